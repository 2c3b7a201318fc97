mod app;
mod config;
mod control;
mod error;
mod logging;
mod proxy_worker;
mod state;
mod tls;

use clap::Parser;

use config::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls CryptoProvider"))?;

    let cli = Cli::parse();

    if let Err(e) = app::run(cli).await {
        eprintln!("tunnel-client: {e}");
        std::process::exit(1);
    }
    Ok(())
}
