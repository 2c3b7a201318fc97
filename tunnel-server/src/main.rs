mod app;
mod config;
mod dispatcher;
mod error;
mod listener;
mod logging;
mod metrics;
mod registry;
mod session;
mod tls;
mod tunnel;

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::Config::parse();
    if let Err(e) = app::run(config).await {
        eprintln!("tunnel-server: {e}");
        std::process::exit(1);
    }
    Ok(())
}
