//! Application lifecycle: config resolution, task orchestration, shutdown.

use tokio::signal;
use tracing::{error, info};

use crate::config::{Cli, Command, ResolvedConfig};
use crate::error::ClientError;
use crate::state::ClientState;
use crate::{control, logging, tls};

/// Run the full client lifecycle after the CLI has been parsed.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    logging::init(&cli.log_level, cli.log_json);

    let mut resolved = ResolvedConfig::from_cli(&cli)?;

    if let Some(Command::List) = &cli.command {
        list_tunnels(&resolved);
        return Ok(());
    }

    if let Some(Command::Start { names }) = &cli.command {
        resolved.select(names);
    }

    if resolved.tunnels.is_empty() {
        anyhow::bail!("no tunnels configured: pass a local address, `start <name>`, or a config file");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %resolved.server_addr,
        tunnel_count = resolved.tunnels.len(),
        "tunnel-client starting"
    );

    let connector = tls::build_connector(resolved.root_ca.as_deref(), resolved.insecure_skip_verify)
        .map_err(|e: ClientError| anyhow::anyhow!(e))?;

    let state = ClientState::new();
    let resolved = std::sync::Arc::new(resolved);

    let control_handle = {
        let state = std::sync::Arc::clone(&state);
        let resolved = std::sync::Arc::clone(&resolved);
        tokio::spawn(async move { control::run(resolved, state, connector).await })
    };

    tokio::select! {
        res = control_handle => {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(msg)) => {
                    error!(error = %msg, "control session ended fatally");
                    anyhow::bail!(msg);
                }
                Err(e) => anyhow::bail!("control task panicked: {e}"),
            }
        }
        _ = wait_for_shutdown() => {
            info!("shutdown signal received");
        }
    }

    info!("tunnel-client stopped");
    Ok(())
}

fn list_tunnels(config: &ResolvedConfig) {
    if config.tunnels.is_empty() {
        println!("no tunnels configured");
        return;
    }
    for (name, def) in &config.tunnels {
        let protos: Vec<String> = def
            .proto
            .iter()
            .map(|(proto, addr)| format!("{proto}->{addr}"))
            .collect();
        println!("{name}: {}", protos.join(", "));
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
