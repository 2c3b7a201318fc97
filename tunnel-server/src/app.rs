use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tunnel_proto::message::Message;
use tunnel_proto::read_message;

use crate::config::Config;
use crate::logging;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::registry::{ControlRegistry, TunnelRegistry};
use crate::session::{ControlSession, ControlStream};
use crate::tls;

/// Top-level server lifecycle: parses TLS material, builds the shared
/// registries, spawns the three public-facing listeners, and blocks until
/// a shutdown signal arrives.
pub async fn run(config: Config) -> anyhow::Result<()> {
    logging::init(&config.log_level, config.log_json);

    let acceptor = tls::build_acceptor(
        &config.tls_cert,
        &config.tls_key,
        config.tls_client_ca.as_deref(),
    )?;

    let tunnels = Arc::new(TunnelRegistry::new(config.resolved_cache_file()));
    let controls = Arc::new(ControlRegistry::new());
    let metrics: Arc<dyn MetricsSink> = Arc::new(NoopMetrics);
    let vhost: Arc<str> = Arc::from(config.resolved_vhost());

    let _cache_saver = tunnels.spawn_periodic_save();

    let http_addr: SocketAddr = config.http_addr.parse()?;
    let https_addr: SocketAddr = config.https_addr.parse()?;
    let tunnel_addr: SocketAddr = config.tunnel_addr.parse()?;

    let http_task = tokio::spawn(crate::listener::http::run(
        http_addr,
        "http",
        None,
        Arc::clone(&tunnels),
        Arc::clone(&controls),
        Arc::clone(&metrics),
    ));

    let https_task = tokio::spawn(crate::listener::http::run(
        https_addr,
        "https",
        Some(acceptor.clone()),
        Arc::clone(&tunnels),
        Arc::clone(&controls),
        Arc::clone(&metrics),
    ));

    let tunnel_task = tokio::spawn(run_tunnel_listener(
        tunnel_addr,
        acceptor,
        Arc::clone(&tunnels),
        Arc::clone(&controls),
        Arc::clone(&metrics),
        vhost,
    ));

    tracing::info!(domain = %config.domain, "tunnel server started");

    tokio::select! {
        res = http_task => log_listener_exit("http", res),
        res = https_task => log_listener_exit("https", res),
        res = tunnel_task => log_listener_exit("tunnel", res),
        _ = wait_for_shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    if let Err(e) = tunnels.save() {
        tracing::warn!(error = %e, "failed to save affinity cache on shutdown");
    }

    Ok(())
}

fn log_listener_exit(name: &str, result: Result<std::io::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => tracing::warn!(listener = name, "listener exited"),
        Ok(Err(e)) => tracing::error!(listener = name, error = %e, "listener failed"),
        Err(e) => tracing::error!(listener = name, error = %e, "listener task panicked"),
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// The tunnel listener accepts both control connections (first message
/// `Auth`) and proxy connections (first message `RegProxy`) on the same
/// TLS port, dispatching on whichever arrives first.
async fn run_tunnel_listener(
    addr: SocketAddr,
    acceptor: tokio_rustls::TlsAcceptor,
    tunnels: Arc<TunnelRegistry>,
    controls: Arc<ControlRegistry>,
    metrics: Arc<dyn MetricsSink>,
    vhost: Arc<str>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "tunnel listener started");
    loop {
        let (stream, peer) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let tunnels = Arc::clone(&tunnels);
        let controls = Arc::clone(&controls);
        let metrics = Arc::clone(&metrics);
        let vhost = Arc::clone(&vhost);
        tokio::spawn(async move {
            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(e) => {
                    tracing::debug!(error = %e, %peer, "tunnel tls handshake failed");
                    return;
                }
            };
            dispatch_tunnel_connection(tls, peer, tunnels, controls, metrics, vhost).await;
        });
    }
}

async fn dispatch_tunnel_connection(
    mut stream: ControlStream,
    peer: SocketAddr,
    tunnels: Arc<TunnelRegistry>,
    controls: Arc<ControlRegistry>,
    metrics: Arc<dyn MetricsSink>,
    vhost: Arc<str>,
) {
    let first = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        read_message(&mut stream),
    )
    .await;

    match first {
        Ok(Ok(Some(Message::Auth(auth)))) => {
            ControlSession::start(stream, auth, peer.ip(), tunnels, controls, metrics, vhost).await;
        }
        Ok(Ok(Some(Message::RegProxy(reg)))) => {
            match controls.get(&reg.client_id) {
                Some(session) => session.register_proxy(tunnel_proto::LoggedConn::new(stream, "proxy")),
                None => tracing::debug!(client_id = %reg.client_id, "proxy for unknown session"),
            }
        }
        Ok(Ok(Some(_))) => {
            tracing::debug!(%peer, "unexpected first message on tunnel listener");
        }
        Ok(Ok(None)) => {}
        Ok(Err(e)) => tracing::debug!(error = %e, %peer, "tunnel frame error"),
        Err(_) => tracing::debug!(%peer, "timed out waiting for first tunnel frame"),
    }
}
