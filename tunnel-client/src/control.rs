use std::sync::Arc;
use std::time::Duration;

use rustls_pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::split;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tunnel_proto::message::{Auth, Message, NewTunnel, Ping, ReqProxy, ReqTunnel, PROTO_VERSION};
use tunnel_proto::{ident, read_message, write_message};

use crate::config::ResolvedConfig;
use crate::error::ClientError;
use crate::state::{ClientState, ConnectionStatus};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(20);
const PONG_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const PONG_STALE_AFTER: Duration = Duration::from_secs(15);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Outcome of one connected session: `Fatal` stops the whole client (an
/// auth rejection or tunnel error the server reported), anything else
/// reconnects with backoff.
enum Outcome {
    Disconnected,
    Fatal(String),
}

/// The reconnecting outer loop. Runs until a `Fatal` outcome, at which
/// point the process-level caller decides how to report it and exit.
pub async fn run(
    config: Arc<ResolvedConfig>,
    state: Arc<ClientState>,
    connector: TlsConnector,
) -> Result<(), String> {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match run_once(&config, &state, &connector).await {
            Ok(Outcome::Disconnected) => {
                backoff = INITIAL_BACKOFF;
            }
            Ok(Outcome::Fatal(msg)) => return Err(msg),
            Err(e) => {
                tracing::warn!(error = %e, "control session failed");
            }
        }
        state.tunnels.clear();
        state.set_status(ConnectionStatus::Reconnecting);
        tracing::info!(backoff_secs = backoff.as_secs(), "reconnecting");
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn run_once(
    config: &ResolvedConfig,
    state: &Arc<ClientState>,
    connector: &TlsConnector,
) -> Result<Outcome, ClientError> {
    let (host, _) = config
        .server_addr
        .rsplit_once(':')
        .unwrap_or((config.server_addr.as_str(), "4443"));

    let tcp = TcpStream::connect(&config.server_addr).await?;
    tune_socket(&tcp);

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| ClientError::Tls(format!("invalid server name {host}: {e}")))?;
    let tls = connector.connect(server_name, tcp).await?;
    let (mut rd, mut wr) = split(tls);

    let auth = Auth {
        version: PROTO_VERSION.into(),
        mm_version: tunnel_proto::message::MM_VERSION.into(),
        user: config.authtoken.clone(),
        password: String::new(),
        os: std::env::consts::OS.into(),
        arch: std::env::consts::ARCH.into(),
        client_id: state.client_id.read().clone(),
    };
    write_message(&mut wr, &Message::Auth(auth)).await?;

    let resp = match tokio::time::timeout(AUTH_TIMEOUT, read_message(&mut rd)).await {
        Ok(Ok(Some(Message::AuthResp(resp)))) => resp,
        Ok(Ok(Some(_))) => return Err(ClientError::Tls("unexpected first message from server".into())),
        Ok(Ok(None)) => return Ok(Outcome::Disconnected),
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(ClientError::Tls("timed out waiting for AuthResp".into())),
    };

    if !resp.error.is_empty() {
        return Ok(Outcome::Fatal(resp.error));
    }
    *state.client_id.write() = resp.client_id.clone();
    tracing::info!(client_id = %resp.client_id, "authenticated");
    if let Err(e) = config.save_auth_token(&config.authtoken) {
        tracing::warn!(error = %e, "failed to persist authtoken");
    }

    for (name, def) in &config.tunnels {
        for (proto, local_addr) in &def.proto {
            let req_id = ident::new_req_id();
            state.tunnels.register_pending(&req_id, local_addr);
            let req = ReqTunnel {
                req_id,
                protocol: proto.clone(),
                hostname: def.hostname.clone().unwrap_or_default(),
                subdomain: def.subdomain.clone().unwrap_or_default(),
                http_auth: def.auth.clone().unwrap_or_default(),
                remote_port: def.remote_port.unwrap_or(0),
            };
            tracing::debug!(tunnel = name, protocol = proto, "requesting tunnel");
            write_message(&mut wr, &Message::ReqTunnel(req)).await?;
        }
    }

    state.reset_pong_clock();
    let mut ping_ticker = tokio::time::interval(PING_INTERVAL);
    let mut pong_check = tokio::time::interval(PONG_CHECK_INTERVAL);
    let mut ping_outstanding = false;

    loop {
        tokio::select! {
            _ = ping_ticker.tick() => {
                if write_message(&mut wr, &Message::Ping(Ping {})).await.is_err() {
                    return Ok(Outcome::Disconnected);
                }
                ping_outstanding = true;
            }
            _ = pong_check.tick() => {
                if ping_outstanding && state.pong_age() > PONG_STALE_AFTER {
                    tracing::warn!("heartbeat timed out, dropping connection");
                    return Ok(Outcome::Disconnected);
                }
            }
            msg = read_message(&mut rd) => {
                match msg {
                    Ok(Some(Message::Pong(_))) => {
                        state.record_pong();
                        ping_outstanding = false;
                    }
                    Ok(Some(Message::ReqProxy(ReqProxy {}))) => {
                        let server_addr = config.server_addr.clone();
                        let state = Arc::clone(state);
                        let connector = connector.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                crate::proxy_worker::run(server_addr, state, connector).await
                            {
                                tracing::debug!(error = %e, "proxy worker failed");
                            }
                        });
                    }
                    Ok(Some(Message::NewTunnel(NewTunnel { req_id, url, error, .. }))) => {
                        if !error.is_empty() {
                            tracing::warn!(req_id, error, "tunnel registration failed");
                            return Ok(Outcome::Fatal(error));
                        }
                        if let Some(local_addr) = state.tunnels.resolve(&req_id, &url) {
                            tracing::info!(url, local_addr, "tunnel established");
                        }
                        state.set_status(ConnectionStatus::Online);
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => return Ok(Outcome::Disconnected),
                    Err(e) => {
                        tracing::debug!(error = %e, "control read error");
                        return Ok(Outcome::Disconnected);
                    }
                }
            }
        }
    }
}

fn tune_socket(stream: &TcpStream) {
    let sock_ref = SockRef::from(stream);
    let _ = sock_ref.set_nodelay(true);
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(30));
    let _ = sock_ref.set_tcp_keepalive(&keepalive);
}
