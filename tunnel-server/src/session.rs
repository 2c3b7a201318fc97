use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{split, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio_rustls::server::TlsStream;
use tunnel_proto::message::{Auth, AuthResp, Message, NewTunnel, Ping, Pong, ReqProxy};
use tunnel_proto::{ident, read_message, write_message, LoggedConn};

use crate::error::ServerError;
use crate::metrics::MetricsSink;
use crate::registry::{ControlRegistry, TunnelRegistry};
use crate::tunnel::Tunnel;

pub type ControlStream = TlsStream<TcpStream>;
pub type ProxyConn = LoggedConn<ControlStream>;

const PROXY_POOL_CAPACITY: usize = 10;
const OUTBOX_CAPACITY: usize = 32;
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);
const REAP_INTERVAL: Duration = Duration::from_secs(10);
const PROXY_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// One authenticated client's control session: the §4.5 state machine.
/// The manager task is the only party that mutates `tunnels`/`last_ping`;
/// everyone else reaches the outbound channel through `try_send_req_proxy`
/// or `get_proxy`, not `out_tx` directly.
pub struct ControlSession {
    id: Mutex<String>,
    client_ip: IpAddr,
    tunnels: Mutex<Vec<Arc<Tunnel>>>,
    proxy_tx: mpsc::Sender<ProxyConn>,
    proxy_rx: AsyncMutex<mpsc::Receiver<ProxyConn>>,
    out_tx: mpsc::Sender<Message>,
    last_ping: Mutex<Instant>,
    shutdown_tx: watch::Sender<bool>,
}

impl ControlSession {
    pub fn id(&self) -> String {
        self.id.lock().clone()
    }

    pub fn client_ip(&self) -> IpAddr {
        self.client_ip
    }

    fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Called on the session being replaced by a reconnect with the same
    /// client id: clears our id so our own `ControlRegistry::del` later
    /// can't remove the successor, then begins our own shutdown.
    fn mark_replaced(&self) {
        *self.id.lock() = String::new();
        self.trigger_shutdown();
    }

    fn try_send_req_proxy(&self) {
        let _ = self.out_tx.try_send(Message::ReqProxy(ReqProxy {}));
    }

    /// Best-effort pre-warm: asks the client for another proxy connection
    /// ahead of need. Safe to call while the session is tearing down.
    pub fn prewarm_proxy(&self) {
        self.try_send_req_proxy();
    }

    pub fn register_proxy(&self, conn: ProxyConn) {
        conn.set_deadline(PROXY_IDLE_TIMEOUT);
        if self.proxy_tx.try_send(conn).is_err() {
            tracing::debug!(id = %self.id(), "proxy pool full or closed, dropping connection");
        }
    }

    /// Draws one proxy connection, requesting a fresh one from the client
    /// if the draw empties the pool (or if the pool was already empty).
    pub async fn get_proxy(&self) -> Result<ProxyConn, ServerError> {
        {
            let mut rx = self.proxy_rx.lock().await;
            if let Ok(conn) = rx.try_recv() {
                if rx.is_empty() {
                    self.try_send_req_proxy();
                }
                return Ok(conn);
            }
        }
        self.try_send_req_proxy();
        let mut rx = self.proxy_rx.lock().await;
        match tokio::time::timeout(HEARTBEAT_TIMEOUT, rx.recv()).await {
            Ok(Some(conn)) => Ok(conn),
            _ => Err(ServerError::ProxyUnavailable),
        }
    }

    /// Performs the `Auth`/`AuthResp` handshake on a freshly accepted tunnel
    /// connection and, on success, spawns the session's four cooperating
    /// tasks (reader, writer, manager, stopper).
    pub async fn start(
        stream: ControlStream,
        auth: Auth,
        peer_ip: IpAddr,
        tunnels: Arc<TunnelRegistry>,
        controls: Arc<ControlRegistry>,
        metrics: Arc<dyn MetricsSink>,
        vhost: Arc<str>,
    ) {
        let (mut rd, mut wr) = split(stream);

        if auth.version != tunnel_proto::message::PROTO_VERSION {
            let resp = AuthResp {
                version: tunnel_proto::message::PROTO_VERSION.into(),
                mm_version: tunnel_proto::message::MM_VERSION.into(),
                client_id: String::new(),
                error: format!(
                    "incompatible protocol version: server {}, client {}",
                    tunnel_proto::message::PROTO_VERSION,
                    auth.version
                ),
            };
            let _ = write_message(&mut wr, &Message::AuthResp(resp)).await;
            return;
        }

        let client_id = if auth.client_id.is_empty() {
            ident::new_client_id()
        } else {
            auth.client_id.clone()
        };

        let resp = AuthResp {
            version: tunnel_proto::message::PROTO_VERSION.into(),
            mm_version: tunnel_proto::message::MM_VERSION.into(),
            client_id: client_id.clone(),
            error: String::new(),
        };
        if write_message(&mut wr, &Message::AuthResp(resp)).await.is_err() {
            return;
        }

        let (proxy_tx, proxy_rx) = mpsc::channel(PROXY_POOL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let session = Arc::new(ControlSession {
            id: Mutex::new(client_id.clone()),
            client_ip: peer_ip,
            tunnels: Mutex::new(Vec::new()),
            proxy_tx,
            proxy_rx: AsyncMutex::new(proxy_rx),
            out_tx,
            last_ping: Mutex::new(Instant::now()),
            shutdown_tx,
        });

        if let Some(prior) = controls.add(client_id.clone(), Arc::clone(&session)) {
            tracing::info!(id = %client_id, "replacing existing control session");
            prior.mark_replaced();
        }

        // Speculative pre-warm: strictly after AuthResp, strictly before any
        // NewTunnel for this session's first tunnel, since ReqTunnel handling
        // hasn't started yet (reader/manager aren't spawned until below).
        session.try_send_req_proxy();

        let reader = tokio::spawn(run_reader(rd, in_tx, shutdown_rx.clone()));
        let writer = tokio::spawn(run_writer(wr, out_rx, shutdown_rx.clone()));
        let manager = tokio::spawn(run_manager(
            Arc::clone(&session),
            in_rx,
            Arc::clone(&tunnels),
            vhost,
            Arc::clone(&metrics),
            shutdown_rx.clone(),
        ));

        run_stopper(session, controls, tunnels, metrics, shutdown_rx, reader, writer, manager).await;
    }
}

async fn run_reader(
    mut rd: ReadHalf<ControlStream>,
    in_tx: mpsc::Sender<Message>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            result = read_message(&mut rd) => {
                match result {
                    Ok(Some(msg)) => {
                        if in_tx.send(msg).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        tracing::debug!(error = %e, "control read error");
                        return;
                    }
                }
            }
        }
    }
}

async fn run_writer(
    mut wr: WriteHalf<ControlStream>,
    mut out_rx: mpsc::Receiver<Message>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            msg = out_rx.recv() => {
                let Some(msg) = msg else { return };
                let write = write_message(&mut wr, &msg);
                match tokio::time::timeout(WRITE_TIMEOUT, write).await {
                    Ok(Ok(())) => {}
                    _ => return,
                }
            }
        }
    }
}

async fn run_manager(
    session: Arc<ControlSession>,
    mut in_rx: mpsc::Receiver<Message>,
    tunnels: Arc<TunnelRegistry>,
    vhost: Arc<str>,
    metrics: Arc<dyn MetricsSink>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut reap = tokio::time::interval(REAP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            _ = reap.tick() => {
                let stale = session.last_ping.lock().elapsed() > HEARTBEAT_TIMEOUT;
                if stale {
                    tracing::info!(id = %session.id(), "heartbeat lost");
                    session.trigger_shutdown();
                    return;
                }
            }
            msg = in_rx.recv() => {
                let Some(msg) = msg else { return };
                handle_message(&session, msg, &tunnels, &vhost, &*metrics).await;
            }
        }
    }
}

async fn handle_message(
    session: &Arc<ControlSession>,
    msg: Message,
    tunnels: &Arc<TunnelRegistry>,
    vhost: &str,
    metrics: &dyn MetricsSink,
) {
    match msg {
        Message::Ping(Ping {}) => {
            *session.last_ping.lock() = Instant::now();
            let _ = session.out_tx.send(Message::Pong(Pong {})).await;
        }
        Message::ReqTunnel(req) => {
            let first_tunnel = session.tunnels.lock().is_empty();
            let protocols: Vec<String> = req.protocol.split('+').map(str::to_string).collect();
            let mut any_ok = false;
            for proto in protocols {
                let result = Tunnel::register(
                    req.clone(),
                    &proto,
                    &session.id(),
                    session.client_ip(),
                    tunnels,
                    vhost,
                )
                .await;
                match result {
                    Ok(tunnel) => {
                        any_ok = true;
                        metrics.tunnel_registered(&proto);
                        session.tunnels.lock().push(Arc::clone(&tunnel));
                        let ack = NewTunnel {
                            req_id: req.req_id.clone(),
                            url: tunnel.url.clone(),
                            protocol: proto,
                            error: String::new(),
                        };
                        let _ = session.out_tx.send(Message::NewTunnel(ack)).await;
                    }
                    Err(e) => {
                        let ack = NewTunnel {
                            req_id: req.req_id.clone(),
                            url: String::new(),
                            protocol: proto,
                            error: e.to_string(),
                        };
                        let _ = session.out_tx.send(Message::NewTunnel(ack)).await;
                    }
                }
            }
            if first_tunnel && !any_ok {
                tracing::info!(id = %session.id(), "first tunnel request failed, tearing down session");
                session.trigger_shutdown();
            }
        }
        other => {
            tracing::debug!(id = %session.id(), ty = other.type_name(), "unexpected message on control channel");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_stopper(
    session: Arc<ControlSession>,
    controls: Arc<ControlRegistry>,
    tunnels: Arc<TunnelRegistry>,
    metrics: Arc<dyn MetricsSink>,
    mut shutdown_rx: watch::Receiver<bool>,
    reader: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
    manager: tokio::task::JoinHandle<()>,
) {
    let _ = shutdown_rx.changed().await;

    let id = session.id();
    if !id.is_empty() {
        controls.del(&id, &session);
    }

    let _ = reader.await;
    let _ = manager.await;
    let _ = writer.await;

    for tunnel in session.tunnels.lock().drain(..).collect::<Vec<_>>() {
        tunnel.shutdown(&tunnels, &*metrics);
    }

    let mut rx = session.proxy_rx.lock().await;
    while rx.try_recv().is_ok() {}
    drop(rx);

    tracing::info!(id = %id, "control session shut down");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_proxy_emits_req_proxy_when_pool_empty() {
        let (proxy_tx, proxy_rx) = mpsc::channel(PROXY_POOL_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);

        let session = Arc::new(ControlSession {
            id: Mutex::new("abc".into()),
            client_ip: "127.0.0.1".parse().unwrap(),
            tunnels: Mutex::new(Vec::new()),
            proxy_tx,
            proxy_rx: AsyncMutex::new(proxy_rx),
            out_tx,
            last_ping: Mutex::new(Instant::now()),
            shutdown_tx,
        });

        let session2 = Arc::clone(&session);
        let handle = tokio::spawn(async move { session2.get_proxy().await });

        let msg = out_rx.recv().await.unwrap();
        assert!(matches!(msg, Message::ReqProxy(_)));

        // unblock the waiting get_proxy so the spawned task can exit.
        drop(handle);
    }

    #[test]
    fn mark_replaced_clears_id_and_triggers_shutdown() {
        let (proxy_tx, proxy_rx) = mpsc::channel(PROXY_POOL_CAPACITY);
        let (out_tx, _out_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let session = ControlSession {
            id: Mutex::new("abc".into()),
            client_ip: "127.0.0.1".parse().unwrap(),
            tunnels: Mutex::new(Vec::new()),
            proxy_tx,
            proxy_rx: AsyncMutex::new(proxy_rx),
            out_tx,
            last_ping: Mutex::new(Instant::now()),
            shutdown_tx,
        };

        session.mark_replaced();
        assert_eq!(session.id(), "");
        assert!(*shutdown_rx.borrow_and_update());
    }
}
