use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};
use tunnel_proto::message::{Message, StartProxy};
use tunnel_proto::write_message;

use crate::metrics::MetricsSink;
use crate::registry::ControlRegistry;
use crate::tunnel::Tunnel;

const MAX_PROXY_ATTEMPTS: u32 = 20;

/// Draws a proxy connection from the tunnel's owning session, hands it a
/// `StartProxy` frame, and joins it to the freshly accepted public stream.
/// Never brings the control session down on failure; it just drops the
/// public connection after exhausting its retries.
pub async fn handle_public_connection<S>(
    tunnel: Arc<Tunnel>,
    control_registry: Arc<ControlRegistry>,
    metrics: Arc<dyn MetricsSink>,
    public: S,
    client_addr: std::net::SocketAddr,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let start = Instant::now();
    metrics.open_connection(&tunnel.url);

    let Some(session) = control_registry.get(&tunnel.client_id) else {
        tracing::warn!(url = %tunnel.url, "no live session for tunnel, dropping connection");
        return;
    };

    let client_addr = client_addr.to_string();
    let mut proxy = None;
    for _ in 0..MAX_PROXY_ATTEMPTS {
        let mut conn = match session.get_proxy().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(url = %tunnel.url, error = %e, "failed to draw a proxy connection");
                return;
            }
        };

        let start_proxy = Message::StartProxy(StartProxy {
            url: tunnel.url.clone(),
            client_addr: client_addr.clone(),
        });
        if write_message(&mut conn, &start_proxy).await.is_err() {
            continue;
        }
        proxy = Some(conn);
        break;
    }

    let Some(mut proxy) = proxy else {
        tracing::warn!(url = %tunnel.url, "exhausted proxy retries, dropping public connection");
        return;
    };

    session.prewarm_proxy();
    proxy.clear_deadline();

    let (bytes_in, bytes_out) = tunnel_proto::join(public, proxy).await;
    metrics.close_connection(&tunnel.url, bytes_in, bytes_out);
    tracing::debug!(
        url = %tunnel.url,
        bytes_in,
        bytes_out,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "public connection closed"
    );
}
