use std::sync::Arc;

use rustls_pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::io::split;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tunnel_proto::message::{Message, RegProxy};
use tunnel_proto::{join, read_message, write_message};

use crate::error::ClientError;
use crate::state::ClientState;

/// Dials the server fresh, registers as a proxy connection for this
/// client's control session, waits for the matching `StartProxy`, and
/// joins the connection to the local service it names.
///
/// One of these runs per `ReqProxy` the control loop receives, so the
/// server always has a spare connection waiting in its pool.
pub async fn run(
    server_addr: String,
    state: Arc<ClientState>,
    connector: TlsConnector,
) -> Result<(), ClientError> {
    let (host, _) = server_addr
        .rsplit_once(':')
        .unwrap_or((server_addr.as_str(), "4443"));

    let tcp = TcpStream::connect(&server_addr).await?;
    tune_socket(&tcp);

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| ClientError::Tls(format!("invalid server name {host}: {e}")))?;
    let tls = connector.connect(server_name, tcp).await?;
    let (mut rd, mut wr) = split(tls);

    let client_id = state.client_id.read().clone();
    write_message(&mut wr, &Message::RegProxy(RegProxy { client_id })).await?;

    let start = match read_message(&mut rd).await? {
        Some(Message::StartProxy(sp)) => sp,
        Some(other) => {
            return Err(ClientError::Tls(format!(
                "expected StartProxy, got {}",
                other.type_name()
            )))
        }
        None => return Err(ClientError::Tls("server closed proxy connection".into())),
    };

    let local_addr = state
        .tunnels
        .local_addr_for(&start.url)
        .ok_or_else(|| ClientError::UnknownUrl(start.url.clone()))?;

    tracing::debug!(url = start.url, local_addr, client_addr = start.client_addr, "starting proxy");

    let local = TcpStream::connect(&local_addr).await?;
    let remote = rd.unsplit(wr);
    join(remote, local).await;
    Ok(())
}

fn tune_socket(stream: &TcpStream) {
    let sock_ref = SockRef::from(stream);
    let _ = sock_ref.set_nodelay(true);
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(30));
    let _ = sock_ref.set_tcp_keepalive(&keepalive);
}
