use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use base64::Engine;
use rand::RngCore;
use tokio::net::TcpListener;
use tunnel_proto::message::ReqTunnel;

use crate::error::ServerError;
use crate::registry::{ControlRegistry, TunnelRegistry};
use crate::metrics::MetricsSink;

/// A routable endpoint owned by one control session. TCP tunnels carry
/// their own listener; HTTP/HTTPS tunnels are reached through the shared
/// public listeners via a registry lookup on their URL.
pub struct Tunnel {
    pub req: ReqTunnel,
    pub url: String,
    pub client_id: String,
    pub created_at: Instant,
    pub listener: Option<TcpListener>,
    closing: AtomicBool,
}

impl Tunnel {
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Registers a tunnel for one protocol named in `req.protocol` (the
    /// caller splits a `+`-joined protocol list into one call per element).
    pub async fn register(
        mut req: ReqTunnel,
        protocol: &str,
        client_id: &str,
        client_ip: IpAddr,
        tunnels: &Arc<TunnelRegistry>,
        vhost: &str,
    ) -> Result<Arc<Tunnel>, ServerError> {
        if !req.http_auth.is_empty() {
            req.http_auth = format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(req.http_auth.as_bytes())
            );
        }

        match protocol {
            "tcp" => Self::register_tcp(req, client_id, client_ip, tunnels),
            "http" | "https" => Self::register_http(req, protocol, client_id, client_ip, tunnels, vhost).await,
            other => Err(ServerError::UnsupportedProtocol(other.to_string())),
        }
    }

    fn register_tcp(
        req: ReqTunnel,
        client_id: &str,
        client_ip: IpAddr,
        tunnels: &Arc<TunnelRegistry>,
    ) -> Result<Arc<Tunnel>, ServerError> {
        let id_key = format!("client-id-tcp:{client_id}");
        let ip_key = format!("client-ip-tcp:{client_ip}");

        let preferred_port = if req.remote_port != 0 {
            Some(req.remote_port)
        } else {
            tunnels
                .get_cached(&id_key)
                .and_then(|url| url.rsplit(':').next().and_then(|p| p.parse().ok()))
        };

        let listener = std::net::TcpListener::bind(("0.0.0.0", preferred_port.unwrap_or(0)))
            .or_else(|_| std::net::TcpListener::bind(("0.0.0.0", 0)))?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let port = listener.local_addr()?.port();
        let url = format!("tcp://{client_ip}:{port}");

        let tunnel = Arc::new(Tunnel {
            req,
            url: url.clone(),
            client_id: client_id.to_string(),
            created_at: Instant::now(),
            listener: Some(listener),
            closing: AtomicBool::new(false),
        });

        // OS-assigned ports collide only under pathological reuse; fail closed.
        tunnels.register_and_cache(&url, Arc::clone(&tunnel), &[id_key, ip_key])?;

        Ok(tunnel)
    }

    async fn register_http(
        req: ReqTunnel,
        protocol: &str,
        client_id: &str,
        client_ip: IpAddr,
        tunnels: &Arc<TunnelRegistry>,
        vhost: &str,
    ) -> Result<Arc<Tunnel>, ServerError> {
        let id_key = format!("client-id-{protocol}:{client_id}");
        let ip_key = format!("client-ip-{protocol}:{client_ip}");
        let cache_keys = [id_key.clone(), ip_key.clone()];

        if !req.hostname.is_empty() {
            let url = format!("{protocol}://{}", req.hostname.to_lowercase());
            return Self::finalize_http(req, client_id, &url, tunnels, &cache_keys);
        }

        if !req.subdomain.is_empty() {
            let url = format!("{protocol}://{}.{vhost}", req.subdomain.to_lowercase());
            return Self::finalize_http(req, client_id, &url, tunnels, &cache_keys);
        }

        let cached = tunnels.get_cached(&id_key);
        let client_id = client_id.to_string();
        let protocol = protocol.to_string();
        let vhost = vhost.to_string();

        tunnels.register_repeat(
            cached.as_deref(),
            || format!("{protocol}://{}.{vhost}", random_subdomain()),
            |url| {
                Arc::new(Tunnel {
                    req: req.clone(),
                    url: url.to_string(),
                    client_id: client_id.clone(),
                    created_at: Instant::now(),
                    listener: None,
                    closing: AtomicBool::new(false),
                })
            },
            &cache_keys,
        )
    }

    fn finalize_http(
        req: ReqTunnel,
        client_id: &str,
        url: &str,
        tunnels: &Arc<TunnelRegistry>,
        cache_keys: &[String],
    ) -> Result<Arc<Tunnel>, ServerError> {
        let tunnel = Arc::new(Tunnel {
            req,
            url: url.to_string(),
            client_id: client_id.to_string(),
            created_at: Instant::now(),
            listener: None,
            closing: AtomicBool::new(false),
        });
        tunnels.register_and_cache(url, Arc::clone(&tunnel), cache_keys)?;
        Ok(tunnel)
    }

    pub fn shutdown(&self, tunnels: &TunnelRegistry, metrics: &dyn MetricsSink) {
        self.closing.store(true, Ordering::SeqCst);
        // Dropping the listener (by letting this struct drop) is what actually
        // unbinds it; marking `closing` first lets the accept loop exit quietly.
        tunnels.del(&self.url);
        metrics.tunnel_closed(&self.url);
    }

    /// Runs the accept loop for a `tcp` tunnel's dedicated listener. Exits
    /// quietly once `closing` is set, since that's what a bind-error during
    /// shutdown looks like from inside `accept()`.
    pub async fn run_tcp_acceptor(
        self: Arc<Self>,
        control_registry: Arc<ControlRegistry>,
        metrics: Arc<dyn MetricsSink>,
    ) {
        let Some(listener) = &self.listener else {
            return;
        };
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    tracing::info!(url = %self.url, peer = %addr, "new public tcp connection");
                    let tunnel = Arc::clone(&self);
                    let control_registry = Arc::clone(&control_registry);
                    let metrics = Arc::clone(&metrics);
                    tokio::spawn(async move {
                        crate::dispatcher::handle_public_connection(
                            tunnel,
                            control_registry,
                            metrics,
                            stream,
                            addr,
                        )
                        .await;
                    });
                }
                Err(e) => {
                    if self.is_closing() {
                        return;
                    }
                    tracing::warn!(error = %e, url = %self.url, "tcp accept failed");
                }
            }
        }
    }
}

fn random_subdomain() -> String {
    let mut buf = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    pub fn dummy_tunnel() -> Arc<Tunnel> {
        dummy_tunnel_with(
            "http://placeholder.example.com",
            "deadbeef",
        )
    }

    pub fn dummy_tunnel_with(url: &str, client_id: &str) -> Arc<Tunnel> {
        Arc::new(Tunnel {
            req: ReqTunnel {
                req_id: "test".into(),
                protocol: "http".into(),
                hostname: String::new(),
                subdomain: String::new(),
                http_auth: String::new(),
                remote_port: 0,
            },
            url: url.to_string(),
            client_id: client_id.to_string(),
            created_at: Instant::now(),
            listener: None,
            closing: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn http_hostname_request_yields_exact_url() {
        let tunnels = Arc::new(TunnelRegistry::new(None));
        let req = ReqTunnel {
            req_id: "r1".into(),
            protocol: "http".into(),
            hostname: "Custom.Example.COM".into(),
            subdomain: String::new(),
            http_auth: String::new(),
            remote_port: 0,
        };
        let tunnel = Tunnel::register(
            req,
            "http",
            "client1",
            "127.0.0.1".parse().unwrap(),
            &tunnels,
            "tunnel.example.com",
        )
        .await
        .unwrap();
        assert_eq!(tunnel.url, "http://custom.example.com");
    }

    #[tokio::test]
    async fn http_auth_is_pre_encoded_as_basic_header_value() {
        let tunnels = Arc::new(TunnelRegistry::new(None));
        let req = ReqTunnel {
            req_id: "r2".into(),
            protocol: "http".into(),
            hostname: String::new(),
            subdomain: "foo".into(),
            http_auth: "user:pass".into(),
            remote_port: 0,
        };
        let tunnel = Tunnel::register(
            req,
            "http",
            "client2",
            "127.0.0.1".parse().unwrap(),
            &tunnels,
            "tunnel.example.com",
        )
        .await
        .unwrap();
        let expected = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode("user:pass")
        );
        assert_eq!(tunnel.req.http_auth, expected);
    }

    #[tokio::test]
    async fn random_subdomain_retried_on_collision() {
        let tunnels = Arc::new(TunnelRegistry::new(None));
        let req1 = ReqTunnel {
            req_id: "r3".into(),
            protocol: "http".into(),
            hostname: String::new(),
            subdomain: String::new(),
            http_auth: String::new(),
            remote_port: 0,
        };
        let t1 = Tunnel::register(
            req1,
            "http",
            "client3",
            "127.0.0.1".parse().unwrap(),
            &tunnels,
            "tunnel.example.com",
        )
        .await
        .unwrap();

        let req2 = ReqTunnel {
            req_id: "r4".into(),
            protocol: "http".into(),
            hostname: String::new(),
            subdomain: String::new(),
            http_auth: String::new(),
            remote_port: 0,
        };
        let t2 = Tunnel::register(
            req2,
            "http",
            "client4",
            "127.0.0.2".parse().unwrap(),
            &tunnels,
            "tunnel.example.com",
        )
        .await
        .unwrap();

        assert_ne!(t1.url, t2.url);
    }

    #[tokio::test]
    async fn tcp_registration_binds_an_os_assigned_port() {
        let tunnels = Arc::new(TunnelRegistry::new(None));
        let req = ReqTunnel {
            req_id: "r5".into(),
            protocol: "tcp".into(),
            hostname: String::new(),
            subdomain: String::new(),
            http_auth: String::new(),
            remote_port: 0,
        };
        let tunnel = Tunnel::register(
            req,
            "tcp",
            "client5",
            "127.0.0.1".parse().unwrap(),
            &tunnels,
            "tunnel.example.com",
        )
        .await
        .unwrap();
        assert!(tunnel.url.starts_with("tcp://127.0.0.1:"));
        assert!(tunnel.listener.is_some());
    }
}
