use clap::Parser;

/// Server configuration. Every field doubles as an environment variable
/// under the `TUNNEL_SERVER_` prefix, the way the proxy's own config layer
/// does it, so deployments can be driven entirely from env without a file.
#[derive(Parser, Debug, Clone)]
#[command(name = "tunnel-server", version, about = "Reverse tunnel server")]
pub struct Config {
    /// Address the plain HTTP public listener binds.
    #[arg(long, env = "TUNNEL_SERVER_HTTP_ADDR", default_value = "0.0.0.0:80")]
    pub http_addr: String,

    /// Address the TLS-terminated HTTPS public listener binds.
    #[arg(long, env = "TUNNEL_SERVER_HTTPS_ADDR", default_value = "0.0.0.0:443")]
    pub https_addr: String,

    /// Address the TLS tunnel listener (control + proxy connections) binds.
    #[arg(long, env = "TUNNEL_SERVER_TUNNEL_ADDR", default_value = "0.0.0.0:4443")]
    pub tunnel_addr: String,

    /// Base domain used to synthesize subdomain URLs, e.g. `tunnel.example.com`.
    #[arg(long, env = "TUNNEL_SERVER_DOMAIN")]
    pub domain: String,

    /// PEM certificate chain for the tunnel and https listeners.
    #[arg(long, env = "TUNNEL_SERVER_TLS_CERT")]
    pub tls_cert: std::path::PathBuf,

    /// PEM private key matching `tls_cert`.
    #[arg(long, env = "TUNNEL_SERVER_TLS_KEY")]
    pub tls_key: std::path::PathBuf,

    /// Optional PEM CA bundle to require and verify client certificates on
    /// the tunnel listener.
    #[arg(long, env = "TUNNEL_SERVER_TLS_CLIENT_CA")]
    pub tls_client_ca: Option<std::path::PathBuf>,

    #[arg(long, env = "TUNNEL_SERVER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "TUNNEL_SERVER_LOG_JSON", default_value_t = false)]
    pub log_json: bool,

    /// Path to persist the affinity cache snapshot. Also overridable by the
    /// `REGISTRY_CACHE_FILE` environment variable, checked separately at
    /// startup for parity with the upstream deployment convention.
    #[arg(long, env = "TUNNEL_SERVER_REGISTRY_CACHE_FILE")]
    pub registry_cache_file: Option<std::path::PathBuf>,

    /// Override for the virtual-host name used in subdomain URL allocation.
    /// Also overridable by the `VHOST` environment variable.
    #[arg(long, env = "TUNNEL_SERVER_VHOST")]
    pub vhost: Option<String>,
}

impl Config {
    /// Resolves the vhost precedence: explicit CLI/env flag, then the
    /// bare `VHOST` variable, then the configured domain.
    pub fn resolved_vhost(&self) -> String {
        self.vhost
            .clone()
            .or_else(|| std::env::var("VHOST").ok())
            .unwrap_or_else(|| self.domain.clone())
            .to_lowercase()
    }

    /// Resolves the affinity cache file path: explicit flag first, then the
    /// bare `REGISTRY_CACHE_FILE` variable.
    pub fn resolved_cache_file(&self) -> Option<std::path::PathBuf> {
        self.registry_cache_file
            .clone()
            .or_else(|| std::env::var("REGISTRY_CACHE_FILE").ok().map(Into::into))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            http_addr: "0.0.0.0:80".into(),
            https_addr: "0.0.0.0:443".into(),
            tunnel_addr: "0.0.0.0:4443".into(),
            domain: "tunnel.example.com".into(),
            tls_cert: "/tmp/cert.pem".into(),
            tls_key: "/tmp/key.pem".into(),
            tls_client_ca: None,
            log_level: "info".into(),
            log_json: false,
            registry_cache_file: None,
            vhost: None,
        }
    }

    #[test]
    fn vhost_falls_back_to_domain_when_unset() {
        let cfg = base_config();
        assert_eq!(cfg.resolved_vhost(), "tunnel.example.com");
    }

    #[test]
    fn explicit_vhost_flag_wins_over_domain() {
        let mut cfg = base_config();
        cfg.vhost = Some("Other.Example.com".into());
        assert_eq!(cfg.resolved_vhost(), "other.example.com");
    }
}
