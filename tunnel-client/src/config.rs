use std::collections::HashMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

#[derive(Parser, Debug, Clone)]
#[command(name = "tunnel-client", version, about = "Reverse tunnel client")]
pub struct Cli {
    /// Path to the TOML tunnel definitions file.
    #[arg(long, env = "TUNNEL_CLIENT_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "TUNNEL_CLIENT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "TUNNEL_CLIENT_LOG_JSON", default_value_t = false)]
    pub log_json: bool,

    /// Sent as `Auth.User`; the opaque bearer the server checks.
    #[arg(long, env = "TUNNEL_CLIENT_AUTHTOKEN")]
    pub authtoken: Option<String>,

    /// `user:pass` to require on the public HTTP tunnel; overrides any
    /// per-tunnel `auth` from the config file for a single ad-hoc tunnel.
    #[arg(long, env = "TUNNEL_CLIENT_HTTPAUTH")]
    pub httpauth: Option<String>,

    #[arg(long, env = "TUNNEL_CLIENT_HOSTNAME")]
    pub hostname: Option<String>,

    #[arg(long, env = "TUNNEL_CLIENT_SUBDOMAIN")]
    pub subdomain: Option<String>,

    /// `http`, `https`, `tcp`, or `http+https`.
    #[arg(long, env = "TUNNEL_CLIENT_PROTO", default_value = "http")]
    pub proto: String,

    #[arg(long, env = "TUNNEL_CLIENT_SERVER_ADDR")]
    pub server_addr: Option<String>,

    /// Accepted for compatibility with the upstream CLI surface; the
    /// inspection UI itself is out of scope, so `disabled` is the only
    /// value this implementation honors.
    #[arg(long, env = "TUNNEL_CLIENT_INSPECT_ADDR", default_value = "disabled")]
    pub inspect_addr: String,

    #[arg(long, env = "TUNNEL_CLIENT_ROOT_CA")]
    pub root_ca: Option<PathBuf>,

    #[arg(long, env = "TUNNEL_CLIENT_INSECURE_SKIP_VERIFY", default_value_t = false)]
    pub insecure_skip_verify: bool,

    #[command(subcommand)]
    pub command: Option<Command>,

    /// For the no-subcommand form: `tunnel-client 8080` opens one ad-hoc
    /// tunnel to `127.0.0.1:8080`.
    pub local_addr: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start only the named tunnels from the config file.
    Start { names: Vec<String> },
    /// Start every tunnel defined in the config file.
    StartAll,
    /// List configured tunnels without connecting.
    List,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TunnelDef {
    pub subdomain: Option<String>,
    pub hostname: Option<String>,
    #[serde(default)]
    pub proto: HashMap<String, String>,
    pub auth: Option<String>,
    pub remote_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    pub server_addr: Option<String>,
    pub http_proxy: Option<String>,
    pub inspect_addr: Option<String>,
    pub trust_host_root_certs: Option<bool>,
    pub auth_token: Option<String>,
    #[serde(default)]
    pub tunnels: HashMap<String, TunnelDef>,
}

impl ConfigFile {
    pub fn load(path: &std::path::Path) -> Result<Self, ClientError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("reading {}: {e}", path.display())))?;
        toml::from_str(&text).map_err(|e| ClientError::Config(format!("parsing {}: {e}", path.display())))
    }
}

/// The fully resolved configuration the rest of the client operates on:
/// CLI/env values override the file, matching the precedence the upstream
/// config layer documents.
pub struct ResolvedConfig {
    pub server_addr: String,
    pub authtoken: String,
    pub root_ca: Option<PathBuf>,
    pub insecure_skip_verify: bool,
    pub tunnels: HashMap<String, TunnelDef>,
    config_path: Option<PathBuf>,
}

impl ResolvedConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self, ClientError> {
        let file = match &cli.config {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };

        let server_addr = cli
            .server_addr
            .clone()
            .or(file.server_addr)
            .unwrap_or_else(|| "tunnel.example.com:4443".to_string());

        let authtoken = cli
            .authtoken
            .clone()
            .or(file.auth_token)
            .unwrap_or_default();

        let mut tunnels = file.tunnels;
        if let Some(local_addr) = &cli.local_addr {
            let mut proto = HashMap::new();
            for p in cli.proto.split('+') {
                proto.insert(p.to_string(), normalize_addr(local_addr));
            }
            tunnels.insert(
                "default".to_string(),
                TunnelDef {
                    subdomain: cli.subdomain.clone(),
                    hostname: cli.hostname.clone(),
                    proto,
                    auth: cli.httpauth.clone(),
                    remote_port: None,
                },
            );
        }

        Ok(ResolvedConfig {
            server_addr,
            authtoken,
            root_ca: cli.root_ca.clone(),
            insecure_skip_verify: cli.insecure_skip_verify,
            tunnels,
            config_path: cli.config.clone(),
        })
    }

    /// Narrows `tunnels` to the given names, per the `start <name...>`
    /// subcommand.
    pub fn select(&mut self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        self.tunnels.retain(|k, _| names.contains(k));
    }

    /// Persists `token` as the config file's `auth_token`, writing only if
    /// it differs from what's already on disk. Returns whether a write
    /// happened, so repeated calls with the same token are a no-op after
    /// the first. No-op if the client wasn't started with a config file.
    pub fn save_auth_token(&self, token: &str) -> Result<bool, ClientError> {
        let Some(path) = &self.config_path else {
            return Ok(false);
        };

        let mut file = if path.exists() {
            ConfigFile::load(path)?
        } else {
            ConfigFile::default()
        };

        if file.auth_token.as_deref() == Some(token) {
            return Ok(false);
        }

        file.auth_token = Some(token.to_string());
        let text = toml::to_string_pretty(&file)
            .map_err(|e| ClientError::Config(format!("encoding {}: {e}", path.display())))?;
        std::fs::write(path, text)
            .map_err(|e| ClientError::Config(format!("writing {}: {e}", path.display())))?;
        Ok(true)
    }
}

/// A bare integer becomes `127.0.0.1:<n>`; a `host:port` pair is used as
/// given; anything else is left untouched for the dialer to reject.
pub fn normalize_addr(raw: &str) -> String {
    if let Ok(port) = raw.parse::<u16>() {
        return format!("127.0.0.1:{port}");
    }
    if let Some((host, port)) = raw.rsplit_once(':') {
        if host.is_empty() {
            return format!("127.0.0.1:{port}");
        }
    }
    raw.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_port_normalizes_to_loopback() {
        assert_eq!(normalize_addr("8080"), "127.0.0.1:8080");
    }

    #[test]
    fn host_port_pair_is_unchanged() {
        assert_eq!(normalize_addr("10.0.0.5:9000"), "10.0.0.5:9000");
    }

    #[test]
    fn missing_host_fills_in_loopback() {
        assert_eq!(normalize_addr(":9000"), "127.0.0.1:9000");
    }

    #[test]
    fn save_auth_token_writes_file_at_most_once() {
        let dir = std::env::temp_dir().join(format!("tunnel-client-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tunnels.toml");
        std::fs::write(&path, "").unwrap();

        let config = ResolvedConfig {
            server_addr: "tunnel.example.com:4443".into(),
            authtoken: String::new(),
            root_ca: None,
            insecure_skip_verify: false,
            tunnels: HashMap::new(),
            config_path: Some(path.clone()),
        };

        assert!(config.save_auth_token("tok1").unwrap());
        let written_once = std::fs::read_to_string(&path).unwrap();
        assert!(!config.save_auth_token("tok1").unwrap());
        let written_twice = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written_once, written_twice);

        let file = ConfigFile::load(&path).unwrap();
        assert_eq!(file.auth_token.as_deref(), Some("tok1"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn save_auth_token_is_noop_without_a_config_path() {
        let config = ResolvedConfig {
            server_addr: "tunnel.example.com:4443".into(),
            authtoken: String::new(),
            root_ca: None,
            insecure_skip_verify: false,
            tunnels: HashMap::new(),
            config_path: None,
        };
        assert!(!config.save_auth_token("tok").unwrap());
    }
}
