#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Codec(#[from] tunnel_proto::CodecError),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("server rejected authentication: {0}")]
    AuthRejected(String),
    #[error("server reported a tunnel error: {0}")]
    TunnelRejected(String),
    #[error("no local address configured for url {0}")]
    UnknownUrl(String),
    #[error("config error: {0}")]
    Config(String),
}
