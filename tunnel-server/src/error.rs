#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Codec(#[from] tunnel_proto::CodecError),
    #[error("url {0} is already registered")]
    UrlTaken(String),
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("no proxy connection available")]
    ProxyUnavailable,
    #[error("registration exhausted after {0} collisions")]
    RegistrationExhausted(u32),
    #[error("tls configuration error: {0}")]
    Tls(String),
    #[error("affinity cache error: {0}")]
    Cache(String),
}
