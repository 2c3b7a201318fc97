use std::path::Path;
use std::sync::Arc;

use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use crate::error::ServerError;

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let f = std::fs::File::open(path)?;
    let mut rd = std::io::BufReader::new(f);
    rustls_pemfile::certs(&mut rd)
        .collect::<Result<Vec<_>, _>>()
        .map_err(ServerError::Io)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let f = std::fs::File::open(path)?;
    let mut rd = std::io::BufReader::new(f);
    rustls_pemfile::private_key(&mut rd)?
        .ok_or_else(|| ServerError::Tls(format!("no private key found in {}", path.display())))
}

/// Builds the TLS acceptor shared by the tunnel listener and the HTTPS
/// public listener. Client certificate verification is enabled only when
/// `client_ca` is supplied.
pub fn build_acceptor(
    cert_path: &Path,
    key_path: &Path,
    client_ca: Option<&Path>,
) -> Result<TlsAcceptor, ServerError> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let builder = rustls::ServerConfig::builder();
    let mut config = match client_ca {
        Some(ca_path) => {
            let ca_certs = load_certs(ca_path)?;
            let mut roots = rustls::RootCertStore::empty();
            for c in ca_certs {
                roots
                    .add(c)
                    .map_err(|e| ServerError::Tls(format!("bad client CA cert: {e}")))?;
            }
            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| ServerError::Tls(format!("client verifier: {e}")))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
                .map_err(|e| ServerError::Tls(format!("bad cert/key: {e}")))?
        }
        None => builder
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::Tls(format!("bad cert/key: {e}")))?,
    };

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}
