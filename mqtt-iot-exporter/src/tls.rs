//! TLS acceptor for the MQTT listener.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls_pemfile::{certs, private_key};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::RootCertStore;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tracing::info;

use crate::config::TlsConfig;

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path).map_err(|e| anyhow::anyhow!("Failed to open {}: {}", path, e))?,
    );
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader).collect::<Result<_, _>>()?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }
    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(path).map_err(|e| anyhow::anyhow!("Failed to open {}: {}", path, e))?,
    );
    private_key(&mut reader)?.ok_or_else(|| anyhow::anyhow!("No private key found in {}", path))
}

/// Build the acceptor, or `None` when TLS is not configured.
///
/// When a client CA is configured, clients must present a certificate
/// signed by it.
pub fn load_acceptor(config: &TlsConfig) -> anyhow::Result<Option<TlsAcceptor>> {
    let (Some(cert_path), Some(key_path)) = (&config.server_cert, &config.server_key) else {
        return Ok(None);
    };

    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let builder = ServerConfig::builder();
    let server_config = match &config.client_ca_cert {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots.add(cert)?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build()?;
            info!(client_ca = %ca_path, "Requiring client certificates");
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)?
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key)?,
    };

    info!(cert = %cert_path, "TLS enabled for MQTT listener");
    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};
    use std::path::Path;

    fn write_self_signed(dir: &Path, name: &str) -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();

        let cert_path = dir.join(format!("{name}.pem"));
        let key_path = dir.join(format!("{name}.key"));
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key.serialize_pem()).unwrap();

        (
            cert_path.to_string_lossy().into_owned(),
            key_path.to_string_lossy().into_owned(),
        )
    }

    #[test]
    fn test_disabled_without_server_cert() {
        assert!(load_acceptor(&TlsConfig::default()).unwrap().is_none());
    }

    #[test]
    fn test_server_only() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_self_signed(dir.path(), "server");

        let config = TlsConfig {
            server_cert: Some(cert),
            server_key: Some(key),
            ..Default::default()
        };
        assert!(load_acceptor(&config).unwrap().is_some());
    }

    #[test]
    fn test_with_client_ca() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_self_signed(dir.path(), "server");
        let ca = crate::certs::generate_ca().unwrap();
        let ca_path = dir.path().join("ca.pem");
        std::fs::write(&ca_path, ca.cert_pem).unwrap();

        let config = TlsConfig {
            server_cert: Some(cert),
            server_key: Some(key),
            client_ca_cert: Some(ca_path.to_string_lossy().into_owned()),
            ..Default::default()
        };
        assert!(load_acceptor(&config).unwrap().is_some());
    }

    #[test]
    fn test_missing_files() {
        let config = TlsConfig {
            server_cert: Some("/nonexistent/server.pem".to_string()),
            server_key: Some("/nonexistent/server.key".to_string()),
            ..Default::default()
        };
        assert!(load_acceptor(&config).is_err());
    }

    #[test]
    fn test_empty_cert_file() {
        let dir = tempfile::tempdir().unwrap();
        let (_, key) = write_self_signed(dir.path(), "server");
        let empty = dir.path().join("empty.pem");
        std::fs::write(&empty, "").unwrap();

        let config = TlsConfig {
            server_cert: Some(empty.to_string_lossy().into_owned()),
            server_key: Some(key),
            ..Default::default()
        };
        let Err(err) = load_acceptor(&config) else {
            panic!("empty certificate file accepted");
        };
        assert!(err.to_string().contains("No certificates found"));
    }
}
