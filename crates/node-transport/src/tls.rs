//! Server-side TLS for the control API.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use rustls::{
    RootCertStore, ServerConfig,
    crypto::aws_lc_rs,
    pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject},
    server::WebPkiClientVerifier,
};
use thiserror::Error;

/// TLS setup error.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Certificate error: {0}")]
    Certificate(String),
    #[error("Private key error: {0}")]
    PrivateKey(String),
    #[error("TLS config error: {0}")]
    Config(String),
}

/// Build the server config from PEM files.
///
/// With `client_ca`, clients must present a certificate chaining to it.
///
/// # Errors
/// Returns error if a file is unreadable or holds no usable PEM material.
pub fn load_server_config(
    cert_file: &Path,
    key_file: &Path,
    client_ca: Option<&Path>,
) -> Result<ServerConfig, TlsError> {
    let cert = read(cert_file)?;
    let key = read(key_file)?;
    let ca = client_ca.map(read).transpose()?;
    server_config_from_pem(&cert, &key, ca.as_deref())
}

/// Build the server config from PEM bytes.
///
/// # Errors
/// Returns error if the PEM material is invalid or the key does not match.
pub fn server_config_from_pem(
    cert_pem: &[u8],
    key_pem: &[u8],
    client_ca_pem: Option<&[u8]>,
) -> Result<ServerConfig, TlsError> {
    let provider = Arc::new(aws_lc_rs::default_provider());

    let certs = parse_certificates(cert_pem)?;
    if certs.is_empty() {
        return Err(TlsError::Certificate("no server certificate found".into()));
    }
    let key = PrivateKeyDer::from_pem_slice(key_pem)
        .map_err(|e| TlsError::PrivateKey(format!("failed to parse private key: {e}")))?;

    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::Config(e.to_string()))?;

    let builder = match client_ca_pem {
        Some(ca_pem) => {
            let roots = root_store(ca_pem)?;
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .map_err(|e| TlsError::Config(format!("client verifier error: {e}")))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let mut config = builder
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::Config(format!("server config error: {e}")))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

fn read(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Certificate(format!("failed to parse certificates: {e}")))
}

fn root_store(pem: &[u8]) -> Result<RootCertStore, TlsError> {
    let certs = parse_certificates(pem)?;
    if certs.is_empty() {
        return Err(TlsError::Certificate("no client CA certificate found".into()));
    }
    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| TlsError::Certificate(format!("failed to add client CA: {e}")))?;
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
    use tokio_test::assert_ok;

    use super::*;

    struct Material {
        cert: Vec<u8>,
        key: Vec<u8>,
        ca: Vec<u8>,
    }

    fn material() -> Material {
        let mut ca_params = CertificateParams::default();
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "Control Plane CA");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let params = CertificateParams::new(vec!["node.local".to_string()]).unwrap();
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &ca_cert, &ca_key).unwrap();

        Material {
            cert: cert.pem().into_bytes(),
            key: key.serialize_pem().into_bytes(),
            ca: ca_cert.pem().into_bytes(),
        }
    }

    #[test]
    fn test_config_with_client_auth() {
        let m = material();
        let config = server_config_from_pem(&m.cert, &m.key, Some(m.ca.as_slice())).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_config_without_client_auth() {
        let m = material();
        assert_ok!(server_config_from_pem(&m.cert, &m.key, None));
    }

    #[test]
    fn test_garbage_pem_is_rejected() {
        let m = material();
        assert!(matches!(
            server_config_from_pem(b"not a cert", &m.key, None),
            Err(TlsError::Certificate(_))
        ));
        assert!(matches!(
            server_config_from_pem(&m.cert, b"not a key", None),
            Err(TlsError::PrivateKey(_))
        ));
        assert!(matches!(
            server_config_from_pem(&m.cert, &m.key, Some(&b""[..])),
            Err(TlsError::Certificate(_))
        ));
    }

    #[test]
    fn test_load_from_files() {
        let m = material();
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("ssl_cert.pem");
        let key = dir.path().join("ssl_key.pem");
        let ca = dir.path().join("ssl_client_cert.pem");
        std::fs::write(&cert, &m.cert).unwrap();
        std::fs::write(&key, &m.key).unwrap();
        std::fs::write(&ca, &m.ca).unwrap();

        assert_ok!(load_server_config(&cert, &key, Some(ca.as_path())));
        assert!(matches!(
            load_server_config(&dir.path().join("missing.pem"), &key, None),
            Err(TlsError::Read { .. })
        ));
    }
}
