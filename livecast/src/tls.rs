//! TLS listener support

use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Load a PEM certificate chain
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("opening cert {path}"))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("invalid certs in {path}"))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {path}");
    }
    Ok(certs)
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("opening key {path}"))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("invalid key in {path}"))?
        .with_context(|| format!("no private key found in {path}"))
}

/// Build an acceptor advertising HTTP/1.1 only, so WebSocket upgrades work
pub fn acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building TLS server config")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> String {
        let path = std::env::temp_dir().join(format!("livecast-{}-{name}", std::process::id()));
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_missing_files_fail() {
        assert!(load_certs("/nonexistent/cert.pem").is_err());
        assert!(load_private_key("/nonexistent/key.pem").is_err());
        assert!(acceptor("/nonexistent/cert.pem", "/nonexistent/key.pem").is_err());
    }

    #[test]
    fn test_empty_pem_rejected() {
        let path = write_temp("empty.pem", "not a pem file\n");
        let err = load_certs(&path).unwrap_err();
        assert!(err.to_string().contains("no certificates"));
        let err = load_private_key(&path).unwrap_err();
        assert!(err.to_string().contains("no private key"));
        let _ = std::fs::remove_file(path);
    }
}
