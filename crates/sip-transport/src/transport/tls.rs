//! TLS acceptor built over the TCP listener

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use tokio_rustls::TlsAcceptor;

use crate::error::{Error, Result};

pub fn load_certs(path: &str) -> Result<Vec<Certificate>> {
    let file = File::open(path).map_err(Error::IoError)?;
    let mut reader = BufReader::new(file);
    let certs: Vec<Certificate> = certs(&mut reader)
        .map_err(Error::IoError)?
        .into_iter()
        .map(Certificate)
        .collect();

    if certs.is_empty() {
        return Err(Error::TlsError(format!("No certificates found in {}", path)));
    }

    Ok(certs)
}

pub fn load_private_key(path: &str) -> Result<PrivateKey> {
    let file = File::open(path).map_err(Error::IoError)?;
    let mut reader = BufReader::new(file);

    // Try PKCS8 first
    let keys = pkcs8_private_keys(&mut reader)
        .map_err(Error::IoError)?
        .into_iter()
        .map(PrivateKey)
        .collect::<Vec<_>>();

    if let Some(key) = keys.into_iter().next() {
        return Ok(key);
    }

    // Try RSA
    let file = File::open(path).map_err(Error::IoError)?;
    let mut reader = BufReader::new(file);
    let keys = rsa_private_keys(&mut reader)
        .map_err(Error::IoError)?
        .into_iter()
        .map(PrivateKey)
        .collect::<Vec<_>>();

    keys.into_iter()
        .next()
        .ok_or_else(|| Error::TlsError(format!("No private keys found in {}", path)))
}

/// Build a TLS acceptor from PEM cert/key files.
pub fn build_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::TlsError(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
