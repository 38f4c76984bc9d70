use crate::util::{MirrorError, Result};
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

fn open(path: &Path, what: &str) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| MirrorError::TlsConfig(format!("failed to open {} file {:?}: {}", what, path, e)))
}

/// loads the certificate chain and the first private key (pkcs8, then rsa)
/// into a rustls server config for terminating https in front of the mirror
pub fn load_rustls_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig> {
    let cert_chain: Vec<Certificate> = certs(&mut open(cert_path, "cert")?)
        .map_err(|e| MirrorError::TlsConfig(format!("failed to parse certs: {}", e)))?
        .into_iter()
        .map(Certificate)
        .collect();
    if cert_chain.is_empty() {
        return Err(MirrorError::TlsConfig(
            "no certificates found in cert file".to_string(),
        ));
    }

    let mut keys = pkcs8_private_keys(&mut open(key_path, "key")?)
        .map_err(|e| MirrorError::TlsConfig(format!("failed to parse private key: {}", e)))?;
    if keys.is_empty() {
        keys = rsa_private_keys(&mut open(key_path, "key")?)
            .map_err(|e| MirrorError::TlsConfig(format!("failed to parse private key: {}", e)))?;
    }
    if keys.is_empty() {
        return Err(MirrorError::TlsConfig(
            "no private keys found in key file".to_string(),
        ));
    }

    ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, PrivateKey(keys.remove(0)))
        .map_err(|e| MirrorError::TlsConfig(format!("tls config error: {}", e)))
}
