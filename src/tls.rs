use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("cannot read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse certificates in {path}: {source}")]
    Certificates { path: PathBuf, source: io::Error },
    #[error("no certificate found in {0}")]
    NoCertificate(PathBuf),
    #[error("failed to parse private key in {path}: {source}")]
    PrivateKey { path: PathBuf, source: io::Error },
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),
}

/// Checks that the PEM files hold at least one certificate and a private
/// key. Returns the number of certificates in the chain.
pub async fn check_tls_material(cert_path: &Path, key_path: &Path) -> Result<usize, TlsError> {
    let cert_pem = read(cert_path).await?;
    let key_pem = read(key_path).await?;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Certificates {
            path: cert_path.to_owned(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate(cert_path.to_owned()));
    }

    rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|source| TlsError::PrivateKey {
            path: key_path.to_owned(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(key_path.to_owned()))?;

    Ok(certs.len())
}

async fn read(path: &Path) -> Result<Vec<u8>, TlsError> {
    fs::read(path).await.map_err(|source| TlsError::Read {
        path: path.to_owned(),
        source,
    })
}
