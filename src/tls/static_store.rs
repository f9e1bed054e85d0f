//! Statically loaded key-pair store.
//!
//! Every route that carries `tls_material` has its certificate and key read
//! from disk once at start-up and parsed into a `rustls` `CertifiedKey`. The
//! SNI resolver consults this map before ever falling back to ACME.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::sign::CertifiedKey;
use rustls_pemfile::Item;

use crate::error::TlsError;

/// Read and parse a PEM certificate chain + private key into a
/// `rustls::sign::CertifiedKey`, ready to be served for a `ClientHello`.
pub fn load_certified_key(
    cert_path: &Path,
    key_path: &Path,
) -> Result<CertifiedKey, TlsError> {
    let cert_pem = std::fs::read(cert_path).map_err(|source| TlsError::ReadFile {
        kind: "certificate",
        path: cert_path.display().to_string(),
        source,
    })?;
    let key_pem = std::fs::read(key_path).map_err(|source| TlsError::ReadFile {
        kind: "private key",
        path: key_path.display().to_string(),
        source,
    })?;

    let chain: Vec<_> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|_| TlsError::InvalidPem(cert_path.display().to_string()))?;
    if chain.is_empty() {
        return Err(TlsError::InvalidPem(cert_path.display().to_string()));
    }

    let key_item = rustls_pemfile::read_one(&mut key_pem.as_slice())
        .map_err(|_| TlsError::InvalidPem(key_path.display().to_string()))?
        .ok_or_else(|| TlsError::InvalidPem(key_path.display().to_string()))?;
    let key_der = match key_item {
        Item::Pkcs1Key(k) => k.into(),
        Item::Pkcs8Key(k) => k.into(),
        Item::Sec1Key(k) => k.into(),
        _ => return Err(TlsError::InvalidPem(key_path.display().to_string())),
    };

    let signing_key = any_supported_type(&key_der)
        .map_err(|_| TlsError::InvalidPem(key_path.display().to_string()))?;

    Ok(CertifiedKey::new(chain, signing_key))
}

/// Domain -> pre-parsed key pair, built once at supervisor start-up from
/// every route's `tls_material`.
#[derive(Default)]
pub struct StaticKeyPairs {
    by_domain: HashMap<String, Arc<CertifiedKey>>,
}

impl StaticKeyPairs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, domain: impl Into<String>, cert_path: &Path, key_path: &Path) -> Result<(), TlsError> {
        let key = load_certified_key(cert_path, key_path)?;
        self.by_domain.insert(domain.into(), Arc::new(key));
        Ok(())
    }

    pub fn get(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        self.by_domain.get(domain).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.by_domain.is_empty()
    }
}
