//! Dev-mode certificate synthesis.
//!
//! When the configured ACME directory is the sentinel value `"dev"`, the SNI
//! resolver swaps its ACME path for this generator instead of talking to a
//! real ACME server: an in-memory root CA is created once, and a leaf
//! certificate with the requested SNI name as both CN and SAN is minted and
//! cached per name. Intended for integration tests only — every process
//! restart produces a new, untrusted root.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rcgen::{CertificateParams, DistinguishedName, DnType, Issuer, KeyPair, SanType};
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;

use crate::error::TlsError;

fn root_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "sandproxy dev root");
    dn.push(DnType::OrganizationName, "sandproxy");
    params.distinguished_name = dn;
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params
}

/// Generates and caches self-signed leaf certificates for arbitrary SNI
/// names, signed by a single in-process root CA.
pub struct SelfSignedGenerator {
    root_params: CertificateParams,
    root_der: CertificateDer<'static>,
    root_key: KeyPair,
    leaves: Mutex<HashMap<String, Arc<CertifiedKey>>>,
}

impl SelfSignedGenerator {
    pub fn new() -> Result<Self, TlsError> {
        let root_params = root_params();
        let root_key = KeyPair::generate()?;
        let root_cert = root_params.clone().self_signed(&root_key)?;
        let root_der = CertificateDer::from(root_cert.der().to_vec());
        Ok(Self {
            root_params,
            root_der,
            root_key,
            leaves: Mutex::new(HashMap::new()),
        })
    }

    /// Return the cached leaf for `name`, minting and caching one on first
    /// request.
    pub fn certificate_for(&self, name: &str) -> Result<Arc<CertifiedKey>, TlsError> {
        if let Some(existing) = self.leaves.lock().get(name) {
            return Ok(existing.clone());
        }

        let mut params = CertificateParams::new(vec![name.to_string()])?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::DnsName(
            name.try_into().map_err(|_| rcgen::Error::InvalidNameType)?,
        )];

        let leaf_key = KeyPair::generate()?;
        let issuer = Issuer::new(self.root_params.clone(), &self.root_key);
        let leaf_cert = params.signed_by(&leaf_key, &issuer)?;

        let chain = vec![CertificateDer::from(leaf_cert.der().to_vec()), self.root_der.clone()];
        let key_der = PrivatePkcs8KeyDer::from(leaf_key.serialize_der());
        let signing_key = any_supported_type(&key_der.into())
            .map_err(|_| TlsError::InvalidPem(format!("dev cert for {name}")))?;
        let certified = Arc::new(CertifiedKey::new(chain, signing_key));

        self.leaves.lock().insert(name.to_string(), certified.clone());
        Ok(certified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mints_and_caches_a_leaf_per_name() {
        let gen = SelfSignedGenerator::new().unwrap();
        let first = gen.certificate_for("foo.test").unwrap();
        let second = gen.certificate_for("foo.test").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = gen.certificate_for("bar.test").unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }
}
