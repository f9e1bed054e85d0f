//! The `GetCertificate` callback wired into the TLS listener.
//!
//! Decision order per the data model: a statically loaded key pair for the
//! exact SNI name wins outright; otherwise the request falls through to the
//! ACME manager (or, in dev mode, the self-signed generator), which applies
//! the host-allowance policy before issuing anything.

use std::sync::Arc;

use rustls::ServerConfig;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;

use crate::tls::acme::AcmeManager;
use crate::tls::self_signed::SelfSignedGenerator;
use crate::tls::static_store::StaticKeyPairs;

/// Either a real ACME manager or the dev-mode self-signed generator; chosen
/// once at start-up based on whether `letsencrypt_url == "dev"`.
pub enum AcmeBackend {
    Acme(Arc<AcmeManager>),
    Dev(Arc<SelfSignedGenerator>),
}

pub struct SniCertResolver {
    static_keys: StaticKeyPairs,
    backend: AcmeBackend,
}

impl SniCertResolver {
    pub fn new(static_keys: StaticKeyPairs, backend: AcmeBackend) -> Self {
        Self { static_keys, backend }
    }

    /// Build a `rustls::ServerConfig` that resolves certificates through
    /// this resolver and defaults `ALPN` to HTTP/1.1 only, per the external
    /// interfaces contract.
    pub fn into_server_config(self: Arc<Self>) -> ServerConfig {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(self);
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        config
    }

    async fn resolve_async(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        if let Some(key) = self.static_keys.get(name) {
            return Some(key);
        }
        match &self.backend {
            AcmeBackend::Acme(manager) => manager.certificate_for(name).await.ok(),
            AcmeBackend::Dev(generator) => generator.certificate_for(name).ok(),
        }
    }
}

impl std::fmt::Debug for SniCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniCertResolver").finish()
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?.to_string();
        if let Some(key) = self.static_keys.get(&name) {
            return Some(key);
        }
        // `ResolvesServerCert::resolve` is synchronous in rustls; the ACME
        // path only ever does async work on a cache hit or a fresh issuance,
        // neither of which the handshake can itself block on indefinitely,
        // so we bridge into async via `block_in_place` + a oneshot runtime
        // handle rather than change the rustls trait's shape.
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(self.resolve_async(&name))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::self_signed::SelfSignedGenerator;

    #[tokio::test]
    async fn dev_backend_mints_a_leaf_for_unknown_sni() {
        let resolver = SniCertResolver::new(
            StaticKeyPairs::new(),
            AcmeBackend::Dev(Arc::new(SelfSignedGenerator::new().unwrap())),
        );
        let key = resolver.resolve_async("foo.test").await;
        assert!(key.is_some());
    }
}
