//! ACME certificate acquisition, gated by a host-allowance policy and backed
//! by a pluggable [`Cache`].
//!
//! On each SNI miss against the static key-pair store, the resolver asks the
//! [`AcmeManager`] for a certificate. The manager first consults the cache
//! (so a certificate issued by an earlier process, or a prior request, is
//! reused); on a cache miss it runs a full ACME order against the configured
//! directory using HTTP-01 domain validation, then writes the result back to
//! the cache before returning it.

use std::collections::HashMap;
use std::sync::Arc;

use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, NewAccount, NewOrder, OrderStatus,
    RetryPolicy,
};
use parking_lot::RwLock;
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;

use crate::error::AcmeError;
use crate::metrics::Metrics;
use crate::tls::cache::Cache;

/// Production Let's Encrypt ACME directory, used whenever `letsencrypt_url`
/// is left empty.
pub const LETSENCRYPT_PRODUCTION_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Sentinel `letsencrypt_url` value that swaps the resolver onto the
/// in-memory self-signed generator instead of talking to a real directory.
pub const DEV_DIRECTORY_SENTINEL: &str = "dev";

/// In-memory map of outstanding HTTP-01 challenge tokens to the key
/// authorization the challenge handler must serve back at
/// `/.well-known/acme-challenge/<token>`.
pub type ChallengeTokens = Arc<RwLock<HashMap<String, String>>>;

/// A host-allowance policy: returns `true` when `host` may obtain an ACME
/// certificate. Backed by [`crate::route::RouteTable::autocert_allowed`] in
/// the supervisor, but kept abstract here so the manager has no dependency
/// on the routing module.
pub type HostPolicy = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub struct AcmeManager {
    directory_url: String,
    contact_email: Option<String>,
    cache: Arc<dyn Cache>,
    policy: HostPolicy,
    account: RwLock<Option<Account>>,
    challenge_tokens: ChallengeTokens,
    metrics: Arc<Metrics>,
}

impl AcmeManager {
    pub fn new(
        directory_url: String,
        contact_email: Option<String>,
        cache: Arc<dyn Cache>,
        policy: HostPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            directory_url,
            contact_email,
            cache,
            policy,
            account: RwLock::new(None),
            challenge_tokens: Arc::new(RwLock::new(HashMap::new())),
            metrics,
        }
    }

    pub fn challenge_tokens(&self) -> ChallengeTokens {
        self.challenge_tokens.clone()
    }

    /// Create (or load, if already cached) the ACME account used for every
    /// subsequent order. Call once at start-up.
    pub async fn init(&self) -> Result<(), AcmeError> {
        const ACCOUNT_CACHE_KEY: &str = "__account_credentials";

        if let Some(bytes) = self
            .cache
            .get(ACCOUNT_CACHE_KEY)
            .await
            .map_err(AcmeError::from)?
        {
            if let Ok(credentials) = serde_json::from_slice(&bytes) {
                let account = Account::builder()
                    .map_err(|e| AcmeError::AccountCreation(e.to_string()))?
                    .from_credentials(credentials)
                    .await
                    .map_err(|e| AcmeError::AccountCreation(e.to_string()))?;
                *self.account.write() = Some(account);
                return Ok(());
            }
        }

        let contact = self.contact_email.as_ref().map(|e| format!("mailto:{e}"));
        let contact_refs: Vec<&str> = contact.as_deref().into_iter().collect();
        let new_account = NewAccount {
            contact: &contact_refs,
            terms_of_service_agreed: true,
            only_return_existing: false,
        };
        let (account, credentials) = Account::builder()
            .map_err(|e| AcmeError::AccountCreation(e.to_string()))?
            .create(&new_account, self.directory_url.clone(), None)
            .await
            .map_err(|e| AcmeError::AccountCreation(e.to_string()))?;

        let credentials_json = serde_json::to_vec(&credentials)
            .map_err(|e| AcmeError::AccountCreation(e.to_string()))?;
        self.cache
            .put(ACCOUNT_CACHE_KEY, &credentials_json)
            .await
            .map_err(AcmeError::from)?;

        *self.account.write() = Some(account);
        Ok(())
    }

    /// Obtain a certificate for `host`, subject to the host-allowance
    /// policy, consulting the cache before issuing a fresh order.
    pub async fn certificate_for(&self, host: &str) -> Result<Arc<CertifiedKey>, AcmeError> {
        match self.certificate_for_inner(host).await {
            Ok(key) => Ok(key),
            Err(e) => {
                self.metrics.record_acme_failure();
                Err(e)
            }
        }
    }

    async fn certificate_for_inner(&self, host: &str) -> Result<Arc<CertifiedKey>, AcmeError> {
        if !(self.policy)(host) {
            return Err(AcmeError::Order {
                domain: host.to_string(),
                reason: "host is not allowed to use autocert".to_string(),
            });
        }

        if let Some(bytes) = self.cache.get(host).await.map_err(AcmeError::from)? {
            if let Some(key) = parse_certified_key(&bytes) {
                return Ok(Arc::new(key));
            }
        }

        let issued = self.issue(host).await?;
        self.cache
            .put(host, &issued.cache_bytes)
            .await
            .map_err(AcmeError::from)?;
        self.metrics.record_acme_issuance();
        Ok(Arc::new(issued.certified_key))
    }

    async fn issue(&self, domain: &str) -> Result<IssuedCertificate, AcmeError> {
        let account = {
            let guard = self.account.read();
            guard
                .clone()
                .ok_or_else(|| AcmeError::AccountCreation("acme account not initialised".to_string()))?
        };

        let identifiers = [Identifier::Dns(domain.to_string())];
        let new_order = NewOrder::new(&identifiers);
        let mut order = account
            .new_order(&new_order)
            .await
            .map_err(|e| AcmeError::Order { domain: domain.to_string(), reason: e.to_string() })?;

        let mut authorizations = order.authorizations();
        while let Some(auth_result) = authorizations.next().await {
            let mut auth = auth_result.map_err(|e| AcmeError::Order {
                domain: domain.to_string(),
                reason: e.to_string(),
            })?;

            match auth.status {
                AuthorizationStatus::Valid => continue,
                AuthorizationStatus::Pending => {
                    let mut challenge = auth
                        .challenge(ChallengeType::Http01)
                        .ok_or_else(|| AcmeError::Challenge(domain.to_string()))?;
                    let key_auth = challenge.key_authorization();
                    self.challenge_tokens
                        .write()
                        .insert(challenge.token.clone(), key_auth.as_str().to_string());
                    challenge
                        .set_ready()
                        .await
                        .map_err(|e| AcmeError::Challenge(format!("{domain}: {e}")))?;
                }
                other => {
                    return Err(AcmeError::Order {
                        domain: domain.to_string(),
                        reason: format!("unexpected authorization status: {other:?}"),
                    });
                }
            }
        }

        let retry_policy = RetryPolicy::new().timeout(std::time::Duration::from_secs(300));
        let status = order
            .poll_ready(&retry_policy)
            .await
            .map_err(|_| AcmeError::Timeout(domain.to_string()))?;
        self.challenge_tokens.write().clear();

        if status != OrderStatus::Ready {
            return Err(AcmeError::Order {
                domain: domain.to_string(),
                reason: format!("order did not become ready: {status:?}"),
            });
        }

        let private_key_pem = order
            .finalize()
            .await
            .map_err(|e| AcmeError::Order { domain: domain.to_string(), reason: e.to_string() })?;
        let cert_chain_pem = order
            .poll_certificate(&retry_policy)
            .await
            .map_err(|_| AcmeError::Timeout(domain.to_string()))?;

        let key_der = rustls_pemfile::pkcs8_private_keys(&mut private_key_pem.as_bytes())
            .next()
            .and_then(|r| r.ok())
            .ok_or_else(|| AcmeError::CertParse(domain.to_string(), "no private key in finalize response".to_string()))?;
        let chain: Vec<_> = rustls_pemfile::certs(&mut cert_chain_pem.as_bytes())
            .collect::<Result<_, _>>()
            .map_err(|e| AcmeError::CertParse(domain.to_string(), e.to_string()))?;
        let signing_key = any_supported_type(&key_der.clone().into())
            .map_err(|e| AcmeError::CertParse(domain.to_string(), e.to_string()))?;

        let mut cache_bytes = Vec::new();
        cache_bytes.extend_from_slice(&(chain.len() as u32).to_le_bytes());
        for cert in &chain {
            cache_bytes.extend_from_slice(&(cert.len() as u32).to_le_bytes());
            cache_bytes.extend_from_slice(cert);
        }
        cache_bytes.extend_from_slice(&(key_der.secret_pkcs8_der().len() as u32).to_le_bytes());
        cache_bytes.extend_from_slice(key_der.secret_pkcs8_der());

        Ok(IssuedCertificate {
            certified_key: CertifiedKey::new(chain, signing_key),
            cache_bytes,
        })
    }
}

struct IssuedCertificate {
    certified_key: CertifiedKey,
    cache_bytes: Vec<u8>,
}

/// Inverse of the framing written in [`AcmeManager::issue`]: a length-prefixed
/// certificate chain followed by a length-prefixed PKCS#8 private key.
fn parse_certified_key(bytes: &[u8]) -> Option<CertifiedKey> {
    let mut cursor = bytes;
    let read_u32 = |cursor: &mut &[u8]| -> Option<u32> {
        let (head, rest) = cursor.split_at_checked(4)?;
        *cursor = rest;
        Some(u32::from_le_bytes(head.try_into().ok()?))
    };

    let chain_len = read_u32(&mut cursor)? as usize;
    let mut chain = Vec::with_capacity(chain_len);
    for _ in 0..chain_len {
        let len = read_u32(&mut cursor)? as usize;
        let (cert, rest) = cursor.split_at_checked(len)?;
        chain.push(CertificateDer::from(cert.to_vec()));
        cursor = rest;
    }
    let key_len = read_u32(&mut cursor)? as usize;
    let (key_bytes, _) = cursor.split_at_checked(key_len)?;
    let key_der = PrivatePkcs8KeyDer::from(key_bytes.to_vec());
    let signing_key = any_supported_type(&key_der.into()).ok()?;
    Some(CertifiedKey::new(chain, signing_key))
}

/// HTTP-01 challenge responder consulted by the plain listener before any
/// request is handed to the routing core.
pub struct ChallengeHandler {
    tokens: ChallengeTokens,
}

impl ChallengeHandler {
    pub fn new(tokens: ChallengeTokens) -> Self {
        Self { tokens }
    }

    pub fn is_challenge_request(path: &str) -> bool {
        path.starts_with("/.well-known/acme-challenge/")
    }

    pub fn respond(&self, path: &str) -> Option<String> {
        let token = path.strip_prefix("/.well-known/acme-challenge/")?;
        self.tokens.read().get(token).cloned()
    }
}
