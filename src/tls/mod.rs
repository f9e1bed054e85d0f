//! SNI + ACME certificate resolver.
//!
//! Combines statically loaded key pairs with an automated ACME manager (or,
//! in dev mode, an in-memory self-signed generator) behind a single
//! `rustls::server::ResolvesServerCert` implementation wired into the TLS
//! listener.

pub mod acme;
pub mod cache;
pub mod self_signed;
pub mod sni;
pub mod static_store;

pub use acme::{AcmeManager, ChallengeHandler, ChallengeTokens, DEV_DIRECTORY_SENTINEL, LETSENCRYPT_PRODUCTION_DIRECTORY};
pub use cache::Cache;
pub use self_signed::SelfSignedGenerator;
pub use sni::{AcmeBackend, SniCertResolver};
pub use static_store::StaticKeyPairs;
