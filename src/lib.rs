//! `sandproxy` — a multi-tenant HTTP/HTTPS reverse proxy: host-based routing
//! over a wildcard-capable trie, pluggable egress dispatch (plain HTTP,
//! verified/skip-verify HTTPS, redirect, round-robin load balancing), and an
//! SNI certificate resolver backed by static key pairs and ACME.

pub mod config;
pub mod error;
pub mod lb;
pub mod metrics;
pub mod proxy;
pub mod route;
pub mod supervisor;
pub mod tls;

pub use error::AppError;
pub use supervisor::Supervisor;
