//! Typed error hierarchy for the proxy core and its ambient collaborators.
//!
//! Each module boundary gets its own `thiserror` enum; [`AppError`] is the
//! top-level union the binary entry point matches on to pick an exit code.

use thiserror::Error;

/// Errors raised while building or mutating a [`crate::route::RouteTable`].
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("duplicate domain: {0}")]
    DuplicateDomain(String),

    #[error("invalid host pattern {0:?}: empty label")]
    EmptyLabel(String),

    #[error("invalid redirect target for {domain}: {reason}")]
    InvalidRedirectTarget { domain: String, reason: String },

    #[error("load balancer route {0} has no targets")]
    EmptyLoadBalancerTargets(String),

    #[error("route {0} declares tls_material but is missing cert_file or key_file")]
    IncompleteTlsMaterial(String),
}

/// Errors surfaced while dispatching a single request through the reverse
/// proxy transport. These never propagate past the connection task that hit
/// them — the caller turns every variant into a best-effort HTTP response.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("dial to upstream {0} failed: {1}")]
    Dial(String, std::io::Error),

    #[error("upstream round-trip failed: {0}")]
    RoundTrip(#[from] hyper_util::client::legacy::Error),

    #[error("invalid request path: {0}")]
    InvalidPath(String),

    #[error("websocket handshake with upstream failed: {0}")]
    WsHandshake(String),

    #[error("method {0} not allowed for websocket upgrade")]
    WsMethodNotAllowed(String),

    #[error("redirect target could not be resolved: {0}")]
    RedirectResolution(String),
}

/// Errors from the SNI certificate resolver and static key-pair store.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {kind} file {path}: {source}")]
    ReadFile {
        kind: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse PEM material for {0}")]
    InvalidPem(String),

    #[error("no certificate available for host {0}")]
    NoCertificate(String),

    #[error("autocert policy denied host {0}")]
    AutocertDenied(String),

    #[error("self-signed certificate generation failed: {0}")]
    SelfSigned(#[from] rcgen::Error),

    #[error(transparent)]
    Acme(#[from] AcmeError),
}

/// Errors from the ACME client and renewal loop.
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("acme account creation failed: {0}")]
    AccountCreation(String),

    #[error("acme order failed for {domain}: {reason}")]
    Order { domain: String, reason: String },

    #[error("http-01 challenge failed for {0}")]
    Challenge(String),

    #[error("timed out waiting for order to become ready for {0}")]
    Timeout(String),

    #[error("failed to parse issued certificate for {0}: {1}")]
    CertParse(String, String),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Errors from a [`crate::tls::cache::Cache`] backend. `Get` on a missing key
/// is not an error — it returns `Ok(None)`; this enum covers true I/O and
/// transport failures.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("local cache I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("object store error for key {key}: {reason}")]
    ObjectStore { key: String, reason: String },
}

/// Errors from loading the ambient configuration surface (file, env, CLI).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: Box<toml::de::Error>,
    },

    #[error(transparent)]
    Routing(#[from] RoutingError),
}

/// Errors from the supervisor's start-up sequence.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {listener} listener on {addr}: {source}")]
    Bind {
        listener: &'static str,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("acme account initialisation failed: {0}")]
    AcmeInit(#[source] AcmeError),
}

/// Top-level error the binary entry point maps to an exit code.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Process exit code for this failure, per the external interfaces
    /// contract: 1 for config load failures, 2 for listener bind failures,
    /// 3 for ACME account init failures, 1 as a catch-all otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) => 1,
            AppError::Supervisor(SupervisorError::Config(_)) => 1,
            AppError::Supervisor(SupervisorError::Bind { .. }) => 2,
            AppError::Supervisor(SupervisorError::AcmeInit(_)) => 3,
            AppError::Supervisor(SupervisorError::Tls(_)) => 3,
            AppError::Io(_) => 1,
        }
    }
}
