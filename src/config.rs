//! The ambient configuration surface consumed from the (out-of-scope)
//! YAML/env configuration collaborator. The core does not own config
//! loading or validation beyond what's needed to build a [`RouteTable`]; it
//! only defines the shape the collaborator must hand it.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::route::{AuthConfig, AuthMode, EgressMode, RouteSpec, WsConfig};

/// Raw, on-disk shape of one table entry under `[[routes]]`.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub domain: String,
    #[serde(default = "default_egress_type")]
    pub egress_type: String,
    #[serde(default)]
    pub out_address: String,
    #[serde(default)]
    pub load_balancer_targets: Vec<String>,
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default)]
    pub autocert: bool,
    #[serde(default = "default_true")]
    pub ws_enabled: bool,
    #[serde(default = "default_ws_buf")]
    pub ws_read_buf: usize,
    #[serde(default = "default_ws_buf")]
    pub ws_write_buf: usize,
    #[serde(default = "default_ws_read_deadline_secs")]
    pub ws_read_deadline_secs: u64,
    #[serde(default)]
    pub auth_mode: String,
    #[serde(default)]
    pub auth_header_key: String,
    #[serde(default)]
    pub auth_expected_value: String,
    #[serde(default)]
    pub force_https: bool,
    #[serde(default)]
    pub flush_interval: u64,
}

fn default_egress_type() -> String {
    "HTTP".to_string()
}
fn default_true() -> bool {
    true
}
fn default_ws_buf() -> usize {
    4096
}
fn default_ws_read_deadline_secs() -> u64 {
    60
}

impl RouteConfig {
    /// Build a validated [`RouteSpec`]. `egress_type` is parsed with the same
    /// [`EgressMode::parse`] used everywhere else in the source, so an
    /// unrecognised value defaults to `Http` here too rather than rejecting
    /// the config entry — the two call sites are kept deliberately in sync.
    pub fn into_spec(self) -> Result<RouteSpec, ConfigError> {
        Ok(RouteSpec {
            domain: self.domain,
            egress_mode: EgressMode::parse(&self.egress_type),
            out_address: self.out_address,
            load_balancer_targets: self.load_balancer_targets,
            cert_file: self.cert_file,
            key_file: self.key_file,
            autocert: self.autocert,
            ws_config: WsConfig {
                enabled: self.ws_enabled,
                read_buf: self.ws_read_buf,
                write_buf: self.ws_write_buf,
                read_deadline: Duration::from_secs(self.ws_read_deadline_secs),
            },
            auth: AuthConfig {
                mode: if self.auth_mode.eq_ignore_ascii_case("apikey") {
                    AuthMode::ApiKey
                } else {
                    AuthMode::None
                },
                header_key: self.auth_header_key,
                expected_value: self.auth_expected_value,
            },
            force_https: self.force_https,
            flush_interval: self.flush_interval,
        })
    }
}

/// S3 cache backend parameters, injected wholesale — the SDK credential
/// chain itself is the AWS SDK's concern, not ours.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct S3CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub folder: String,
}

/// The full on-disk configuration surface: globals plus the route table.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_listen_addr_tls")]
    pub listen_addr_tls: String,
    #[serde(default)]
    pub disable_tls: bool,
    #[serde(default)]
    pub fallback_domain: String,
    #[serde(default)]
    pub cache_path: String,
    #[serde(default)]
    pub autocert_all: bool,
    #[serde(default)]
    pub letsencrypt_url: String,
    #[serde(default)]
    pub letsencrypt_email: Option<String>,
    #[serde(default)]
    pub num_cpu: usize,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub s3_cache: S3CacheConfig,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

fn default_listen_addr() -> String {
    ":80".to_string()
}
fn default_listen_addr_tls() -> String {
    ":443".to_string()
}

impl Config {
    /// Parse a TOML document into a `Config`. The out-of-scope collaborator
    /// this stands in for may additionally merge environment variables and
    /// CLI flags; the core only needs the resulting, fully-merged shape.
    pub fn parse_toml(contents: &str, path: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source: Box::new(source),
        })
    }

    pub async fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
        Self::parse_toml(&contents, &path.display().to_string())
    }

    /// Default cache directory when `cache_path` is left empty, per §6:
    /// `/tmp/<app>`.
    pub fn cache_dir(&self) -> PathBuf {
        if self.cache_path.is_empty() {
            PathBuf::from("/tmp/sandproxy")
        } else {
            PathBuf::from(&self.cache_path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_parses_with_defaults() {
        let toml = r#"
            [[routes]]
            domain = "example.com"
            out_address = "127.0.0.1:9092"
        "#;
        let config = Config::parse_toml(toml, "test.toml").unwrap();
        assert_eq!(config.listen_addr, ":80");
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.routes[0].egress_type, "HTTP");
    }

    #[test]
    fn route_config_converts_apikey_auth() {
        let route = RouteConfig {
            domain: "a.test".to_string(),
            egress_type: "HTTP".to_string(),
            out_address: "127.0.0.1:9092".to_string(),
            load_balancer_targets: vec![],
            cert_file: None,
            key_file: None,
            autocert: false,
            ws_enabled: true,
            ws_read_buf: 4096,
            ws_write_buf: 4096,
            ws_read_deadline_secs: 60,
            auth_mode: "ApiKey".to_string(),
            auth_header_key: "X-Api-Key".to_string(),
            auth_expected_value: "secret".to_string(),
            force_https: false,
            flush_interval: 0,
        };
        let spec = route.into_spec().unwrap();
        assert_eq!(spec.auth.mode, AuthMode::ApiKey);
    }

    #[test]
    fn cache_dir_defaults_when_unset() {
        let toml = "";
        let config = Config::parse_toml(toml, "test.toml").unwrap();
        assert_eq!(config.cache_dir(), PathBuf::from("/tmp/sandproxy"));
    }
}
