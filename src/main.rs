use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use sandproxy::config::Config;
use sandproxy::error::{AppError, SupervisorError};
use sandproxy::route::RouteSpec;
use sandproxy::supervisor::Supervisor;
use sandproxy::tls::{
    AcmeBackend, AcmeManager, Cache, ChallengeHandler, DEV_DIRECTORY_SENTINEL,
    LETSENCRYPT_PRODUCTION_DIRECTORY, SelfSignedGenerator, SniCertResolver, StaticKeyPairs,
};
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::EnvFilter;

/// sandproxy - multi-tenant HTTP/HTTPS reverse proxy
#[derive(Parser)]
#[command(name = "sandproxy")]
#[command(version)]
#[command(about = "Multi-tenant HTTP/HTTPS reverse proxy with wildcard host routing and SNI+ACME certificates")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, env = "SANDPROXY_CONFIG", default_value = "/etc/sandproxy/config.toml")]
    config: PathBuf,

    /// Override the plain listen address (file < env < CLI)
    #[arg(long, env = "SANDPROXY_LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Override the TLS listen address (file < env < CLI)
    #[arg(long, env = "SANDPROXY_LISTEN_ADDR_TLS")]
    listen_addr_tls: Option<String>,

    /// Disable the TLS listener entirely (file < env < CLI)
    #[arg(long, env = "SANDPROXY_DISABLE_TLS")]
    disable_tls: bool,

    /// Enable the `X-Debug-Host` lookup override (file < env < CLI)
    #[arg(long, env = "SANDPROXY_DEBUG")]
    debug: bool,

    /// Route requests with no matching host to this domain (file < env < CLI)
    #[arg(long, env = "SANDPROXY_FALLBACK_DOMAIN")]
    fallback_domain: Option<String>,

    /// Override the ACME/static-cert cache directory (file < env < CLI)
    #[arg(long, env = "SANDPROXY_CACHE_PATH")]
    cache_path: Option<String>,

    /// Allow autocert for every host, not just routes with `autocert = true`
    #[arg(long, env = "SANDPROXY_AUTOCERT_ALL")]
    autocert_all: bool,

    /// Override the ACME directory URL, or "dev" for self-signed certificates
    #[arg(long, env = "SANDPROXY_LETSENCRYPT_URL")]
    letsencrypt_url: Option<String>,

    /// Contact email passed on ACME account creation
    #[arg(long, env = "SANDPROXY_LETSENCRYPT_EMAIL")]
    letsencrypt_email: Option<String>,

    /// Clamp the number of tokio worker threads (0 = use all available)
    #[arg(long, env = "SANDPROXY_NUM_CPU")]
    num_cpu: Option<usize>,

    /// Use the S3-backed ACME cache instead of the local filesystem
    #[arg(long, env = "SANDPROXY_S3_ENABLED")]
    s3_enabled: bool,

    /// S3 access key id for the ACME cache backend
    #[arg(long, env = "SANDPROXY_S3_ID")]
    s3_id: Option<String>,

    /// S3 secret access key for the ACME cache backend
    #[arg(long, env = "SANDPROXY_S3_SECRET")]
    s3_secret: Option<String>,

    /// S3 region for the ACME cache backend
    #[arg(long, env = "SANDPROXY_S3_REGION")]
    s3_region: Option<String>,

    /// S3 bucket for the ACME cache backend
    #[arg(long, env = "SANDPROXY_S3_BUCKET")]
    s3_bucket: Option<String>,

    /// Key prefix within the S3 bucket for the ACME cache backend
    #[arg(long, env = "SANDPROXY_S3_FOLDER")]
    s3_folder: Option<String>,
}

impl Args {
    /// Apply CLI/env overrides onto a file-loaded config. `disable_tls` and
    /// `debug` are plain booleans (clap/env already resolve their own
    /// precedence against a `false` default), so they only flip the file's
    /// value to `true`, never back to `false`.
    fn apply_to(&self, config: &mut Config) {
        if let Some(addr) = &self.listen_addr {
            config.listen_addr = addr.clone();
        }
        if let Some(addr) = &self.listen_addr_tls {
            config.listen_addr_tls = addr.clone();
        }
        if self.disable_tls {
            config.disable_tls = true;
        }
        if self.debug {
            config.debug = true;
        }
        if let Some(domain) = &self.fallback_domain {
            config.fallback_domain = domain.clone();
        }
        if let Some(path) = &self.cache_path {
            config.cache_path = path.clone();
        }
        if self.autocert_all {
            config.autocert_all = true;
        }
        if let Some(url) = &self.letsencrypt_url {
            config.letsencrypt_url = url.clone();
        }
        if let Some(email) = &self.letsencrypt_email {
            config.letsencrypt_email = Some(email.clone());
        }
        if let Some(num_cpu) = self.num_cpu {
            config.num_cpu = num_cpu;
        }
        if self.s3_enabled {
            config.s3_cache.enabled = true;
        }
        if let Some(id) = &self.s3_id {
            config.s3_cache.id = id.clone();
        }
        if let Some(secret) = &self.s3_secret {
            config.s3_cache.secret = secret.clone();
        }
        if let Some(region) = &self.s3_region {
            config.s3_cache.region = region.clone();
        }
        if let Some(bucket) = &self.s3_bucket {
            config.s3_cache.bucket = bucket.clone();
        }
        if let Some(folder) = &self.s3_folder {
            config.s3_cache.folder = folder.clone();
        }
    }
}

fn install_rustls_crypto_provider() {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return;
    }
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Go's `:80`-style "all interfaces" listen address isn't a valid Rust
/// socket address on its own; normalise it to `0.0.0.0:80` before binding.
fn normalize_listen_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    }
}

async fn build_cache(config: &Config) -> Result<Arc<dyn Cache>, AppError> {
    if config.s3_cache.enabled {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if !config.s3_cache.region.is_empty() {
            loader = loader.region(aws_config::Region::new(config.s3_cache.region.clone()));
        }
        if !config.s3_cache.id.is_empty() && !config.s3_cache.secret.is_empty() {
            let credentials = aws_credential_types::Credentials::new(
                config.s3_cache.id.clone(),
                config.s3_cache.secret.clone(),
                None,
                None,
                "sandproxy-config",
            );
            loader = loader.credentials_provider(credentials);
        }
        let sdk_config = loader.load().await;
        let client = aws_sdk_s3::Client::new(&sdk_config);
        let folder = (!config.s3_cache.folder.is_empty()).then(|| config.s3_cache.folder.clone());
        Ok(Arc::new(sandproxy::tls::cache::S3Cache::new(client, config.s3_cache.bucket.clone(), folder)))
    } else {
        Ok(Arc::new(sandproxy::tls::cache::DirCache::new(config.cache_dir())))
    }
}

/// Resolves on `SIGTERM` on unix; never resolves elsewhere, so the
/// `tokio::select!` in [`run`] degrades to `ctrl_c`-only on platforms without
/// that signal.
#[cfg(unix)]
async fn wait_for_terminate() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_terminate() {
    std::future::pending::<()>().await;
}

async fn run(config: Config) -> Result<(), AppError> {
    let specs: Vec<RouteSpec> = config
        .routes
        .iter()
        .cloned()
        .map(|route| route.into_spec())
        .collect::<Result<_, _>>()?;

    let mut static_keys = StaticKeyPairs::new();
    for route in &config.routes {
        if let (Some(cert_file), Some(key_file)) = (&route.cert_file, &route.key_file) {
            static_keys
                .insert(route.domain.clone(), cert_file, key_file)
                .map_err(SupervisorError::Tls)?;
        }
    }

    let listen_addr_tls = if config.disable_tls {
        None
    } else {
        Some(normalize_listen_addr(&config.listen_addr_tls))
    };

    let supervisor = Arc::new(Supervisor::new(
        normalize_listen_addr(&config.listen_addr),
        listen_addr_tls,
        config.fallback_domain.clone(),
        config.debug,
    ));

    for spec in specs {
        let domain = spec.domain.clone();
        supervisor.add(spec).map_err(sandproxy::error::ConfigError::Routing).map_err(|e| {
            tracing::error!(domain = %domain, error = %e, "failed to register route");
            AppError::from(e)
        })?;
    }

    if !config.disable_tls {
        let cache = build_cache(&config).await?;
        let autocert_all = config.autocert_all;
        let policy_supervisor = supervisor.clone();

        let (backend, challenge_handler) = if config.letsencrypt_url == DEV_DIRECTORY_SENTINEL {
            (AcmeBackend::Dev(Arc::new(SelfSignedGenerator::new().map_err(SupervisorError::Tls)?)), None)
        } else {
            let directory_url = if config.letsencrypt_url.is_empty() {
                LETSENCRYPT_PRODUCTION_DIRECTORY.to_string()
            } else {
                config.letsencrypt_url.clone()
            };
            let manager = Arc::new(AcmeManager::new(
                directory_url,
                config.letsencrypt_email.clone(),
                cache,
                Arc::new(move |host: &str| policy_supervisor.autocert_allowed(host, autocert_all)),
                supervisor.metrics(),
            ));
            manager.init().await.map_err(SupervisorError::AcmeInit)?;
            let handler = Arc::new(ChallengeHandler::new(manager.challenge_tokens()));
            (AcmeBackend::Acme(manager), Some(handler))
        };

        let resolver = Arc::new(SniCertResolver::new(static_keys, backend));
        let server_config = resolver.into_server_config();
        let acceptor = TlsAcceptor::from(Arc::new(server_config));
        supervisor.configure_tls(acceptor, challenge_handler);
    }

    tracing::info!(
        listen_addr = %config.listen_addr,
        listen_addr_tls = %config.listen_addr_tls,
        routes = config.routes.len(),
        "sandproxy starting"
    );

    let run_handle = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.run().await })
    };
    tokio::pin!(run_handle);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
            supervisor.close();
            let _ = (&mut run_handle).await;
        }
        _ = wait_for_terminate() => {
            tracing::info!("received SIGTERM, shutting down");
            supervisor.close();
            let _ = (&mut run_handle).await;
        }
        result = &mut run_handle => {
            return match result {
                Ok(inner) => inner.map_err(AppError::from),
                Err(e) => {
                    tracing::error!(error = %e, "listener task panicked");
                    Ok(())
                }
            };
        }
    }

    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    install_rustls_crypto_provider();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();

    // A one-worker runtime just to load the config, which is the only thing
    // that determines how many workers the real runtime should get.
    let bootstrap_rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let mut config = match bootstrap_rt.block_on(Config::load(&args.config)) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            std::process::exit(AppError::from(e).exit_code());
        }
    };
    drop(bootstrap_rt);
    args.apply_to(&mut config);

    let available = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let worker_threads = if config.num_cpu > 0 { available.min(config.num_cpu) } else { available };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads.max(1))
        .enable_all()
        .build()?;

    match rt.block_on(run(config)) {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::error!(error = %e, "sandproxy exiting with error");
            std::process::exit(e.exit_code());
        }
    }
}
