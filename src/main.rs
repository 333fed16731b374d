use gantry::api::{ApiState, PKG_NAME, VERSION};
use gantry::backend::create_driver;
use gantry::catalog::SpecCatalog;
use gantry::config::Config;
use gantry::events::EventBus;
use gantry::lifecycle::{LifecycleOrchestrator, LifecycleSettings};
use gantry::mapping::MappingTable;
use gantry::pool::PoolConfig;
use gantry::proxy::ProxyServer;
use gantry::registry::ProxyRegistry;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gantry=debug".parse()?),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let driver = create_driver(&config.backend).await?;
    let events = EventBus::from_config(&config.events)?;
    let catalog = Arc::new(SpecCatalog::new(config.specs.clone()));
    let lifecycle = Arc::new(LifecycleOrchestrator::new(
        driver,
        Arc::new(ProxyRegistry::new()),
        Arc::new(MappingTable::new()),
        events,
        LifecycleSettings::from(&config.lifecycle),
    ));

    if config.lifecycle.recover_running {
        match lifecycle.recover().await {
            Ok(count) => info!(count, "Recovered running instances"),
            Err(e) => warn!(error = %e, "Failed to recover running instances"),
        }
    }

    let api_token = config.server.api_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated API token (configure api_token to set a fixed value)");
        token
    });
    let api = Arc::new(ApiState::new(
        Arc::clone(&catalog),
        Arc::clone(&lifecycle),
        api_token,
    ));

    let tls_acceptor = if config.server.tls_enabled() {
        let (certs, key) = match (&config.server.tls_cert, &config.server.tls_key) {
            (Some(cert_path), Some(key_path)) => {
                let certs = load_certs(cert_path)?;
                let key = load_key(key_path)?;
                info!(cert = %cert_path, key = %key_path, "TLS enabled with provided certificates");
                (certs, key)
            }
            _ => {
                let generated = generate_self_signed_cert()?;
                warn!("TLS enabled with auto-generated self-signed certificate (not for production)");
                generated
            }
        };
        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;
        Some(TlsAcceptor::from(Arc::new(tls_config)))
    } else {
        None
    };

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;
    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };

    let mut server = ProxyServer::new(
        bind_addr,
        api,
        shutdown_rx.clone(),
        pool_config,
        config.server.request_timeout(),
    );
    if let Some(acceptor) = tls_acceptor {
        server = server.with_tls(acceptor);
    }
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    wait_for_shutdown(&config_path, &catalog).await?;

    let _ = shutdown_tx.send(true);

    if config.lifecycle.stop_on_shutdown {
        info!("Stopping all instances...");
        let stopped = lifecycle.stop_all().await;
        info!(stopped, "Instances stopped");
    } else {
        info!(
            running = lifecycle.registry().len(),
            "Leaving instances running for recovery on next start"
        );
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

/// Block until SIGINT/SIGTERM. SIGHUP reloads the spec catalog.
#[cfg(unix)]
async fn wait_for_shutdown(config_path: &Path, catalog: &SpecCatalog) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
                return Ok(());
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                return Ok(());
            }
            _ = sighup.recv() => {
                info!(path = %config_path.display(), "Received SIGHUP, reloading specs...");
                match Config::load(config_path) {
                    Ok(config) => {
                        let result = catalog.replace(config.specs);
                        info!(
                            added = result.added.len(),
                            removed = result.removed.len(),
                            updated = result.updated.len(),
                            "Specs reloaded successfully"
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to reload configuration, keeping current specs");
                    }
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_config_path: &Path, _catalog: &SpecCatalog) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gantry");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        tls = config.server.tls_enabled(),
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        backend = ?config.backend.backend_type,
        endpoint_prefix = %config.lifecycle.endpoint_prefix,
        startup_timeout_secs = config.lifecycle.startup_timeout_secs,
        ready_poll_interval_ms = config.lifecycle.ready_poll_interval_ms,
        "Lifecycle settings"
    );
    info!(
        spec_count = config.specs.len(),
        specs = ?config.specs.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
        "Configured specs"
    );
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }
    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file =
        File::open(path).map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("No private key found in {}", path)
}

fn generate_self_signed_cert(
) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let subject_alt_names = vec!["localhost".to_string(), "127.0.0.1".to_string()];

    let CertifiedKey { cert, key_pair } = generate_simple_self_signed(subject_alt_names)
        .map_err(|e| anyhow::anyhow!("Failed to generate self-signed certificate: {}", e))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;

    Ok((vec![cert_der], key_der))
}
