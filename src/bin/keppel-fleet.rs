//! Process entrypoint: parses configuration, wires up the selected backend and the
//! orchestration engine, and serves the debug/metrics HTTP surface until shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use keppel_fleet::account::{Account, AccountSource};
use keppel_fleet::backend::kubernetes::KubernetesBackend;
use keppel_fleet::backend::local::LocalBackend;
use keppel_fleet::backend::Backend;
use keppel_fleet::config::{BackendKind, Config};
use keppel_fleet::engine::Engine;
use keppel_fleet::storage::NullStorageDriver;
use keppel_fleet::{telemetry, Metrics};

/// Stand-in for the real account database: reads a newline-delimited list of `name:secret`
/// pairs from `KEPPEL_ACCOUNTS_FILE`, re-read on every sweep. Real deployments replace this
/// with a client for whatever database backs the fleet.
struct FileAccountSource {
    path: std::path::PathBuf,
}

#[async_trait]
impl AccountSource for FileAccountSource {
    async fn all_accounts(&self) -> keppel_fleet::error::Result<Vec<Account>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(keppel_fleet::Error::Io(e)),
        };
        Ok(contents
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(name, secret)| Account::new(name.trim(), secret.trim()))
            .collect())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let config = Config::from_env()?;
    let registry = Arc::new(prometheus::Registry::new());
    let metrics = Metrics::new().register(&registry)?;
    let storage = Arc::new(NullStorageDriver);
    let accounts_path = std::env::var("KEPPEL_ACCOUNTS_FILE")
        .unwrap_or_else(|_| "/etc/keppel/accounts".to_string());
    let accounts = Arc::new(FileAccountSource {
        path: accounts_path.into(),
    });

    let shutdown = CancellationToken::new();
    let bind_addr = config.bind_addr.clone();
    let sweep_interval = config.sweep_interval;

    let engine_run = match config.backend {
        BackendKind::Local => {
            let backend = Arc::new(LocalBackend::new(config.local, storage, metrics.clone()));
            run_with_backend(
                backend, accounts, metrics, registry, sweep_interval, bind_addr, shutdown.clone(),
            )
            .await
        }
        BackendKind::Kubernetes => {
            let k8s_config = config
                .kubernetes
                .expect("Config::from_env guarantees kubernetes config when backend is Kubernetes");
            let backend = Arc::new(KubernetesBackend::new(k8s_config, storage, metrics.clone()).await?);
            run_with_backend(
                backend, accounts, metrics, registry, sweep_interval, bind_addr, shutdown.clone(),
            )
            .await
        }
    };

    match engine_run {
        Ok(true) => {
            info!("shutdown complete");
            Ok(())
        }
        Ok(false) => {
            error!("shutdown completed after a fatal backend error");
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_with_backend<B: Backend, S: AccountSource>(
    backend: Arc<B>,
    accounts: Arc<S>,
    metrics: Metrics,
    registry: Arc<prometheus::Registry>,
    sweep_interval: Duration,
    bind_addr: String,
    shutdown: CancellationToken,
) -> keppel_fleet::error::Result<bool> {
    let (engine, handle) = Engine::new(backend, accounts, metrics, sweep_interval);

    let app = keppel_fleet::http::router(handle, registry);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(keppel_fleet::Error::Io)?;
    info!(%bind_addr, "debug/metrics HTTP surface listening");

    let http_shutdown = shutdown.clone();
    let http_server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .await
    });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
        signal_shutdown.cancel();
    });

    let ok = engine.run(shutdown).await?;
    match http_server.await {
        Ok(Err(e)) => error!(error = %e, "debug/metrics HTTP server exited with an error"),
        Err(e) => error!(error = %e, "debug/metrics HTTP server task panicked"),
        Ok(Ok(())) => {}
    }
    Ok(ok)
}
