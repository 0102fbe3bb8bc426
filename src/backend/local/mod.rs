//! Local-processes backend: spawns one `keppel-registry` subprocess per account, bound to
//! a locally-assigned TCP port.

mod config_files;
mod supervise;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::account::Account;
use crate::backend::{Backend, ConnectivityMessage};
use crate::config::LocalConfig;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::storage::StorageDriver;

const FIRST_PORT: u16 = 10000;

/// The fixed base registry config shared by both backends' ConfigMap/file rendering
/// (the kubernetes backend ships the same bytes into its ConfigMap).
pub(crate) fn base_config_yaml() -> &'static str {
    config_files::REGISTRY_BASE_YAML
}

type PortMap = Arc<RwLock<HashMap<String, u16>>>;

/// Backend state shared across every spawned supervisor task.
pub struct LocalBackend {
    config: LocalConfig,
    storage: Arc<dyn StorageDriver>,
    metrics: Metrics,
    ports: PortMap,
    next_port: AtomicU16,
    tasks: Mutex<JoinSet<()>>,
    shutdown: RwLock<Option<CancellationToken>>,
    connectivity_out: RwLock<Option<mpsc::UnboundedSender<ConnectivityMessage>>>,
}

impl LocalBackend {
    pub fn new(config: LocalConfig, storage: Arc<dyn StorageDriver>, metrics: Metrics) -> Self {
        Self {
            config,
            storage,
            metrics,
            ports: Arc::new(RwLock::new(HashMap::new())),
            next_port: AtomicU16::new(FIRST_PORT),
            tasks: Mutex::new(JoinSet::new()),
            shutdown: RwLock::new(None),
            connectivity_out: RwLock::new(None),
        }
    }

    async fn connectivity_sender(&self) -> mpsc::UnboundedSender<ConnectivityMessage> {
        self.connectivity_out
            .read()
            .await
            .clone()
            .expect("launch called before init")
    }

    async fn shutdown_token(&self) -> CancellationToken {
        self.shutdown
            .read()
            .await
            .clone()
            .expect("launch called before init")
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn init(
        &self,
        shutdown: CancellationToken,
        connectivity_out: mpsc::UnboundedSender<ConnectivityMessage>,
        all_accounts: Vec<Account>,
    ) -> Result<(), Error> {
        *self.shutdown.write().await = Some(shutdown.clone());
        *self.connectivity_out.write().await = Some(connectivity_out);

        config_files::write_base_config(&self.config.runtime_dir).map_err(Error::Io)?;
        info!(dir = %self.config.runtime_dir.display(), "wrote local backend base config");

        for account in all_accounts {
            self.launch(account, shutdown.child_token()).await;
        }

        Ok(())
    }

    async fn launch(&self, account: Account, cancel: CancellationToken) {
        let port = {
            let ports = self.ports.read().await;
            if let Some(port) = ports.get(&account.name) {
                Some(*port)
            } else {
                None
            }
        };
        if port.is_some() {
            return;
        }

        let port = {
            let mut ports = self.ports.write().await;
            // Re-check under the write lock: two concurrent launches may have raced here.
            if let Some(port) = ports.get(&account.name) {
                *port
            } else {
                let port = self.next_port.fetch_add(1, Ordering::SeqCst);
                ports.insert(account.name.clone(), port);
                port
            }
        };

        let connectivity_out = self.connectivity_sender().await;
        let shutdown = self.shutdown_token().await;
        let base_config_path = config_files::base_config_path(&self.config.runtime_dir);
        let cert_bundle_path = config_files::cert_bundle_path(&self.config.runtime_dir);

        let mut tasks = self.tasks.lock().await;
        supervise::spawn_child(
            &mut tasks,
            account,
            port,
            base_config_path,
            cert_bundle_path,
            self.storage.clone(),
            self.metrics.clone(),
            connectivity_out,
            self.ports.clone(),
            shutdown,
            cancel,
        );
    }

    async fn join(&self) {
        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
    }
}
