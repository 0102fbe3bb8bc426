//! Kubernetes backend: reconciles one shared ConfigMap plus one Service+Deployment pair
//! per account against the cluster.

mod objects;
mod queue;
mod watch;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::runtime::{reflector, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use tokio::sync::{mpsc, Mutex, OnceCell, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::account::Account;
use crate::backend::{Backend, ConnectivityMessage};
use crate::config::KubernetesConfig;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::storage::StorageDriver;

use objects::{
    apply_configmap, apply_deployment, apply_service, deployment_name, labels_match,
    new_configmap, new_deployment, new_service, service_name, ConfigMapDesired,
    DeploymentDesired, ServiceDesired, CONFIGMAP_NAME,
};
use queue::WorkQueue;
use watch::Watch;

const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(30);
const WORKER_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    ConfigMap,
    Service,
    Deployment,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
}

/// Desired-state descriptor for one managed object.
enum ManagedObject {
    ConfigMap(ConfigMapDesired),
    Service { account: String, spec: ServiceDesired },
    Deployment { account: String, spec: DeploymentDesired },
}

impl Clone for ManagedObject {
    fn clone(&self) -> Self {
        match self {
            ManagedObject::ConfigMap(spec) => ManagedObject::ConfigMap(spec.clone()),
            ManagedObject::Service { account, spec } => ManagedObject::Service {
                account: account.clone(),
                spec: spec.clone(),
            },
            ManagedObject::Deployment { account, spec } => ManagedObject::Deployment {
                account: account.clone(),
                spec: spec.clone(),
            },
        }
    }
}

/// Everything a reconcile worker needs, held behind one `Arc` so spawned tasks get a cheap
/// owned handle instead of borrowing `&KubernetesBackend`: workers must outlive the `&self`
/// call that starts them.
struct Shared {
    client: Client,
    namespace: String,
    marker: String,
    registry_image: String,
    debug_diffs: bool,
    storage: Arc<dyn StorageDriver>,
    metrics: Metrics,

    desired: RwLock<HashMap<ObjectKey, ManagedObject>>,
    queue: Arc<WorkQueue>,

    configmaps: OnceCell<reflector::Store<ConfigMap>>,
    services: OnceCell<reflector::Store<Service>>,
    deployments: OnceCell<reflector::Store<Deployment>>,

    connectivity_out: RwLock<Option<mpsc::UnboundedSender<ConnectivityMessage>>>,
}

pub struct KubernetesBackend {
    shared: Arc<Shared>,
    tasks: Mutex<JoinSet<()>>,
}

impl KubernetesBackend {
    pub async fn new(
        config: KubernetesConfig,
        storage: Arc<dyn StorageDriver>,
        metrics: Metrics,
    ) -> Result<Self, Error> {
        let client = Client::try_default().await.map_err(Error::Kube)?;
        Ok(Self {
            shared: Arc::new(Shared {
                client,
                namespace: config.namespace,
                marker: config.marker,
                registry_image: config.registry_image,
                debug_diffs: config.debug_diffs,
                storage,
                metrics,
                desired: RwLock::new(HashMap::new()),
                queue: WorkQueue::new(),
                configmaps: OnceCell::new(),
                services: OnceCell::new(),
                deployments: OnceCell::new(),
                connectivity_out: RwLock::new(None),
            }),
            tasks: Mutex::new(JoinSet::new()),
        })
    }
}

impl Shared {
    async fn start_watches(&self) -> Result<(), Error> {
        let configmaps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);

        let (cm_reader, cm_task) =
            spawn_watch(configmaps, ObjectKind::ConfigMap, self.marker.clone(), self.queue.clone());
        let (svc_reader, svc_task) =
            spawn_watch(services, ObjectKind::Service, self.marker.clone(), self.queue.clone());
        let (dep_reader, dep_task) = spawn_watch(
            deployments,
            ObjectKind::Deployment,
            self.marker.clone(),
            self.queue.clone(),
        );

        tokio::spawn(cm_task);
        tokio::spawn(svc_task);
        tokio::spawn(dep_task);

        wait_ready(&cm_reader).await?;
        wait_ready(&svc_reader).await?;
        wait_ready(&dep_reader).await?;

        self.configmaps.set(cm_reader).ok();
        self.services.set(svc_reader).ok();
        self.deployments.set(dep_reader).ok();

        Ok(())
    }

    async fn run_worker(self: Arc<Self>, id: usize) {
        loop {
            let key = self.queue.get().await;
            let timer = self.metrics.reconcile_latency.start_timer();
            let result = self.reconcile_one(&key).await;
            timer.observe_duration();
            match result {
                Ok(()) => {
                    self.queue.forget(&key).await;
                }
                Err(e) => {
                    warn!(worker = id, ?key, error = %e, "reconcile failed, retrying with backoff");
                    if let Some(account) = account_for_key(&key) {
                        if let Some(out) = self.connectivity_out.read().await.clone() {
                            let _ = out.send(ConnectivityMessage::terminated(account));
                        }
                    }
                    self.queue.requeue_rate_limited(key.clone()).await;
                }
            }
            self.queue.done(&key).await;
        }
    }

    async fn reconcile_one(&self, key: &ObjectKey) -> Result<(), Error> {
        let managed = {
            let desired = self.desired.read().await;
            match desired.get(key) {
                Some(managed) => managed.clone(),
                None => {
                    debug!(?key, "no desired state for key, dropping");
                    return Ok(());
                }
            }
        };

        match managed {
            ManagedObject::ConfigMap(spec) => self.reconcile_configmap(key, &spec).await,
            ManagedObject::Service { spec, .. } => self.reconcile_service(key, &spec).await,
            ManagedObject::Deployment { spec, .. } => self.reconcile_deployment(key, &spec).await,
        }
    }

    async fn reconcile_configmap(&self, key: &ObjectKey, spec: &ConfigMapDesired) -> Result<(), Error> {
        let store = self.configmaps.get().expect("init must run before reconcile");
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &key.namespace);
        let current = store_lookup(store, &key.namespace, &key.name);

        let mut desired_obj = current
            .clone()
            .unwrap_or_else(|| new_configmap(&key.namespace, &self.marker));
        apply_configmap(spec, &mut desired_obj);

        if current.as_ref() == Some(&desired_obj) {
            return Ok(());
        }
        self.log_diff(key, current.is_none());
        patch_apply(&api, &key.name, &desired_obj).await
    }

    async fn reconcile_service(&self, key: &ObjectKey, spec: &ServiceDesired) -> Result<(), Error> {
        let store = self.services.get().expect("init must run before reconcile");
        let api: Api<Service> = Api::namespaced(self.client.clone(), &key.namespace);
        let current = store_lookup(store, &key.namespace, &key.name);

        let mut desired_obj = current
            .clone()
            .unwrap_or_else(|| new_service(&key.namespace, &spec.account, &self.marker));
        apply_service(spec, &mut desired_obj);

        let changed = current.as_ref() != Some(&desired_obj);
        if changed {
            self.log_diff(key, current.is_none());
            patch_apply(&api, &key.name, &desired_obj).await?;
        }

        if let Some(cluster_ip) = desired_obj
            .spec
            .as_ref()
            .and_then(|s| s.cluster_ip.clone())
            .filter(|ip| !ip.is_empty() && ip != "None")
        {
            if let Some(out) = self.connectivity_out.read().await.clone() {
                let _ = out.send(ConnectivityMessage::ready(
                    spec.account.clone(),
                    format!("{cluster_ip}:8080"),
                ));
            }
        }
        Ok(())
    }

    async fn reconcile_deployment(&self, key: &ObjectKey, spec: &DeploymentDesired) -> Result<(), Error> {
        let store = self.deployments.get().expect("init must run before reconcile");
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &key.namespace);
        let current = store_lookup(store, &key.namespace, &key.name);

        let mut desired_obj = current
            .clone()
            .unwrap_or_else(|| new_deployment(&key.namespace, &spec.account, &self.marker));
        apply_deployment(spec, &mut desired_obj);

        if current.as_ref() == Some(&desired_obj) {
            return Ok(());
        }
        self.log_diff(key, current.is_none());
        patch_apply(&api, &key.name, &desired_obj).await
    }

    fn log_diff(&self, key: &ObjectKey, creating: bool) {
        if creating {
            info!(?key, "creating managed object");
        } else if self.debug_diffs {
            info!(?key, "applying update to managed object (KEPPEL_DEBUG_KUBERNETES_DIFFS=true)");
        } else {
            debug!(?key, "applying update to managed object");
        }
    }
}

async fn wait_ready<K>(reader: &reflector::Store<K>) -> Result<(), Error>
where
    K: kube::Resource<DynamicType = ()> + Clone,
{
    tokio::time::timeout(CACHE_SYNC_TIMEOUT, reader.wait_until_ready())
        .await
        .map_err(|_| Error::CacheSyncTimeout(CACHE_SYNC_TIMEOUT))?
        .map_err(|_| Error::CacheSyncTimeout(CACHE_SYNC_TIMEOUT))
}

fn account_for_key(key: &ObjectKey) -> Option<String> {
    match key.kind {
        ObjectKind::ConfigMap => None,
        ObjectKind::Service | ObjectKind::Deployment => {
            key.name.strip_prefix("keppel-").map(str::to_string)
        }
    }
}

fn store_lookup<K>(store: &reflector::Store<K>, namespace: &str, name: &str) -> Option<K>
where
    K: kube::Resource<DynamicType = ()> + Clone,
{
    let obj_ref = reflector::ObjectRef::new(name).within(namespace);
    store.get(&obj_ref).map(|arc| (*arc).clone())
}

async fn patch_apply<K>(api: &Api<K>, name: &str, desired: &K) -> Result<(), Error>
where
    K: kube::Resource + Clone + std::fmt::Debug + serde::Serialize + for<'de> serde::Deserialize<'de>,
    K::DynamicType: Default,
{
    use kube::api::{Patch, PatchParams};
    let params = PatchParams::apply("keppel-fleet").force();
    api.patch(name, &params, &Patch::Apply(desired))
        .await
        .map_err(Error::Kube)?;
    Ok(())
}

/// Spawns the informer task for one kind and returns its cache reader alongside the
/// 'static future to hand to `tokio::spawn` (see `watch.rs` for the retry-on-error loop).
fn spawn_watch<K>(
    api: Api<K>,
    kind: ObjectKind,
    marker: String,
    queue: Arc<WorkQueue>,
) -> (reflector::Store<K>, impl std::future::Future<Output = ()>)
where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + std::fmt::Debug
        + for<'de> serde::Deserialize<'de>
        + Send
        + Sync
        + 'static,
{
    let (reader, writer) = reflector::store();
    let stream = reflector::reflector(writer, watcher(api, watcher::Config::default()));

    let task = async move {
        let mut watch = Watch::new(Box::pin(stream));
        loop {
            let event = watch.recv().await;
            enqueue_event(kind, event, &marker, &queue).await;
        }
    };

    (reader, task)
}

async fn enqueue_event<K>(kind: ObjectKind, event: watcher::Event<K>, marker: &str, queue: &WorkQueue)
where
    K: kube::ResourceExt,
{
    match event {
        watcher::Event::Applied(obj) => enqueue_if_labeled(kind, &obj, marker, queue).await,
        watcher::Event::Deleted(obj) => enqueue_if_labeled(kind, &obj, marker, queue).await,
        watcher::Event::Restarted(objs) => {
            for obj in &objs {
                enqueue_if_labeled(kind, obj, marker, queue).await;
            }
        }
    }
}

async fn enqueue_if_labeled<K>(kind: ObjectKind, obj: &K, marker: &str, queue: &WorkQueue)
where
    K: kube::ResourceExt,
{
    let empty = std::collections::BTreeMap::new();
    let labels = obj.meta().labels.as_ref().unwrap_or(&empty);
    if !labels_match(labels, marker) {
        return;
    }
    let Some(namespace) = obj.namespace() else {
        return;
    };
    queue
        .add(ObjectKey {
            kind,
            namespace,
            name: obj.name_any(),
        })
        .await;
}

#[async_trait]
impl Backend for KubernetesBackend {
    async fn init(
        &self,
        shutdown: CancellationToken,
        connectivity_out: mpsc::UnboundedSender<ConnectivityMessage>,
        all_accounts: Vec<Account>,
    ) -> Result<(), Error> {
        *self.shared.connectivity_out.write().await = Some(connectivity_out);

        self.shared.start_watches().await?;

        {
            let mut tasks = self.tasks.lock().await;
            for id in 0..WORKER_COUNT {
                let shared = self.shared.clone();
                tasks.spawn(async move { shared.run_worker(id).await });
            }
        }

        let configmap_key = ObjectKey {
            kind: ObjectKind::ConfigMap,
            namespace: self.shared.namespace.clone(),
            name: CONFIGMAP_NAME.to_string(),
        };
        self.shared.desired.write().await.insert(
            configmap_key.clone(),
            ManagedObject::ConfigMap(ConfigMapDesired {
                base_yaml: crate::backend::local::base_config_yaml().to_string(),
                cert_bundle: String::new(),
            }),
        );
        self.shared.queue.add(configmap_key).await;

        for account in all_accounts {
            self.launch(account, shutdown.child_token()).await;
        }

        Ok(())
    }

    async fn launch(&self, account: Account, _cancel: CancellationToken) {
        let env_vars = self.shared.storage.env_vars(&account);

        let service_key = ObjectKey {
            kind: ObjectKind::Service,
            namespace: self.shared.namespace.clone(),
            name: service_name(&account.name),
        };
        let deployment_key = ObjectKey {
            kind: ObjectKind::Deployment,
            namespace: self.shared.namespace.clone(),
            name: deployment_name(&account.name),
        };

        {
            let mut desired = self.shared.desired.write().await;
            desired.insert(
                service_key.clone(),
                ManagedObject::Service {
                    account: account.name.clone(),
                    spec: ServiceDesired {
                        marker: self.shared.marker.clone(),
                        account: account.name.clone(),
                    },
                },
            );
            desired.insert(
                deployment_key.clone(),
                ManagedObject::Deployment {
                    account: account.name.clone(),
                    spec: DeploymentDesired {
                        marker: self.shared.marker.clone(),
                        account: account.name.clone(),
                        registry_image: self.shared.registry_image.clone(),
                        secret: account.secret.clone(),
                        env_vars,
                    },
                },
            );
        }

        self.shared
            .metrics
            .child_launches
            .with_label_values(&["kubernetes", "enqueued"])
            .inc();
        self.shared.queue.add(service_key).await;
        self.shared.queue.add(deployment_key).await;
    }

    async fn join(&self) {
        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
    }
}
