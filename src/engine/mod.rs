//! Central orchestration engine: one scheduling task that routes requests to per-account
//! children, tracks their lifecycle, and drives graceful shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::account::{Account, AccountSource};
use crate::backend::{Backend, ConnectivityMessage};
use crate::metrics::Metrics;

/// A request to ensure a child exists and learn its reachable address.
/// The sweep-driven form carries `None` for `reply`: it only triggers a launch if no
/// `ChildRecord` exists yet and otherwise no-ops.
pub struct RouteRequest {
    pub account: Account,
    pub reply: Option<oneshot::Sender<Option<String>>>,
}

type StateReportRequest = oneshot::Sender<HashMap<String, Option<String>>>;

struct ChildRecord {
    address: Option<String>,
    pending: Vec<oneshot::Sender<Option<String>>>,
    cancel: CancellationToken,
}

/// Handle used by upstream callers; cheap to clone, backed by unbounded channels into the
/// single engine task.
#[derive(Clone)]
pub struct EngineHandle {
    route_requests: mpsc::UnboundedSender<RouteRequest>,
    state_reports: mpsc::UnboundedSender<StateReportRequest>,
    http_client: reqwest::Client,
}

impl EngineHandle {
    /// Ensures a child exists for `account` and returns its reachable address, blocking
    /// until the child becomes ready or the engine gives up on it.
    pub async fn ensure_address(&self, account: Account) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        let request = RouteRequest {
            account,
            reply: Some(tx),
        };
        if self.route_requests.send(request).is_err() {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    /// Rewrites `request`'s scheme/authority to the reachable address for `account` and
    /// performs it, optionally refusing to follow the first redirect.
    pub async fn route_request(
        &self,
        account: Account,
        request: http::Request<Vec<u8>>,
        do_not_follow_redirects: bool,
    ) -> crate::error::Result<http::Response<Vec<u8>>> {
        let address = self
            .ensure_address(account.clone())
            .await
            .ok_or_else(|| crate::error::Error::NotReachable {
                account: account.name.clone(),
            })?;

        let (mut parts, body) = request.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/")
            .to_string();
        parts.uri = format!("http://{address}{path_and_query}")
            .parse()
            .map_err(|_| crate::error::Error::NotReachable {
                account: account.name.clone(),
            })?;
        parts.headers.remove(http::header::HOST);

        let client = if do_not_follow_redirects {
            reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .map_err(crate::error::Error::Http)?
        } else {
            self.http_client.clone()
        };

        let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
            .unwrap_or(reqwest::Method::GET);
        let mut builder = client.request(method, parts.uri.to_string());
        for (name, value) in parts.headers.iter() {
            builder = builder.header(name, value);
        }
        let response = builder.body(body).send().await.map_err(crate::error::Error::Http)?;

        let mut response_builder = http::Response::builder().status(response.status().as_u16());
        for (name, value) in response.headers().iter() {
            response_builder = response_builder.header(name, value);
        }
        let bytes = response.bytes().await.map_err(crate::error::Error::Http)?.to_vec();
        response_builder
            .body(bytes)
            .map_err(|_| crate::error::Error::NotReachable { account: account.name })
    }

    /// Snapshots `account_name -> address` for every known child; used by the debug surface.
    pub async fn report_state(&self) -> HashMap<String, Option<String>> {
        let (tx, rx) = oneshot::channel();
        if self.state_reports.send(tx).is_err() {
            return HashMap::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// The orchestration engine itself. Construct with [`Engine::new`], then drive it with
/// [`Engine::run`]; interact with it via the [`EngineHandle`] returned alongside it.
pub struct Engine<B: Backend, S: AccountSource> {
    backend: Arc<B>,
    accounts: Arc<S>,
    metrics: Metrics,
    sweep_interval: Duration,

    route_requests_rx: mpsc::UnboundedReceiver<RouteRequest>,
    route_requests_tx: mpsc::UnboundedSender<RouteRequest>,
    state_reports_rx: mpsc::UnboundedReceiver<StateReportRequest>,
    state_reports_tx: mpsc::UnboundedSender<StateReportRequest>,
    connectivity_rx: mpsc::UnboundedReceiver<ConnectivityMessage>,
    connectivity_tx: mpsc::UnboundedSender<ConnectivityMessage>,
}

impl<B: Backend, S: AccountSource> Engine<B, S> {
    pub fn new(backend: Arc<B>, accounts: Arc<S>, metrics: Metrics, sweep_interval: Duration) -> (Self, EngineHandle) {
        let (route_requests_tx, route_requests_rx) = mpsc::unbounded_channel();
        let (state_reports_tx, state_reports_rx) = mpsc::unbounded_channel();
        let (connectivity_tx, connectivity_rx) = mpsc::unbounded_channel();

        let handle = EngineHandle {
            route_requests: route_requests_tx.clone(),
            state_reports: state_reports_tx.clone(),
            http_client: reqwest::Client::new(),
        };

        (
            Self {
                backend,
                accounts,
                metrics,
                sweep_interval,
                route_requests_rx,
                route_requests_tx,
                state_reports_rx,
                state_reports_tx,
                connectivity_rx,
                connectivity_tx,
            },
            handle,
        )
    }

    /// Brings up the backend, then runs the main scheduling loop until `shutdown` is
    /// cancelled. Returns whether shutdown was clean (`false` if a fatal error occurred).
    pub async fn run(mut self, shutdown: CancellationToken) -> crate::error::Result<bool> {
        let all_accounts = self.accounts.all_accounts().await?;
        self.backend
            .init(shutdown.clone(), self.connectivity_tx.clone(), all_accounts)
            .await?;

        let ok = Arc::new(AtomicBool::new(true));
        let mut records: HashMap<String, ChildRecord> = HashMap::new();

        let sweep_handle = self.spawn_sweep(shutdown.clone());

        loop {
            tokio::select! {
                Some(request) = self.route_requests_rx.recv() => {
                    self.handle_route_request(request, &mut records, &shutdown).await;
                }
                Some(reply) = self.state_reports_rx.recv() => {
                    let snapshot = records
                        .iter()
                        .map(|(name, record)| (name.clone(), record.address.clone()))
                        .collect();
                    let _ = reply.send(snapshot);
                }
                Some(message) = self.connectivity_rx.recv() => {
                    self.handle_connectivity(message, &mut records, &shutdown, &ok);
                }
                _ = shutdown.cancelled() => {
                    break;
                }
            }
        }

        info!("engine shutdown beginning, cancelling per-account tokens");
        for record in records.values() {
            record.cancel.cancel();
        }

        let drain = self.spawn_drain();
        self.backend.join().await;
        drain.abort();
        sweep_handle.abort();

        Ok(ok.load(Ordering::SeqCst))
    }

    async fn handle_route_request(
        &self,
        request: RouteRequest,
        records: &mut HashMap<String, ChildRecord>,
        shutdown: &CancellationToken,
    ) {
        let RouteRequest { account, reply } = request;

        if shutdown.is_cancelled() {
            if let Some(reply) = reply {
                let _ = reply.send(None);
            }
            return;
        }

        if let Some(record) = records.get_mut(&account.name) {
            match (&record.address, reply) {
                (Some(address), Some(reply)) => {
                    let _ = reply.send(Some(address.clone()));
                }
                (None, Some(reply)) => {
                    record.pending.push(reply);
                }
                (_, None) => {}
            }
            return;
        }

        let cancel = shutdown.child_token();
        let mut record = ChildRecord {
            address: None,
            pending: Vec::new(),
            cancel: cancel.clone(),
        };
        if let Some(reply) = reply {
            record.pending.push(reply);
        }
        records.insert(account.name.clone(), record);

        self.metrics
            .child_launches
            .with_label_values(&[backend_label::<B>(), "requested"])
            .inc();

        let backend = self.backend.clone();
        tokio::spawn(async move {
            backend.launch(account, cancel).await;
        });
    }

    fn handle_connectivity(
        &self,
        message: ConnectivityMessage,
        records: &mut HashMap<String, ChildRecord>,
        shutdown: &CancellationToken,
        ok: &Arc<AtomicBool>,
    ) {
        let kind = if message.fatal.is_some() {
            "fatal"
        } else if message.address.is_some() {
            "ready"
        } else {
            "terminated"
        };
        self.metrics
            .connectivity_messages
            .with_label_values(&[kind])
            .inc();

        if let Some(reason) = &message.fatal {
            error!(account = %message.account_name, reason = %reason, "fatal backend error, shutting down");
            ok.store(false, Ordering::SeqCst);
            shutdown.cancel();
        }

        let Some(record) = records.get_mut(&message.account_name) else {
            return;
        };

        for reply in record.pending.drain(..) {
            let _ = reply.send(message.address.clone());
        }

        match message.address {
            Some(address) => {
                info!(account = %message.account_name, %address, "child reachable");
                record.address = Some(address);
                self.metrics.reachable_children.set(
                    records.values().filter(|r| r.address.is_some()).count() as i64,
                );
            }
            None => {
                info!(account = %message.account_name, "child terminated");
                record.cancel.cancel();
                records.remove(&message.account_name);
                self.metrics
                    .reachable_children
                    .set(records.values().filter(|r| r.address.is_some()).count() as i64);
            }
        }
    }

    fn spawn_sweep(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let accounts = self.accounts.clone();
        let route_requests = self.route_requests_tx.clone();
        let interval = self.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match accounts.all_accounts().await {
                            Ok(all_accounts) => {
                                for account in all_accounts {
                                    let _ = route_requests.send(RouteRequest { account, reply: None });
                                }
                            }
                            Err(e) => warn!(error = %e, "account sweep failed to list accounts"),
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    /// Spawns the shutdown drain task: answers any late arrivals on all three inbound
    /// channels so that no backend task or blocked caller stalls forever.
    fn spawn_drain(&mut self) -> tokio::task::JoinHandle<()> {
        let mut route_requests_rx = std::mem::replace(&mut self.route_requests_rx, mpsc::unbounded_channel().1);
        let mut state_reports_rx = std::mem::replace(&mut self.state_reports_rx, mpsc::unbounded_channel().1);
        let mut connectivity_rx = std::mem::replace(&mut self.connectivity_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(request) = route_requests_rx.recv() => {
                        if let Some(reply) = request.reply {
                            let _ = reply.send(None);
                        }
                    }
                    Some(reply) = state_reports_rx.recv() => {
                        let _ = reply.send(HashMap::new());
                    }
                    Some(_) = connectivity_rx.recv() => {}
                    else => break,
                }
            }
        })
    }
}

fn backend_label<B>() -> &'static str {
    std::any::type_name::<B>()
        .rsplit("::")
        .next()
        .unwrap_or("backend")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    struct FakeBackend {
        connectivity_out: Mutex<Option<mpsc::UnboundedSender<ConnectivityMessage>>>,
        launches: Mutex<Vec<String>>,
    }

    impl FakeBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                connectivity_out: Mutex::new(None),
                launches: Mutex::new(Vec::new()),
            })
        }

        async fn make_ready(&self, account_name: &str, address: &str) {
            let out = self.connectivity_out.lock().await.clone().unwrap();
            let _ = out.send(ConnectivityMessage::ready(account_name, address));
        }

        async fn make_terminated(&self, account_name: &str) {
            let out = self.connectivity_out.lock().await.clone().unwrap();
            let _ = out.send(ConnectivityMessage::terminated(account_name));
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn init(
            &self,
            _shutdown: CancellationToken,
            connectivity_out: mpsc::UnboundedSender<ConnectivityMessage>,
            _all_accounts: Vec<Account>,
        ) -> crate::error::Result<()> {
            *self.connectivity_out.lock().await = Some(connectivity_out);
            Ok(())
        }

        async fn launch(&self, account: Account, _cancel: CancellationToken) {
            self.launches.lock().await.push(account.name);
        }

        async fn join(&self) {}
    }

    struct FakeAccountSource {
        accounts: Mutex<Vec<Account>>,
    }

    #[async_trait]
    impl AccountSource for FakeAccountSource {
        async fn all_accounts(&self) -> crate::error::Result<Vec<Account>> {
            Ok(self.accounts.lock().await.clone())
        }
    }

    fn metrics() -> Metrics {
        Metrics::new()
    }

    #[tokio::test]
    async fn subscriber_fan_out_delivers_same_address_to_every_waiter() {
        let backend = FakeBackend::new();
        let accounts = Arc::new(FakeAccountSource {
            accounts: Mutex::new(vec![]),
        });
        let (engine, handle) = Engine::new(backend.clone(), accounts, metrics(), Duration::from_secs(3600));
        let shutdown = CancellationToken::new();
        let run_shutdown = shutdown.clone();
        let run = tokio::spawn(async move { engine.run(run_shutdown).await });

        let h1 = handle.clone();
        let h2 = handle.clone();
        let a = Account::new("a1", "secret");

        let backend_for_ready = backend.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            backend_for_ready.make_ready("a1", "localhost:10001").await;
        });

        let (w1, w2) = tokio::join!(
            h1.ensure_address(a.clone()),
            h2.ensure_address(a.clone()),
        );

        assert_eq!(w1, Some("localhost:10001".to_string()));
        assert_eq!(w2, Some("localhost:10001".to_string()));

        shutdown.cancel();
        let ok = run.await.unwrap().unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn terminated_child_is_removed_and_relaunched_on_next_request() {
        let backend = FakeBackend::new();
        let accounts = Arc::new(FakeAccountSource {
            accounts: Mutex::new(vec![]),
        });
        let (engine, handle) = Engine::new(backend.clone(), accounts, metrics(), Duration::from_secs(3600));
        let shutdown = CancellationToken::new();
        let run_shutdown = shutdown.clone();
        let run = tokio::spawn(async move { engine.run(run_shutdown).await });

        let a = Account::new("a1", "secret");
        let backend_for_ready = backend.clone();
        let account_for_ready = a.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            backend_for_ready.make_ready(&account_for_ready.name, "localhost:10001").await;
        });
        let address = handle.ensure_address(a.clone()).await;
        assert_eq!(address, Some("localhost:10001".to_string()));

        backend.make_terminated("a1").await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let state = handle.report_state().await;
        assert!(!state.contains_key("a1"));

        shutdown.cancel();
        let _ = run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn fatal_connectivity_message_flips_ok_to_false() {
        let backend = FakeBackend::new();
        let accounts = Arc::new(FakeAccountSource {
            accounts: Mutex::new(vec![]),
        });
        let (engine, handle) = Engine::new(backend.clone(), accounts, metrics(), Duration::from_secs(3600));
        let shutdown = CancellationToken::new();
        let run_shutdown = shutdown.clone();
        let run = tokio::spawn(async move { engine.run(run_shutdown).await });

        let a = Account::new("a1", "secret");
        let backend_for_fatal = backend.clone();
        let account_for_fatal = a.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let out = backend_for_fatal.connectivity_out.lock().await.clone().unwrap();
            let _ = out.send(ConnectivityMessage::fatal(account_for_fatal.name, "boom"));
        });

        let address = handle.ensure_address(a).await;
        assert_eq!(address, None);

        let ok = run.await.unwrap().unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn late_requests_after_shutdown_resolve_to_none() {
        let backend = FakeBackend::new();
        let accounts = Arc::new(FakeAccountSource {
            accounts: Mutex::new(vec![]),
        });
        let (engine, handle) = Engine::new(backend, accounts, metrics(), Duration::from_secs(3600));
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let run = tokio::spawn(async move { engine.run(shutdown).await });

        let a = Account::new("a1", "secret");
        let address = handle.ensure_address(a).await;
        assert_eq!(address, None);

        let ok = run.await.unwrap().unwrap();
        assert!(ok);
    }
}
