//! Informer-equivalent: wraps a `kube::runtime::watcher` stream with backoff-on-error
//! `recv()`, grounded on `linkerd-linkerd2/policy-controller/k8s/api/src/watch.rs`.

use std::pin::Pin;
use std::time::Duration;

use futures::{Stream, StreamExt};
use kube::runtime::watcher::{Error as WatcherError, Event};
use tokio::time;
use tracing::info;

/// Wraps an event stream that never terminates, restarting with a short backoff whenever
/// the underlying watch errors (e.g. on a connection reset).
pub struct Watch<K> {
    rx: Pin<Box<dyn Stream<Item = Result<Event<K>, WatcherError>> + Send + 'static>>,
}

impl<K> Watch<K> {
    pub fn new(rx: Pin<Box<dyn Stream<Item = Result<Event<K>, WatcherError>> + Send + 'static>>) -> Self {
        Self { rx }
    }

    /// Receives the next watch event, retrying transparently on error.
    pub async fn recv(&mut self) -> Event<K> {
        loop {
            let ev = self.rx.next().await.expect("watch stream must not terminate");
            match ev {
                Ok(ev) => return ev,
                Err(error) => {
                    info!(%error, "kubernetes watch failed, restarting");
                    time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}
