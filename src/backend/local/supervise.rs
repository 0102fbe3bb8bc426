//! Subprocess spawning and supervision for one account's child.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::account::Account;
use crate::backend::ConnectivityMessage;
use crate::metrics::Metrics;
use crate::storage::StorageDriver;

type PortMap = Arc<RwLock<HashMap<String, u16>>>;

/// Any process environment variable prefixed with this is forwarded to every child (with
/// the prefix stripped) as global registry configuration forwarded to every child.
const GLOBAL_CONFIG_ENV_PREFIX: &str = "KEPPEL_REGISTRY_";

#[allow(clippy::too_many_arguments)]
pub fn spawn_child(
    tasks: &mut JoinSet<()>,
    account: Account,
    port: u16,
    base_config_path: PathBuf,
    cert_bundle_path: PathBuf,
    storage: Arc<dyn StorageDriver>,
    metrics: Metrics,
    connectivity_out: mpsc::UnboundedSender<ConnectivityMessage>,
    ports: PortMap,
    shutdown: CancellationToken,
    _cancel: CancellationToken,
) {
    tasks.spawn(async move {
        let account_name = account.name.clone();
        let child = match spawn_process(&account, port, &base_config_path, &cert_bundle_path, &storage) {
            Ok(child) => child,
            Err(e) => {
                error!(account = %account_name, error = %e, "failed to spawn registry child");
                metrics
                    .child_launches
                    .with_label_values(&["local", "start_failure"])
                    .inc();
                let _ = connectivity_out.send(ConnectivityMessage::fatal(
                    account_name,
                    format!("failed to spawn child: {e}"),
                ));
                return;
            }
        };
        metrics
            .child_launches
            .with_label_values(&["local", "spawned"])
            .inc();

        let pid = child.id();
        info!(account = %account_name, port, pid, "spawned registry child");

        run_supervisors(
            account_name,
            port,
            child,
            metrics,
            connectivity_out,
            ports,
            shutdown,
        )
        .await;
    });
}

fn spawn_process(
    account: &Account,
    port: u16,
    base_config_path: &PathBuf,
    cert_bundle_path: &PathBuf,
    storage: &Arc<dyn StorageDriver>,
) -> std::io::Result<tokio::process::Child> {
    let mut cmd = Command::new("keppel-registry");
    cmd.arg("serve").arg(base_config_path);

    // (i) parent environment is inherited implicitly by tokio::process::Command.
    // (ii) storage-driver-provided variables for this account.
    for (key, value) in storage.env_vars(account) {
        cmd.env(key, value);
    }
    // (iii) global registry configuration, passed through from the parent environment.
    for (key, value) in std::env::vars() {
        if let Some(suffix) = key.strip_prefix(GLOBAL_CONFIG_ENV_PREFIX) {
            cmd.env(format!("REGISTRY_{suffix}"), value);
        }
    }
    // (iv) account-specific variables.
    cmd.env("REGISTRY_HTTP_ADDR", format!(":{port}"));
    cmd.env("REGISTRY_HTTP_SECRET", &account.secret);
    cmd.env("REGISTRY_LOG_FIELDS_KEPPEL.ACCOUNT", &account.name);
    cmd.env(
        "REGISTRY_AUTH_TOKEN_ROOTCERTBUNDLE",
        cert_bundle_path.display().to_string(),
    );

    cmd.stdout(std::process::Stdio::inherit());
    cmd.stderr(std::process::Stdio::inherit());
    cmd.kill_on_drop(false);

    cmd.spawn()
}

async fn run_supervisors(
    account_name: String,
    port: u16,
    mut child: tokio::process::Child,
    metrics: Metrics,
    connectivity_out: mpsc::UnboundedSender<ConnectivityMessage>,
    ports: PortMap,
    shutdown: CancellationToken,
) {
    let pid = child.id();

    // Readiness probe races against the process simply exiting early; whichever observes
    // first wins. We spawn the probe as its own task so a slow/never-ready process doesn't
    // block the waiter from detecting exit.
    let probe_account = account_name.clone();
    let probe_metrics = metrics.clone();
    let probe_out = connectivity_out.clone();
    tokio::spawn(async move {
        probe_readiness(probe_account, port, probe_metrics, probe_out).await;
    });

    tokio::select! {
        status = child.wait() => {
            handle_exit(&account_name, status, &connectivity_out);
        }
        _ = shutdown.cancelled() => {
            interrupt_and_wait(pid, &mut child, &account_name).await;
            let _ = connectivity_out.send(ConnectivityMessage::terminated(account_name.clone()));
        }
    }

    ports.write().await.remove(&account_name);
}

fn handle_exit(
    account_name: &str,
    status: std::io::Result<std::process::ExitStatus>,
    connectivity_out: &mpsc::UnboundedSender<ConnectivityMessage>,
) {
    match status {
        Ok(status) if status.success() => {
            info!(account = %account_name, "registry child exited cleanly");
        }
        Ok(status) => {
            error!(account = %account_name, %status, "registry child exited with an error");
        }
        Err(e) => {
            error!(account = %account_name, error = %e, "failed to wait for registry child");
        }
    }
    let _ = connectivity_out.send(ConnectivityMessage::terminated(account_name.to_string()));
}

#[cfg(unix)]
async fn interrupt_and_wait(pid: Option<u32>, child: &mut tokio::process::Child, account_name: &str) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
            error!(account = %account_name, error = %e, "failed to signal registry child");
        }
    }

    match child.wait().await {
        Ok(status) if is_sigint_exit(status) => {
            debug!(account = %account_name, "registry child exited after SIGINT");
        }
        Ok(status) => {
            error!(account = %account_name, %status, "registry child exited abnormally during shutdown");
        }
        Err(e) => {
            error!(account = %account_name, error = %e, "failed to wait for registry child during shutdown");
        }
    }
}

#[cfg(not(unix))]
async fn interrupt_and_wait(_pid: Option<u32>, child: &mut tokio::process::Child, account_name: &str) {
    let _ = child.kill().await;
    let _ = child.wait().await;
    debug!(account = %account_name, "registry child killed during shutdown");
}

#[cfg(unix)]
fn is_sigint_exit(status: std::process::ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(nix::sys::signal::Signal::SIGINT as i32)
}

async fn probe_readiness(
    account_name: String,
    port: u16,
    metrics: Metrics,
    connectivity_out: mpsc::UnboundedSender<ConnectivityMessage>,
) {
    let client = reqwest::Client::new();
    let url = format!("http://localhost:{port}/");
    let mut backoff = Duration::from_millis(2);

    for attempt in 1..=10 {
        match client.get(&url).send().await {
            Ok(_) => {
                metrics
                    .readiness_probe_attempts
                    .with_label_values(&["success"])
                    .inc();
                debug!(account = %account_name, attempt, "registry child became ready");
                break;
            }
            Err(_) if attempt < 10 => {
                metrics
                    .readiness_probe_attempts
                    .with_label_values(&["retry"])
                    .inc();
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(_) => {
                metrics
                    .readiness_probe_attempts
                    .with_label_values(&["exhausted"])
                    .inc();
                debug!(account = %account_name, "readiness probe exhausted all attempts");
            }
        }
    }

    let _ = connectivity_out.send(ConnectivityMessage::ready(
        account_name,
        format!("localhost:{port}"),
    ));
}
