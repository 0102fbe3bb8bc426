//! The abstract interface the engine drives.
//!
//! Both concrete backends (`local`, `kubernetes`) implement [`Backend`]; the engine never
//! reaches past this trait into backend internals.

pub mod kubernetes;
pub mod local;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::account::Account;
use crate::error::Error;

/// A backend-to-engine state change for one account's child.
#[derive(Debug, Clone)]
pub struct ConnectivityMessage {
    pub account_name: String,
    /// `Some(addr)` — reachable at `addr`. `None` — terminated or never came up.
    pub address: Option<String>,
    /// `Some(..)` — unrecoverable start failure; the engine must begin global shutdown.
    pub fatal: Option<String>,
}

impl ConnectivityMessage {
    pub fn ready(account_name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            account_name: account_name.into(),
            address: Some(address.into()),
            fatal: None,
        }
    }

    pub fn terminated(account_name: impl Into<String>) -> Self {
        Self {
            account_name: account_name.into(),
            address: None,
            fatal: None,
        }
    }

    pub fn fatal(account_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            account_name: account_name.into(),
            address: None,
            fatal: Some(reason.into()),
        }
    }
}

/// Backend contract driven by the orchestration engine.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Called exactly once, before any call to `launch`. Must bring up infrastructure
    /// common to all accounts and act as if `launch` had already been called for every
    /// account in `all_accounts`.
    async fn init(
        &self,
        shutdown: CancellationToken,
        connectivity_out: mpsc::UnboundedSender<ConnectivityMessage>,
        all_accounts: Vec<Account>,
    ) -> Result<(), Error>;

    /// Idempotent request to ensure a child exists for `account`. Must not block for long;
    /// long-running work is deferred to backend-internal tasks.
    async fn launch(&self, account: Account, cancel: CancellationToken);

    /// Awaits every task the backend has spawned, used during engine shutdown.
    async fn join(&self);
}
