use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A tenant account known to the database. Opaque to the engine except for its name and
/// secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Lowercase, path-safe tenant identifier.
    pub name: String,
    /// Per-account secret handed through to the child via `REGISTRY_HTTP_SECRET`.
    pub secret: String,
}

impl Account {
    pub fn new(name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secret: secret.into(),
        }
    }
}

/// The database interface the engine drives its sweep off of.
#[async_trait]
pub trait AccountSource: Send + Sync + 'static {
    async fn all_accounts(&self) -> crate::error::Result<Vec<Account>>;
}
