use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("kube error: {0}")]
    Kube(#[source] kube::Error),

    #[error("io error: {0}")]
    Io(#[source] std::io::Error),

    #[error("http client error: {0}")]
    Http(#[source] reqwest::Error),

    #[error("account {account:?} has no reachable address")]
    NotReachable { account: String },

    #[error("child for account {account:?} failed to start: {reason}")]
    StartFailure { account: String, reason: String },

    #[error("cache sync timed out after {0:?}")]
    CacheSyncTimeout(std::time::Duration),

    #[error("shutting down")]
    ShuttingDown,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Lowercased tag suitable for a metrics label.
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Kube(_) => "kube",
            Error::Io(_) => "io",
            Error::Http(_) => "http",
            Error::NotReachable { .. } => "not_reachable",
            Error::StartFailure { .. } => "start_failure",
            Error::CacheSyncTimeout(_) => "cache_sync_timeout",
            Error::ShuttingDown => "shutting_down",
        }
    }

    /// Whether this error should be treated as fatal to the whole fleet.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::StartFailure { .. } | Error::CacheSyncTimeout(_)
        )
    }
}
