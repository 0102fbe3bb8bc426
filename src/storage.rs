use std::collections::HashMap;

use crate::account::Account;

/// The storage-driver interface that supplies per-account environment variables.
pub trait StorageDriver: Send + Sync {
    /// Key/value pairs to inject into a child's environment for `account`.
    fn env_vars(&self, account: &Account) -> HashMap<String, String>;
}

/// A driver that contributes no environment variables, useful for tests and for storage
/// backends that need no extra wiring.
pub struct NullStorageDriver;

impl StorageDriver for NullStorageDriver {
    fn env_vars(&self, _account: &Account) -> HashMap<String, String> {
        HashMap::new()
    }
}
