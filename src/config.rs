use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("environment variable {0} has an invalid value: {1}")]
    Invalid(&'static str, String),
}

/// Which backend to drive the fleet with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    Kubernetes,
}

/// Top-level configuration, assembled once from the process environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: BackendKind,
    pub sweep_interval: Duration,
    pub bind_addr: String,
    pub local: LocalConfig,
    pub kubernetes: Option<KubernetesConfig>,
}

#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub runtime_dir: std::path::PathBuf,
}

#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    pub namespace: String,
    pub marker: String,
    pub registry_image: String,
    pub debug_diffs: bool,
}

impl Config {
    /// Parse configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = match std::env::var("KEPPEL_BACKEND").as_deref() {
            Ok("kubernetes") => BackendKind::Kubernetes,
            Ok("local") | Err(_) => BackendKind::Local,
            Ok(other) => {
                return Err(ConfigError::Invalid("KEPPEL_BACKEND", other.to_string()));
            }
        };

        let sweep_interval = match std::env::var("KEPPEL_SWEEP_INTERVAL_SECONDS") {
            Ok(raw) => Duration::from_secs(raw.parse().map_err(|_| {
                ConfigError::Invalid("KEPPEL_SWEEP_INTERVAL_SECONDS", raw.clone())
            })?),
            Err(_) => Duration::from_secs(60),
        };

        let bind_addr =
            std::env::var("KEPPEL_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let runtime_dir = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/run".to_string());
        let local = LocalConfig {
            runtime_dir: std::path::PathBuf::from(runtime_dir).join("keppel"),
        };

        let kubernetes = if backend == BackendKind::Kubernetes {
            Some(KubernetesConfig::from_env()?)
        } else {
            None
        };

        Ok(Config {
            backend,
            sweep_interval,
            bind_addr,
            local,
            kubernetes,
        })
    }
}

impl KubernetesConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let namespace = std::env::var("KEPPEL_KUBERNETES_NAMESPACE")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("KEPPEL_KUBERNETES_NAMESPACE"))?;

        let marker =
            std::env::var("KEPPEL_KUBERNETES_MARKER").unwrap_or_else(|_| "registry".to_string());

        let registry_image = std::env::var("KEPPEL_REGISTRY_IMAGE")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("KEPPEL_REGISTRY_IMAGE"))?;

        let debug_diffs = match std::env::var("KEPPEL_DEBUG_KUBERNETES_DIFFS") {
            Ok(raw) => raw.parse().map_err(|_| {
                ConfigError::Invalid("KEPPEL_DEBUG_KUBERNETES_DIFFS", raw.clone())
            })?,
            Err(_) => false,
        };

        Ok(KubernetesConfig {
            namespace,
            marker,
            registry_image,
            debug_diffs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests mutate process-wide env vars, so they must not run concurrently with each
    // other; a single test exercising all branches keeps that implicit.
    #[test]
    fn backend_selection_and_kubernetes_requirements() {
        std::env::remove_var("KEPPEL_BACKEND");
        std::env::remove_var("KEPPEL_KUBERNETES_NAMESPACE");
        std::env::remove_var("KEPPEL_REGISTRY_IMAGE");
        std::env::remove_var("KEPPEL_SWEEP_INTERVAL_SECONDS");
        std::env::remove_var("KEPPEL_BIND_ADDR");

        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.backend, BackendKind::Local);
        assert_eq!(cfg.sweep_interval, Duration::from_secs(60));
        assert!(cfg.kubernetes.is_none());

        std::env::set_var("KEPPEL_BACKEND", "kubernetes");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("KEPPEL_KUBERNETES_NAMESPACE")));

        std::env::set_var("KEPPEL_KUBERNETES_NAMESPACE", "");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("KEPPEL_KUBERNETES_NAMESPACE")));

        std::env::set_var("KEPPEL_KUBERNETES_NAMESPACE", "keppel");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("KEPPEL_REGISTRY_IMAGE")));

        std::env::set_var("KEPPEL_REGISTRY_IMAGE", "keppel/registry:latest");
        let cfg = Config::from_env().unwrap();
        let k8s = cfg.kubernetes.unwrap();
        assert_eq!(k8s.namespace, "keppel");
        assert_eq!(k8s.marker, "registry");
        assert!(!k8s.debug_diffs);

        std::env::remove_var("KEPPEL_BACKEND");
        std::env::remove_var("KEPPEL_KUBERNETES_NAMESPACE");
        std::env::remove_var("KEPPEL_REGISTRY_IMAGE");
    }
}
