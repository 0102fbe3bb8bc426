//! Base-configuration rendering for the local-processes backend.
//!
//! Written once, during `init`, to `${XDG_RUNTIME_DIR:-/run}/keppel/`.

use std::io;
use std::path::{Path, PathBuf};

use indoc::indoc;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// The fixed base registry config. Source tabs are expanded to four spaces.
pub(crate) const REGISTRY_BASE_YAML: &str = indoc! {"
    version: 0.1
    log:
        fields:
            service: keppel-registry
    storage:
        delete:
            enabled: true
    http:
        relativeurls: true
    auth:
        token:
            realm: https://keppel.example/keppel/v1/auth
            service: keppel_api
            issuer: keppel-api
"};

/// Placeholder issuer certificate bundle content; the real bundle is supplied by the
/// JWT-issuer configuration.
const ISSUER_CERT_BUNDLE_PLACEHOLDER: &str = "";

pub fn base_config_path(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join("registry-base.yaml")
}

pub fn cert_bundle_path(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join("issuer-cert-bundle.pem")
}

/// Writes `registry-base.yaml` (mode 0644) and `issuer-cert-bundle.pem` (mode 0600) under
/// `runtime_dir`, creating the directory if necessary.
pub fn write_base_config(runtime_dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(runtime_dir)?;

    let base_config = base_config_path(runtime_dir);
    std::fs::write(&base_config, REGISTRY_BASE_YAML)?;
    set_mode(&base_config, 0o644)?;

    let cert_bundle = cert_bundle_path(runtime_dir);
    std::fs::write(&cert_bundle, ISSUER_CERT_BUNDLE_PLACEHOLDER)?;
    set_mode(&cert_bundle, 0o600)?;

    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(mode);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_both_files_with_expected_modes() {
        let dir = tempfile::tempdir().unwrap();
        write_base_config(dir.path()).unwrap();

        let base = base_config_path(dir.path());
        let bundle = cert_bundle_path(dir.path());
        assert!(base.exists());
        assert!(bundle.exists());
        assert!(std::fs::read_to_string(&base).unwrap().contains("keppel-registry"));

        #[cfg(unix)]
        {
            let base_mode = std::fs::metadata(&base).unwrap().permissions().mode() & 0o777;
            let bundle_mode = std::fs::metadata(&bundle).unwrap().permissions().mode() & 0o777;
            assert_eq!(base_mode, 0o644);
            assert_eq!(bundle_mode, 0o600);
        }
    }
}
