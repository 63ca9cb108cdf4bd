//! Orchestrator configuration.
//!
//! Loaded from a TOML file (`/etc/vfiovm/config.toml` by default, overridable
//! with `--config`). Every field has a default so the tool runs on a stock
//! single-GPU passthrough host with no file present at all.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vfiovm/config.toml";

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Name of the libvirt domain this orchestrator manages.
    pub vm_name: String,

    /// The passthrough GPU.
    pub device: DeviceConfig,

    /// Preferred network path: a host bridge interface the VM attaches to.
    pub bridge: String,

    /// Fallback libvirt NAT network, accepted as a degraded mode when the
    /// bridge is absent.
    pub nat_network: String,

    /// Host directory exported to the guest over the file-sharing transport.
    /// The orchestrator guarantees it exists; it does not own its contents.
    pub shared_folder: PathBuf,

    /// Subfolders expected under `shared_folder`.
    pub shared_subfolders: Vec<String>,

    /// Name of the user-space file-sharing daemon whose leftovers the
    /// sanitizer cleans up.
    pub helper_daemon: String,

    /// Directory where the helper daemon leaves its control sockets.
    pub socket_dir: PathBuf,

    /// Operational log directory.
    pub log_dir: PathBuf,

    /// Lock directory marking an orchestrator-managed session.
    pub lock_dir: PathBuf,
}

/// One multi-function PCI device: the GPU plus its companion audio function.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    /// Bus/device part of the PCI address, without the function suffix.
    pub base_address: String,

    /// Ordered function suffixes. Function 0 is the GPU itself; function 1
    /// is usually the HDMI audio controller.
    pub functions: Vec<String>,

    /// Driver every function must be bound to for passthrough.
    pub required_driver: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vm_name: "win10-gpu".to_string(),
            device: DeviceConfig::default(),
            bridge: "br0".to_string(),
            nat_network: "default".to_string(),
            shared_folder: PathBuf::from("/srv/vm-share"),
            shared_subfolders: vec!["shared".to_string(), "iso".to_string()],
            helper_daemon: "virtiofsd".to_string(),
            socket_dir: PathBuf::from("/run/vfiovm"),
            log_dir: PathBuf::from("/var/log/vfiovm"),
            lock_dir: PathBuf::from("/run/vfiovm/lock"),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            base_address: "0000:01:00".to_string(),
            functions: vec!["0".to_string(), "1".to_string()],
            required_driver: "vfio-pci".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from [`DEFAULT_CONFIG_PATH`] when
    /// `path` is `None`.
    ///
    /// An explicitly given file must exist and parse; a missing file at the
    /// default location silently yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        if !path.exists() {
            if explicit {
                anyhow::bail!("config file not found: {}", path.display());
            }
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("parse config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file {}", path.display()))?;

        debug!(path = %path.display(), vm = %config.vm_name, "config loaded");
        Ok(config)
    }

    /// Reject configurations that parse but cannot be operated on. Every
    /// device check indexes function 0, and a device with no functions would
    /// vacuously pass binding verification.
    fn validate(&self) -> Result<()> {
        if self.device.functions.is_empty() {
            anyhow::bail!("device.functions must name at least one PCI function");
        }
        if self.vm_name.is_empty() {
            anyhow::bail!("vm_name must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_name_the_passthrough_driver() {
        let config = Config::default();
        assert_eq!(config.device.required_driver, "vfio-pci");
        assert_eq!(config.device.functions, vec!["0", "1"]);
    }

    #[test]
    fn missing_default_file_yields_defaults() {
        // DEFAULT_CONFIG_PATH does not exist in the test environment.
        let config = Config::load(None).expect("defaults must load");
        assert_eq!(config.vm_name, Config::default().vm_name);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let result = Config::load(Some(Path::new("/nonexistent/vfiovm.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
vm_name = "render-box"

[device]
base_address = "0000:0a:00"
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).expect("partial config must parse");
        assert_eq!(config.vm_name, "render-box");
        assert_eq!(config.device.base_address, "0000:0a:00");
        // Unspecified fields fall back to defaults.
        assert_eq!(config.device.required_driver, "vfio-pci");
        assert_eq!(config.bridge, "br0");
    }

    #[test]
    fn empty_function_list_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[device]
functions = []
"#,
        )
        .unwrap();

        let err = Config::load(Some(&path)).unwrap_err();
        assert!(
            format!("{err:#}").contains("at least one PCI function"),
            "unexpected error: {err:#}"
        );
    }

    #[test]
    fn empty_vm_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "vm_name = \"\"\n").unwrap();

        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "vm_nmae = \"typo\"\n").unwrap();

        assert!(Config::load(Some(&path)).is_err());
    }
}
