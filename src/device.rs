//! PCI device power and driver-binding management for the passthrough GPU.
//!
//! Owns all direct sysfs interaction with the multi-function device (GPU
//! plus companion audio function). Hosts routinely drop an idle passthrough
//! GPU into D3cold; a VM started against a sleeping or vanished device fails
//! with a cryptic hypervisor error. The wake/reset/verify operations here
//! turn that flaky failure into a deterministic, logged, retryable one.
//!
//! Nothing in this module caches device state: every check reads sysfs
//! fresh, and the only mutations are the power-control write ([`wake`]) and
//! the remove-plus-rescan cycle ([`reset`]).
//!
//! [`wake`]: GpuDevice::wake
//! [`reset`]: GpuDevice::reset

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::DeviceConfig;

/// Default sysfs PCI bus root.
const SYSFS_PCI_ROOT: &str = "/sys/bus/pci";

/// Deepest runtime power state; a device reading this is not usable until
/// reset.
const POWER_STATE_COLD: &str = "D3cold";

/// Settle times around the remove/rescan cycle. Hardware-tuned values from
/// operational experience with consumer GPUs; named rather than re-derived.
#[derive(Debug, Clone, Copy)]
pub struct ResetSettle {
    /// Wait after requesting function removal, before the bus rescan.
    pub after_remove: Duration,
    /// Wait after the rescan, before re-checking enumeration.
    pub after_rescan: Duration,
}

impl Default for ResetSettle {
    fn default() -> Self {
        Self {
            after_remove: Duration::from_secs(1),
            after_rescan: Duration::from_secs(3),
        }
    }
}

/// Driver currently bound to one function of the device.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FunctionDriver {
    /// Full PCI address of the function, e.g. `0000:01:00.0`.
    pub address: String,
    /// Resolved driver name, or `None` when no driver is bound.
    pub driver: Option<String>,
}

fn render_report(report: &[FunctionDriver]) -> String {
    report
        .iter()
        .map(|f| {
            format!(
                "{}={}",
                f.address,
                f.driver.as_deref().unwrap_or("(none)")
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    /// The device is not enumerated on the bus, and a remove/rescan cycle
    /// did not bring it back. Not recoverable locally.
    #[error("PCI device {address} not found on the bus after reset")]
    NotFound { address: String },

    /// At least one function is bound to something other than the required
    /// passthrough driver. A host configuration problem; retrying cannot
    /// fix it.
    #[error("driver binding mismatch (want {required}): {}", render_report(.report))]
    WrongDriver {
        required: String,
        report: Vec<FunctionDriver>,
    },
}

/// One multi-function PCI device addressed through sysfs.
///
/// Requires at least one function; [`Config::load`](crate::Config::load)
/// rejects an empty list before a device is ever constructed.
///
/// The sysfs root is injectable so tests can run against a fake bus tree;
/// production code uses `/sys/bus/pci`.
#[derive(Debug, Clone)]
pub struct GpuDevice {
    base_address: String,
    functions: Vec<String>,
    required_driver: String,
    sysfs_root: PathBuf,
    settle: ResetSettle,
}

impl GpuDevice {
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            base_address: config.base_address.clone(),
            functions: config.functions.clone(),
            required_driver: config.required_driver.clone(),
            sysfs_root: PathBuf::from(SYSFS_PCI_ROOT),
            settle: ResetSettle::default(),
        }
    }

    /// Test constructor: same device, different bus root and settle times.
    pub fn with_sysfs_root(
        config: &DeviceConfig,
        sysfs_root: impl Into<PathBuf>,
        settle: ResetSettle,
    ) -> Self {
        Self {
            base_address: config.base_address.clone(),
            functions: config.functions.clone(),
            required_driver: config.required_driver.clone(),
            sysfs_root: sysfs_root.into(),
            settle,
        }
    }

    /// Full PCI address of the base function (function 0 by convention).
    pub fn base_function_address(&self) -> String {
        format!("{}.{}", self.base_address, self.functions[0])
    }

    fn function_addresses(&self) -> impl Iterator<Item = String> + '_ {
        self.functions
            .iter()
            .map(|f| format!("{}.{}", self.base_address, f))
    }

    fn device_dir(&self, address: &str) -> PathBuf {
        self.sysfs_root.join("devices").join(address)
    }

    /// True iff the base function is enumerated on the bus right now.
    pub fn exists(&self) -> bool {
        self.device_dir(&self.base_function_address()).is_dir()
    }

    /// Best-effort write of `on` to one function's power-control attribute.
    /// Absence of the attribute is normal on some platforms and swallowed.
    fn write_power_on(&self, address: &str) {
        let path = self.device_dir(address).join("power").join("control");
        match std::fs::write(&path, "on") {
            Ok(()) => debug!(function = address, "power/control set to on"),
            Err(e) => debug!(function = address, error = %e, "power/control write skipped"),
        }
    }

    /// Current runtime power state of the base function, if readable.
    fn power_state(&self) -> Option<String> {
        let path = self
            .device_dir(&self.base_function_address())
            .join("power_state");
        std::fs::read_to_string(path)
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Force every function out of runtime power management.
    ///
    /// Writes `on` to each function's power-control attribute, then re-reads
    /// the base function's power state. If the device still reads
    /// `D3cold` — or has meanwhile dropped off the bus entirely — escalates
    /// to a full [`reset`](Self::reset).
    pub async fn wake(&self) -> Result<(), DeviceError> {
        for address in self.function_addresses() {
            self.write_power_on(&address);
        }

        let state = self.power_state();
        if state.as_deref() == Some(POWER_STATE_COLD) || !self.exists() {
            warn!(
                device = %self.base_function_address(),
                power_state = state.as_deref().unwrap_or("unreadable"),
                "device still cold after wake, escalating to reset"
            );
            return self.reset().await;
        }

        debug!(
            device = %self.base_function_address(),
            power_state = state.as_deref().unwrap_or("unreadable"),
            "device awake"
        );
        Ok(())
    }

    /// Remove every function from the bus and trigger a full rescan.
    ///
    /// The remove and rescan writes are best-effort triggers; the outcome is
    /// judged solely by whether the device is enumerated afterwards. On
    /// success the power-control write is re-applied to every function
    /// (rescan re-binds with default power management).
    pub async fn reset(&self) -> Result<(), DeviceError> {
        info!(device = %self.base_function_address(), "resetting PCI device");

        for address in self.function_addresses() {
            let path = self.device_dir(&address).join("remove");
            match std::fs::write(&path, "1") {
                Ok(()) => debug!(function = %address, "removal requested"),
                Err(e) => warn!(function = %address, error = %e, "removal request failed"),
            }
        }
        sleep(self.settle.after_remove).await;

        let rescan = self.sysfs_root.join("rescan");
        if let Err(e) = std::fs::write(&rescan, "1") {
            warn!(error = %e, "bus rescan trigger failed");
        }
        sleep(self.settle.after_rescan).await;

        if !self.exists() {
            return Err(DeviceError::NotFound {
                address: self.base_function_address(),
            });
        }

        for address in self.function_addresses() {
            self.write_power_on(&address);
        }
        info!(device = %self.base_function_address(), "device re-enumerated after reset");
        Ok(())
    }

    /// Resolved driver for every function, fetched live.
    pub fn driver_report(&self) -> Vec<FunctionDriver> {
        self.function_addresses()
            .map(|address| {
                let driver = std::fs::read_link(self.device_dir(&address).join("driver"))
                    .ok()
                    .and_then(|target| {
                        target
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                    });
                FunctionDriver { address, driver }
            })
            .collect()
    }

    /// Ok only when *every* function is bound to the required passthrough
    /// driver. Partial binding is always a mismatch.
    pub fn verify_binding(&self) -> Result<(), DeviceError> {
        let report = self.driver_report();
        let all_bound = report
            .iter()
            .all(|f| f.driver.as_deref() == Some(self.required_driver.as_str()));

        if all_bound {
            debug!(device = %self.base_function_address(), driver = %self.required_driver, "binding verified");
            Ok(())
        } else {
            Err(DeviceError::WrongDriver {
                required: self.required_driver.clone(),
                report,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use std::path::Path;

    /// Build a fake sysfs bus tree with the given functions bound to the
    /// given drivers (`None` leaves the function unbound).
    fn fake_bus(root: &Path, functions: &[(&str, Option<&str>)]) {
        std::fs::create_dir_all(root.join("drivers")).unwrap();
        std::fs::write(root.join("rescan"), "").unwrap();

        for (address, driver) in functions {
            let dev = root.join("devices").join(address);
            std::fs::create_dir_all(dev.join("power")).unwrap();
            std::fs::write(dev.join("power").join("control"), "auto").unwrap();
            std::fs::write(dev.join("power_state"), "D0\n").unwrap();
            std::fs::write(dev.join("remove"), "").unwrap();

            if let Some(driver) = driver {
                let driver_dir = root.join("drivers").join(driver);
                std::fs::create_dir_all(&driver_dir).unwrap();
                symlink(&driver_dir, dev.join("driver")).unwrap();
            }
        }
    }

    fn test_device(root: &Path) -> GpuDevice {
        GpuDevice::with_sysfs_root(
            &crate::config::DeviceConfig::default(),
            root,
            ResetSettle {
                after_remove: Duration::from_millis(1),
                after_rescan: Duration::from_millis(1),
            },
        )
    }

    #[test]
    fn exists_reflects_enumeration() {
        let tmp = tempfile::tempdir().unwrap();
        let device = test_device(tmp.path());
        assert!(!device.exists());

        fake_bus(tmp.path(), &[("0000:01:00.0", Some("vfio-pci"))]);
        assert!(device.exists());
    }

    #[test]
    fn binding_ok_when_all_functions_match() {
        let tmp = tempfile::tempdir().unwrap();
        fake_bus(
            tmp.path(),
            &[
                ("0000:01:00.0", Some("vfio-pci")),
                ("0000:01:00.1", Some("vfio-pci")),
            ],
        );

        assert!(test_device(tmp.path()).verify_binding().is_ok());
    }

    #[test]
    fn single_mismatched_function_is_wrong_driver() {
        // F0 bound to the host driver, F1 correctly to vfio-pci.
        let tmp = tempfile::tempdir().unwrap();
        fake_bus(
            tmp.path(),
            &[
                ("0000:01:00.0", Some("other-driver")),
                ("0000:01:00.1", Some("vfio-pci")),
            ],
        );

        let err = test_device(tmp.path()).verify_binding().unwrap_err();
        match err {
            DeviceError::WrongDriver { required, report } => {
                assert_eq!(required, "vfio-pci");
                assert_eq!(report.len(), 2);
                assert_eq!(report[0].address, "0000:01:00.0");
                assert_eq!(report[0].driver.as_deref(), Some("other-driver"));
                assert_eq!(report[1].address, "0000:01:00.1");
                assert_eq!(report[1].driver.as_deref(), Some("vfio-pci"));
            }
            other => panic!("expected WrongDriver, got {other:?}"),
        }
    }

    #[test]
    fn unbound_function_is_wrong_driver() {
        let tmp = tempfile::tempdir().unwrap();
        fake_bus(
            tmp.path(),
            &[("0000:01:00.0", Some("vfio-pci")), ("0000:01:00.1", None)],
        );

        let err = test_device(tmp.path()).verify_binding().unwrap_err();
        match err {
            DeviceError::WrongDriver { report, .. } => {
                assert_eq!(report[1].driver, None);
            }
            other => panic!("expected WrongDriver, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wake_writes_power_control_on_every_function() {
        let tmp = tempfile::tempdir().unwrap();
        fake_bus(
            tmp.path(),
            &[
                ("0000:01:00.0", Some("vfio-pci")),
                ("0000:01:00.1", Some("vfio-pci")),
            ],
        );

        test_device(tmp.path()).wake().await.unwrap();

        for function in ["0000:01:00.0", "0000:01:00.1"] {
            let control = tmp
                .path()
                .join("devices")
                .join(function)
                .join("power")
                .join("control");
            assert_eq!(std::fs::read_to_string(control).unwrap(), "on");
        }
    }

    #[tokio::test]
    async fn wake_escalates_to_reset_when_cold() {
        let tmp = tempfile::tempdir().unwrap();
        fake_bus(tmp.path(), &[("0000:01:00.0", Some("vfio-pci"))]);
        std::fs::write(
            tmp.path().join("devices/0000:01:00.0/power_state"),
            "D3cold\n",
        )
        .unwrap();

        // Device stays enumerated in the fake tree, so the escalated reset
        // succeeds; the rescan trigger is the observable side effect.
        test_device(tmp.path()).wake().await.unwrap();
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("rescan")).unwrap(),
            "1"
        );
    }

    #[tokio::test]
    async fn reset_succeeds_regardless_of_driver_binding() {
        let tmp = tempfile::tempdir().unwrap();
        fake_bus(tmp.path(), &[("0000:01:00.0", Some("other-driver"))]);

        // Reset is judged by re-enumeration only; the binding stays wrong
        // and that is for verify_binding to report.
        test_device(tmp.path()).reset().await.unwrap();
        assert!(test_device(tmp.path()).verify_binding().is_err());
    }

    #[tokio::test]
    async fn reset_fails_when_device_never_reappears() {
        let tmp = tempfile::tempdir().unwrap();
        // Bus tree with a rescan trigger but no device directories.
        std::fs::write(tmp.path().join("rescan"), "").unwrap();

        let err = test_device(tmp.path()).reset().await.unwrap_err();
        assert!(matches!(err, DeviceError::NotFound { .. }));
    }

    #[test]
    fn wrong_driver_message_names_every_function() {
        let err = DeviceError::WrongDriver {
            required: "vfio-pci".to_string(),
            report: vec![
                FunctionDriver {
                    address: "0000:01:00.0".to_string(),
                    driver: Some("other-driver".to_string()),
                },
                FunctionDriver {
                    address: "0000:01:00.1".to_string(),
                    driver: None,
                },
            ],
        };

        let msg = err.to_string();
        assert!(msg.contains("0000:01:00.0=other-driver"), "msg = {msg}");
        assert!(msg.contains("0000:01:00.1=(none)"), "msg = {msg}");
    }
}
