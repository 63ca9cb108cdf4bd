//! Pre-start validation gate.
//!
//! Composes the device manager, process sanitizer and environment checks
//! into a single pass/fail gate with diagnostics, run before every start.
//! Steps execute in a fixed order; a failed step short-circuits the rest
//! and the error carries every outcome gathered up to that point, so the
//! operator sees the whole picture, not just the last line.
//!
//! Two steps abort rather than warn: a GPU that is missing and cannot be
//! brought back by reset (nothing local can fix it), and a driver-binding
//! mismatch (a host configuration problem that retrying cannot fix).

use std::path::PathBuf;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;
use crate::device::GpuDevice;
use crate::hypervisor::{DomainState, Hypervisor};
use crate::paths::RuntimePaths;
use crate::sanitize::Sanitizer;

/// Default location of host network interfaces.
const SYSFS_NET_ROOT: &str = "/sys/class/net";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Passed,
    /// The step found a degraded but acceptable condition.
    Warned,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Passed => "ok",
            Self::Warned => "warn",
        })
    }
}

/// Outcome of one preflight step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step: &'static str,
    pub status: StepStatus,
    pub detail: String,
}

/// All step outcomes of a successful preflight pass.
#[derive(Debug, Clone, Default)]
pub struct PreflightReport {
    pub steps: Vec<StepOutcome>,
}

/// A preflight step failed; `completed` holds every outcome gathered before
/// the failure.
#[derive(Debug, Error)]
#[error("preflight failed at `{step}`: {reason}")]
pub struct PreflightError {
    pub step: &'static str,
    pub reason: String,
    pub completed: Vec<StepOutcome>,
}

/// The pre-start gate. Borrows its collaborators; holds no state of its own,
/// so running it twice with no intervening system change yields the same
/// outcome twice.
pub struct Preflight<'a, H: Hypervisor> {
    hypervisor: &'a H,
    device: &'a GpuDevice,
    sanitizer: &'a Sanitizer,
    paths: &'a RuntimePaths,
    vm_name: &'a str,
    bridge: &'a str,
    nat_network: &'a str,
    net_root: PathBuf,
}

impl<'a, H: Hypervisor> Preflight<'a, H> {
    pub fn new(
        hypervisor: &'a H,
        device: &'a GpuDevice,
        sanitizer: &'a Sanitizer,
        paths: &'a RuntimePaths,
        config: &'a Config,
    ) -> Self {
        Self {
            hypervisor,
            device,
            sanitizer,
            paths,
            vm_name: &config.vm_name,
            bridge: &config.bridge,
            nat_network: &config.nat_network,
            net_root: PathBuf::from(SYSFS_NET_ROOT),
        }
    }

    /// Test constructor: look for network interfaces under a fake root.
    pub fn with_net_root(mut self, net_root: impl Into<PathBuf>) -> Self {
        self.net_root = net_root.into();
        self
    }

    /// Run every step in order. See the module docs for the abort policy.
    pub async fn run(&self) -> Result<PreflightReport, PreflightError> {
        let mut report = PreflightReport::default();

        self.ensure_directories(&mut report)?;
        self.clear_stale_domain(&mut report).await?;
        self.sanitize_processes(&mut report);
        self.recover_device(&mut report).await?;
        self.verify_binding(&mut report)?;
        self.check_network(&mut report).await;
        self.ensure_shared_folder(&mut report)?;

        info!(vm = %self.vm_name, steps = report.steps.len(), "preflight passed");
        Ok(report)
    }

    fn fail(
        &self,
        report: &PreflightReport,
        step: &'static str,
        reason: String,
    ) -> PreflightError {
        warn!(vm = %self.vm_name, step, %reason, "preflight aborted");
        PreflightError {
            step,
            reason,
            completed: report.steps.clone(),
        }
    }

    fn pass(report: &mut PreflightReport, step: &'static str, detail: impl Into<String>) {
        let detail = detail.into();
        info!(step, %detail, "preflight step ok");
        report.steps.push(StepOutcome {
            step,
            status: StepStatus::Passed,
            detail,
        });
    }

    fn warn_step(report: &mut PreflightReport, step: &'static str, detail: impl Into<String>) {
        let detail = detail.into();
        warn!(step, %detail, "preflight step degraded");
        report.steps.push(StepOutcome {
            step,
            status: StepStatus::Warned,
            detail,
        });
    }

    fn ensure_directories(&self, report: &mut PreflightReport) -> Result<(), PreflightError> {
        match self.paths.ensure_runtime_dirs() {
            Ok(()) => {
                Self::pass(report, "directories", "log and lock directories ready");
                Ok(())
            }
            Err(e) => Err(self.fail(report, "directories", e.to_string())),
        }
    }

    /// Clear any zombie domain left by a prior session. Destroy is attempted
    /// for every not-running state — including ShutOff and Unknown, where it
    /// is a harmless no-op that still clears a stale process-table entry.
    async fn clear_stale_domain(&self, report: &mut PreflightReport) -> Result<(), PreflightError> {
        let state = self
            .hypervisor
            .domain_state(self.vm_name)
            .await
            .map_err(|e| self.fail(report, "stale-domain", e.to_string()))?;

        if state == DomainState::Running {
            Self::pass(report, "stale-domain", "domain already running, left untouched");
            return Ok(());
        }

        self.hypervisor
            .force_destroy(self.vm_name)
            .await
            .map_err(|e| self.fail(report, "stale-domain", e.to_string()))?;
        Self::pass(
            report,
            "stale-domain",
            format!("cleared domain in state `{state}`"),
        );
        Ok(())
    }

    fn sanitize_processes(&self, report: &mut PreflightReport) {
        let cleaned = self.sanitizer.cleanup();
        Self::pass(
            report,
            "sanitize",
            format!(
                "{} helper process(es) signalled, {} socket(s) removed",
                cleaned.processes_signalled, cleaned.sockets_removed
            ),
        );
    }

    /// Bring the GPU onto the bus and out of runtime suspend. A device that
    /// is absent and stays absent after a reset aborts preflight.
    async fn recover_device(&self, report: &mut PreflightReport) -> Result<(), PreflightError> {
        if !self.device.exists() {
            warn!(device = %self.device.base_function_address(), "device absent, attempting reset");
            self.device
                .reset()
                .await
                .map_err(|e| self.fail(report, "device-presence", e.to_string()))?;
            Self::pass(report, "device-presence", "device recovered by reset");
        } else {
            Self::pass(report, "device-presence", "device enumerated");
        }

        self.device
            .wake()
            .await
            .map_err(|e| self.fail(report, "device-wake", e.to_string()))?;
        Self::pass(report, "device-wake", "device awake");
        Ok(())
    }

    fn verify_binding(&self, report: &mut PreflightReport) -> Result<(), PreflightError> {
        match self.device.verify_binding() {
            Ok(()) => {
                Self::pass(report, "driver-binding", "all functions on the passthrough driver");
                Ok(())
            }
            Err(e) => Err(self.fail(report, "driver-binding", e.to_string())),
        }
    }

    /// Preferred path is the host bridge; a running default NAT network is
    /// an acceptable degraded mode; no network at all is only a warning —
    /// the guest may not need connectivity to be useful.
    async fn check_network(&self, report: &mut PreflightReport) {
        if self.net_root.join(self.bridge).is_dir() {
            Self::pass(report, "network", format!("bridge `{}` present", self.bridge));
            return;
        }

        match self.hypervisor.network_active(self.nat_network).await {
            Ok(true) => {
                Self::warn_step(
                    report,
                    "network",
                    format!(
                        "bridge `{}` absent, using NAT network `{}`",
                        self.bridge, self.nat_network
                    ),
                );
                return;
            }
            Ok(false) => {
                if self.hypervisor.start_network(self.nat_network).await.is_ok() {
                    Self::warn_step(
                        report,
                        "network",
                        format!("started inactive NAT network `{}`", self.nat_network),
                    );
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "NAT network query failed");
            }
        }

        Self::warn_step(
            report,
            "network",
            "no usable network path found, continuing without",
        );
    }

    fn ensure_shared_folder(&self, report: &mut PreflightReport) -> Result<(), PreflightError> {
        match self.paths.ensure_shared_folder() {
            Ok(()) => {
                Self::pass(
                    report,
                    "shared-folder",
                    format!("{} ready", self.paths.shared_folder.display()),
                );
                Ok(())
            }
            Err(e) => Err(self.fail(report, "shared-folder", e.to_string())),
        }
    }
}
