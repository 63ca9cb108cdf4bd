//! VM state machine: start with retry-and-recover, graceful-then-forced
//! stop, live status, and the health check.
//!
//! The start path is the one place in the orchestrator that retries: each
//! failed attempt runs the sanitizer and a best-effort device reset before
//! trying again, and the budget is fixed — exhausting it surfaces a
//! terminal [`StartError::RetriesExhausted`] to the operator instead of
//! looping forever.
//!
//! The health check deliberately does *not* recover one case: a GPU that
//! has vanished from the bus while the guest is still reported running. A
//! live guest is actively depending on that device; resetting it out from
//! underneath the guest risks corruption, so the policy is report, don't
//! act.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::device::{FunctionDriver, GpuDevice};
use crate::hypervisor::{DomainState, Hypervisor};
use crate::poll::poll_until;
use crate::preflight::{Preflight, PreflightError};
use crate::sanitize::Sanitizer;

/// Every fixed wait in the lifecycle, as named constants.
///
/// The defaults are hardware-tuned values carried over from operational
/// experience (consumer GPUs take seconds to settle after a rescan; Windows
/// guests take tens of seconds to accept a shutdown request). They are
/// overridable in code and tests, never from the CLI, so recovery behavior
/// stays predictable.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    /// Interval between state probes while waiting for boot.
    pub boot_poll_interval: Duration,
    /// Total budget for the domain to reach Running after a start call.
    pub boot_settle: Duration,
    /// Start attempts before giving up.
    pub max_start_attempts: u32,
    /// Pause between start attempts, after recovery actions.
    pub retry_delay: Duration,
    /// Interval between state probes while waiting for graceful shutdown.
    pub shutdown_poll_interval: Duration,
    /// Total graceful-shutdown budget before force-destroying.
    pub shutdown_timeout: Duration,
    /// Pause between the stop and start halves of a restart.
    pub restart_pause: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            boot_poll_interval: Duration::from_secs(5),
            boot_settle: Duration::from_secs(25),
            max_start_attempts: 3,
            retry_delay: Duration::from_secs(10),
            shutdown_poll_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(120),
            restart_pause: Duration::from_secs(5),
        }
    }
}

/// How a stop concluded. Forced termination is an outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The domain was already not running; cleanup still ran.
    AlreadyStopped,
    /// The guest shut down within the timeout.
    Graceful,
    /// The timeout elapsed and the domain was destroyed.
    Forced,
}

impl std::fmt::Display for StopOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AlreadyStopped => "already stopped",
            Self::Graceful => "graceful",
            Self::Forced => "forced",
        };
        f.write_str(s)
    }
}

/// Successful start, with the recovery work it took.
#[derive(Debug, Clone)]
pub struct StartReport {
    /// Start attempts used (0 when the domain was already running).
    pub attempts: u32,
    /// Sanitize-plus-reset recovery cycles run between attempts.
    pub recovery_cycles: u32,
    /// Guest address, when one was already assigned.
    pub address: Option<String>,
}

#[derive(Debug, Error)]
pub enum StartError {
    /// Every attempt in the budget failed. The one place this component
    /// gives up and surfaces to the operator.
    #[error("start failed after {attempts} attempt(s); last failure: {last_failure}")]
    RetriesExhausted { attempts: u32, last_failure: String },
}

#[derive(Debug, Error)]
pub enum HealthError {
    /// The GPU fell off the bus while the guest is running. Fatal and
    /// deliberately not auto-recovered.
    #[error("GPU {address} vanished while the domain is running; refusing automatic recovery")]
    DeviceVanished { address: String },

    #[error(transparent)]
    Preflight(#[from] PreflightError),

    #[error(transparent)]
    Start(#[from] StartError),

    #[error(transparent)]
    Query(#[from] anyhow::Error),
}

/// What the health check found (and possibly did).
#[derive(Debug, Clone)]
pub enum HealthReport {
    /// Running with the device present; nothing to do.
    Healthy { address: Option<String> },
    /// Was down; the full preflight-plus-start path brought it back.
    Restarted(StartReport),
}

/// Live snapshot for the `status` command. Always fetched fresh.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub vm_name: String,
    pub state: DomainState,
    pub address: Option<String>,
    pub device_present: bool,
    pub functions: Vec<FunctionDriver>,
    pub queried_at: DateTime<Utc>,
}

/// Drives the domain through its lifecycle. Borrows its collaborators and
/// holds no state between operations — every decision point re-queries.
pub struct Controller<'a, H: Hypervisor> {
    hypervisor: &'a H,
    device: &'a GpuDevice,
    sanitizer: &'a Sanitizer,
    vm_name: &'a str,
    timings: Timings,
}

impl<'a, H: Hypervisor> Controller<'a, H> {
    pub fn new(
        hypervisor: &'a H,
        device: &'a GpuDevice,
        sanitizer: &'a Sanitizer,
        vm_name: &'a str,
        timings: Timings,
    ) -> Self {
        Self {
            hypervisor,
            device,
            sanitizer,
            vm_name,
            timings,
        }
    }

    /// Wait (bounded) for the domain to reach `target`.
    async fn wait_for_state(
        &self,
        target: DomainState,
        interval: Duration,
        timeout: Duration,
    ) -> bool {
        let hypervisor = self.hypervisor;
        let name = self.vm_name;
        poll_until(interval, timeout, move || async move {
            match hypervisor.domain_state(name).await {
                Ok(state) if state == target => Some(()),
                _ => None,
            }
        })
        .await
        .is_ok()
    }

    async fn resolve_address(&self) -> Option<String> {
        match self.hypervisor.guest_address(self.vm_name).await {
            Ok(address) => address,
            Err(e) => {
                warn!(vm = %self.vm_name, error = %e, "address resolution failed");
                None
            }
        }
    }

    /// Start the domain, recovering between attempts.
    ///
    /// Precondition: preflight passed. Issues at most
    /// `max_start_attempts` hypervisor start calls. Each failure (start
    /// refusal or the domain not reaching Running within the boot budget)
    /// triggers one recovery cycle — sanitizer cleanup plus a best-effort
    /// device reset — before the next attempt.
    pub async fn start(&self) -> Result<StartReport, StartError> {
        if let Ok(DomainState::Running) = self.hypervisor.domain_state(self.vm_name).await {
            let address = self.resolve_address().await;
            info!(vm = %self.vm_name, "domain already running");
            return Ok(StartReport {
                attempts: 0,
                recovery_cycles: 0,
                address,
            });
        }

        let mut recovery_cycles = 0;
        let mut last_failure = String::new();

        for attempt in 1..=self.timings.max_start_attempts {
            info!(vm = %self.vm_name, attempt, "starting domain");

            let failure = match self.hypervisor.start_domain(self.vm_name).await {
                Err(e) => format!("start command failed: {e:#}"),
                Ok(()) => {
                    if self
                        .wait_for_state(
                            DomainState::Running,
                            self.timings.boot_poll_interval,
                            self.timings.boot_settle,
                        )
                        .await
                    {
                        let address = self.resolve_address().await;
                        info!(
                            vm = %self.vm_name,
                            attempt,
                            recovery_cycles,
                            address = address.as_deref().unwrap_or("unresolved"),
                            "domain running"
                        );
                        return Ok(StartReport {
                            attempts: attempt,
                            recovery_cycles,
                            address,
                        });
                    }
                    format!(
                        "domain not running {:?} after start",
                        self.timings.boot_settle
                    )
                }
            };

            warn!(vm = %self.vm_name, attempt, %failure, "start attempt failed, recovering");
            last_failure = failure;

            self.sanitizer.cleanup();
            if let Err(e) = self.device.reset().await {
                // Reset failure does not abort the loop; the next attempt
                // may still succeed if the device reappears on its own.
                warn!(error = %e, "device reset during recovery failed");
            }
            recovery_cycles += 1;

            if attempt < self.timings.max_start_attempts {
                tokio::time::sleep(self.timings.retry_delay).await;
            }
        }

        error!(
            vm = %self.vm_name,
            attempts = self.timings.max_start_attempts,
            %last_failure,
            "start budget exhausted"
        );
        Err(StartError::RetriesExhausted {
            attempts: self.timings.max_start_attempts,
            last_failure,
        })
    }

    /// Stop the domain: graceful request, bounded wait, forced fallback.
    /// Idempotent — stopping an already-stopped domain is a success that
    /// still runs cleanup.
    pub async fn stop(&self) -> Result<StopOutcome> {
        let state = self.hypervisor.domain_state(self.vm_name).await?;
        if state != DomainState::Running {
            info!(vm = %self.vm_name, %state, "domain not running, cleanup only");
            self.sanitizer.cleanup();
            return Ok(StopOutcome::AlreadyStopped);
        }

        if let Err(e) = self.hypervisor.graceful_shutdown(self.vm_name).await {
            // The guest may be wedged and ignoring ACPI; the bounded wait
            // below will time out and fall through to destroy.
            warn!(vm = %self.vm_name, error = %e, "graceful shutdown request failed");
        }

        if self
            .wait_for_state(
                DomainState::ShutOff,
                self.timings.shutdown_poll_interval,
                self.timings.shutdown_timeout,
            )
            .await
        {
            info!(vm = %self.vm_name, "domain shut down gracefully");
            self.sanitizer.cleanup();
            return Ok(StopOutcome::Graceful);
        }

        warn!(
            vm = %self.vm_name,
            timeout = ?self.timings.shutdown_timeout,
            "graceful shutdown timed out, destroying domain"
        );
        self.hypervisor.force_destroy(self.vm_name).await?;
        self.sanitizer.cleanup();
        Ok(StopOutcome::Forced)
    }

    /// Pure, side-effect-free snapshot of domain and device state.
    pub async fn status(&self) -> Result<StatusSnapshot> {
        let state = self.hypervisor.domain_state(self.vm_name).await?;
        let address = if state == DomainState::Running {
            self.resolve_address().await
        } else {
            None
        };

        Ok(StatusSnapshot {
            vm_name: self.vm_name.to_string(),
            state,
            address,
            device_present: self.device.exists(),
            functions: self.device.driver_report(),
            queried_at: Utc::now(),
        })
    }

    /// Health check: restart a down VM, leave a healthy one alone, and
    /// refuse to touch a running VM whose GPU has vanished.
    pub async fn health(
        &self,
        preflight: &Preflight<'_, H>,
    ) -> Result<HealthReport, HealthError> {
        let state = self
            .hypervisor
            .domain_state(self.vm_name)
            .await
            .map_err(HealthError::Query)?;

        if state == DomainState::Running {
            if !self.device.exists() {
                error!(
                    vm = %self.vm_name,
                    device = %self.device.base_function_address(),
                    "device vanished under a running guest"
                );
                return Err(HealthError::DeviceVanished {
                    address: self.device.base_function_address(),
                });
            }
            let address = self.resolve_address().await;
            info!(vm = %self.vm_name, "healthy");
            return Ok(HealthReport::Healthy { address });
        }

        info!(vm = %self.vm_name, %state, "domain down, running full start path");
        preflight.run().await?;
        let report = self.start().await?;
        Ok(HealthReport::Restarted(report))
    }
}
