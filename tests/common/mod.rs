//! Shared test support: a scripted hypervisor and a fake sysfs bus.
//!
//! `MockHypervisor` plays back a scripted sequence of domain states and
//! start outcomes while recording every control call, so scenario tests can
//! assert not just the result of an operation but exactly which hypervisor
//! actions it took (and did not take).

// Not every test binary uses every helper here.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};

use vfiovm::config::DeviceConfig;
use vfiovm::controller::Timings;
use vfiovm::device::ResetSettle;
use vfiovm::hypervisor::{DomainState, Hypervisor};

/// A hypervisor control call, as recorded by [`MockHypervisor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Start,
    Shutdown,
    Destroy,
    Resume,
    StartNetwork,
}

/// Scripted [`Hypervisor`] for scenario tests.
///
/// State queries pop from a queue; once the queue is empty the fallback
/// state repeats. A successful start flips the fallback to `Running` and a
/// destroy flips it to `ShutOff`, mirroring what a real hypervisor would
/// report afterwards.
pub struct MockHypervisor {
    states: Mutex<VecDeque<DomainState>>,
    fallback: Mutex<DomainState>,
    start_failures: Mutex<VecDeque<String>>,
    pub calls: Mutex<Vec<Call>>,
    pub nat_active: bool,
    pub address: Option<String>,
}

impl MockHypervisor {
    pub fn with_states(states: &[DomainState]) -> Self {
        let fallback = *states.last().expect("at least one scripted state");
        Self {
            states: Mutex::new(states.iter().copied().collect()),
            fallback: Mutex::new(fallback),
            start_failures: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            nat_active: true,
            address: None,
        }
    }

    /// Queue `n` start failures; further starts succeed.
    pub fn failing_starts(self, n: usize) -> Self {
        let mut failures = VecDeque::new();
        for i in 0..n {
            failures.push_back(format!("scripted start failure #{}", i + 1));
        }
        *self.start_failures.lock().unwrap() = failures;
        self
    }

    pub fn with_address(mut self, address: &str) -> Self {
        self.address = Some(address.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: Call) -> usize {
        self.calls().iter().filter(|&&c| c == call).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Hypervisor for MockHypervisor {
    async fn domain_state(&self, _name: &str) -> Result<DomainState> {
        let next = self.states.lock().unwrap().pop_front();
        Ok(next.unwrap_or(*self.fallback.lock().unwrap()))
    }

    async fn start_domain(&self, _name: &str) -> Result<()> {
        self.record(Call::Start);
        match self.start_failures.lock().unwrap().pop_front() {
            Some(msg) => Err(anyhow!(msg)),
            None => {
                *self.fallback.lock().unwrap() = DomainState::Running;
                Ok(())
            }
        }
    }

    async fn graceful_shutdown(&self, _name: &str) -> Result<()> {
        self.record(Call::Shutdown);
        Ok(())
    }

    async fn force_destroy(&self, _name: &str) -> Result<()> {
        self.record(Call::Destroy);
        *self.fallback.lock().unwrap() = DomainState::ShutOff;
        Ok(())
    }

    async fn resume(&self, _name: &str) -> Result<()> {
        self.record(Call::Resume);
        Ok(())
    }

    async fn guest_address(&self, _name: &str) -> Result<Option<String>> {
        Ok(self.address.clone())
    }

    async fn network_active(&self, _network: &str) -> Result<bool> {
        Ok(self.nat_active)
    }

    async fn start_network(&self, _network: &str) -> Result<()> {
        self.record(Call::StartNetwork);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fake sysfs bus
// ---------------------------------------------------------------------------

/// Build a fake PCI bus tree under `root`: a `devices/<addr>` directory per
/// function, each with a `driver` symlink and a `power/` subtree, plus an
/// empty `rescan` file at the bus root.
pub fn fake_bus(root: &Path, base: &str, bindings: &[(&str, &str)]) {
    let drivers = root.join("drivers");
    fs::create_dir_all(&drivers).unwrap();
    fs::write(root.join("rescan"), "").unwrap();

    for (function, driver) in bindings {
        let dev = root.join("devices").join(format!("{base}.{function}"));
        fs::create_dir_all(dev.join("power")).unwrap();
        fs::write(dev.join("power").join("control"), "auto").unwrap();
        fs::write(dev.join("power_state"), "D0").unwrap();
        fs::write(dev.join("remove"), "").unwrap();

        let driver_dir = drivers.join(driver);
        fs::create_dir_all(&driver_dir).unwrap();
        std::os::unix::fs::symlink(&driver_dir, dev.join("driver")).unwrap();
    }
}

/// Timings shrunk to milliseconds so scenario tests finish instantly.
pub fn fast_timings() -> Timings {
    Timings {
        boot_poll_interval: Duration::from_millis(1),
        boot_settle: Duration::from_millis(10),
        max_start_attempts: 3,
        retry_delay: Duration::from_millis(1),
        shutdown_poll_interval: Duration::from_millis(1),
        shutdown_timeout: Duration::from_millis(25),
        restart_pause: Duration::from_millis(1),
    }
}

/// Settle times shrunk to microseconds for the fake bus.
pub fn fast_settle() -> ResetSettle {
    ResetSettle {
        after_remove: Duration::from_micros(100),
        after_rescan: Duration::from_micros(100),
    }
}

/// Device config pointing at the standard two-function test GPU.
pub fn test_device_config() -> DeviceConfig {
    DeviceConfig {
        base_address: "0000:01:00".to_string(),
        functions: vec!["0".to_string(), "1".to_string()],
        required_driver: "vfio-pci".to_string(),
    }
}
