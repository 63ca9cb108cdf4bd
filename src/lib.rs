//! vfiovm: GPU-passthrough VM lifecycle orchestrator.
//!
//! Brings a libvirt-managed VM with a passthrough GPU into a running state,
//! tears it down safely, and repairs the hardware/process failure modes that
//! a GPU shared between host and guest accumulates across power transitions:
//! a device asleep in D3cold, a device that fell off the bus, a function
//! bound to the wrong driver, and stale helper daemons/sockets from a
//! previous session.
//!
//! ## Architecture
//!
//! ```text
//! main (dispatcher)
//!     ├─► preflight::Preflight ──► device::GpuDevice     (sysfs)
//!     │                        ──► sanitize::Sanitizer   (processes, sockets)
//!     │                        ──► hypervisor::Hypervisor (virsh)
//!     └─► controller::Controller ─► start / stop / status / health
//! ```
//!
//! Every command re-derives all state from the live system; nothing is
//! cached between invocations. The only persistent resource is the
//! append-only operational log.

pub mod config;
pub mod controller;
pub mod device;
pub mod hypervisor;
pub mod logging;
pub mod paths;
pub mod poll;
pub mod preflight;
pub mod sanitize;

pub use config::Config;
pub use controller::{Controller, HealthError, HealthReport, StartError, StartReport, StopOutcome, Timings};
pub use device::{DeviceError, FunctionDriver, GpuDevice};
pub use hypervisor::{DomainState, Hypervisor, Virsh};
pub use preflight::{Preflight, PreflightError};
pub use sanitize::Sanitizer;
