//! vfiovm: GPU-passthrough VM lifecycle orchestrator.
//!
//! Thin CLI over the library. Each subcommand wires up the same set of
//! collaborators (virsh hypervisor, sysfs GPU device, process sanitizer,
//! state controller) and maps one library operation to an exit code.
//! Operational detail goes to the tracing log; the final line on stdout is
//! the human-facing verdict.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use vfiovm::config::Config;
use vfiovm::controller::{Controller, HealthReport, StopOutcome, Timings};
use vfiovm::device::GpuDevice;
use vfiovm::hypervisor::Virsh;
use vfiovm::paths::RuntimePaths;
use vfiovm::preflight::Preflight;
use vfiovm::sanitize::Sanitizer;

/// GPU-passthrough VM lifecycle orchestrator
#[derive(Parser, Debug)]
#[command(name = "vfiovm", version, about = "GPU-passthrough VM lifecycle orchestrator")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full preflight, then bring the VM to running
    Start,
    /// Shut the VM down gracefully, destroying it after the timeout
    Stop,
    /// Stop, settle, re-run preflight, start
    Restart,
    /// Report domain, guest address, and device driver state
    Status {
        /// Emit the snapshot as JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Restart the VM if it is down; leave a healthy one alone
    Health,
    /// Run the preflight checks and report, without starting the VM
    Preflight,
    /// Force a remove/rescan cycle on the GPU
    ResetDevice,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    // sysfs writes, virsh control, and signalling other users' processes
    // all need root; refuse before touching anything.
    if !nix::unistd::Uid::effective().is_root() {
        bail!("vfiovm must run as root (it writes to sysfs and controls libvirt)");
    }

    let config = Config::load(cli.config.as_deref())?;
    let paths = RuntimePaths::from_config(&config);
    let _log_guard = vfiovm::logging::init(&paths.log_dir);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        vm = %config.vm_name,
        command = ?cli.command,
        "vfiovm invoked"
    );

    paths
        .ensure_runtime_dirs()
        .context("creating runtime directories")?;

    let hypervisor = Virsh::default();
    let device = GpuDevice::from_config(&config.device);
    let sanitizer = Sanitizer::new(&config.vm_name, &config.helper_daemon, &config.socket_dir);
    let timings = Timings::default();
    let controller = Controller::new(&hypervisor, &device, &sanitizer, &config.vm_name, timings);
    let preflight = Preflight::new(&hypervisor, &device, &sanitizer, &paths, &config);

    match cli.command {
        Command::Start => {
            preflight.run().await?;
            let report = controller.start().await?;
            println!(
                "{} running (attempts: {}, address: {})",
                config.vm_name,
                report.attempts,
                report.address.as_deref().unwrap_or("not yet assigned")
            );
        }

        Command::Stop => {
            let outcome = controller.stop().await?;
            println!("{} stopped ({outcome})", config.vm_name);
        }

        Command::Restart => {
            let outcome = controller.stop().await?;
            if outcome != StopOutcome::AlreadyStopped {
                tokio::time::sleep(timings.restart_pause).await;
            }
            preflight.run().await?;
            let report = controller.start().await?;
            println!(
                "{} restarted (address: {})",
                config.vm_name,
                report.address.as_deref().unwrap_or("not yet assigned")
            );
        }

        Command::Status { json } => {
            let snapshot = controller.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                println!("domain:  {} ({})", snapshot.vm_name, snapshot.state);
                println!(
                    "address: {}",
                    snapshot.address.as_deref().unwrap_or("none")
                );
                println!(
                    "device:  {}",
                    if snapshot.device_present { "present" } else { "MISSING" }
                );
                for function in &snapshot.functions {
                    println!(
                        "  {} -> {}",
                        function.address,
                        function.driver.as_deref().unwrap_or("no driver")
                    );
                }
            }
        }

        Command::Health => match controller.health(&preflight).await? {
            HealthReport::Healthy { address } => {
                println!(
                    "{} healthy (address: {})",
                    config.vm_name,
                    address.as_deref().unwrap_or("not yet assigned")
                );
            }
            HealthReport::Restarted(report) => {
                println!(
                    "{} was down, restarted (attempts: {}, recovery cycles: {})",
                    config.vm_name, report.attempts, report.recovery_cycles
                );
            }
        },

        Command::Preflight => {
            let report = preflight.run().await?;
            for step in &report.steps {
                println!("[{}] {}: {}", step.status, step.step, step.detail);
            }
            println!("preflight passed ({} steps)", report.steps.len());
        }

        Command::ResetDevice => {
            device.reset().await?;
            println!("device {} reset", device.base_function_address());
            // Binding state is reported, not enforced; a reset is useful
            // even while the host is still configured for another driver.
            for function in device.driver_report() {
                println!(
                    "  {} -> {}",
                    function.address,
                    function.driver.as_deref().unwrap_or("no driver")
                );
            }
        }
    }

    Ok(())
}
