//! Stale helper-process and socket cleanup.
//!
//! A crashed or interrupted VM session leaves two kinds of debris behind:
//! helper processes (the user-space file-sharing daemon, QEMU stragglers
//! referencing the domain) and their control sockets. Either blocks a clean
//! restart. Cleanup is unconditional, best-effort and idempotent — running
//! it with nothing to clean is the common case and is free.

use std::path::PathBuf;

use sysinfo::{Signal, System};
use tracing::{debug, info, warn};

/// Result of one cleanup pass, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Helper processes that were sent a termination signal.
    pub processes_signalled: usize,
    /// Leftover control sockets removed.
    pub sockets_removed: usize,
}

/// Terminates leftover helper processes and removes stale sockets for one
/// VM session.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    vm_name: String,
    helper_daemon: String,
    socket_dir: PathBuf,
}

impl Sanitizer {
    pub fn new(vm_name: impl Into<String>, helper_daemon: impl Into<String>, socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            vm_name: vm_name.into(),
            helper_daemon: helper_daemon.into(),
            socket_dir: socket_dir.into(),
        }
    }

    /// Kill helper processes referencing the VM, then unlink their sockets.
    ///
    /// Never fails: every individual miss is logged and skipped. Safe to call
    /// with no prior session and safe to call repeatedly.
    pub fn cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        report.processes_signalled = self.kill_helpers();
        report.sockets_removed = self.remove_stale_sockets();

        if report == CleanupReport::default() {
            debug!(vm = %self.vm_name, "nothing to sanitize");
        } else {
            info!(
                vm = %self.vm_name,
                processes = report.processes_signalled,
                sockets = report.sockets_removed,
                "sanitized stale session state"
            );
        }
        report
    }

    /// SIGTERM every process whose command line references the VM name or
    /// the file-sharing daemon binary. The orchestrator's own process is
    /// skipped (its command line contains the VM name too).
    fn kill_helpers(&self) -> usize {
        let mut system = System::new();
        system.refresh_processes();

        let own_pid = std::process::id();
        let mut signalled = 0;

        for (pid, process) in system.processes() {
            if pid.as_u32() == own_pid {
                continue;
            }

            // Helpers are identified by command line, same as `pkill -f`:
            // either the daemon binary or anything referencing the domain.
            let cmdline = process.cmd().join(" ");
            let matches_daemon =
                process.name() == self.helper_daemon || cmdline.contains(&self.helper_daemon);
            let matches_vm = cmdline.contains(&self.vm_name);

            if !matches_daemon && !matches_vm {
                continue;
            }

            let sent = process
                .kill_with(Signal::Term)
                .unwrap_or_else(|| process.kill());
            if sent {
                info!(pid = pid.as_u32(), name = %process.name(), "terminated stale helper");
                signalled += 1;
            } else {
                warn!(pid = pid.as_u32(), name = %process.name(), "could not signal helper");
            }
        }
        signalled
    }

    /// Unlink leftover `*.sock` files referencing this VM in the socket
    /// directory. A missing directory means nothing to do.
    fn remove_stale_sockets(&self) -> usize {
        let entries = match std::fs::read_dir(&self.socket_dir) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".sock") || !name.contains(&self.vm_name) {
                continue;
            }

            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    info!(socket = %entry.path().display(), "removed stale control socket");
                    removed += 1;
                }
                Err(e) => {
                    warn!(socket = %entry.path().display(), error = %e, "socket removal failed");
                }
            }
        }
        removed
    }
}
