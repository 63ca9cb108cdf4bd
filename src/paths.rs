//! Runtime directory structure for vfiovm.
//!
//! Provides a single `RuntimePaths` struct that resolves the log, lock and
//! shared-folder directories from the loaded [`Config`](crate::Config) and
//! ensures they exist with fixed permissions. Created idempotently on every
//! invocation; the orchestrator never deletes any of them.
//!
//! - Log dir:        `/var/log/vfiovm/`  (operational log lives here)
//! - Lock dir:       `/run/vfiovm/lock/` (marks an orchestrator session)
//! - Shared folder:  `/srv/vm-share/`    (file-sharing export, plus subfolders)

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::config::Config;

/// Mode applied to the shared folder and its subfolders: group-writable with
/// setgid so files created by the sharing daemon inherit the group.
const SHARED_FOLDER_MODE: u32 = 0o2775;

/// Mode for the log and lock directories.
const RUNTIME_DIR_MODE: u32 = 0o755;

/// All resolved runtime directory paths.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    /// Operational log directory.
    pub log_dir: PathBuf,
    /// Lock directory marking an orchestrator-managed session.
    pub lock_dir: PathBuf,
    /// Helper-daemon control socket directory.
    pub socket_dir: PathBuf,
    /// File-sharing export root.
    pub shared_folder: PathBuf,
    /// Expected subfolders under `shared_folder`.
    pub shared_subfolders: Vec<String>,
}

impl RuntimePaths {
    /// Resolve all paths from the configuration. Does not create anything —
    /// call [`ensure_runtime_dirs`](Self::ensure_runtime_dirs) and
    /// [`ensure_shared_folder`](Self::ensure_shared_folder) for that.
    pub fn from_config(config: &Config) -> Self {
        Self {
            log_dir: config.log_dir.clone(),
            lock_dir: config.lock_dir.clone(),
            socket_dir: config.socket_dir.clone(),
            shared_folder: config.shared_folder.clone(),
            shared_subfolders: config.shared_subfolders.clone(),
        }
    }

    /// Create the log, lock and socket directories if missing.
    pub fn ensure_runtime_dirs(&self) -> std::io::Result<()> {
        for dir in [&self.log_dir, &self.lock_dir, &self.socket_dir] {
            std::fs::create_dir_all(dir)?;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(RUNTIME_DIR_MODE))?;
            debug!(dir = %dir.display(), "ensured runtime directory");
        }
        Ok(())
    }

    /// Create the shared folder and its expected subfolders if missing, with
    /// the fixed group-writable mode. Existing contents are left untouched.
    pub fn ensure_shared_folder(&self) -> std::io::Result<()> {
        let mode = std::fs::Permissions::from_mode(SHARED_FOLDER_MODE);

        let created = !self.shared_folder.is_dir();
        std::fs::create_dir_all(&self.shared_folder)?;
        std::fs::set_permissions(&self.shared_folder, mode.clone())?;
        if created {
            info!(dir = %self.shared_folder.display(), "created shared folder");
        }

        for sub in &self.shared_subfolders {
            let dir = self.shared_folder.join(sub);
            if !dir.is_dir() {
                std::fs::create_dir_all(&dir)?;
                std::fs::set_permissions(&dir, mode.clone())?;
                info!(dir = %dir.display(), "created shared subfolder");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths_in(tmp: &std::path::Path) -> RuntimePaths {
        RuntimePaths {
            log_dir: tmp.join("log"),
            lock_dir: tmp.join("lock"),
            socket_dir: tmp.join("run"),
            shared_folder: tmp.join("share"),
            shared_subfolders: vec!["shared".to_string(), "iso".to_string()],
        }
    }

    #[test]
    fn ensure_creates_runtime_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = paths_in(tmp.path());

        paths.ensure_runtime_dirs().expect("ensure should succeed");

        assert!(paths.log_dir.is_dir());
        assert!(paths.lock_dir.is_dir());
        assert!(paths.socket_dir.is_dir());
    }

    #[test]
    fn ensure_shared_folder_creates_subfolders_with_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = paths_in(tmp.path());

        paths.ensure_shared_folder().expect("ensure should succeed");

        assert!(paths.shared_folder.join("shared").is_dir());
        assert!(paths.shared_folder.join("iso").is_dir());

        let mode = std::fs::metadata(&paths.shared_folder)
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o7777, SHARED_FOLDER_MODE);
    }

    #[test]
    fn ensure_is_idempotent_and_preserves_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = paths_in(tmp.path());

        paths.ensure_shared_folder().unwrap();
        let marker = paths.shared_folder.join("shared").join("save.dat");
        std::fs::write(&marker, b"keep me").unwrap();

        paths.ensure_shared_folder().unwrap();
        assert_eq!(std::fs::read(&marker).unwrap(), b"keep me");
    }
}
