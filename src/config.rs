//! Isolated configuration for one embedded cluster.
//!
//! Reproducibility rule: every configurable path lives under a single
//! disposable base directory, and nothing is ever read from the environment
//! or from system-wide configuration. A leftover base dir from a crashed run
//! cannot influence a new one (provisioning wipes and recreates each
//! subdirectory), and two live harnesses can never share a base dir (a lock
//! file enforces it).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::HarnessError;

const NAME_DIR: &str = "name";
const NAMESPACE_DIR: &str = "fs";
const WORK_DIRS: [&str; 4] = ["work-local", "work-system", "work-staging", "work-temp"];
const LOCK_FILE: &str = "silo.lock";

const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Fully isolated configuration for one embedded cluster.
///
/// Construction is pure; directories are created when a
/// [`Silo`](crate::harness::Silo) provisions against the config.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    base_dir: PathBuf,
    /// Bind the health endpoint on IPv4 loopback. IPv6 loopback otherwise.
    /// Explicit here rather than a process-wide toggle so concurrent
    /// harnesses can disagree.
    pub prefer_ipv4: bool,
    /// How long provisioning waits for the cluster to answer its health
    /// endpoint before failing.
    pub startup_timeout: Duration,
}

impl ClusterConfig {
    /// Configuration rooted at `base_dir` with default toggles
    /// (IPv4 loopback, 10 s startup timeout).
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            prefer_ipv4: true,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Cluster metadata directory (holds the `VERSION` file).
    pub fn name_dir(&self) -> PathBuf {
        self.base_dir.join(NAME_DIR)
    }

    /// Root of the cluster file namespace.
    pub fn namespace_dir(&self) -> PathBuf {
        self.base_dir.join(NAMESPACE_DIR)
    }

    /// Local-execution scratch directories.
    pub fn work_dirs(&self) -> Vec<PathBuf> {
        WORK_DIRS.iter().map(|d| self.base_dir.join(d)).collect()
    }

    fn lock_path(&self) -> PathBuf {
        self.base_dir.join(LOCK_FILE)
    }

    /// Take ownership of the base directory and lay out a fresh tree under
    /// it: lock file first, then every subdirectory wiped and recreated.
    ///
    /// Fails with [`HarnessError::Provision`] if the lock is already held
    /// (another live harness, or a crashed one; base dirs are disposable,
    /// pick a new one) or if any subdirectory cannot be created.
    pub(crate) fn acquire(&self) -> Result<(), HarnessError> {
        fs::create_dir_all(&self.base_dir).map_err(|e| {
            HarnessError::provision(
                format!("create base dir {}", self.base_dir.display()),
                e,
            )
        })?;
        let lock = self.lock_path();
        match fs::OpenOptions::new().write(true).create_new(true).open(&lock) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(HarnessError::provision_bare(format!(
                    "base dir {} is already owned by another harness (lock file present)",
                    self.base_dir.display()
                )));
            }
            Err(e) => {
                return Err(HarnessError::provision(
                    format!("create lock file {}", lock.display()),
                    e,
                ));
            }
        }

        let mut dirs = vec![self.name_dir(), self.namespace_dir()];
        dirs.extend(self.work_dirs());
        for dir in dirs {
            if let Err(e) = recreate_dir(&dir) {
                // Failed half-way: give the base dir back before reporting.
                self.release_lock();
                return Err(HarnessError::provision(
                    format!("create {}", dir.display()),
                    e,
                ));
            }
        }
        Ok(())
    }

    /// Drop the ownership lock. Safe to call at any point after `acquire`,
    /// including after a failed one.
    pub(crate) fn release_lock(&self) {
        let _ = fs::remove_file(self.lock_path());
    }
}

fn recreate_dir(dir: &Path) -> io::Result<()> {
    if dir.symlink_metadata().is_ok() {
        if dir.is_dir() {
            fs::remove_dir_all(dir)?;
        } else {
            fs::remove_file(dir)?;
        }
    }
    fs::create_dir_all(dir)
}

/// Cluster-namespace staging directories for one job run.
///
/// Both directories are cleared (deleted if present, then recreated) by the
/// stager before each run, so re-running a job against the same silo is
/// idempotent.
#[derive(Debug, Clone)]
pub struct StagingPaths {
    /// Namespace directory inputs are copied into.
    pub input: String,
    /// Namespace directory the job writes its part files to.
    pub output: String,
}

impl StagingPaths {
    /// The conventional `<job>/input` and `<job>/output` pair.
    pub fn for_job(name: &str) -> Self {
        Self {
            input: format!("{name}/input"),
            output: format!("{name}/output"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_paths_follow_the_job_name() {
        let staging = StagingPaths::for_job("peopleinyear");
        assert_eq!(staging.input, "peopleinyear/input");
        assert_eq!(staging.output, "peopleinyear/output");
    }

    #[test]
    fn acquire_is_exclusive_per_base_dir() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let config = ClusterConfig::new(tmp.path());
        config.acquire()?;
        let second = ClusterConfig::new(tmp.path());
        assert!(matches!(
            second.acquire(),
            Err(HarnessError::Provision { .. })
        ));
        config.release_lock();
        // Released: the same base dir can be owned again.
        second.acquire()?;
        second.release_lock();
        Ok(())
    }

    #[test]
    fn acquire_wipes_stale_subdirectories() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let config = ClusterConfig::new(tmp.path());
        fs::create_dir_all(config.namespace_dir().join("stale/run"))?;
        config.acquire()?;
        assert!(config.namespace_dir().is_dir());
        assert!(!config.namespace_dir().join("stale").exists());
        config.release_lock();
        Ok(())
    }
}
