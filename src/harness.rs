//! Provision-use-release lifecycle around the embedded cluster.
//!
//! A [`Silo`] owns one provisioned cluster: the directory tree, the lock,
//! and the running [`MiniCluster`]. Explicit [`release`](Silo::release)
//! reports teardown problems; dropping an unreleased silo runs the same
//! teardown best-effort, so a panicking test or an early `?` cannot leak a
//! live cluster or a held lock. [`scoped`] packages the whole cycle.

use std::fs;
use std::io;
use std::path::Path;

use tracing::{info, warn};

use crate::cluster::MiniCluster;
use crate::config::ClusterConfig;
use crate::error::HarnessError;
use crate::fs::{ClusterFs, LocalFs};

/// A provisioned single-node cluster and its on-disk tree.
pub struct Silo {
    config: ClusterConfig,
    cluster: MiniCluster,
    fs: ClusterFs,
    local: LocalFs,
    released: bool,
}

impl Silo {
    /// Provision a cluster against `config`: take the base dir lock, lay
    /// out fresh directories, start the service, and wait until its health
    /// endpoint answers.
    ///
    /// On any failure the lock is dropped and partially created state is
    /// cleaned up before the error is returned, so a failed provision
    /// leaves the base dir reusable.
    pub fn provision(config: ClusterConfig) -> Result<Self, HarnessError> {
        config.acquire()?;
        let cluster = match MiniCluster::start(&config) {
            Ok(cluster) => cluster,
            Err(e) => {
                wipe_tree(&config).ok();
                config.release_lock();
                return Err(e);
            }
        };
        if let Err(e) = cluster.await_ready(config.startup_timeout) {
            drop(cluster);
            wipe_tree(&config).ok();
            config.release_lock();
            return Err(e);
        }
        let fs = ClusterFs::new(config.namespace_dir());
        info!(base = %config.base_dir().display(), "silo provisioned");
        Ok(Self { config, cluster, fs, local: LocalFs, released: false })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn cluster(&self) -> &MiniCluster {
        &self.cluster
    }

    /// The cluster file namespace.
    pub fn fs(&self) -> &ClusterFs {
        &self.fs
    }

    /// The local side of staging transfers.
    pub fn local(&self) -> &LocalFs {
        &self.local
    }

    /// Tear the cluster down and remove everything provisioning created.
    ///
    /// The service stops first, then the directory tree goes, then the
    /// lock. The base dir itself is left in place for its owner.
    pub fn release(mut self) -> Result<(), HarnessError> {
        self.released = true;
        self.cluster.shutdown();
        let wiped = wipe_tree(&self.config);
        self.config.release_lock();
        info!(base = %self.config.base_dir().display(), "silo released");
        wiped
    }
}

impl Drop for Silo {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.cluster.shutdown();
        if let Err(e) = wipe_tree(&self.config) {
            warn!(error = %e, "drop-time teardown left files behind");
        }
        self.config.release_lock();
    }
}

fn wipe_tree(config: &ClusterConfig) -> Result<(), HarnessError> {
    let mut dirs = vec![config.name_dir(), config.namespace_dir()];
    dirs.extend(config.work_dirs());
    let mut first_failure: Option<HarnessError> = None;
    for dir in dirs {
        if let Err(e) = remove_tree(&dir)
            && first_failure.is_none()
        {
            first_failure =
                Some(HarnessError::teardown(format!("remove {}", dir.display()), e));
        }
    }
    match first_failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn remove_tree(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Provision, run `f` against the live silo, release.
///
/// Release always runs, even when `f` fails. A job error takes precedence
/// over a release error; a release error after a successful job surfaces as
/// the result.
pub fn scoped<T, E, F>(config: ClusterConfig, f: F) -> Result<T, E>
where
    E: From<HarnessError>,
    F: FnOnce(&Silo) -> Result<T, E>,
{
    let silo = Silo::provision(config)?;
    let outcome = f(&silo);
    match (outcome, silo.release()) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(release_err)) => Err(E::from(release_err)),
        (Err(job_err), release) => {
            if let Err(release_err) = release {
                warn!(error = %release_err, "release failed after job error");
            }
            Err(job_err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provision_lays_out_the_tree() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let silo = Silo::provision(ClusterConfig::new(tmp.path()))?;
        assert!(silo.config().name_dir().join("VERSION").is_file());
        for dir in silo.config().work_dirs() {
            assert!(dir.is_dir(), "missing {}", dir.display());
        }
        silo.release()?;
        Ok(())
    }

    #[test]
    fn release_leaves_only_the_base_dir() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let silo = Silo::provision(ClusterConfig::new(tmp.path()))?;
        silo.release()?;
        let leftovers: Vec<_> = fs::read_dir(tmp.path())?.collect();
        assert!(leftovers.is_empty(), "leftovers: {leftovers:?}");
        Ok(())
    }

    #[test]
    fn failed_provision_leaves_the_base_reusable() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let base = tmp.path().join("base");
        // A plain file where the base dir should go blocks provisioning.
        fs::write(&base, "not a directory")?;

        let config = ClusterConfig::new(&base);
        let refused = match Silo::provision(config.clone()) {
            Ok(_) => panic!("provisioning into a file should fail"),
            Err(e) => e,
        };
        assert!(matches!(refused, HarnessError::Provision { .. }));
        assert!(!base.join("silo.lock").exists());

        // Once the obstacle is gone the same config provisions cleanly.
        fs::remove_file(&base)?;
        let silo = Silo::provision(config)?;
        silo.cluster().ping()?;
        silo.release()?;
        assert_eq!(fs::read_dir(&base)?.count(), 0);
        Ok(())
    }

    #[test]
    fn drop_backstop_frees_the_base_dir() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        {
            let _silo = Silo::provision(ClusterConfig::new(tmp.path()))?;
        }
        // The lock is gone, so a second provision of the same base succeeds.
        Silo::provision(ClusterConfig::new(tmp.path()))?.release()?;
        Ok(())
    }

    #[test]
    fn scoped_releases_after_a_job_error() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let result: Result<(), HarnessError> =
            scoped(ClusterConfig::new(tmp.path()), |_silo| {
                Err(HarnessError::provision_bare("job blew up"))
            });
        assert!(result.is_err());
        assert!(!tmp.path().join("silo.lock").exists());
        Ok(())
    }
}
