//! Data staging between the local filesystem and the cluster namespace.
//!
//! Stage-in clears both staging directories and copies the job inputs into
//! `<job>/input`, so a re-run against the same silo starts from a clean
//! slate. Stage-out is a move: the local destination is recreated empty,
//! then part files are copied into it and deleted from the namespace,
//! leaving the cluster output directory empty.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::StagingPaths;
use crate::error::{HarnessError, StageDirection};
use crate::harness::Silo;

/// What a stage-in transferred. Directory inputs count every plain file
/// in their tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageInReport {
    pub files: usize,
    pub bytes: u64,
}

/// Copy local inputs into the job's staging input directory.
///
/// Both staging directories are deleted and recreated first. Inputs may be
/// plain files or directories; a directory is copied recursively under its
/// own name. A missing input fails the whole stage-in with
/// [`HarnessError::Stage`] and direction `in`.
pub fn stage_in(
    silo: &Silo,
    inputs: &[PathBuf],
    staging: &StagingPaths,
) -> Result<StageInReport, HarnessError> {
    let fs = silo.fs();
    for dir in [&staging.input, &staging.output] {
        fs.delete(dir)
            .and_then(|_| fs.mkdirs(dir))
            .map_err(|e| stage_in_err(Path::new(dir), e))?;
    }

    let mut report = StageInReport { files: 0, bytes: 0 };
    for input in inputs {
        let moved = fs
            .copy_from_local(input, &staging.input)
            .map_err(|e| stage_in_err(input, e))?;
        report.files += moved.files;
        report.bytes += moved.bytes;
    }
    debug!(files = report.files, bytes = report.bytes, dir = %staging.input, "stage-in complete");
    Ok(report)
}

/// Real paths of the files currently staged in the job's input directory,
/// sorted by name. This is what a batch job should be pointed at after
/// [`stage_in`].
pub fn staged_inputs(silo: &Silo, staging: &StagingPaths) -> Result<Vec<PathBuf>, HarnessError> {
    let fs = silo.fs();
    let listed = fs
        .list_files(&staging.input)
        .map_err(|e| stage_in_err(Path::new(&staging.input), e))?;
    let mut staged = Vec::with_capacity(listed.len());
    for status in listed {
        let real = fs
            .resolve(&format!("{}/{}", staging.input, status.name))
            .map_err(|e| stage_in_err(Path::new(&staging.input), e))?;
        staged.push(real);
    }
    Ok(staged)
}

/// Move the job's staged output files to a local directory.
///
/// `dest` is deleted if present and recreated, so stale results from an
/// earlier run cannot mix with this one. Every plain file under the
/// staging output directory is then copied into `dest` and removed from
/// the namespace. Returns the local paths written, sorted by name.
pub fn stage_out(
    silo: &Silo,
    staging: &StagingPaths,
    dest: &Path,
) -> Result<Vec<PathBuf>, HarnessError> {
    silo.local().recreate_dir(dest).map_err(|e| stage_out_err(dest, e))?;

    let cluster_fs = silo.fs();
    let listed = cluster_fs
        .list_files(&staging.output)
        .map_err(|e| stage_out_err(Path::new(&staging.output), e))?;

    let mut moved = Vec::with_capacity(listed.len());
    for status in listed {
        let src = cluster_fs
            .resolve(&format!("{}/{}", staging.output, status.name))
            .map_err(|e| stage_out_err(Path::new(&staging.output), e))?;
        let dst = dest.join(&status.name);
        fs::copy(&src, &dst).map_err(|e| stage_out_err(&dst, e))?;
        fs::remove_file(&src).map_err(|e| stage_out_err(&src, e))?;
        moved.push(dst);
    }
    debug!(files = moved.len(), dest = %dest.display(), "stage-out complete");
    Ok(moved)
}

fn stage_in_err(path: &Path, source: io::Error) -> HarnessError {
    HarnessError::stage(StageDirection::In, path, source)
}

fn stage_out_err(path: &Path, source: io::Error) -> HarnessError {
    HarnessError::stage(StageDirection::Out, path, source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;

    #[test]
    fn missing_input_fails_with_stage_in() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let silo = Silo::provision(ClusterConfig::new(tmp.path().join("base")))?;
        let staging = StagingPaths::for_job("job");
        let missing = tmp.path().join("nope.csv");
        let err = stage_in(&silo, &[missing.clone()], &staging).unwrap_err();
        match err {
            HarnessError::Stage { direction, path, .. } => {
                assert_eq!(direction, StageDirection::In);
                assert_eq!(path, missing);
            }
            other => panic!("unexpected error: {other}"),
        }
        silo.release()?;
        Ok(())
    }

    #[test]
    fn stage_out_without_a_job_fails_with_stage_out() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let silo = Silo::provision(ClusterConfig::new(tmp.path().join("base")))?;
        let staging = StagingPaths::for_job("job");
        // No stage_in, so the staging output dir was never created.
        let err = stage_out(&silo, &staging, &tmp.path().join("out")).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Stage { direction: StageDirection::Out, .. }
        ));
        silo.release()?;
        Ok(())
    }
}
