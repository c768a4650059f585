//! Error taxonomy for the harness and the two engines.
//!
//! Harness-side failures ([`HarnessError`]) cover everything between the
//! caller and a running cluster: path resolution, provisioning, staging.
//! Engine-side failures ([`EngineError`]) cover a running job: malformed
//! input rows in batch mode, part-file writes in stream mode. Binaries fold
//! both into `anyhow` at the edge; library code keeps them typed.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Direction of a staging transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageDirection {
    /// Local filesystem into the cluster namespace.
    In,
    /// Cluster namespace back out to the local filesystem.
    Out,
}

impl fmt::Display for StageDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::In => f.write_str("in"),
            Self::Out => f.write_str("out"),
        }
    }
}

/// Errors raised while provisioning, staging against, or releasing a cluster.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The cluster could not be brought to a ready state. Nothing was staged
    /// and no engine ran; any partially created resources have already been
    /// released.
    #[error("provision failed: {reason}")]
    Provision {
        reason: String,
        #[source]
        source: Option<io::Error>,
    },

    /// A local path could not be resolved to its canonical cluster form
    /// (missing file, broken symlink, permission denied).
    #[error("cannot resolve {}: {source}", path.display())]
    PathResolution {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A copy between the local filesystem and the cluster namespace failed.
    /// Partially copied state may remain on the failing side.
    #[error("stage-{direction} failed at {}: {source}", path.display())]
    Stage {
        direction: StageDirection,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Cluster teardown did not complete; the base dir may hold leftovers.
    #[error("teardown failed: {reason}")]
    Teardown {
        reason: String,
        #[source]
        source: Option<io::Error>,
    },
}

impl HarnessError {
    pub(crate) fn provision(reason: impl Into<String>, source: io::Error) -> Self {
        Self::Provision {
            reason: reason.into(),
            source: Some(source),
        }
    }

    pub(crate) fn provision_bare(reason: impl Into<String>) -> Self {
        Self::Provision {
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn stage(direction: StageDirection, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Stage {
            direction,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn teardown(reason: impl Into<String>, source: io::Error) -> Self {
        Self::Teardown {
            reason: reason.into(),
            source: Some(source),
        }
    }
}

/// Errors raised by the batch and stream engines.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An input row that does not match the expected shape. Fails the whole
    /// batch run; no partial output is valid.
    #[error("malformed record at {file}:{line}: {reason}")]
    MalformedRecord {
        /// Path of the offending file as the engine saw it.
        file: String,
        /// 1-based line number within that file.
        line: u64,
        reason: String,
    },

    /// A rolling part file could not be written. Fatal to the owning
    /// partition only; sibling partitions keep running.
    #[error("sink write failed on partition {partition}: {source}")]
    SinkWrite {
        partition: usize,
        #[source]
        source: io::Error,
    },

    /// Reading staged input or writing batch output failed.
    #[error("engine i/o error: {0}")]
    Io(#[from] io::Error),
}
