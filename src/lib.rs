//! # Ironsilo
//!
//! An **ephemeral single-node cluster harness** with two key-aggregation
//! engines. Ironsilo provisions a disposable miniature cluster on local
//! disk, stages data in and out of its file namespace, and runs jobs
//! against it: a batch map-combine-reduce engine and a continuous keyed
//! streaming engine with rolling file output.
//!
//! ## Key Features
//!
//! - **Scoped provisioning** - a cluster lives exactly as long as its
//!   [`Silo`] handle; teardown runs even on panic or early error
//! - **Isolated configuration** - every run owns one base directory, with
//!   nothing read from ambient environment or global state
//! - **Data staging** - copy inputs into the cluster namespace, move
//!   results back out
//! - **Batch engine** - parallel map and local combine per input file,
//!   key-routed reduce, sorted `part-r-NNNNN` output plus `_SUCCESS`
//! - **Stream engine** - bounded or continuous file sources, single
//!   writer per key partition, rolling part files with size/time policy
//! - **Typed errors** - provisioning, staging, and engine failures carry
//!   their own variants instead of stringly-typed causes
//!
//! ## Quick Start
//!
//! ```ignore
//! use ironsilo::*;
//! use ironsilo::stage::{stage_in, stage_out, staged_inputs};
//!
//! # fn main() -> anyhow::Result<()> {
//! let staging = StagingPaths::for_job("peopleinyear");
//! let outputs = harness::scoped(ClusterConfig::new("/tmp/silo-base"), |silo| {
//!     stage_in(silo, &inputs, &staging)?;
//!     let job = BatchJob::new(batch::year_counts, Sum::<i64>::new());
//!     job.run(&staged_inputs(silo, &staging)?, &silo.fs().resolve(&staging.output)?)?;
//!     stage_out(silo, &staging, std::path::Path::new("out"))
//! })?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Execution Model
//!
//! The harness and the batch engine run synchronously from the caller's
//! point of view; inside a batch run, map and reduce stages fan out over a
//! worker pool. The stream engine runs as one ingestion thread plus one
//! thread per key partition, connected by bounded channels; a key's
//! running total lives on exactly one partition, so totals are never
//! updated concurrently. Cancellation is cooperative and observed at
//! record-batch boundaries.
//!
//! With the `watch` feature (default) the continuous stream source wakes
//! on filesystem events; without it, discovery falls back to periodic
//! rescans alone.
//!
//! ## Module Overview
//!
//! - [`config`] - Per-run cluster configuration and staging layout
//! - [`cluster`] - The in-process miniature cluster service
//! - [`harness`] - Provision-use-release lifecycle and scoped execution
//! - [`fs`] - The cluster file namespace
//! - [`stage`] - Stage-in and stage-out transfers
//! - [`paths`] - Local-path to cluster-path normalization
//! - [`batch`] - The map-combine-reduce engine
//! - [`combine`] - Mergeable per-key aggregation
//! - [`stream`] - The keyed streaming engine
//! - [`source`] - File discovery and change watching
//! - [`sink`] - Rolling part-file output
//! - [`tokenize`] - Line tokenization for word counting
//! - [`error`] - Harness and engine error types
//! - [`testing`] - Fixtures and assertions for job tests

pub mod batch;
pub mod cluster;
pub mod combine;
pub mod config;
pub mod error;
pub mod fs;
pub mod harness;
pub mod paths;
pub mod sink;
pub mod source;
pub mod stage;
pub mod stream;
pub mod testing;
pub mod tokenize;

// General re-exports
pub use batch::{BatchJob, BatchSummary, RawRow};
pub use combine::{CombineFn, Sum};
pub use config::{ClusterConfig, StagingPaths};
pub use error::{EngineError, HarnessError, StageDirection};
pub use harness::Silo;
pub use sink::{RollingPolicy, RollingSink};
pub use stream::{CancelToken, Mode, StreamConfig, StreamHandle, StreamJob, StreamSummary};
