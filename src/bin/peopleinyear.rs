//! People-per-year batch driver.
//!
//! Provisions a throwaway silo, stages the census inputs into its
//! namespace, runs the year aggregation, and moves the part files back out
//! to the local output directory. The cluster is gone by the time the
//! process exits, whichever way the job went.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use ironsilo::batch::{BatchJob, year_counts};
use ironsilo::combine::Sum;
use ironsilo::config::{ClusterConfig, StagingPaths};
use ironsilo::harness::{self, Silo};
use ironsilo::stage::{stage_in, stage_out, staged_inputs};

#[derive(Parser)]
#[command(name = "peopleinyear")]
#[command(about = "Count people per year across census files")]
#[command(version)]
struct Cli {
    /// Input census files followed by the local output directory.
    #[arg(required = true, num_args = 2.., value_name = "PATH")]
    paths: Vec<PathBuf>,

    /// Base directory for the ephemeral cluster. A temp dir by default.
    #[arg(long, value_name = "DIR")]
    base: Option<PathBuf>,

    /// Number of reduce partitions (and part files).
    #[arg(long, default_value_t = 1, value_name = "N")]
    reduce_partitions: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let mut inputs = cli.paths;
    let output = inputs.pop().context("missing output directory")?;

    // Keep the guard alive until the silo is released.
    let (base, _guard) = match cli.base {
        Some(dir) => (dir, None),
        None => {
            let tmp = tempfile::Builder::new().prefix("peopleinyear").tempdir()?;
            (tmp.path().to_path_buf(), Some(tmp))
        }
    };

    let staging = StagingPaths::for_job("peopleinyear");
    let moved = harness::scoped(ClusterConfig::new(base), |silo: &Silo| {
        let staged = stage_in(silo, &inputs, &staging)?;
        info!(files = staged.files, bytes = staged.bytes, "inputs staged");

        let summary = BatchJob::new(year_counts, Sum::<i64>::new())
            .reduce_partitions(cli.reduce_partitions)
            .run(
                &staged_inputs(silo, &staging)?,
                &silo.fs().resolve(&staging.output)?,
            )?;
        info!(
            rows = summary.rows,
            keys = summary.keys,
            parts = summary.parts,
            "census aggregation done"
        );

        stage_out(silo, &staging, &output).map_err(anyhow::Error::from)
    })?;

    for part in moved {
        println!("{}", part.display());
    }
    Ok(())
}
