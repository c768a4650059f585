//! Word-histogram stream driver.
//!
//! Counts words by their first character across text files, writing
//! `(key,total)` records into rolling part files. Without a discovery
//! interval the run is bounded: it drains the inputs, writes final counts,
//! and exits. With one, it keeps watching the inputs for new files and
//! streams an updated count on every word until the process is stopped.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use ironsilo::stream::{Mode, StreamConfig, StreamJob};
use ironsilo::tokenize::{first_char_key, tokenize};

#[derive(Parser)]
#[command(name = "wordcount")]
#[command(about = "Word occurrence histogram keyed by first character")]
#[command(version)]
struct Cli {
    /// Input file or directory to read. Repeatable.
    #[arg(long = "input", required = true, value_name = "PATH")]
    inputs: Vec<PathBuf>,

    /// Rescan the inputs for new files at this interval (e.g. "10s").
    /// Absent means a bounded run over what exists now.
    #[arg(long, value_parser = humantime::parse_duration, value_name = "DURATION")]
    discovery_interval: Option<Duration>,

    /// Directory the rolling part files are written to.
    #[arg(long, value_name = "DIR")]
    output: PathBuf,

    /// Partition worker count. Defaults to the number of CPUs.
    #[arg(long, value_name = "N")]
    workers: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = StreamConfig::new(cli.inputs, cli.output);
    config.mode = match cli.discovery_interval {
        Some(discovery_interval) => Mode::Continuous { discovery_interval },
        None => Mode::Bounded,
    };
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }

    let handle = StreamJob::new(config, |line: &str| {
        tokenize(line).into_iter().map(first_char_key).collect()
    })
    .start()?;

    // Bounded runs return once the inputs are drained; continuous runs
    // block here until the process is stopped.
    let summary = handle.wait()?;
    println!(
        "{} files, {} lines, {} records, {} keys, {} parts",
        summary.files,
        summary.lines,
        summary.records,
        summary.keys,
        summary.parts.len()
    );
    Ok(())
}
