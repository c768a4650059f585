//! Rolling part-file sink.
//!
//! Each stream partition owns one [`RollingSink`]. Records append to an
//! in-progress file named `.part-<partition>-<seq>.inprogress`; the hidden
//! name keeps half-written parts invisible to downstream discovery. A part
//! rolls (flush, close, rename to its visible `part-<partition>-<seq>`
//! name) when it grows past the size cap or lives past the rollover
//! interval. Only whole records are ever written, so a finished part never
//! ends mid-line.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::EngineError;

/// When to close the current part file and start the next one.
#[derive(Debug, Clone, Copy)]
pub struct RollingPolicy {
    /// Size cap. A part may exceed it by at most one record, since the
    /// check runs after a whole record went out.
    pub max_part_size: u64,
    /// Age cap, measured from when the part was opened.
    pub rollover_interval: Duration,
}

impl Default for RollingPolicy {
    fn default() -> Self {
        Self {
            max_part_size: 1024 * 1024,
            rollover_interval: Duration::from_secs(10),
        }
    }
}

struct ActivePart {
    writer: BufWriter<File>,
    working_path: PathBuf,
    final_path: PathBuf,
    bytes: u64,
    opened: Instant,
}

/// Line-oriented writer that rolls files per [`RollingPolicy`].
///
/// Opening is lazy: a partition that never receives a record leaves no file
/// behind.
pub struct RollingSink {
    dir: PathBuf,
    partition: usize,
    policy: RollingPolicy,
    seq: u64,
    active: Option<ActivePart>,
    finished: Vec<PathBuf>,
}

impl RollingSink {
    pub fn new(dir: impl Into<PathBuf>, partition: usize, policy: RollingPolicy) -> Self {
        Self {
            dir: dir.into(),
            partition,
            policy,
            seq: 0,
            active: None,
            finished: Vec::new(),
        }
    }

    /// Append one record as a line, rolling afterwards if the part grew
    /// past the size cap.
    pub fn write(&mut self, record: &str) -> Result<(), EngineError> {
        let partition = self.partition;
        if self.active.is_none() {
            self.open_part().map_err(|e| Self::wrap(partition, e))?;
        }
        if let Some(part) = self.active.as_mut() {
            part.writer
                .write_all(record.as_bytes())
                .and_then(|_| part.writer.write_all(b"\n"))
                .map_err(|e| Self::wrap(partition, e))?;
            part.bytes += record.len() as u64 + 1;
        }
        if self.should_roll_on_size() {
            self.roll().map_err(|e| Self::wrap(partition, e))?;
        }
        Ok(())
    }

    /// Roll the current part if it has outlived the rollover interval.
    /// Cheap to call often; does nothing when no part is open.
    pub fn tick(&mut self) -> Result<(), EngineError> {
        if self.should_roll_on_time() {
            self.roll().map_err(|e| Self::wrap(self.partition, e))?;
        }
        Ok(())
    }

    /// Finalize the in-progress part and return every finished part path,
    /// in the order they were completed.
    pub fn close(mut self) -> Result<Vec<PathBuf>, EngineError> {
        if self.active.is_some() {
            self.roll().map_err(|e| Self::wrap(self.partition, e))?;
        }
        Ok(self.finished)
    }

    fn should_roll_on_size(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|part| part.bytes >= self.policy.max_part_size)
    }

    fn should_roll_on_time(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|part| part.opened.elapsed() >= self.policy.rollover_interval)
    }

    fn open_part(&mut self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let stem = format!("part-{}-{}", self.partition, self.seq);
        let working_path = self.dir.join(format!(".{stem}.inprogress"));
        let final_path = self.dir.join(stem);
        let writer = BufWriter::new(File::create(&working_path)?);
        self.active = Some(ActivePart {
            writer,
            working_path,
            final_path,
            bytes: 0,
            opened: Instant::now(),
        });
        Ok(())
    }

    fn roll(&mut self) -> io::Result<()> {
        let Some(mut part) = self.active.take() else {
            return Ok(());
        };
        part.writer.flush()?;
        drop(part.writer);
        fs::rename(&part.working_path, &part.final_path)?;
        debug!(part = %part.final_path.display(), bytes = part.bytes, "part finished");
        self.finished.push(part.final_path);
        self.seq += 1;
        Ok(())
    }

    fn wrap(partition: usize, source: io::Error) -> EngineError {
        EngineError::SinkWrite { partition, source }
    }
}
