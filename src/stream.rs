//! Streaming aggregation engine.
//!
//! One ingestion thread discovers and reads input files, turns each line
//! into keyed pairs through the job's transform, and routes every pair to a
//! partition worker by key hash. Each worker owns its keys outright: it
//! keeps the running totals for exactly the keys that hash to it and is the
//! only writer of its rolling part files, so no total is ever updated from
//! two threads.
//!
//! Bounded jobs drain the inputs once and emit one final `(key,total)`
//! record per key. Continuous jobs rescan for new files (woken early by the
//! filesystem watcher) and emit an updated record on every input pair, the
//! way a running histogram would. Cancellation is cooperative: it is
//! observed between record batches, and in-flight part files are flushed,
//! closed, and renamed to their visible names on the way out.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::mem;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, sync_channel};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::combine::{CombineFn, Sum, key_partition};
use crate::error::EngineError;
use crate::sink::{RollingPolicy, RollingSink};
use crate::source::{ChangeFeed, FileSource};

const TICK_QUANTUM: Duration = Duration::from_millis(200);
const WAIT_SLICE: Duration = Duration::from_millis(200);
const BATCH_RECORDS: usize = 256;
const BATCH_LINES: u64 = 512;

/// Whether the job ends with its inputs or keeps watching them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Drain whatever exists now, emit finals, stop.
    Bounded,
    /// Keep rescanning for new files every interval, emit running updates,
    /// run until cancelled.
    Continuous { discovery_interval: Duration },
}

/// Cooperative cancellation flag, cheap to clone and share.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Streaming job configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Input files or directories, scanned recursively.
    pub inputs: Vec<PathBuf>,
    /// Directory the rolling part files land in.
    pub output_dir: PathBuf,
    pub mode: Mode,
    /// Partition worker count; keys hash onto these.
    pub workers: usize,
    pub rolling: RollingPolicy,
    /// Bound of each worker's inbox, in record batches. Full inboxes
    /// backpressure ingestion instead of growing without limit.
    pub channel_capacity: usize,
}

impl StreamConfig {
    /// Bounded-mode configuration with default partitioning and rolling.
    pub fn new(inputs: Vec<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            inputs,
            output_dir: output_dir.into(),
            mode: Mode::Bounded,
            workers: num_cpus::get().max(1),
            rolling: RollingPolicy::default(),
            channel_capacity: 64,
        }
    }
}

/// Counters and outputs from a finished stream run.
#[derive(Debug, Clone, Default)]
pub struct StreamSummary {
    /// Input files consumed.
    pub files: u64,
    /// Input lines read.
    pub lines: u64,
    /// Keyed records routed to workers.
    pub records: u64,
    /// Output records written across all partitions.
    pub updates: u64,
    /// Distinct keys held across all partitions.
    pub keys: u64,
    /// Finished part files, sorted.
    pub parts: Vec<PathBuf>,
    /// Whether a cancel request was observed.
    pub cancelled: bool,
}

/// A keyed running-sum job over line files.
///
/// The transform maps one input line to keyed `(key, count)` pairs; the
/// engine owns everything after that (routing, summing, rolling output).
pub struct StreamJob<F> {
    config: StreamConfig,
    transform: F,
}

type Batch = Vec<(String, u64)>;

impl<F> StreamJob<F>
where
    F: Fn(&str) -> Vec<(String, u64)> + Send + 'static,
{
    pub fn new(config: StreamConfig, transform: F) -> Self {
        Self { config, transform }
    }

    /// Spawn the ingestion and partition threads and hand back the control
    /// handle. The job runs until its input is exhausted (bounded) or until
    /// cancelled (continuous).
    pub fn start(self) -> Result<StreamHandle, EngineError> {
        let StreamConfig { inputs, output_dir, mode, workers, rolling, channel_capacity } =
            self.config;
        let workers = workers.max(1);
        let cancel = CancelToken::new();
        let failed = Arc::new(AtomicBool::new(false));
        let continuous = matches!(mode, Mode::Continuous { .. });
        std::fs::create_dir_all(&output_dir)?;

        let mut senders = Vec::with_capacity(workers);
        let mut worker_handles = Vec::with_capacity(workers);
        for partition in 0..workers {
            let (tx, rx) = sync_channel::<Batch>(channel_capacity.max(1));
            senders.push(Some(tx));
            let handle = thread::Builder::new()
                .name(format!("silo-stream-{partition}"))
                .spawn({
                    let output_dir = output_dir.clone();
                    let cancel = cancel.clone();
                    let failed = Arc::clone(&failed);
                    move || run_partition(partition, rx, output_dir, rolling, continuous, cancel, failed)
                })?;
            worker_handles.push(handle);
        }

        let ingest_handle = thread::Builder::new().name("silo-ingest".into()).spawn({
            let cancel = cancel.clone();
            let failed = Arc::clone(&failed);
            let transform = self.transform;
            move || {
                let source = FileSource::new(inputs);
                ingest(transform, source, mode, senders, &cancel, &failed)
            }
        })?;

        info!(workers, continuous, "stream job started");
        Ok(StreamHandle { cancel, ingest: ingest_handle, workers: worker_handles })
    }
}

/// Control handle for a running stream job.
pub struct StreamHandle {
    cancel: CancelToken,
    ingest: JoinHandle<Result<IngestStats, EngineError>>,
    workers: Vec<JoinHandle<Result<PartitionStats, EngineError>>>,
}

impl StreamHandle {
    /// Token that cancels this job; clonable into other threads.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Block until every thread has exited and fold their results.
    ///
    /// An ingestion error wins over worker errors; worker errors surface in
    /// partition order. All threads are joined either way, so no part file
    /// is still being written when this returns.
    pub fn wait(self) -> Result<StreamSummary, EngineError> {
        let ingest = join_stream_thread(self.ingest);
        let workers: Vec<_> = self.workers.into_iter().map(join_stream_thread).collect();
        // Read after the joins so a cancel delivered while wait() blocked
        // is reported.
        let cancelled = self.cancel.is_cancelled();

        let ingest = ingest?;
        let mut summary = StreamSummary {
            files: ingest.files,
            lines: ingest.lines,
            cancelled,
            ..StreamSummary::default()
        };
        for worker in workers {
            let stats = worker?;
            summary.records += stats.records;
            summary.updates += stats.updates;
            summary.keys += stats.keys;
            summary.parts.extend(stats.parts);
        }
        summary.parts.sort();
        info!(
            files = summary.files,
            records = summary.records,
            keys = summary.keys,
            parts = summary.parts.len(),
            cancelled = summary.cancelled,
            "stream job finished"
        );
        Ok(summary)
    }
}

fn join_stream_thread<T>(handle: JoinHandle<Result<T, EngineError>>) -> Result<T, EngineError> {
    handle
        .join()
        .map_err(|_| EngineError::Io(io::Error::other("stream thread panicked")))?
}

#[derive(Default)]
struct IngestStats {
    files: u64,
    lines: u64,
}

/// Marks the run failed when dropped while still armed.
///
/// [`ingest`] declares it after its router, so on an unwind the flag is up
/// before the router's channels disconnect and wake the workers.
struct FailGuard<'a> {
    failed: &'a AtomicBool,
    armed: bool,
}

impl FailGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for FailGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.failed.store(true, Ordering::SeqCst);
        }
    }
}

fn ingest<F>(
    transform: F,
    mut source: FileSource,
    mode: Mode,
    senders: Vec<Option<SyncSender<Batch>>>,
    cancel: &CancelToken,
    failed: &AtomicBool,
) -> Result<IngestStats, EngineError>
where
    F: Fn(&str) -> Vec<(String, u64)>,
{
    let mut stats = IngestStats::default();
    let mut router = Router::new(senders);
    let mut guard = FailGuard { failed, armed: true };
    let feed = match mode {
        Mode::Continuous { .. } => Some(ChangeFeed::new(source.roots())),
        Mode::Bounded => None,
    };

    'scan: loop {
        for file in source.discover()? {
            debug!(file = %file.display(), "consuming");
            stats.files += 1;
            if drain_file(&file, &transform, &mut router, &mut stats, cancel)? {
                break 'scan;
            }
        }
        match mode {
            Mode::Bounded => break,
            Mode::Continuous { discovery_interval } => {
                if cancel.is_cancelled() {
                    break;
                }
                if let Some(feed) = &feed {
                    wait_for_wake(feed, discovery_interval, cancel);
                }
                if cancel.is_cancelled() {
                    break;
                }
            }
        }
    }
    router.flush_all();
    guard.disarm();
    Ok(stats)
}

/// Read one file through the transform. Returns whether a cancel request
/// was observed at a batch boundary.
fn drain_file<F>(
    file: &std::path::Path,
    transform: &F,
    router: &mut Router,
    stats: &mut IngestStats,
    cancel: &CancelToken,
) -> Result<bool, EngineError>
where
    F: Fn(&str) -> Vec<(String, u64)>,
{
    let reader = BufReader::new(File::open(file)?);
    let mut batched = 0u64;
    for line in reader.lines() {
        let line = line?;
        stats.lines += 1;
        for (key, value) in transform(&line) {
            router.push(key, value);
        }
        batched += 1;
        if batched >= BATCH_LINES {
            batched = 0;
            router.flush_all();
            if cancel.is_cancelled() {
                return Ok(true);
            }
        }
    }
    router.flush_all();
    Ok(cancel.is_cancelled())
}

fn wait_for_wake(feed: &ChangeFeed, interval: Duration, cancel: &CancelToken) {
    let deadline = Instant::now() + interval;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        if feed.wait((deadline - now).min(WAIT_SLICE)) {
            return;
        }
    }
}

/// Hash-routes pairs into per-partition batches. A partition whose worker
/// has gone away is skipped; its records are dropped, not redistributed,
/// so surviving partitions keep exactly their own keys.
struct Router {
    senders: Vec<Option<SyncSender<Batch>>>,
    buffers: Vec<Batch>,
}

impl Router {
    fn new(senders: Vec<Option<SyncSender<Batch>>>) -> Self {
        let buffers = senders.iter().map(|_| Batch::new()).collect();
        Self { senders, buffers }
    }

    fn push(&mut self, key: String, value: u64) {
        let partition = key_partition(&key, self.senders.len());
        if self.senders[partition].is_none() {
            return;
        }
        self.buffers[partition].push((key, value));
        if self.buffers[partition].len() >= BATCH_RECORDS {
            self.flush(partition);
        }
    }

    fn flush(&mut self, partition: usize) {
        if self.buffers[partition].is_empty() {
            return;
        }
        let batch = mem::take(&mut self.buffers[partition]);
        if let Some(sender) = &self.senders[partition]
            && sender.send(batch).is_err()
        {
            warn!(partition, "partition worker gone, dropping its records");
            self.senders[partition] = None;
        }
    }

    fn flush_all(&mut self) {
        for partition in 0..self.senders.len() {
            self.flush(partition);
        }
    }
}

#[derive(Default)]
struct PartitionStats {
    records: u64,
    updates: u64,
    keys: u64,
    parts: Vec<PathBuf>,
}

fn run_partition(
    partition: usize,
    rx: Receiver<Batch>,
    output_dir: PathBuf,
    policy: RollingPolicy,
    continuous: bool,
    cancel: CancelToken,
    failed: Arc<AtomicBool>,
) -> Result<PartitionStats, EngineError> {
    let sum = Sum::<u64>::new();
    let mut totals: HashMap<String, u64> = HashMap::new();
    let mut sink = RollingSink::new(output_dir, partition, policy);
    let mut stats = PartitionStats::default();

    let driven = drive_partition(
        &rx, &sum, &mut totals, &mut sink, &mut stats, continuous, &cancel, &failed,
    );
    // Close even after an error so no hidden in-progress file keeps a
    // half-written record buffered.
    let closed = sink.close();
    driven?;
    stats.parts = closed?;
    stats.keys = totals.len() as u64;
    Ok(stats)
}

#[allow(clippy::too_many_arguments)]
fn drive_partition(
    rx: &Receiver<Batch>,
    sum: &Sum<u64>,
    totals: &mut HashMap<String, u64>,
    sink: &mut RollingSink,
    stats: &mut PartitionStats,
    continuous: bool,
    cancel: &CancelToken,
    failed: &AtomicBool,
) -> Result<(), EngineError> {
    loop {
        match rx.recv_timeout(TICK_QUANTUM) {
            Ok(batch) => {
                for (key, value) in batch {
                    let total = {
                        let slot = totals.entry(key.clone()).or_insert_with(|| sum.create());
                        sum.add_input(slot, value);
                        *slot
                    };
                    stats.records += 1;
                    if continuous {
                        sink.write(&format!("({key},{total})"))?;
                        stats.updates += 1;
                    }
                }
                sink.tick()?;
            }
            Err(RecvTimeoutError::Timeout) => sink.tick()?,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // Finals belong only to bounded runs that actually drained their input.
    if !continuous && !cancel.is_cancelled() && !failed.load(Ordering::SeqCst) {
        let mut finals: Vec<(&String, &u64)> = totals.iter().collect();
        finals.sort_by(|a, b| a.0.cmp(b.0));
        for (key, total) in finals {
            sink.write(&format!("({key},{total})"))?;
            stats.updates += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::stream_totals;
    use crate::tokenize::{first_char_key, tokenize};
    use std::fs;

    fn word_pairs(line: &str) -> Vec<(String, u64)> {
        tokenize(line).into_iter().map(first_char_key).collect()
    }

    #[test]
    fn bounded_run_emits_final_counts_once() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let input = tmp.path().join("in");
        fs::create_dir_all(&input)?;
        fs::write(input.join("a.txt"), "hello world hello you\n")?;
        fs::write(input.join("b.txt"), "wide web\n")?;

        let mut config = StreamConfig::new(vec![input], tmp.path().join("out"));
        config.workers = 2;
        let summary = StreamJob::new(config, word_pairs).start()?.wait()?;

        assert_eq!(summary.files, 2);
        assert_eq!(summary.records, 6);
        assert_eq!(summary.keys, 3);
        assert!(!summary.cancelled);
        // One final per key: h->2, y->1, w->3.
        assert_eq!(summary.updates, 3);
        let totals = stream_totals(&summary.parts)?;
        assert_eq!(totals.get("h"), Some(&2));
        assert_eq!(totals.get("y"), Some(&1));
        assert_eq!(totals.get("w"), Some(&3));
        Ok(())
    }

    #[test]
    fn bounded_run_over_empty_dir_finishes_clean() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let input = tmp.path().join("in");
        fs::create_dir_all(&input)?;
        let summary = StreamJob::new(
            StreamConfig::new(vec![input], tmp.path().join("out")),
            word_pairs,
        )
        .start()?
        .wait()?;
        assert_eq!(summary.records, 0);
        assert!(summary.parts.is_empty());
        Ok(())
    }

    #[test]
    fn continuous_run_stops_on_cancel_with_parts_closed() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let input = tmp.path().join("in");
        fs::create_dir_all(&input)?;
        fs::write(input.join("a.txt"), "tick tock tick\n")?;

        let mut config = StreamConfig::new(vec![input], tmp.path().join("out"));
        config.workers = 1;
        config.mode = Mode::Continuous { discovery_interval: Duration::from_millis(50) };
        let handle = StreamJob::new(config, word_pairs).start()?;

        // Give ingestion a few scan cycles, then pull the plug.
        std::thread::sleep(Duration::from_millis(300));
        handle.cancel();
        let summary = handle.wait()?;

        assert!(summary.cancelled);
        assert_eq!(summary.records, 3);
        // Updates stream per record: (t,1), (t,2), (t,3) all written.
        assert_eq!(summary.updates, 3);
        let totals = stream_totals(&summary.parts)?;
        assert_eq!(totals.get("t"), Some(&3));
        // Nothing left hidden in the output dir.
        for entry in fs::read_dir(tmp.path().join("out"))? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            assert!(!name.ends_with(".inprogress"), "unfinished part {name}");
        }
        Ok(())
    }
}
