//! File discovery for the stream engine.
//!
//! A [`FileSource`] enumerates line files under a set of roots and
//! remembers what it has already handed out, so repeated discovery passes
//! only surface new arrivals. A file is consumed whole, once, by path;
//! appends to an already-consumed file are not picked up. Names starting
//! with `.` or `_` are invisible (editor droppings, in-progress files,
//! success markers).
//!
//! [`ChangeFeed`] turns filesystem events into wakeups for the discovery
//! loop. It rides the platform watcher when the `watch` feature is on and
//! the watcher starts; otherwise waiting degrades to plain sleeping and the
//! engine falls back on its periodic rescan.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

#[cfg(feature = "watch")]
use tracing::debug;

/// Incremental file enumerator over a fixed set of roots.
pub struct FileSource {
    roots: Vec<PathBuf>,
    seen: HashSet<PathBuf>,
}

impl FileSource {
    /// Roots may be plain files or directories; directories are walked
    /// recursively on every discovery pass.
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots, seen: HashSet::new() }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Files under the roots that earlier passes have not returned,
    /// sorted by path.
    ///
    /// A root that does not exist yet is skipped, not an error; in
    /// continuous mode it may appear later.
    pub fn discover(&mut self) -> io::Result<Vec<PathBuf>> {
        let mut fresh = Vec::new();
        for root in &self.roots {
            if !root.exists() {
                continue;
            }
            if root.is_file() {
                collect_candidate(root.clone(), &mut self.seen, &mut fresh);
            } else {
                walk(root, &mut self.seen, &mut fresh)?;
            }
        }
        fresh.sort();
        Ok(fresh)
    }
}

fn walk(dir: &Path, seen: &mut HashSet<PathBuf>, fresh: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if hidden(&entry.file_name().to_string_lossy()) {
            continue;
        }
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(&path, seen, fresh)?;
        } else if file_type.is_file() {
            collect_candidate(path, seen, fresh);
        }
    }
    Ok(())
}

fn collect_candidate(path: PathBuf, seen: &mut HashSet<PathBuf>, fresh: &mut Vec<PathBuf>) {
    if seen.insert(path.clone()) {
        fresh.push(path);
    }
}

fn hidden(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('_')
}

/// Wakeup source for continuous discovery.
pub struct ChangeFeed {
    rx: Option<Receiver<()>>,
    #[cfg(feature = "watch")]
    _watcher: Option<notify::RecommendedWatcher>,
}

impl ChangeFeed {
    /// Start watching the roots. Roots that do not exist yet are watched
    /// through their parent directory so their creation still wakes us.
    #[cfg(feature = "watch")]
    pub fn new(roots: &[PathBuf]) -> Self {
        use notify::{RecursiveMode, Watcher};

        let (tx, rx) = std::sync::mpsc::channel();
        let mut watcher = match notify::recommended_watcher(move |res: Result<notify::Event, _>| {
            if res.is_ok() {
                let _ = tx.send(());
            }
        }) {
            Ok(watcher) => watcher,
            Err(e) => {
                debug!(error = %e, "file watcher unavailable, rescan only");
                return Self { rx: None, _watcher: None };
            }
        };

        let mut watching = 0usize;
        for root in roots {
            let target = if root.exists() {
                root.clone()
            } else if let Some(parent) = root.parent().filter(|p| p.exists()) {
                parent.to_path_buf()
            } else {
                continue;
            };
            match watcher.watch(&target, RecursiveMode::Recursive) {
                Ok(()) => watching += 1,
                Err(e) => debug!(path = %target.display(), error = %e, "watch failed"),
            }
        }
        if watching == 0 {
            return Self { rx: None, _watcher: None };
        }
        Self { rx: Some(rx), _watcher: Some(watcher) }
    }

    #[cfg(not(feature = "watch"))]
    pub fn new(_roots: &[PathBuf]) -> Self {
        Self { rx: None }
    }

    /// Block up to `timeout` for a change notification. Returns whether one
    /// arrived; queued duplicates are drained so one burst of writes means
    /// one wakeup.
    pub fn wait(&self, timeout: Duration) -> bool {
        let Some(rx) = &self.rx else {
            thread::sleep(timeout);
            return false;
        };
        match rx.recv_timeout(timeout) {
            Ok(()) => {
                while rx.try_recv().is_ok() {}
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => {
                thread::sleep(timeout);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_returns_each_file_once_sorted() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        fs::create_dir_all(tmp.path().join("nested"))?;
        fs::write(tmp.path().join("b.txt"), "b")?;
        fs::write(tmp.path().join("nested/a.txt"), "a")?;

        let mut source = FileSource::new(vec![tmp.path().to_path_buf()]);
        let first = source.discover()?;
        assert_eq!(
            first,
            vec![tmp.path().join("b.txt"), tmp.path().join("nested/a.txt")]
        );

        fs::write(tmp.path().join("c.txt"), "c")?;
        assert_eq!(source.discover()?, vec![tmp.path().join("c.txt")]);
        assert!(source.discover()?.is_empty());
        Ok(())
    }

    #[test]
    fn discover_skips_hidden_and_marker_names() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        fs::write(tmp.path().join(".hidden"), "")?;
        fs::write(tmp.path().join("_SUCCESS"), "")?;
        fs::create_dir_all(tmp.path().join("_staging"))?;
        fs::write(tmp.path().join("_staging/real.txt"), "")?;
        fs::write(tmp.path().join("data.txt"), "")?;

        let mut source = FileSource::new(vec![tmp.path().to_path_buf()]);
        assert_eq!(source.discover()?, vec![tmp.path().join("data.txt")]);
        Ok(())
    }

    #[test]
    fn a_plain_file_root_counts_itself() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let file = tmp.path().join("alone.txt");
        fs::write(&file, "x")?;
        let mut source = FileSource::new(vec![file.clone(), tmp.path().join("absent")]);
        assert_eq!(source.discover()?, vec![file]);
        Ok(())
    }

    #[test]
    fn wait_times_out_quietly() {
        let feed = ChangeFeed::new(&[]);
        assert!(!feed.wait(Duration::from_millis(10)));
    }
}
