//! File namespace of the embedded cluster.
//!
//! The namespace is a plain directory tree under the config's `fs/` root,
//! addressed by slash-separated cluster paths (`"peopleinyear/input"`).
//! [`ClusterFs`] resolves cluster paths to real paths and offers the small
//! set of operations the stager and the jobs need; [`LocalFs`] is its
//! counterpart on the local side of a transfer. Everything returns
//! `io::Result`; callers at the harness seam wrap failures into their own
//! error types.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Component, Path, PathBuf};

/// One entry from a namespace directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatus {
    /// File name within the listed directory.
    pub name: String,
    /// Length in bytes.
    pub len: u64,
}

/// What one copy into the namespace moved. Directory sources count every
/// plain file in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Transferred {
    pub files: usize,
    pub bytes: u64,
}

/// View over the cluster file namespace.
#[derive(Debug, Clone)]
pub struct ClusterFs {
    root: PathBuf,
}

impl ClusterFs {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Resolve a cluster path to the real path under the namespace root.
    ///
    /// Cluster paths are relative, slash-separated, and stay inside the
    /// namespace: a leading `/` is tolerated, `.` and empty segments are
    /// dropped, and any `..` segment is rejected outright rather than
    /// normalized.
    pub fn resolve(&self, cluster_path: &str) -> io::Result<PathBuf> {
        let mut real = self.root.clone();
        for segment in cluster_path.split('/') {
            match Path::new(segment).components().next() {
                None | Some(Component::CurDir) => continue,
                Some(Component::ParentDir) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("cluster path {cluster_path:?} escapes the namespace"),
                    ));
                }
                _ => real.push(segment),
            }
        }
        Ok(real)
    }

    pub fn exists(&self, cluster_path: &str) -> bool {
        self.resolve(cluster_path).map(|p| p.exists()).unwrap_or(false)
    }

    /// Create a namespace directory and any missing parents.
    pub fn mkdirs(&self, cluster_path: &str) -> io::Result<()> {
        fs::create_dir_all(self.resolve(cluster_path)?)
    }

    /// Delete a file or directory tree. Returns whether anything existed.
    pub fn delete(&self, cluster_path: &str) -> io::Result<bool> {
        let real = self.resolve(cluster_path)?;
        match real.symlink_metadata() {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&real).map(|_| true),
            Ok(_) => fs::remove_file(&real).map(|_| true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Copy a local file or directory into a namespace directory, keeping
    /// its name. Directories are copied recursively.
    pub fn copy_from_local(&self, local: &Path, dst_dir: &str) -> io::Result<Transferred> {
        let name = local.file_name().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no file name", local.display()),
            )
        })?;
        let dst = self.resolve(dst_dir)?.join(name);
        if local.is_dir() {
            copy_tree(local, &dst)
        } else {
            copy_file(local, &dst).map(|bytes| Transferred { files: 1, bytes })
        }
    }

    /// List the plain files directly under a namespace directory, sorted by
    /// name. Subdirectories are skipped, not recursed into.
    pub fn list_files(&self, cluster_dir: &str) -> io::Result<Vec<FileStatus>> {
        let real = self.resolve(cluster_dir)?;
        let mut out = Vec::new();
        for entry in fs::read_dir(real)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            out.push(FileStatus {
                name: entry.file_name().to_string_lossy().into_owned(),
                len: meta.len(),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Open a namespace file for buffered reading.
    pub fn open(&self, cluster_path: &str) -> io::Result<BufReader<File>> {
        Ok(BufReader::new(File::open(self.resolve(cluster_path)?)?))
    }

    /// Read a whole namespace file into a string.
    pub fn read_to_string(&self, cluster_path: &str) -> io::Result<String> {
        fs::read_to_string(self.resolve(cluster_path)?)
    }
}

/// Local side of staging transfers.
///
/// The harness hands this out next to [`ClusterFs`] so the stager reaches
/// both halves of a transfer through the silo. It is stateless and uses
/// local paths as given.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl LocalFs {
    /// Delete a local directory tree if present, then create it empty.
    pub fn recreate_dir(&self, dir: &Path) -> io::Result<()> {
        match fs::remove_dir_all(dir) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        fs::create_dir_all(dir)
    }
}

fn copy_file(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut reader = BufReader::new(File::open(src)?);
    let mut writer = BufWriter::new(File::create(dst)?);
    let copied = io::copy(&mut reader, &mut writer)?;
    io::Write::flush(&mut writer)?;
    Ok(copied)
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<Transferred> {
    fs::create_dir_all(dst)?;
    let mut entries = fs::read_dir(src)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    let mut moved = Transferred::default();
    for entry in entries {
        let child = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            let sub = copy_tree(&entry.path(), &child)?;
            moved.files += sub.files;
            moved.bytes += sub.bytes;
        } else {
            moved.bytes += copy_file(&entry.path(), &child)?;
            moved.files += 1;
        }
    }
    Ok(moved)
}
