//! Canonical cluster-path form for local filesystem paths.
//!
//! Cluster configuration stores every directory as an absolute,
//! slash-separated string so the same config reads identically on every
//! platform. Unix canonical paths already have that shape; Windows paths
//! carry a drive prefix and backslashes and are re-rooted under a single
//! leading slash.

use std::io;
use std::path::Path;

use crate::error::HarnessError;

/// Resolve a local path to the canonical slash-separated absolute form used
/// in cluster configuration.
///
/// The path must exist: canonicalization follows symlinks and fails on
/// broken links or unreadable parents, surfacing
/// [`HarnessError::PathResolution`] with the offending path. A canonical
/// path that is not valid UTF-8 is refused, not mangled. No side effects.
pub fn cluster_path(local: &Path) -> Result<String, HarnessError> {
    let canonical = local
        .canonicalize()
        .map_err(|source| HarnessError::PathResolution {
            path: local.to_path_buf(),
            source,
        })?;
    let canonical = canonical.to_str().ok_or_else(|| HarnessError::PathResolution {
        path: local.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidData, "path is not valid UTF-8"),
    })?;
    Ok(slash_form(canonical, cfg!(windows)))
}

/// Slash-form of an already-canonical path string.
///
/// Split out from [`cluster_path`] so the drive-letter branch is testable on
/// any host.
fn slash_form(canonical: &str, windows: bool) -> String {
    if windows {
        // Canonicalization on Windows yields verbatim paths (`\\?\C:\...`);
        // strip the prefix, then re-root under `/` with forward slashes.
        let trimmed = canonical.trim_start_matches(r"\\?\");
        format!("/{}", trimmed.replace('\\', "/"))
    } else {
        canonical.to_string()
    }
}
