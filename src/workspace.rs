// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The process-private temp directory holding the staged engine library and
//! per-session trace files.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use tempfile::TempDir;

// One workspace per process. Never dropped, so the directory lives until the
// process exits; sessions only ever create and delete files inside it.
static WORKSPACE: LazyLock<Result<TempWorkspace, Arc<io::Error>>> =
    LazyLock::new(|| TempWorkspace::new().map_err(Arc::new));

pub(crate) fn workspace() -> Result<&'static TempWorkspace, Arc<io::Error>> {
    WORKSPACE.as_ref().map_err(Arc::clone)
}

/// A private directory dedicated to this process instance.
pub(crate) struct TempWorkspace {
    dir: TempDir,
}

impl TempWorkspace {
    pub(crate) fn new() -> Result<Self, io::Error> {
        let dir = tempfile::Builder::new().prefix("asprof-pprof-").tempdir()?;
        tracing::debug!("created workspace directory {:?}", dir.path());
        Ok(Self { dir })
    }

    pub(crate) fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Creates a new, uniquely-named empty trace file for one session.
    pub(crate) fn allocate_trace_file(&self) -> Result<TraceFile, io::Error> {
        let file = tempfile::Builder::new()
            .prefix("profile-")
            .suffix(".jfr")
            .tempfile_in(self.dir.path())?;
        // The engine writes to the file by path; keep it so deletion stays
        // under the guard's control rather than tempfile's silent drop.
        let (_, path) = file.keep().map_err(|e| e.error)?;
        Ok(TraceFile { path })
    }
}

/// Scoped handle to one session's raw trace file. Deletes the file when
/// dropped, so every exit path of a session releases it.
pub(crate) struct TraceFile {
    path: PathBuf,
}

impl TraceFile {
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TraceFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            // Never raised: a cleanup failure must not mask the session's
            // own error, and the result (if any) is already produced.
            tracing::warn!(?err, path = ?self.path, "unable to delete trace file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_unique_files() {
        let ws = TempWorkspace::new().unwrap();
        let a = ws.allocate_trace_file().unwrap();
        let b = ws.allocate_trace_file().unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.path().exists());
        assert!(b.path().exists());
        assert!(a.path().starts_with(ws.path()));
    }

    #[test]
    fn test_trace_file_deleted_on_drop() {
        let ws = TempWorkspace::new().unwrap();
        let trace = ws.allocate_trace_file().unwrap();
        let path = trace.path().to_owned();
        std::fs::write(&path, b"JFR").unwrap();
        drop(trace);
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_tolerates_missing_file() {
        let ws = TempWorkspace::new().unwrap();
        let trace = ws.allocate_trace_file().unwrap();
        std::fs::remove_file(trace.path()).unwrap();
        // drop only warns; it must not panic
        drop(trace);
    }
}
