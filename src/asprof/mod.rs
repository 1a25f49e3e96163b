// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::ffi::{c_char, CStr, CString};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use thiserror::Error;

use crate::locate::{self, ResolveError};
use crate::workspace;

pub(crate) mod raw;

/// Nanoseconds between CPU samples (100 Hz).
pub(crate) const SAMPLING_INTERVAL_NANOS: u64 = 10_000_000;

/// Error talking to the native async-profiler engine.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum AsProfError {
    /// The engine rejected a command.
    #[error("async-profiler error: {0}")]
    AsyncProfilerError(String),
    /// The engine library path could not be resolved.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// `libasyncProfiler` could not be loaded from the resolved path.
    #[error("error loading libasyncProfiler: {0}")]
    LibraryError(#[from] Arc<libloading::Error>),
}

/// The operations the session controller needs from a sampling engine.
/// Implemented by [`AsProf`] for the real engine and by mocks in tests.
pub(crate) trait ProfilerEngine: Send + Sync + 'static {
    fn ensure_ready(&self) -> Result<(), AsProfError>;
    fn start(&self, trace_file: &Path) -> Result<(), AsProfError>;
    fn stop(&self) -> Result<(), AsProfError>;
}

#[derive(Debug, Default)]
pub(crate) struct AsProfBuilder {}

impl AsProfBuilder {
    pub fn build(self) -> AsProf {
        AsProf {}
    }
}

/// Handle to the process-wide async-profiler engine.
pub(crate) struct AsProf {}

// Resolution runs at most once per process; its result, success or failure,
// is what every later session sees.
static RESOLVED_LIBRARY: OnceLock<Result<PathBuf, ResolveError>> = OnceLock::new();

// asprof_init has init-once semantics; memoize the whole ready-check,
// including a failed one, which only a fresh process can retry.
static ENGINE_READY: OnceLock<Result<(), AsProfError>> = OnceLock::new();

fn resolved_library_path() -> Result<&'static Path, ResolveError> {
    RESOLVED_LIBRARY
        .get_or_init(|| {
            let workspace = workspace::workspace().map_err(ResolveError::Workspace)?;
            locate::resolve(workspace.path())
        })
        .as_ref()
        .map(PathBuf::as_path)
        .map_err(Clone::clone)
}

impl AsProf {
    pub fn builder() -> AsProfBuilder {
        AsProfBuilder::default()
    }

    /// Builds the engine start command for a CPU profile written to `dst`.
    fn start_command(dst: &Path) -> String {
        format!(
            "start,event=cpu,interval={},file={},jfr",
            SAMPLING_INTERVAL_NANOS,
            dst.display()
        )
    }

    /// convert an asprof_error_t to a Result
    ///
    /// SAFETY: response must be a valid asprof_error_t
    unsafe fn asprof_error(
        prof: &'static raw::AsyncProfiler,
        response: raw::asprof_error_t,
    ) -> Result<(), AsProfError> {
        if !response.is_null() {
            let response = (prof.asprof_error_str)(response);
            if response.is_null() {
                return Ok(());
            }
            let response = unsafe { CStr::from_ptr(response) };
            let response_str = response.to_string_lossy();
            tracing::error!("received error from async-profiler: {}", response_str);
            Err(AsProfError::AsyncProfilerError(response_str.to_string()))
        } else {
            Ok(())
        }
    }

    fn asprof_execute(args: &str) -> Result<(), AsProfError> {
        unsafe extern "C" fn callback(buf: *const c_char, size: usize) {
            unsafe {
                if !buf.is_null() {
                    let parts = std::slice::from_raw_parts(buf as *const u8, size);
                    tracing::debug!(
                        "response from async-profiler: {}",
                        String::from_utf8_lossy(parts)
                    );
                } else {
                    tracing::debug!("invalid pointer or size");
                }
            }
        }

        let library_path = resolved_library_path()?;
        let prof = raw::async_profiler(library_path)?;
        let args_compatible = CString::new(args)
            .map_err(|e| AsProfError::AsyncProfilerError(e.to_string()))?;
        unsafe {
            Self::asprof_error(
                prof,
                (prof.asprof_execute)(args_compatible.as_ptr(), Some(callback)),
            )
        }
    }
}

impl ProfilerEngine for AsProf {
    fn ensure_ready(&self) -> Result<(), AsProfError> {
        ENGINE_READY
            .get_or_init(|| {
                let library_path = resolved_library_path()?;
                tracing::debug!("loading async-profiler from {library_path:?}");
                let prof = raw::async_profiler(library_path)?;
                unsafe { (prof.asprof_init)() };
                tracing::info!("successfully initialized async profiler.");
                Ok(())
            })
            .clone()
    }

    fn start(&self, trace_file: &Path) -> Result<(), AsProfError> {
        tracing::debug!("starting the async-profiler and giving JFR file path: {trace_file:?}");
        Self::asprof_execute(&Self::start_command(trace_file))?;
        tracing::debug!("async-profiler started successfully");
        Ok(())
    }

    fn stop(&self) -> Result<(), AsProfError> {
        Self::asprof_execute("stop")?;
        tracing::debug!("async-profiler stopped successfully");
        Ok(())
    }
}
