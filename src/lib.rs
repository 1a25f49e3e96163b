// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]

//! ## asprof-pprof
//! An in-process, pull-based CPU-profiling endpoint for Rust services, backed by
//! [async-profiler]: a caller asks for N seconds of CPU profile over HTTP and
//! receives a gzipped [pprof] artifact, ready for `pprof -http` or any other
//! pprof consumer.
//!
//! [async-profiler]: https://github.com/async-profiler/async-profiler
//! [pprof]: https://github.com/google/pprof
//!
//! ### OS/CPU Support
//!
//! Profiling requires a `libasyncProfiler` build for the running platform:
//! Linux on x86-64 or aarch64, or macOS. Release packaging may embed the
//! shared object; otherwise it is looked up under
//! `./async-profiler-2.8.3/` in the working directory, and a missing library
//! is reported on the first profiling request rather than at startup.
//!
//! ### Usage
//!
//! Mount the endpoint into your service (requires the default `endpoint`
//! feature):
//!
//! ```no_run
//! # use std::sync::Arc;
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let profiler = Arc::new(asprof_pprof::CpuProfiler::new()?);
//! let app = asprof_pprof::endpoint::router(profiler);
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:4001").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```
//!
//! then pull a profile:
//!
//! ```notrust
//! curl -o profile.pb.gz 'localhost:4001/debug/pprof/profile?seconds=10'
//! pprof -http=:8080 profile.pb.gz
//! ```
//!
//! [`CpuProfiler::profile`] is also usable directly, with any `io::Write`
//! sink.
//!
//! ### How a session runs
//!
//! Each request drives one session against the engine: start sampling on-CPU
//! time at 100 Hz into a temp JFR file, sleep for the requested duration,
//! stop, convert the JFR into a gzipped pprof profile, delete the temp file.
//! The engine is a process-wide singleton with no session queue, so sessions
//! are serialized; a request arriving mid-session is rejected with
//! [`ProfileError::SessionBusy`].

mod asprof;
mod convert;
mod locate;
mod workspace;

#[cfg(feature = "endpoint")]
pub mod endpoint;
pub mod profiler;

pub use asprof::AsProfError;
pub use convert::ConvertError;
pub use locate::ResolveError;
pub use profiler::{CpuProfiler, ProfileError};
