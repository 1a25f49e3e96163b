// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The profiling session controller: drives the engine through one
//! start/sleep/stop cycle and pipes the trace through conversion.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::asprof::{AsProf, AsProfError, ProfilerEngine};
use crate::convert::{self, ConvertError, JfrTraceReader, TraceReader};
use crate::workspace::{self, TempWorkspace};

/// Error running a profiling session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProfileError {
    /// The requested duration is zero. Rejected before any engine or
    /// filesystem interaction.
    #[error("invalid profiling duration: {0:?}")]
    InvalidDuration(Duration),
    /// Another session currently holds the engine. The engine is a global
    /// singleton with no session queue; concurrent requests are rejected
    /// rather than interleaved.
    #[error("a profiling session is already in progress")]
    SessionBusy,
    /// The engine could not be resolved, loaded or initialized.
    #[error(transparent)]
    Engine(#[from] AsProfError),
    /// The engine rejected the start command.
    #[error("unable to start async-profiler: {0}")]
    EngineStart(#[source] AsProfError),
    /// The engine rejected the stop command. The trace written up to that
    /// point is still converted; a conversion failure rides along.
    #[error("unable to stop async-profiler: {stop}")]
    EngineStop {
        /// The stop failure itself.
        #[source]
        stop: AsProfError,
        /// Outcome of converting the partial trace, if that failed too.
        convert: Option<ConvertError>,
    },
    /// The trace could not be converted into a pprof profile.
    #[error(transparent)]
    Convert(#[from] ConvertError),
    /// The workspace directory or a trace file could not be created.
    #[error("tempfile error: {0}")]
    TempFile(#[source] Arc<io::Error>),
}

// The engine is process-global, so session serialization must be too: every
// CpuProfiler instance contends for this one lock, and two instances can
// never interleave start/stop against the singleton engine.
static SESSION_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Captures timed CPU profiles of the running process.
///
/// The underlying engine is a global singleton, and sessions are serialized
/// process-wide, across all instances of this type. A request that arrives
/// while a session is sampling fails with [`ProfileError::SessionBusy`].
pub struct CpuProfiler {
    inner: SessionRunner<AsProf, JfrTraceReader>,
}

impl CpuProfiler {
    /// Creates the profiler. The engine itself is resolved lazily, on the
    /// first profiling session.
    pub fn new() -> Result<Self, ProfileError> {
        let workspace = workspace::workspace().map_err(ProfileError::TempFile)?;
        Ok(Self {
            inner: SessionRunner::new(
                AsProf::builder().build(),
                JfrTraceReader::new(),
                workspace,
                &SESSION_LOCK,
            ),
        })
    }

    /// Samples on-CPU time for `duration` and writes the gzipped pprof
    /// profile to `sink`.
    pub async fn profile<W: Write>(
        &self,
        duration: Duration,
        sink: W,
    ) -> Result<(), ProfileError> {
        self.inner.profile(duration, sink).await
    }
}

/// Generic over the engine and trace reader so tests can drive the session
/// protocol without the native library.
struct SessionRunner<E, R> {
    engine: E,
    reader: Arc<R>,
    workspace: &'static TempWorkspace,
    // Held for the whole start/sleep/stop/convert sequence; a second start
    // command against the running engine is undefined behavior. Shared by
    // every runner in the process, since the engine is too.
    session_lock: &'static tokio::sync::Mutex<()>,
}

impl<E: ProfilerEngine, R: TraceReader> SessionRunner<E, R> {
    fn new(
        engine: E,
        reader: R,
        workspace: &'static TempWorkspace,
        session_lock: &'static tokio::sync::Mutex<()>,
    ) -> Self {
        Self {
            engine,
            reader: Arc::new(reader),
            workspace,
            session_lock,
        }
    }

    async fn profile<W: Write>(&self, duration: Duration, mut sink: W) -> Result<(), ProfileError> {
        if duration.is_zero() {
            return Err(ProfileError::InvalidDuration(duration));
        }
        let _session = self
            .session_lock
            .try_lock()
            .map_err(|_| ProfileError::SessionBusy)?;

        self.engine.ensure_ready()?;

        let trace = self
            .workspace
            .allocate_trace_file()
            .map_err(|e| ProfileError::TempFile(Arc::new(e)))?;
        // `trace` drops at the end of this scope, deleting the file on
        // every path from here on.

        self.engine
            .start(trace.path())
            .map_err(ProfileError::EngineStart)?;

        // The sampling window. No cancellation: a caller disconnecting does
        // not abort the engine's run.
        tokio::time::sleep(duration).await;

        let stopped = self.engine.stop();
        // A failed stop still leaves a usable (if partial) trace; convert
        // it rather than discard it. Parsing and compressing the trace is
        // CPU-bound work, so it runs off the async worker.
        let reader = Arc::clone(&self.reader);
        let trace_path = trace.path().to_owned();
        let compressed = match tokio::task::spawn_blocking(move || {
            let mut compressed = Vec::new();
            convert::convert(&*reader, &trace_path, &mut compressed)?;
            Ok(compressed)
        })
        .await
        {
            Ok(compressed) => compressed,
            // only reachable if the conversion stage panicked
            Err(err) => std::panic::resume_unwind(err.into_panic()),
        };
        let converted =
            compressed.and_then(|bytes| sink.write_all(&bytes).map_err(ConvertError::SinkWrite));

        match (stopped, converted) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(convert)) => Err(convert.into()),
            (Err(stop), converted) => Err(ProfileError::EngineStop {
                stop,
                convert: converted.err(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{self, AtomicU32};
    use std::sync::Mutex;

    use flate2::read::GzDecoder;
    use prost::Message;
    use test_case::test_case;

    use crate::convert::pprof::Profile;
    use crate::convert::{TraceFrame, TraceSample};

    use super::*;

    fn leaked_workspace() -> &'static TempWorkspace {
        Box::leak(Box::new(TempWorkspace::new().unwrap()))
    }

    // tests get their own lock so they stay independent of each other; the
    // production path shares the one SESSION_LOCK static
    fn leaked_lock() -> &'static tokio::sync::Mutex<()> {
        Box::leak(Box::new(tokio::sync::Mutex::new(())))
    }

    #[derive(Default)]
    struct MockEngine {
        fail_start: bool,
        fail_stop: bool,
        readies: AtomicU32,
        starts: AtomicU32,
        stops: AtomicU32,
        trace_path: Mutex<Option<PathBuf>>,
        started_at: Mutex<Option<tokio::time::Instant>>,
        stopped_at: Mutex<Option<tokio::time::Instant>>,
    }

    impl ProfilerEngine for MockEngine {
        fn ensure_ready(&self) -> Result<(), AsProfError> {
            self.readies.fetch_add(1, atomic::Ordering::Relaxed);
            Ok(())
        }

        fn start(&self, trace_file: &Path) -> Result<(), AsProfError> {
            self.starts.fetch_add(1, atomic::Ordering::Relaxed);
            *self.trace_path.lock().unwrap() = Some(trace_file.to_owned());
            *self.started_at.lock().unwrap() = Some(tokio::time::Instant::now());
            if self.fail_start {
                return Err(AsProfError::AsyncProfilerError(
                    "Profiler already started".into(),
                ));
            }
            std::fs::write(trace_file, b"TRACE").unwrap();
            Ok(())
        }

        fn stop(&self) -> Result<(), AsProfError> {
            self.stops.fetch_add(1, atomic::Ordering::Relaxed);
            *self.stopped_at.lock().unwrap() = Some(tokio::time::Instant::now());
            if self.fail_stop {
                return Err(AsProfError::AsyncProfilerError("Profiler not active".into()));
            }
            Ok(())
        }
    }

    /// Emits `samples` single-frame samples after checking the trace the
    /// mock engine wrote is actually there, then optionally fails.
    struct MockReader {
        samples: usize,
        fail_after: Option<usize>,
    }

    impl MockReader {
        fn emitting(samples: usize) -> Self {
            Self {
                samples,
                fail_after: None,
            }
        }

        fn failing_after(samples: usize) -> Self {
            Self {
                samples,
                fail_after: Some(samples),
            }
        }
    }

    impl TraceReader for MockReader {
        fn read_samples(
            &self,
            trace: &Path,
            emit: &mut dyn FnMut(TraceSample),
        ) -> Result<(), ConvertError> {
            assert_eq!(std::fs::read(trace).unwrap(), b"TRACE");
            for i in 0..self.samples {
                emit(TraceSample {
                    frames: vec![TraceFrame {
                        class_name: None,
                        method_name: Some(format!("fn_{i}")),
                    }],
                });
            }
            match self.fail_after {
                Some(_) => Err(ConvertError::TraceRead("truncated chunk".into())),
                None => Ok(()),
            }
        }
    }

    fn runner(engine: MockEngine, reader: MockReader) -> SessionRunner<MockEngine, MockReader> {
        SessionRunner::new(engine, reader, leaked_workspace(), leaked_lock())
    }

    fn decode_profile(sink: &[u8]) -> Profile {
        let mut decoded = Vec::new();
        GzDecoder::new(sink).read_to_end(&mut decoded).unwrap();
        Profile::decode(decoded.as_slice()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_profile_round_trip() {
        let runner = runner(MockEngine::default(), MockReader::emitting(3));
        let mut sink = Vec::new();
        runner
            .profile(Duration::from_millis(100), &mut sink)
            .await
            .unwrap();

        let profile = decode_profile(&sink);
        assert_eq!(profile.sample.len(), 3);
        for sample in &profile.sample {
            assert_eq!(sample.value, vec![1, 10_000_000]);
        }

        // exactly one start/stop pair, and the trace file is gone
        assert_eq!(runner.engine.starts.load(atomic::Ordering::Relaxed), 1);
        assert_eq!(runner.engine.stops.load(atomic::Ordering::Relaxed), 1);
        let path = runner.engine.trace_path.lock().unwrap().clone().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampling_window_matches_duration() {
        let duration = Duration::from_secs(7);
        let runner = runner(MockEngine::default(), MockReader::emitting(1));
        runner.profile(duration, Vec::new()).await.unwrap();

        let started = runner.engine.started_at.lock().unwrap().unwrap();
        let stopped = runner.engine.stopped_at.lock().unwrap().unwrap();
        // paused clock: the window is exactly the requested duration
        assert_eq!(stopped - started, duration);
    }

    #[tokio::test]
    async fn test_zero_duration_rejected_before_any_side_effect() {
        let runner = runner(MockEngine::default(), MockReader::emitting(1));
        let err = runner
            .profile(Duration::ZERO, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProfileError::InvalidDuration(_)));
        assert_eq!(runner.engine.readies.load(atomic::Ordering::Relaxed), 0);
        assert_eq!(runner.engine.starts.load(atomic::Ordering::Relaxed), 0);
        // no trace file was ever allocated
        assert_eq!(
            std::fs::read_dir(runner.workspace.path()).unwrap().count(),
            0
        );
    }

    #[tokio::test]
    async fn test_resolution_failure_stops_the_session_early() {
        struct UnresolvedEngine;
        impl ProfilerEngine for UnresolvedEngine {
            fn ensure_ready(&self) -> Result<(), AsProfError> {
                Err(AsProfError::Resolve(
                    crate::locate::ResolveError::UnsupportedPlatform {
                        os: "plan9".into(),
                        arch: "mips".into(),
                    },
                ))
            }
            fn start(&self, _: &Path) -> Result<(), AsProfError> {
                panic!("must not start after a failed resolution");
            }
            fn stop(&self) -> Result<(), AsProfError> {
                panic!("must not stop after a failed resolution");
            }
        }

        let runner = SessionRunner::new(
            UnresolvedEngine,
            MockReader::emitting(0),
            leaked_workspace(),
            leaked_lock(),
        );
        let err = runner
            .profile(Duration::from_millis(1), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProfileError::Engine(AsProfError::Resolve(
                crate::locate::ResolveError::UnsupportedPlatform { .. }
            ))
        ));
        assert_eq!(
            std::fs::read_dir(runner.workspace.path()).unwrap().count(),
            0
        );
    }

    // the trace file is released on every exit path
    #[test_case(false, false; "start ok, convert ok")]
    #[test_case(false, true; "start ok, convert fails")]
    #[test_case(true, false; "start fails")]
    #[test_case(true, true; "start fails before convert could")]
    #[tokio::test(start_paused = true)]
    async fn test_trace_file_released(fail_start: bool, fail_convert: bool) {
        let engine = MockEngine {
            fail_start,
            ..Default::default()
        };
        let reader = if fail_convert {
            MockReader::failing_after(1)
        } else {
            MockReader::emitting(1)
        };
        let runner = runner(engine, reader);
        let result = runner.profile(Duration::from_millis(50), Vec::new()).await;
        assert_eq!(result.is_err(), fail_start || fail_convert);

        let path = runner.engine.trace_path.lock().unwrap().clone().unwrap();
        assert!(!path.exists());
        assert_eq!(
            std::fs::read_dir(runner.workspace.path()).unwrap().count(),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_skips_stop_and_convert() {
        let engine = MockEngine {
            fail_start: true,
            ..Default::default()
        };
        let runner = runner(engine, MockReader::emitting(1));
        let mut sink = Vec::new();
        let err = runner
            .profile(Duration::from_millis(50), &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, ProfileError::EngineStart(_)));
        assert_eq!(runner.engine.stops.load(atomic::Ordering::Relaxed), 0);
        assert!(sink.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_failure_still_converts_the_trace() {
        let engine = MockEngine {
            fail_stop: true,
            ..Default::default()
        };
        let runner = runner(engine, MockReader::emitting(2));
        let mut sink = Vec::new();
        let err = runner
            .profile(Duration::from_millis(50), &mut sink)
            .await
            .unwrap_err();
        match err {
            ProfileError::EngineStop { convert, .. } => assert!(convert.is_none()),
            other => panic!("unexpected error: {other:?}"),
        }
        // the partial trace was converted and is readable
        assert_eq!(decode_profile(&sink).sample.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_and_convert_failures_reported_together() {
        let engine = MockEngine {
            fail_stop: true,
            ..Default::default()
        };
        let runner = runner(engine, MockReader::failing_after(1));
        let mut sink = Vec::new();
        let err = runner
            .profile(Duration::from_millis(50), &mut sink)
            .await
            .unwrap_err();
        match err {
            ProfileError::EngineStop { convert, .. } => {
                assert!(matches!(convert, Some(ConvertError::TraceRead(_))));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(sink.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_failure_leaves_no_finalized_stream() {
        let runner = runner(MockEngine::default(), MockReader::failing_after(2));
        let mut sink = Vec::new();
        let err = runner
            .profile(Duration::from_millis(50), &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, ProfileError::Convert(ConvertError::TraceRead(_))));
        assert!(sink.is_empty());
        let path = runner.engine.trace_path.lock().unwrap().clone().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_session_rejected() {
        let runner = Arc::new(runner(MockEngine::default(), MockReader::emitting(1)));

        let first = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.profile(Duration::from_secs(5), Vec::new()).await })
        };
        // let the first session reach its sampling sleep
        tokio::task::yield_now().await;
        assert_eq!(runner.engine.starts.load(atomic::Ordering::Relaxed), 1);

        let err = runner
            .profile(Duration::from_secs(5), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProfileError::SessionBusy));

        first.await.unwrap().unwrap();
        // the rejected session never touched the engine
        assert_eq!(runner.engine.starts.load(atomic::Ordering::Relaxed), 1);
        assert_eq!(runner.engine.stops.load(atomic::Ordering::Relaxed), 1);
    }

    // two controllers sharing the process-wide lock must never interleave
    // start/stop against the singleton engine
    #[tokio::test(start_paused = true)]
    async fn test_second_controller_rejected_while_first_samples() {
        let lock = leaked_lock();
        let first = Arc::new(SessionRunner::new(
            MockEngine::default(),
            MockReader::emitting(1),
            leaked_workspace(),
            lock,
        ));
        let second = SessionRunner::new(
            MockEngine::default(),
            MockReader::emitting(1),
            leaked_workspace(),
            lock,
        );

        let running = {
            let first = first.clone();
            tokio::spawn(async move { first.profile(Duration::from_secs(5), Vec::new()).await })
        };
        // let the first controller reach its sampling sleep
        tokio::task::yield_now().await;
        assert_eq!(first.engine.starts.load(atomic::Ordering::Relaxed), 1);
        assert_eq!(first.engine.stops.load(atomic::Ordering::Relaxed), 0);

        let err = second
            .profile(Duration::from_secs(5), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProfileError::SessionBusy));
        // the second controller never issued a start while the first sampled
        assert_eq!(second.engine.starts.load(atomic::Ordering::Relaxed), 0);

        running.await.unwrap().unwrap();
        assert_eq!(first.engine.stops.load(atomic::Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_sessions_both_succeed() {
        let runner = runner(MockEngine::default(), MockReader::emitting(1));
        runner
            .profile(Duration::from_millis(10), Vec::new())
            .await
            .unwrap();
        runner
            .profile(Duration::from_millis(10), Vec::new())
            .await
            .unwrap();
        assert_eq!(runner.engine.starts.load(atomic::Ordering::Relaxed), 2);
        assert_eq!(runner.engine.stops.load(atomic::Ordering::Relaxed), 2);
    }
}
