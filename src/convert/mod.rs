// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Converts a raw engine trace into a gzipped pprof profile.

use std::io::Write;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

use crate::asprof::SAMPLING_INTERVAL_NANOS;

pub(crate) mod jfr;
pub(crate) mod pprof;

pub use jfr::JfrTraceReader;

/// Error converting a raw trace into a pprof profile.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConvertError {
    /// The raw trace could not be opened or parsed.
    #[error("trace read error: {0}")]
    TraceRead(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The profile could not be serialized.
    #[error("profile encode error: {0}")]
    Encode(#[source] prost::EncodeError),
    /// The downstream sink failed while the compressed profile was written.
    #[error("sink write error: {0}")]
    SinkWrite(#[source] std::io::Error),
}

/// One CPU sample pulled out of the raw trace, frames leaf-first.
pub(crate) struct TraceSample {
    pub frames: Vec<TraceFrame>,
}

/// One stack frame of a sample.
pub(crate) struct TraceFrame {
    pub class_name: Option<String>,
    pub method_name: Option<String>,
}

impl TraceFrame {
    /// Render as `Class.method`, with placeholders for missing symbols.
    pub(crate) fn name(&self) -> String {
        format!(
            "{}.{}",
            self.class_name.as_deref().unwrap_or("<unknown>"),
            self.method_name.as_deref().unwrap_or("<unknown>")
        )
    }
}

/// The structured-sample source the pipeline pulls from. Implemented by
/// [`JfrTraceReader`] for real traces and by mocks in tests.
pub(crate) trait TraceReader: Send + Sync + 'static {
    fn read_samples(
        &self,
        trace: &Path,
        emit: &mut dyn FnMut(TraceSample),
    ) -> Result<(), ConvertError>;
}

/// Reads the completed trace at `trace`, re-encodes it as a pprof profile
/// and writes the gzipped result to `sink`.
///
/// The gzip stream is only opened once the profile has encoded cleanly: a
/// read or encode failure leaves the sink untouched, so a caller can never
/// mistake a truncated profile for a complete one because of a well-formed
/// gzip trailer.
pub(crate) fn convert<R: TraceReader, W: Write>(
    reader: &R,
    trace: &Path,
    sink: W,
) -> Result<(), ConvertError> {
    let mut builder = pprof::ProfileBuilder::new(SAMPLING_INTERVAL_NANOS);
    reader.read_samples(trace, &mut |sample| builder.add_sample(sample))?;
    tracing::debug!(samples = builder.sample_count(), "aggregated trace samples");
    let encoded = builder.finish()?;

    let mut gz = GzEncoder::new(sink, Compression::default());
    gz.write_all(&encoded).map_err(ConvertError::SinkWrite)?;
    gz.finish().map_err(ConvertError::SinkWrite)?;
    Ok(())
}
