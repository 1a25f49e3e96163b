// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Reads CPU samples out of the raw JFR trace the engine writes.

use std::fs::File;
use std::path::Path;

use jfrs::reader::event::Accessor;
use jfrs::reader::type_descriptor::TypeDescriptor;
use jfrs::reader::value_descriptor::ValueDescriptor;
use jfrs::reader::JfrReader;

use super::{ConvertError, TraceFrame, TraceReader, TraceSample};

/// Trace reader for the engine's native JFR output.
#[derive(Debug, Default)]
pub struct JfrTraceReader {}

impl JfrTraceReader {
    /// Creates a reader; one instance serves any number of traces.
    pub fn new() -> Self {
        Self {}
    }
}

fn trace_read(err: impl std::error::Error + Send + Sync + 'static) -> ConvertError {
    ConvertError::TraceRead(Box::new(err))
}

/// Class id and field indices for the JFR event types a CPU profile carries.
struct SampleTypeInfo {
    // jdk.ExecutionSample
    execution_sample: Option<i64>,
    stacktrace_index: usize,
}

impl SampleTypeInfo {
    fn new() -> Self {
        Self {
            execution_sample: None,
            stacktrace_index: !0,
        }
    }

    fn load_type_descriptor(&mut self, ty: &TypeDescriptor) {
        if ty.name() == "jdk.ExecutionSample" {
            self.execution_sample = Some(ty.class_id);
            for (i, field) in ty.fields.iter().enumerate() {
                if field.name() == "stackTrace" {
                    self.stacktrace_index = i;
                }
            }
        }
    }
}

fn symbol_to_string(s: Accessor<'_>) -> Option<&str> {
    if let Some(sym) = s.get_field("string") {
        if let Ok(val) = sym.value.try_into() {
            return Some(val);
        }
    }
    None
}

fn resolve_stack_trace(trace: Accessor<'_>) -> Vec<TraceFrame> {
    let mut frames = vec![];
    if let Some(frame_list) = trace.get_field("frames") {
        if let Some(frame_list) = frame_list.as_iter() {
            // JFR stack traces are leaf-first, which is also the order
            // pprof sample location ids use
            for frame in frame_list {
                let mut class_name = None;
                let mut method_name = None;
                if let Some(method) = frame.get_field("method") {
                    if let Some(class) = method.get_field("type") {
                        if let Some(name) = class.get_field("name") {
                            class_name = symbol_to_string(name).map(|x| x.to_owned());
                        }
                    }
                    if let Some(name) = method.get_field("name") {
                        method_name = symbol_to_string(name).map(|x| x.to_owned());
                    }
                }
                frames.push(TraceFrame {
                    class_name,
                    method_name,
                });
            }
        }
    }
    frames
}

impl TraceReader for JfrTraceReader {
    fn read_samples(
        &self,
        trace: &Path,
        emit: &mut dyn FnMut(TraceSample),
    ) -> Result<(), ConvertError> {
        let mut file = File::open(trace).map_err(trace_read)?;
        let mut reader = JfrReader::new(&mut file);
        for chunk in reader.chunks() {
            let (mut chunk_reader, chunk) = chunk.map_err(trace_read)?;
            let mut types = SampleTypeInfo::new();
            for ty in chunk.metadata.type_pool.get_types() {
                types.load_type_descriptor(ty);
            }
            for event in chunk_reader.events_from_offset(&chunk, 0) {
                let event = event.map_err(trace_read)?;
                if Some(event.class.class_id) != types.execution_sample {
                    continue;
                }
                if let ValueDescriptor::Object(o) = event.value().value {
                    if let Some(stack) = o.fields.get(types.stacktrace_index) {
                        emit(TraceSample {
                            frames: resolve_stack_trace(Accessor::new(&chunk, stack)),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_garbage_trace_is_a_read_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.jfr");
        std::fs::write(&path, b"definitely not a flight recording").unwrap();
        let mut seen = 0;
        let err = JfrTraceReader::new()
            .read_samples(&path, &mut |_| seen += 1)
            .unwrap_err();
        assert!(matches!(err, ConvertError::TraceRead(_)));
        assert_eq!(seen, 0);
    }

    #[test]
    fn test_missing_trace_is_a_read_failure() {
        let err = JfrTraceReader::new()
            .read_samples(Path::new("/nonexistent/profile.jfr"), &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, ConvertError::TraceRead(_)));
    }
}
