// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The subset of the pprof `profile.proto` schema this crate emits, plus a
//! builder that aggregates raw stack samples into an encoded profile.

use std::collections::HashMap;
use std::time::SystemTime;

use prost::Message;

use super::{ConvertError, TraceSample};

#[derive(Clone, PartialEq, ::prost::Message)]
pub(crate) struct Profile {
    #[prost(message, repeated, tag = "1")]
    pub sample_type: Vec<ValueType>,
    #[prost(message, repeated, tag = "2")]
    pub sample: Vec<Sample>,
    #[prost(message, repeated, tag = "4")]
    pub location: Vec<Location>,
    #[prost(message, repeated, tag = "5")]
    pub function: Vec<Function>,
    #[prost(string, repeated, tag = "6")]
    pub string_table: Vec<String>,
    #[prost(int64, tag = "9")]
    pub time_nanos: i64,
    #[prost(message, optional, tag = "11")]
    pub period_type: Option<ValueType>,
    #[prost(int64, tag = "12")]
    pub period: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub(crate) struct ValueType {
    #[prost(int64, tag = "1")]
    pub r#type: i64,
    #[prost(int64, tag = "2")]
    pub unit: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub(crate) struct Sample {
    #[prost(uint64, repeated, tag = "1")]
    pub location_id: Vec<u64>,
    #[prost(int64, repeated, tag = "2")]
    pub value: Vec<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub(crate) struct Location {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(message, repeated, tag = "4")]
    pub line: Vec<Line>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub(crate) struct Line {
    #[prost(uint64, tag = "1")]
    pub function_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub(crate) struct Function {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(int64, tag = "2")]
    pub name: i64,
    #[prost(int64, tag = "3")]
    pub system_name: i64,
}

/// Interns strings into the profile string table. Index 0 is always the
/// empty string, as the pprof format requires.
struct StringTable {
    table: Vec<String>,
    index: HashMap<String, i64>,
}

impl StringTable {
    fn new() -> Self {
        let mut table = Self {
            table: Vec::new(),
            index: HashMap::new(),
        };
        table.intern("");
        table
    }

    fn intern(&mut self, s: &str) -> i64 {
        if let Some(&id) = self.index.get(s) {
            return id;
        }
        let id = self.table.len() as i64;
        self.table.push(s.to_owned());
        self.index.insert(s.to_owned(), id);
        id
    }
}

/// Accumulates trace samples and emits the encoded pprof profile.
///
/// Identical stacks fold into one pprof sample carrying a count and the CPU
/// time it represents (count times the sampling period).
pub(crate) struct ProfileBuilder {
    strings: StringTable,
    functions: HashMap<String, u64>,
    locations: Vec<Location>,
    sample_index: HashMap<Vec<u64>, usize>,
    samples: Vec<Sample>,
    period_nanos: i64,
}

impl ProfileBuilder {
    pub(crate) fn new(period_nanos: u64) -> Self {
        Self {
            strings: StringTable::new(),
            functions: HashMap::new(),
            locations: Vec::new(),
            sample_index: HashMap::new(),
            samples: Vec::new(),
            period_nanos: period_nanos as i64,
        }
    }

    fn location_for(&mut self, name: &str) -> u64 {
        if let Some(&id) = self.functions.get(name) {
            return id;
        }
        let name_index = self.strings.intern(name);
        // one function and one location per distinct frame name; ids are
        // 1-based per the pprof format
        let id = self.locations.len() as u64 + 1;
        self.functions.insert(name.to_owned(), id);
        self.locations.push(Location {
            id,
            line: vec![Line { function_id: id }],
        });
        id
    }

    /// Folds one raw sample (frames leaf-first) into the profile.
    pub(crate) fn add_sample(&mut self, sample: TraceSample) {
        let location_ids: Vec<u64> = sample
            .frames
            .iter()
            .map(|frame| self.location_for(&frame.name()))
            .collect();
        match self.sample_index.get(&location_ids) {
            Some(&at) => {
                self.samples[at].value[0] += 1;
                self.samples[at].value[1] += self.period_nanos;
            }
            None => {
                self.sample_index
                    .insert(location_ids.clone(), self.samples.len());
                self.samples.push(Sample {
                    location_id: location_ids,
                    value: vec![1, self.period_nanos],
                });
            }
        }
    }

    pub(crate) fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Serializes the accumulated profile.
    pub(crate) fn finish(mut self) -> Result<Vec<u8>, ConvertError> {
        let samples_unit = ValueType {
            r#type: self.strings.intern("samples"),
            unit: self.strings.intern("count"),
        };
        let cpu_unit = ValueType {
            r#type: self.strings.intern("cpu"),
            unit: self.strings.intern("nanoseconds"),
        };
        let function = self
            .functions
            .iter()
            .map(|(name, &id)| Function {
                id,
                name: self.strings.index[name.as_str()],
                system_name: self.strings.index[name.as_str()],
            })
            .collect();
        let time_nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        let profile = Profile {
            sample_type: vec![samples_unit, cpu_unit.clone()],
            sample: self.samples,
            location: self.locations,
            function,
            string_table: self.strings.table,
            time_nanos,
            period_type: Some(cpu_unit),
            period: self.period_nanos,
        };
        let mut buf = Vec::with_capacity(profile.encoded_len());
        profile.encode(&mut buf).map_err(ConvertError::Encode)?;
        Ok(buf)
    }
}
