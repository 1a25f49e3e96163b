// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;
use std::sync::{Arc, OnceLock};

// these bindings copied from asprof.h
// in sync with
// https://github.com/async-profiler/async-profiler/blob/bd439d8a0421a821b0c17e5ca74e363103c9cf67/src/asprof.h

#[allow(non_camel_case_types)]
pub type asprof_error_t = *const std::ffi::c_char;
#[allow(non_camel_case_types)]
pub type asprof_writer_t = Option<unsafe extern "C" fn(buf: *const std::ffi::c_char, size: usize)>;

pub(crate) struct AsyncProfiler {
    pub(crate) asprof_init: libloading::Symbol<'static, unsafe extern "C" fn()>,
    pub(crate) asprof_execute: libloading::Symbol<
        'static,
        unsafe extern "C" fn(
            command: *const std::ffi::c_char,
            output_callback: asprof_writer_t,
        ) -> asprof_error_t,
    >,
    pub(crate) asprof_error_str: libloading::Symbol<
        'static,
        unsafe extern "C" fn(asprof_error_t) -> *const std::ffi::c_char,
    >,
}

// The library handle is leaked on purpose: async-profiler starts threads and
// installs signal handlers, so dlclose'ing it is probably a bad idea. Loading
// happens at most once per process, from the path the locator resolved.
static ASYNC_PROFILER: OnceLock<Result<AsyncProfiler, Arc<libloading::Error>>> = OnceLock::new();

pub(crate) fn async_profiler(
    library_path: &Path,
) -> Result<&'static AsyncProfiler, Arc<libloading::Error>> {
    ASYNC_PROFILER
        .get_or_init(|| {
            // safety: correct use of dlopen
            unsafe {
                let lib = Box::leak(Box::new(libloading::Library::new(library_path)?));
                Ok(AsyncProfiler {
                    asprof_init: lib.get(b"asprof_init")?,
                    asprof_execute: lib.get(b"asprof_execute")?,
                    asprof_error_str: lib.get(b"asprof_error_str")?,
                })
            }
        })
        .as_ref()
        .map_err(Arc::clone)
}
