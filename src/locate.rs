// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Locates the platform-specific `libasyncProfiler` shared object.
//!
//! Release packaging may embed the shared objects directly into the binary;
//! a plain source build carries none and falls back to a conventional
//! on-disk layout under the working directory.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

/// async-profiler release the fallback directory layout is named after.
const ENGINE_VERSION: &str = "2.8.3";

const LIBRARY_BASE_NAME: &str = "libasyncProfiler";

/// Supported (os, arch) pairs and the library file-name suffix each maps to.
///
/// The suffixes are the compatibility contract with the packaging step that
/// embeds the artifacts: an embedded entry for suffix `S` holds the bytes of
/// `libasyncProfiler{S}`.
const SUPPORTED_PLATFORMS: &[((&str, &str), &str)] = &[
    (("linux", "x86_64"), "-linux-x64.so"),
    (("linux", "aarch64"), "-linux-arm64.so"),
    (("macos", "x86_64"), "-macos.so"),
    (("macos", "aarch64"), "-macos.so"),
];

/// Engine libraries inlined by the release packaging step. A source build
/// has none and resolves through the on-disk fallback instead.
static EMBEDDED_LIBRARIES: &[(&str, &[u8])] = &[];

/// Error resolving the engine library for this platform.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ResolveError {
    /// No engine artifact exists for this OS/CPU combination. Fatal for the
    /// process; retrying cannot help.
    #[error("unsupported platform: {os}/{arch}")]
    UnsupportedPlatform {
        /// Operating system name, as reported by the runtime.
        os: String,
        /// CPU architecture name, as reported by the runtime.
        arch: String,
    },
    /// The embedded artifact could not be staged on disk.
    #[error("unable to stage engine library: {0}")]
    Extraction(#[source] Arc<io::Error>),
    /// The process-private workspace directory could not be created.
    #[error("unable to create workspace directory: {0}")]
    Workspace(#[source] Arc<io::Error>),
}

fn library_suffix(os: &str, arch: &str) -> Result<&'static str, ResolveError> {
    SUPPORTED_PLATFORMS
        .iter()
        .find(|((o, a), _)| *o == os && *a == arch)
        .map(|(_, suffix)| *suffix)
        .ok_or_else(|| ResolveError::UnsupportedPlatform {
            os: os.to_owned(),
            arch: arch.to_owned(),
        })
}

fn resolve_for(
    embedded: &[(&str, &[u8])],
    os: &str,
    arch: &str,
    workspace: &Path,
) -> Result<PathBuf, ResolveError> {
    let suffix = library_suffix(os, arch)?;

    if let Some((_, bytes)) = embedded.iter().find(|(s, _)| *s == suffix) {
        // Overwrite a stale copy from a previous resolution.
        let staged = workspace.join(format!("{LIBRARY_BASE_NAME}.so"));
        std::fs::write(&staged, bytes)
            .map_err(|e| ResolveError::Extraction(Arc::new(e)))?;
        tracing::debug!("staged embedded engine library at {staged:?}");
        return Ok(staged);
    }

    // No embedded artifact: fall back to the conventional layout under the
    // working directory. The path is deliberately not checked for existence;
    // dlopen reports a missing library when the engine is first used.
    let fallback = std::env::current_dir()
        .map_err(|e| ResolveError::Extraction(Arc::new(e)))?
        .join(format!("async-profiler-{ENGINE_VERSION}"))
        .join(format!("{LIBRARY_BASE_NAME}{suffix}"));
    tracing::debug!("no embedded engine library, falling back to {fallback:?}");
    Ok(fallback)
}

/// Resolves the engine library path for the current platform, staging the
/// embedded artifact into `workspace` if one is present.
pub(crate) fn resolve(workspace: &Path) -> Result<PathBuf, ResolveError> {
    resolve_for(
        EMBEDDED_LIBRARIES,
        std::env::consts::OS,
        std::env::consts::ARCH,
        workspace,
    )
}
