// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The HTTP surface: an axum router exposing the profiling endpoint.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use crate::profiler::{CpuProfiler, ProfileError};

/// Query parameters of the profiling endpoint.
#[derive(Debug, Deserialize)]
pub struct ProfileParams {
    /// Seconds of CPU profile to capture. Defaults to 30, like the Go
    /// `net/http/pprof` endpoint this mimics; requests above 300 seconds
    /// are rejected.
    pub seconds: Option<u64>,
}

/// Upper bound on one request's sampling window. Sessions are serialized
/// process-wide, so an uncapped request would hold the engine (and feed 429s
/// to every other caller) for as long as it likes.
const MAX_PROFILE_SECONDS: u64 = 300;

fn validate_seconds(seconds: u64) -> Result<(), String> {
    if seconds == 0 || seconds > MAX_PROFILE_SECONDS {
        return Err(format!(
            "seconds must be between 1 and {MAX_PROFILE_SECONDS}, got {seconds}"
        ));
    }
    Ok(())
}

/// Builds a router serving `GET /debug/pprof/profile`.
///
/// ```notrust
/// curl -o profile.pb.gz 'localhost:4001/debug/pprof/profile?seconds=10'
/// ```
pub fn router(profiler: Arc<CpuProfiler>) -> Router {
    Router::new()
        .route("/debug/pprof/profile", get(handle_profile))
        .with_state(profiler)
}

async fn handle_profile(
    State(profiler): State<Arc<CpuProfiler>>,
    Query(params): Query<ProfileParams>,
) -> Result<Response, Response> {
    let seconds = params.seconds.unwrap_or(30);
    if let Err(reason) = validate_seconds(seconds) {
        return Err((StatusCode::BAD_REQUEST, reason).into_response());
    }
    tracing::info!(seconds, "profiling request received");

    let mut body = Vec::new();
    match profiler
        .profile(Duration::from_secs(seconds), &mut body)
        .await
    {
        Ok(()) => Ok((
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/octet-stream"),
                (header::CONTENT_ENCODING, "gzip"),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"profile.pb.gz\"",
                ),
            ],
            body,
        )
            .into_response()),
        Err(err) => {
            tracing::error!(?err, "profiling request failed");
            // the error text, never a stack trace
            Err((status_for(&err), err.to_string()).into_response())
        }
    }
}

fn status_for(err: &ProfileError) -> StatusCode {
    match err {
        ProfileError::InvalidDuration(_) => StatusCode::BAD_REQUEST,
        ProfileError::SessionBusy => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_bounds() {
        assert!(validate_seconds(1).is_ok());
        assert!(validate_seconds(30).is_ok());
        assert!(validate_seconds(MAX_PROFILE_SECONDS).is_ok());
        assert!(validate_seconds(0).is_err());
        assert!(validate_seconds(MAX_PROFILE_SECONDS + 1).is_err());
        assert!(validate_seconds(86_400).is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&ProfileError::InvalidDuration(Duration::ZERO)),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&ProfileError::SessionBusy),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for(&ProfileError::EngineStart(
                crate::AsProfError::AsyncProfilerError("boom".into())
            )),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
