//! Write-path validation.
//!
//! Every function here is pure and runs before a command reaches the stream
//! actor, so a rejected write never leaves partial state behind.

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use durastream_types::headers;

use crate::{error::ApiError, types::is_json_content_type};

/// Largest single append accepted unless configured otherwise.
pub const DEFAULT_MAX_APPEND_BYTES: usize = 4 * 1024 * 1024;

/// Check a declared `Content-Length` against the body actually received.
///
/// A missing header passes: the length is only known once the body is read.
pub fn validate_content_length(header: Option<&str>, actual: usize) -> Result<(), ApiError> {
    let Some(raw) = header else {
        return Ok(());
    };

    let declared: u64 = raw.trim().parse().map_err(|_| {
        ApiError::InvalidRequest(format!(
            "Content-Length must be a non-negative integer, got {raw:?}"
        ))
    })?;

    if declared != actual as u64 {
        return Err(ApiError::InvalidRequest(format!(
            "Content-Length mismatch: header declares {declared} bytes but body has {actual}"
        )));
    }
    Ok(())
}

/// Reject bodies larger than `limit`.
pub fn validate_body_size(actual: usize, limit: usize) -> Result<(), ApiError> {
    if actual > limit {
        return Err(ApiError::PayloadTooLarge { limit, actual });
    }
    Ok(())
}

/// Content checks for an append to a stream of `stream_content_type`.
pub fn validate_append_body(body: &[u8], stream_content_type: &str) -> Result<(), ApiError> {
    if body.is_empty() {
        return Err(ApiError::InvalidRequest(
            "Empty body not allowed".to_string(),
        ));
    }

    if is_json_content_type(stream_content_type) {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| ApiError::InvalidRequest(format!("Invalid JSON body: {e}")))?;
        if value.as_array().is_some_and(|items| items.is_empty()) {
            return Err(ApiError::InvalidRequest(
                "Empty arrays are not allowed".to_string(),
            ));
        }
    }
    Ok(())
}

/// Stream names are path-like: non-empty `/`-separated segments without
/// `.` or `..` components.
pub fn validate_stream_id(id: &str) -> Result<(), ApiError> {
    let valid = !id.is_empty()
        && id.len() <= 512
        && id
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
        && !id.chars().any(|c| c.is_control());
    if !valid {
        return Err(ApiError::InvalidRequest(format!("Invalid stream id {id:?}")));
    }
    Ok(())
}

/// TTL settings parsed from a create request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TtlHeaders {
    pub ttl_seconds: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Parse `Stream-TTL` / `Stream-Expires-At`; they are mutually exclusive.
pub fn validate_ttl_headers(headers: &HeaderMap) -> Result<TtlHeaders, ApiError> {
    let ttl_seconds = match header_str(headers, headers::STREAM_TTL)? {
        None => None,
        Some(raw) => Some(raw.trim().parse::<u64>().map_err(|_| {
            ApiError::InvalidRequest(format!(
                "Stream-TTL must be a positive integer, got {raw:?}"
            ))
        })?),
    };

    let expires_at = match header_str(headers, headers::STREAM_EXPIRES_AT)? {
        None => None,
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw.trim())
                .map_err(|_| {
                    ApiError::InvalidRequest(format!(
                        "Stream-Expires-At must be an RFC 3339 timestamp, got {raw:?}"
                    ))
                })?
                .with_timezone(&Utc),
        ),
    };

    if ttl_seconds.is_some() && expires_at.is_some() {
        return Err(ApiError::InvalidRequest(
            "Cannot specify both Stream-TTL and Stream-Expires-At".to_string(),
        ));
    }
    // Either would create a stream that is already expired.
    if ttl_seconds == Some(0) {
        return Err(ApiError::InvalidRequest(
            "Stream-TTL must be at least 1 second".to_string(),
        ));
    }
    if let Some(at) = expires_at
        && at <= Utc::now()
    {
        return Err(ApiError::InvalidRequest(format!(
            "Stream-Expires-At {} is not in the future",
            at.to_rfc3339()
        )));
    }

    Ok(TtlHeaders {
        ttl_seconds,
        expires_at,
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, ApiError> {
    headers
        .get(name)
        .map(|v| {
            v.to_str()
                .map_err(|_| ApiError::InvalidRequest(format!("{name} is not valid ASCII")))
        })
        .transpose()
}
