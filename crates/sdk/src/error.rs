use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur talking to a durable streams server
#[derive(Error, Debug)]
pub enum ClientError {
    /// The server answered with an error status
    #[error("Server returned {status} ({code}): {message}")]
    Status {
        status: StatusCode,
        code: String,
        message: String,
    },

    /// A response was missing a header the protocol requires
    #[error("Missing response header: {0}")]
    MissingHeader(&'static str),

    /// Malformed offset in a response or argument
    #[error(transparent)]
    Offset(#[from] durastream_types::MalformedOffset),

    /// Connection error (failed to open an SSE stream)
    #[error("Connection error: {0}")]
    Connection(String),

    /// HTTP error from reqwest
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Follower stopped
    #[error("Reader closed")]
    Closed,
}

impl ClientError {
    /// HTTP status of a server-side failure.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            ClientError::Http(e) => e.status(),
            _ => None,
        }
    }

    /// Whether the stream (or the requested instance of it) is gone.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }

    /// Build from an error response body of the form
    /// `{"error": {"code": .., "message": ..}}`.
    pub(crate) fn from_body(status: StatusCode, body: &[u8]) -> Self {
        #[derive(Deserialize)]
        struct Envelope {
            error: Detail,
        }
        #[derive(Deserialize)]
        struct Detail {
            code: String,
            message: String,
        }

        match serde_json::from_slice::<Envelope>(body) {
            Ok(Envelope { error }) => ClientError::Status {
                status,
                code: error.code,
                message: error.message,
            },
            Err(_) => ClientError::Status {
                status,
                code: "unknown".to_string(),
                message: String::from_utf8_lossy(body).into_owned(),
            },
        }
    }
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_body_parses_envelope() {
        let err = ClientError::from_body(
            StatusCode::CONFLICT,
            br#"{"error":{"code":"already_exists","message":"content type differs"}}"#,
        );
        match err {
            ClientError::Status { status, code, .. } => {
                assert_eq!(status, StatusCode::CONFLICT);
                assert_eq!(code, "already_exists");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_from_body_keeps_plain_text() {
        let err = ClientError::from_body(StatusCode::BAD_GATEWAY, b"upstream down");
        assert_eq!(err.status(), Some(StatusCode::BAD_GATEWAY));
        assert!(err.to_string().contains("upstream down"));
        assert!(!err.is_not_found());
    }
}
