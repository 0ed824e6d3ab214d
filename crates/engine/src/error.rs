// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{any::Any, path::PathBuf};

use axum::{Json, response::IntoResponse};
use lanxfer_error::{ErrorBody, ErrorExt, StackError, StatusCode};
use serde::{Deserialize, Serialize};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransferError {
    #[snafu(display("Request to {url} failed: {source}"))]
    Network { url: String, source: reqwest::Error },

    #[snafu(display("Peer answered {status} for {url}: {message}"))]
    HttpStatus {
        url:     String,
        status:  u16,
        code:    Option<StatusCode>,
        message: String,
    },

    #[snafu(display("Invalid request: {reason}"))]
    Validation { reason: String },

    #[snafu(display("Protocol violation: {reason}"))]
    Protocol { reason: String },

    #[snafu(display("Unknown transfer {transfer_id}"))]
    UnknownTransfer { transfer_id: String },

    #[snafu(display("Transfer {transfer_id} is still being finalized"))]
    Busy { transfer_id: String },

    #[snafu(display("Content hash mismatch: expected {expected}, got {actual}"))]
    IntegrityMismatch { expected: String, actual: String },

    #[snafu(display("Peer rejected the assembled content: {message}"))]
    IntegrityRejected { message: String },

    #[snafu(display("Cannot read source {}: {source}", path.display()))]
    Resource {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Cannot archive {}: {source}", path.display()))]
    Archive {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Peer {peer} is not reachable"))]
    PeerUnavailable { peer: String },

    #[snafu(display("Transfer cancelled"))]
    Cancelled,

    #[snafu(display("Transfer interrupted by shutdown"))]
    Interrupted,

    #[snafu(display("Storage error at {}: {source}", path.display()))]
    Storage {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Corrupt state document {}: {source}", path.display()))]
    StateCodec {
        path:   PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("Background task failed: {source}"))]
    TaskJoin { source: tokio::task::JoinError },

    #[snafu(display("Invalid configuration: {reason}"))]
    InvalidConfig { reason: String },

    #[snafu(display("Failed to start the receiving endpoint: {source}"))]
    Server { source: lanxfer_server::Error },

    #[snafu(display("Transfer engine is not running"))]
    EngineStopped,
}

/// Coarse failure classification handed to observers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureReason {
    /// Transient network trouble that outlived the retry budget.
    Network,
    /// Final digest did not match; resending the same bytes will not help.
    Integrity,
    Protocol,
    /// Source missing or unreadable.
    Resource,
    PeerUnavailable,
    Cancelled,
    Storage,
}

impl TransferError {
    #[must_use]
    pub const fn failure_reason(&self) -> FailureReason {
        match self {
            Self::Network { .. } | Self::HttpStatus { .. } => FailureReason::Network,
            Self::IntegrityMismatch { .. } | Self::IntegrityRejected { .. } => {
                FailureReason::Integrity
            }
            Self::Validation { .. }
            | Self::Protocol { .. }
            | Self::UnknownTransfer { .. }
            | Self::Busy { .. } => FailureReason::Protocol,
            Self::Resource { .. } | Self::Archive { .. } | Self::InvalidConfig { .. } => {
                FailureReason::Resource
            }
            Self::PeerUnavailable { .. } => FailureReason::PeerUnavailable,
            Self::Cancelled | Self::Interrupted => FailureReason::Cancelled,
            Self::Storage { .. }
            | Self::StateCodec { .. }
            | Self::TaskJoin { .. }
            | Self::Server { .. }
            | Self::EngineStopped => FailureReason::Storage,
        }
    }

    /// Whether repeating the same chunk request may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::HttpStatus { .. })
    }
}

impl StackError for TransferError {
    fn debug_fmt(&self, layer: usize, buf: &mut Vec<String>) {
        buf.push(format!("{layer}: {self}"));
    }

    fn next(&self) -> Option<&dyn StackError> { None }
}

impl ErrorExt for TransferError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } | Self::InvalidConfig { .. } => StatusCode::InvalidArgument,
            Self::Protocol { .. } => StatusCode::ProtocolViolation,
            Self::UnknownTransfer { .. } => StatusCode::NotFound,
            Self::IntegrityMismatch { .. } | Self::IntegrityRejected { .. } => {
                StatusCode::IntegrityMismatch
            }
            Self::PeerUnavailable { .. }
            | Self::Busy { .. }
            | Self::EngineStopped
            | Self::Interrupted => StatusCode::Unavailable,
            Self::Cancelled => StatusCode::Conflict,
            Self::Network { .. } | Self::HttpStatus { .. } => StatusCode::Unknown,
            Self::Resource { .. }
            | Self::Archive { .. }
            | Self::Storage { .. }
            | Self::StateCodec { .. }
            | Self::TaskJoin { .. }
            | Self::Server { .. } => StatusCode::Internal,
        }
    }

    fn as_any(&self) -> &dyn Any { self as _ }
}

impl IntoResponse for TransferError {
    fn into_response(self) -> axum::response::Response {
        let code = self.status_code();
        if matches!(code, StatusCode::Internal | StatusCode::Unknown) {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        let body = Json(ErrorBody {
            error: self.output_msg(),
            code,
        });
        (code.http_status(), body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_wire_status() {
        let err = TransferError::Protocol {
            reason: "offset mismatch".to_string(),
        };
        assert_eq!(err.status_code().http_status(), 400);
        assert_eq!(err.failure_reason(), FailureReason::Protocol);

        let err = TransferError::UnknownTransfer {
            transfer_id: "x".to_string(),
        };
        assert_eq!(err.status_code().http_status(), 404);

        let err = TransferError::IntegrityMismatch {
            expected: "a".to_string(),
            actual:   "b".to_string(),
        };
        assert_eq!(err.status_code().http_status(), 422);
        assert_eq!(err.failure_reason(), FailureReason::Integrity);
        assert!(!err.is_transient());

        let err = TransferError::Busy {
            transfer_id: "x".to_string(),
        };
        assert_eq!(err.status_code().http_status(), 503);
        assert!(err.status_code().is_retryable());
    }

    #[test]
    fn internal_errors_hide_local_details() {
        let err = TransferError::Storage {
            path:   PathBuf::from("/home/someone/.lantransfer/state"),
            source: std::io::Error::other("disk full"),
        };
        assert_eq!(err.status_code().http_status(), 500);
        assert!(!err.output_msg().contains("/home/someone"));
    }

    #[test]
    fn protocol_messages_reach_the_peer() {
        let err = TransferError::Protocol {
            reason: "chunk starts at 10, expected 0".to_string(),
        };
        assert!(err.output_msg().contains("expected 0"));
    }
}
