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

use std::{fmt, path::PathBuf, str::FromStr};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// Header carrying the receiver-issued transfer id on chunk uploads.
pub const TRANSFER_ID_HEADER: &str = "X-Transfer-ID";

/// Which side of a transfer a record belongs to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Lifecycle of a single transfer attempt.
///
/// ```text
/// pending      -> transferring | failed | cancelled
/// transferring -> transferring | retrying | extracting | completed | failed | cancelled
/// retrying     -> transferring | failed | cancelled
/// extracting   -> completed | failed
/// ```
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Transferring,
    Retrying,
    Extracting,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether chunks may still be appended in this state.
    #[must_use]
    pub const fn accepts_data(self) -> bool {
        matches!(self, Self::Pending | Self::Transferring | Self::Retrying)
    }

    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use TransferStatus::{
            Cancelled, Completed, Extracting, Failed, Pending, Retrying, Transferring,
        };
        matches!(
            (self, next),
            (Pending, Transferring | Failed | Cancelled)
                | (
                    Transferring,
                    Transferring | Retrying | Extracting | Completed | Failed | Cancelled
                )
                | (Retrying, Transferring | Failed | Cancelled)
                | (Extracting, Completed | Failed)
        )
    }
}

/// Durable description of one transfer attempt, on either side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub transfer_id:  String,
    pub resume_key:   String,
    pub direction:    Direction,
    /// Receiver side: the sender's IP. Sender side: the receiver's `host:port`.
    pub peer:         String,
    pub filename:     String,
    pub total_size:   u64,
    pub content_hash: String,
    pub offset:       u64,
    pub status:       TransferStatus,
    #[serde(default)]
    pub retry_count:  u32,
    pub created_at:   i64,
    pub updated_at:   i64,
    #[serde(default)]
    pub is_archive:   bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path:  Option<PathBuf>,
}

impl TransferRecord {
    /// Bumps `updated_at` to the current time.
    pub fn touch(&mut self) { self.updated_at = Timestamp::now().as_second(); }

    /// Whether the record was last updated more than `max_age_secs` ago.
    #[must_use]
    pub fn is_expired(&self, max_age_secs: i64, now: i64) -> bool {
        now.saturating_sub(self.updated_at) > max_age_secs
    }
}

/// Ids end up in file names, so only a conservative alphabet is accepted.
#[must_use]
pub fn is_valid_transfer_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// A parsed `Content-Range: bytes <start>-<end>/<total>` header. `end` is
/// inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end:   u64,
    pub total: u64,
}

impl ContentRange {
    /// Range covering `len` bytes from `start`. `len` must be non-zero.
    #[must_use]
    pub const fn new(start: u64, len: u64, total: u64) -> Self {
        Self {
            start,
            end: start + len - 1,
            total,
        }
    }

    /// Number of bytes covered, always at least one.
    #[must_use]
    pub const fn byte_count(&self) -> u64 { self.end - self.start + 1 }
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

impl FromStr for ContentRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let spec = s
            .trim()
            .strip_prefix("bytes ")
            .ok_or_else(|| format!("Content-Range must start with 'bytes ': {s:?}"))?;
        let (range, total) = spec
            .split_once('/')
            .ok_or_else(|| format!("Content-Range is missing the total: {s:?}"))?;
        let (start, end) = range
            .split_once('-')
            .ok_or_else(|| format!("Content-Range is missing '-': {s:?}"))?;

        let parse = |v: &str| {
            v.trim()
                .parse::<u64>()
                .map_err(|_| format!("Content-Range has a non-numeric bound: {s:?}"))
        };
        let (start, end, total) = (parse(start)?, parse(end)?, parse(total)?);
        if end < start {
            return Err(format!("Content-Range end precedes start: {s:?}"));
        }
        Ok(Self { start, end, total })
    }
}

/// `POST /transfer/init` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitRequest {
    pub filename:   String,
    pub size:       i64,
    #[serde(default)]
    pub hash:       String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_id:  Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_archive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitStatus {
    Ready,
    Resuming,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitResponse {
    pub transfer_id:   String,
    pub resume_offset: u64,
    pub status:        InitStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkResponse {
    pub status:   String,
    pub received: u64,
    pub total:    u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub transfer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteResponse {
    pub status:        String,
    pub path:          String,
    pub size:          u64,
    pub hash_verified: bool,
    pub extracted:     bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStatusResponse {
    pub status: TransferStatus,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelResponse {
    pub status: TransferStatus,
}

/// `GET /status` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status:           String,
    pub active_transfers: usize,
}
