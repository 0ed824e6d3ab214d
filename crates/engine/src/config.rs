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

use std::{path::PathBuf, time::Duration};

use bon::Builder;
use lanxfer_base::readable_size::ReadableSize;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::ensure;

use crate::error::{InvalidConfigSnafu, Result};

/// Default listening port of the receiving endpoint.
pub const DEFAULT_PORT: u16 = 8765;

/// Name of the per-user data directory under `$HOME`.
pub const DATA_DIR_NAME: &str = ".lantransfer";

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(DATA_DIR_NAME)
}

/// Settings consumed by the transfer engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SmartDefault, Builder)]
#[serde(default)]
pub struct TransferConfig {
    /// Payload bytes per chunk request. Fixed for the lifetime of a transfer.
    #[default(ReadableSize::mb(1))]
    #[builder(default = ReadableSize::mb(1))]
    pub chunk_size: ReadableSize,

    /// Interface the receiving endpoint binds to.
    #[default = "0.0.0.0"]
    #[builder(into, default = "0.0.0.0".to_string())]
    pub host: String,

    /// Port 0 lets the OS choose; the bound address is reported by `start`.
    #[default(DEFAULT_PORT)]
    #[builder(default = DEFAULT_PORT)]
    pub port: u16,

    /// Applied to every outgoing HTTP request.
    #[default(Duration::from_secs(30))]
    #[builder(default = Duration::from_secs(30))]
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Retries per chunk after the first attempt.
    #[default = 5]
    #[builder(default = 5)]
    pub max_retries: usize,

    #[default(Duration::from_secs(1))]
    #[builder(default = Duration::from_secs(1))]
    #[serde(with = "humantime_serde")]
    pub retry_initial_delay: Duration,

    #[default(Duration::from_secs(30))]
    #[builder(default = Duration::from_secs(30))]
    #[serde(with = "humantime_serde")]
    pub retry_max_delay: Duration,

    /// Records untouched for longer than this are pruned and cannot resume.
    #[default(Duration::from_secs(24 * 60 * 60))]
    #[builder(default = Duration::from_secs(24 * 60 * 60))]
    #[serde(with = "humantime_serde")]
    pub state_expiry: Duration,

    #[default(Duration::from_secs(60 * 60))]
    #[builder(default = Duration::from_secs(60 * 60))]
    #[serde(with = "humantime_serde")]
    pub prune_interval: Duration,

    /// Root for the state store, temporary archives and (by default)
    /// downloads.
    #[default(default_data_dir())]
    #[builder(into, default = default_data_dir())]
    pub data_dir: PathBuf,

    /// Where completed transfers land. Defaults to `<data_dir>/downloads`.
    #[builder(into)]
    pub download_dir: Option<PathBuf>,
}

impl TransferConfig {
    #[must_use]
    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("downloads"))
    }

    #[must_use]
    pub fn state_dir(&self) -> PathBuf { self.data_dir.join("state") }

    /// Scratch space for archives built from directory sources.
    #[must_use]
    pub fn outbox_dir(&self) -> PathBuf { self.data_dir.join("outbox") }

    #[must_use]
    pub fn bind_address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Request body limit: two chunks leaves room for framing overhead.
    #[must_use]
    pub const fn max_body_size(&self) -> ReadableSize {
        ReadableSize(self.chunk_size.as_bytes().saturating_mul(2))
    }

    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn state_expiry_secs(&self) -> i64 { self.state_expiry.as_secs() as i64 }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.chunk_size.as_bytes() > 0,
            InvalidConfigSnafu {
                reason: "chunk_size must be positive",
            }
        );
        ensure!(
            self.retry_initial_delay <= self.retry_max_delay,
            InvalidConfigSnafu {
                reason: "retry_initial_delay must not exceed retry_max_delay",
            }
        );
        ensure!(
            !self.prune_interval.is_zero(),
            InvalidConfigSnafu {
                reason: "prune_interval must be positive",
            }
        );
        Ok(())
    }
}
