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

//! Lifecycle notifications for whoever renders transfers.

use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::{error::FailureReason, types::Direction};

/// One lifecycle step of one transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferEvent {
    /// Job id for outgoing sends, transfer id for incoming ones.
    pub id:        String,
    pub direction: Direction,
    pub kind:      TransferEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEventKind {
    Started {
        filename:     String,
        total:        u64,
        peer:         String,
        resumed_from: u64,
    },
    Progress {
        bytes: u64,
        total: u64,
        /// Bytes per second over the most recent measurement window.
        rate:  f64,
    },
    Retrying {
        attempt: u32,
        delay:   Duration,
    },
    Completed {
        bytes:       u64,
        /// Final location on the receiving side.
        destination: Option<PathBuf>,
        retry_count: u32,
    },
    Failed {
        reason:  FailureReason,
        message: String,
    },
    Cancelled,
}

/// Receives every event, always from the engine's own task.
///
/// Implementations must not block; hand work off to another task or thread.
pub trait TransferObserver: Send + Sync + 'static {
    fn on_event(&self, event: &TransferEvent);
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl TransferObserver for NoopObserver {
    fn on_event(&self, _event: &TransferEvent) {}
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: UnboundedSender<TransferEvent>,
}

impl ChannelObserver {
    #[must_use]
    pub fn new() -> (Self, UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TransferObserver for ChannelObserver {
    fn on_event(&self, event: &TransferEvent) { let _ = self.tx.send(event.clone()); }
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl TransferObserver for LoggingObserver {
    fn on_event(&self, event: &TransferEvent) {
        use indicatif::HumanBytes;

        let (id, direction) = (&event.id, event.direction);
        match &event.kind {
            TransferEventKind::Started {
                filename,
                total,
                peer,
                resumed_from,
            } => tracing::info!(%id, %direction, %filename, %peer, size = %HumanBytes(*total), resumed_from, "transfer started"),
            TransferEventKind::Progress { bytes, total, rate } => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let speed = HumanBytes(rate.max(0.0) as u64);
                tracing::debug!(%id, %direction, done = %HumanBytes(*bytes), size = %HumanBytes(*total), %speed, "progress");
            }
            TransferEventKind::Retrying { attempt, delay } => {
                tracing::warn!(%id, %direction, attempt, ?delay, "retrying chunk");
            }
            TransferEventKind::Completed {
                bytes, destination, ..
            } => tracing::info!(%id, %direction, size = %HumanBytes(*bytes), destination = ?destination, "transfer completed"),
            TransferEventKind::Failed { reason, message } => {
                tracing::warn!(%id, %direction, %reason, %message, "transfer failed");
            }
            TransferEventKind::Cancelled => tracing::info!(%id, %direction, "transfer cancelled"),
        }
    }
}

/// Throughput over windows of at least [`RateMeter::WINDOW`].
#[derive(Debug, Clone)]
pub struct RateMeter {
    window_start: Instant,
    window_bytes: u64,
    rate:         f64,
}

impl Default for RateMeter {
    fn default() -> Self { Self::new() }
}

impl RateMeter {
    pub const WINDOW: Duration = Duration::from_millis(500);

    #[must_use]
    pub fn new() -> Self {
        Self {
            window_start: Instant::now(),
            window_bytes: 0,
            rate:         0.0,
        }
    }

    /// Accounts `bytes` and returns the latest rate estimate.
    #[allow(clippy::cast_precision_loss)]
    pub fn record(&mut self, bytes: u64) -> f64 {
        self.window_bytes += bytes;
        let elapsed = self.window_start.elapsed();
        if elapsed >= Self::WINDOW {
            self.rate = self.window_bytes as f64 / elapsed.as_secs_f64();
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }
        self.rate
    }

    #[must_use]
    pub const fn rate(&self) -> f64 { self.rate }
}
