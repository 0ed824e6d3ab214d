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

use serde::Serialize;

use crate::{
    observer::{TransferEvent, TransferEventKind},
    types::{Direction, TransferStatus},
};

/// Point-in-time view of one transfer, for list rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferSnapshot {
    pub id:          String,
    pub direction:   Direction,
    pub filename:    String,
    pub peer:        String,
    pub total:       u64,
    pub transferred: u64,
    pub rate:        f64,
    pub status:      TransferStatus,
    pub retry_count: u32,
    pub error:       Option<String>,
    pub destination: Option<PathBuf>,
}

impl TransferSnapshot {
    pub(crate) fn queued(id: String, filename: String, peer: String) -> Self {
        Self {
            id,
            direction: Direction::Outgoing,
            filename,
            peer,
            total: 0,
            transferred: 0,
            rate: 0.0,
            status: TransferStatus::Pending,
            retry_count: 0,
            error: None,
            destination: None,
        }
    }

    pub(crate) fn incoming(id: String, filename: String, peer: String, total: u64) -> Self {
        Self {
            direction: Direction::Incoming,
            total,
            ..Self::queued(id, filename, peer)
        }
    }

    /// 0–100, or 0 while the size is unknown.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn progress_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.transferred as f64 / self.total as f64 * 100.0).min(100.0)
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn eta(&self) -> Option<Duration> {
        if self.status.is_terminal() {
            return None;
        }
        let remaining = self.total.saturating_sub(self.transferred);
        if remaining == 0 || self.rate <= 0.0 || !self.rate.is_finite() {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / self.rate))
    }

    /// Folds an event for this transfer into the view.
    pub(crate) fn apply(&mut self, event: &TransferEvent) {
        match &event.kind {
            TransferEventKind::Started {
                filename,
                total,
                peer,
                resumed_from,
            } => {
                filename.clone_into(&mut self.filename);
                peer.clone_into(&mut self.peer);
                self.total = *total;
                self.transferred = *resumed_from;
                self.status = TransferStatus::Transferring;
            }
            TransferEventKind::Progress { bytes, total, rate } => {
                self.transferred = *bytes;
                self.total = *total;
                self.rate = *rate;
                self.status = TransferStatus::Transferring;
            }
            TransferEventKind::Retrying { .. } => {
                self.retry_count += 1;
                self.status = TransferStatus::Retrying;
            }
            TransferEventKind::Completed {
                bytes,
                destination,
                retry_count,
            } => {
                self.transferred = *bytes;
                self.total = self.total.max(*bytes);
                self.retry_count = self.retry_count.max(*retry_count);
                self.destination.clone_from(destination);
                self.rate = 0.0;
                self.status = TransferStatus::Completed;
            }
            TransferEventKind::Failed { message, .. } => {
                self.error = Some(message.clone());
                self.rate = 0.0;
                self.status = TransferStatus::Failed;
            }
            TransferEventKind::Cancelled => {
                self.rate = 0.0;
                self.status = TransferStatus::Cancelled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: TransferEventKind) -> TransferEvent {
        TransferEvent {
            id: "j1".to_string(),
            direction: Direction::Outgoing,
            kind,
        }
    }

    #[test]
    fn folds_lifecycle() {
        let mut snap = TransferSnapshot::queued("j1".into(), "a.bin".into(), "desk".into());
        assert!(snap.progress_percent().abs() < f64::EPSILON);

        snap.apply(&event(TransferEventKind::Started {
            filename:     "a.bin".into(),
            total:        400,
            peer:         "10.0.0.2:8765".into(),
            resumed_from: 100,
        }));
        assert_eq!(snap.transferred, 100);

        snap.apply(&event(TransferEventKind::Progress {
            bytes: 200,
            total: 400,
            rate:  100.0,
        }));
        assert!((snap.progress_percent() - 50.0).abs() < f64::EPSILON);
        assert_eq!(snap.eta(), Some(Duration::from_secs(2)));

        snap.apply(&event(TransferEventKind::Retrying {
            attempt: 1,
            delay:   Duration::from_secs(1),
        }));
        assert_eq!(snap.status, TransferStatus::Retrying);

        snap.apply(&event(TransferEventKind::Completed {
            bytes:       400,
            destination: None,
            retry_count: 1,
        }));
        assert_eq!(snap.status, TransferStatus::Completed);
        assert_eq!(snap.retry_count, 1);
        assert_eq!(snap.eta(), None);
    }

    #[test]
    fn eta_needs_a_measured_rate() {
        let mut snap = TransferSnapshot::queued("j1".into(), "a.bin".into(), "desk".into());
        snap.apply(&event(TransferEventKind::Started {
            filename:     "a.bin".into(),
            total:        400,
            peer:         "desk".into(),
            resumed_from: 0,
        }));
        assert_eq!(snap.eta(), None);
    }
}
