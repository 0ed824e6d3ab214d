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

//! Resumable, integrity-checked file transfer between devices on one LAN.
//!
//! Each device runs a [`TransferCoordinator`]: it receives over a small HTTP
//! protocol and sends queued files or directories to peers announced by a
//! discovery component through [`PeerEventSink`].

pub mod archive;
pub mod config;
pub mod coordinator;
pub mod digest;
pub mod error;
pub mod observer;
pub mod peer;
pub mod receiver;
pub mod sender;
pub mod snapshot;
pub mod store;
pub mod types;

pub use config::TransferConfig;
pub use coordinator::TransferCoordinator;
pub use error::{FailureReason, Result, TransferError};
pub use observer::{
    ChannelObserver, LoggingObserver, NoopObserver, TransferEvent, TransferEventKind,
    TransferObserver,
};
pub use peer::{Peer, PeerEvent, PeerEventSink, PeerId};
pub use snapshot::TransferSnapshot;
pub use store::StateStore;
pub use types::{Direction, TransferRecord, TransferStatus};
