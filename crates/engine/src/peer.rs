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

//! Peers as seen by the engine, and the contract with the discovery
//! component that finds them.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::coordinator::EngineCommand;

/// Service type advertised and browsed on the local network.
pub const SERVICE_TYPE: &str = "_lantransfer._tcp.local.";
/// TXT record key carrying the protocol version.
pub const TXT_VERSION: &str = "version";
/// TXT record key carrying the human-readable device name.
pub const TXT_DEVICE: &str = "device";
/// Protocol version advertised under [`TXT_VERSION`].
pub const PROTOCOL_VERSION: &str = "1";

/// Discovery-assigned identity, e.g. the service instance name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self { Self(value.to_string()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct Peer {
    #[builder(into)]
    pub id:   PeerId,
    /// Display name, usually the remote device name.
    #[builder(into)]
    pub name: String,
    /// IP address or resolvable host name.
    #[builder(into)]
    pub host: String,
    pub port: u16,
}

impl Peer {
    /// `host:port`, bracketing IPv6 literals.
    #[must_use]
    pub fn endpoint(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    #[must_use]
    pub fn base_url(&self) -> String { format!("http://{}", self.endpoint()) }
}

/// Discovery notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Added(Peer),
    Removed(PeerId),
}

/// Thread-safe entry point for the discovery component.
///
/// Publishing only enqueues a message for the engine; it never touches
/// engine state, so it may be called from any thread, including ones not
/// owned by the async runtime.
#[derive(Clone)]
pub struct PeerEventSink {
    tx: UnboundedSender<EngineCommand>,
}

impl PeerEventSink {
    pub(crate) const fn new(tx: UnboundedSender<EngineCommand>) -> Self { Self { tx } }

    /// Returns `false` once the engine has stopped.
    pub fn publish(&self, event: PeerEvent) -> bool {
        self.tx.send(EngineCommand::Peer(event)).is_ok()
    }
}

/// This machine's name as shown to peers: the host name without a trailing
/// `.local`.
#[must_use]
pub fn device_name() -> String {
    let raw = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "lanxfer".to_string());
    raw.strip_suffix(".local").unwrap_or(&raw).to_string()
}
