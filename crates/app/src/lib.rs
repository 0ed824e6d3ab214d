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

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bon::Builder;
use lanxfer_common_telemetry::LoggingOptions;
use lanxfer_engine::{TransferConfig, TransferCoordinator, TransferError, TransferObserver};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("failed to read config file {}", path.display()))]
    ReadConfig {
        path:   PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("invalid config file {}", path.display()))]
    ParseConfig {
        path:   PathBuf,
        source: toml::de::Error,
    },
    #[snafu(transparent)]
    Engine { source: TransferError },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Everything a `lanxfer` process can be configured with.
///
/// ```toml
/// [engine]
/// port = 8765
/// chunk_size = "1MiB"
/// state_expiry = "24h"
///
/// [logging]
/// level = "info,lanxfer_engine=debug"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, Builder)]
#[serde(default)]
pub struct AppConfig {
    #[builder(default)]
    pub engine:  TransferConfig,
    #[builder(default)]
    pub logging: LoggingOptions,
}

impl AppConfig {
    /// Reads a TOML file; missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).context(ReadConfigSnafu { path })?;
        toml::from_str(&text).context(ParseConfigSnafu { path })
    }

    #[must_use]
    pub fn open(self, observer: impl TransferObserver) -> App {
        let engine = TransferCoordinator::new(self.engine.clone(), observer);
        App {
            config: self,
            engine,
            running: Arc::default(),
            cancellation_token: CancellationToken::new(),
        }
    }
}

/// Lets other tasks observe and end a running [`App`].
#[derive(Clone)]
pub struct AppHandle {
    running:            Arc<AtomicBool>,
    cancellation_token: CancellationToken,
}

impl AppHandle {
    /// Asks [`App::run`] to stop the engine and return.
    pub fn shutdown(&self) {
        info!("initiating graceful shutdown");
        self.cancellation_token.cancel();
    }

    #[must_use]
    pub fn is_running(&self) -> bool { self.running.load(Ordering::SeqCst) }

    pub async fn wait_for_shutdown(&self) { self.cancellation_token.cancelled().await; }
}

/// A transfer engine plus the process-level shutdown plumbing around it.
pub struct App {
    config:             AppConfig,
    engine:             TransferCoordinator,
    running:            Arc<AtomicBool>,
    cancellation_token: CancellationToken,
}

impl App {
    #[must_use]
    pub const fn config(&self) -> &AppConfig { &self.config }

    #[must_use]
    pub const fn engine(&self) -> &TransferCoordinator { &self.engine }

    #[must_use]
    pub fn handle(&self) -> AppHandle {
        AppHandle {
            running:            Arc::clone(&self.running),
            cancellation_token: self.cancellation_token.clone(),
        }
    }

    /// Starts the engine and returns the receiving endpoint's address.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let addr = self.engine.start().await?;
        self.running.store(true, Ordering::SeqCst);
        info!(%addr, "lanxfer started");
        Ok(addr)
    }

    /// Stops the engine. Interrupted transfers resume on the next start.
    pub async fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.cancellation_token.cancel();
        self.engine.stop().await?;
        info!("lanxfer stopped");
        Ok(())
    }

    /// Runs until Ctrl-C, SIGTERM or [`AppHandle::shutdown`], starting the
    /// engine first unless [`Self::start`] was already called.
    pub async fn run(mut self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            self.start().await?;
        }
        shutdown_signal(&self.cancellation_token).await;
        self.stop().await
    }
}

async fn shutdown_signal(token: &CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C"),
        () = terminate => info!("received terminate signal"),
        () = token.cancelled() => info!("shutdown requested"),
    }
}
