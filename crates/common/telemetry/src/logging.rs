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

//! Process-wide `tracing` setup.
//!
//! [`init_global_logging`] installs one subscriber made of independent
//! layers, each with its own filter: stdout, a rolling file under `dir`, and
//! an error-only rolling file beside it. Daemons (`lanxfer serve`) usually
//! enable all three; one-shot commands keep stdout only.

use std::{
    env,
    io::IsTerminal,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use bon::Builder;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::{ResultExt, Snafu};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{InitError, RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    filter::{self, LevelFilter, Targets},
    fmt::MakeWriter,
    layer::SubscriberExt,
};

/// Directory used by `--log-dir` when no value is given.
pub const DEFAULT_LOGGING_DIR: &str = "logs";

/// Used when neither `level` nor `RUST_LOG` is set.
const DEFAULT_LOG_TARGETS: &str = "info";

/// Noise from the HTTP stack is rarely useful below `warn`.
const UNITTEST_LOG_TARGETS: &str = "debug,hyper=warn,hyper_util=warn,reqwest=warn,h2=info";

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Keeps the unit-test writer threads alive for the whole test binary.
static UNITTEST_GUARDS: Mutex<Vec<WorkerGuard>> = Mutex::new(Vec::new());

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LoggingError {
    #[snafu(display("invalid log filter {filter:?}"))]
    InvalidFilter {
        filter: String,
        source: filter::ParseError,
    },

    #[snafu(display("cannot write log files to {dir}"))]
    Appender { dir: String, source: InitError },

    #[snafu(display("a global logger was installed by someone else"))]
    AlreadyInstalled,
}

/// Logging section of the application config file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault, Builder)]
#[serde(default)]
pub struct LoggingOptions {
    /// Directory for rolling log files. Empty keeps logs on stdout only.
    #[builder(into, default)]
    pub dir: String,

    /// Target filter such as `info,lanxfer_engine=debug`. Falls back to
    /// `RUST_LOG`, then `info`.
    #[builder(into)]
    pub level: Option<String>,

    #[builder(default)]
    pub log_format: LogFormat,

    #[builder(default)]
    pub rotation: LogRotation,

    /// Rotated files kept per prefix.
    #[default = 72]
    #[builder(default = 72)]
    pub max_log_files: usize,

    #[default = true]
    #[builder(default = true)]
    pub append_stdout: bool,

    #[default = "lanxfer"]
    #[builder(into, default = "lanxfer".to_string())]
    pub file_prefix: String,
}

impl LoggingOptions {
    fn targets(&self) -> Result<Targets, LoggingError> {
        let filter = self
            .level
            .clone()
            .or_else(|| env::var(EnvFilter::DEFAULT_ENV).ok())
            .unwrap_or_else(|| DEFAULT_LOG_TARGETS.to_string());
        filter.parse().context(InvalidFilterSnafu { filter })
    }

    fn appender(&self, prefix: &str) -> Result<RollingFileAppender, LoggingError> {
        RollingFileAppender::builder()
            .rotation(self.rotation.into())
            .filename_prefix(prefix)
            .filename_suffix("log")
            .max_log_files(self.max_log_files)
            .build(&self.dir)
            .context(AppenderSnafu { dir: &self.dir })
    }
}

#[derive(Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per event with its span context, for log shippers.
    Json,
    #[default]
    Text,
}

/// How often log files roll over.
#[derive(Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    #[default]
    Hourly,
    Daily,
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Self::HOURLY,
            LogRotation::Daily => Self::DAILY,
            LogRotation::Never => Self::NEVER,
        }
    }
}

fn fmt_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi);
    match format {
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Text => layer.boxed(),
    }
}

/// Installs the global subscriber described by `opts`.
///
/// Keep the returned guards alive until exit; dropping them stops the
/// background writers. Only the first call in a process installs anything,
/// later calls return no guards.
pub fn init_global_logging(
    app_name: &str,
    opts: &LoggingOptions,
) -> Result<Vec<WorkerGuard>, LoggingError> {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(Vec::new());
    }
    let installed = install(app_name, opts);
    if installed.is_err() {
        INSTALLED.store(false, Ordering::SeqCst);
    }
    installed
}

fn install(app_name: &str, opts: &LoggingOptions) -> Result<Vec<WorkerGuard>, LoggingError> {
    let targets = opts.targets()?;
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guards = Vec::new();

    if opts.append_stdout {
        let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
        guards.push(guard);
        let ansi = std::io::stdout().is_terminal();
        layers.push(
            fmt_layer(opts.log_format, writer, ansi)
                .with_filter(targets.clone())
                .boxed(),
        );
    }

    if !opts.dir.is_empty() {
        let (writer, guard) = tracing_appender::non_blocking(opts.appender(&opts.file_prefix)?);
        guards.push(guard);
        layers.push(
            fmt_layer(opts.log_format, writer, false)
                .with_filter(targets)
                .boxed(),
        );

        let errors = opts.appender(&format!("{}-err", opts.file_prefix))?;
        let (writer, guard) = tracing_appender::non_blocking(errors);
        guards.push(guard);
        layers.push(
            fmt_layer(opts.log_format, writer, false)
                .with_filter(LevelFilter::ERROR)
                .boxed(),
        );
    }

    LogTracer::init().map_err(|_| LoggingError::AlreadyInstalled)?;
    tracing::subscriber::set_global_default(Registry::default().with(layers))
        .map_err(|_| LoggingError::AlreadyInstalled)?;

    tracing::debug!(app = app_name, dir = %opts.dir, format = ?opts.log_format, "logging initialized");
    Ok(guards)
}

/// Logging for unit and integration tests.
///
/// Writes to `UNITTEST_LOG_DIR` (default `/tmp/__lanxfer_unittest_logs`) at
/// `UNITTEST_LOG_LEVEL`. Every test may call it; only the first call in a
/// test binary does anything.
pub fn init_default_ut_logging() {
    let dir =
        env::var("UNITTEST_LOG_DIR").unwrap_or_else(|_| "/tmp/__lanxfer_unittest_logs".to_string());
    let level = env::var("UNITTEST_LOG_LEVEL").unwrap_or_else(|_| UNITTEST_LOG_TARGETS.to_string());
    let opts = LoggingOptions::builder()
        .dir(dir.as_str())
        .level(level)
        .append_stdout(false)
        .file_prefix("unittest")
        .build();

    match init_global_logging("unittest", &opts) {
        Ok(guards) if !guards.is_empty() => {
            if let Ok(mut slot) = UNITTEST_GUARDS.lock() {
                slot.extend(guards);
            }
            tracing::info!("unit test logs in {dir}");
        }
        Ok(_) => {}
        Err(e) => eprintln!("unit test logging disabled: {e}"),
    }
}
