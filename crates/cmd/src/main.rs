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

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use indicatif::{HumanBytes, HumanDuration, ProgressBar, ProgressStyle};
use lanxfer_app::AppConfig;
use lanxfer_common_telemetry::{init_global_logging, logging::DEFAULT_LOGGING_DIR, set_panic_hook};
use lanxfer_engine::{
    ChannelObserver, Direction, LoggingObserver, Peer, PeerEvent, PeerId, StateStore,
    TransferEvent, TransferEventKind, peer::device_name,
};
use snafu::{OptionExt, ResultExt, Whatever, whatever};
use tokio::sync::mpsc::UnboundedReceiver;

mod build_info;

#[derive(Debug, Parser)]
#[command(
    name = "lanxfer",
    about = "Resumable file transfer between devices on the same network",
    author = build_info::AUTHOR,
    version = build_info::VERSION,
    long_version = build_info::LONG_VERSION
)]
struct Cli {
    /// TOML config file. Flags take precedence over it.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Root for transfer state, temporary archives and downloads.
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Also write rolling log files, into DIR or `logs`.
    #[arg(
        long,
        global = true,
        value_name = "DIR",
        num_args = 0..=1,
        default_missing_value = DEFAULT_LOGGING_DIR
    )]
    log_dir: Option<String>,

    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Serve(ServeArgs),
    Send(SendArgs),
    Pending(PendingArgs),
}

impl Cli {
    fn load_config(&self) -> Result<AppConfig, Whatever> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path)
                .with_whatever_context(|_| format!("cannot load {}", path.display()))?,
            None => AppConfig::default(),
        };
        if let Some(dir) = &self.data_dir {
            config.engine.data_dir.clone_from(dir);
        }
        if let Some(dir) = &self.log_dir {
            config.logging.dir.clone_from(dir);
        }
        // Keep one-shot commands quiet unless asked otherwise.
        if !matches!(self.commands, Commands::Serve(_)) && config.logging.level.is_none() {
            config.logging.level = Some("warn".to_string());
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Receive files from peers until interrupted.
Examples:

lanxfer serve
lanxfer serve --port 9000 --download-dir ~/Downloads

")]
struct ServeArgs {
    /// Interface to listen on.
    #[arg(long)]
    host:         Option<String>,
    #[arg(long)]
    port:         Option<u16>,
    /// Where completed transfers are stored.
    #[arg(long, value_name = "DIR")]
    download_dir: Option<PathBuf>,
}

impl ServeArgs {
    async fn run(self, mut config: AppConfig) -> Result<(), Whatever> {
        if let Some(host) = self.host {
            config.engine.host = host;
        }
        if let Some(port) = self.port {
            config.engine.port = port;
        }
        if self.download_dir.is_some() {
            config.engine.download_dir = self.download_dir;
        }
        let downloads = config.engine.download_dir();

        let mut app = config.open(LoggingObserver);
        let addr = app
            .start()
            .await
            .whatever_context("failed to start receiver")?;
        println!(
            "{} receiving on {addr}, saving to {}",
            device_name(),
            downloads.display()
        );
        app.run().await.whatever_context("receiver failed")
    }
}

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Send a file or directory to a peer and wait until it arrives.
An interrupted send resumes where it stopped when run again.
Examples:

lanxfer send ./report.pdf --peer 192.168.1.20:8765
lanxfer send ./photos --peer desk.local:8765 --name desk

")]
struct SendArgs {
    /// File or directory to send.
    path:        PathBuf,
    /// Receiver as `host:port`.
    #[arg(long, value_name = "HOST:PORT")]
    peer:        String,
    /// Display name for the receiver.
    #[arg(long)]
    name:        Option<String>,
    /// Port of this side's own receiving endpoint; 0 picks a free one.
    #[arg(long, default_value_t = 0)]
    listen_port: u16,
}

impl SendArgs {
    async fn run(self, mut config: AppConfig) -> Result<(), Whatever> {
        let (host, port) = parse_endpoint(&self.peer)?;
        config.engine.port = self.listen_port;

        let (observer, mut events) = ChannelObserver::new();
        let mut app = config.open(observer);
        app.start()
            .await
            .whatever_context("failed to start engine")?;

        let peer_id = PeerId::from(self.peer.as_str());
        let peer = Peer::builder()
            .id(peer_id.clone())
            .name(self.name.unwrap_or_else(|| self.peer.clone()))
            .host(host)
            .port(port)
            .build();
        app.engine()
            .peer_sink()
            .whatever_context("engine is not running")?
            .publish(PeerEvent::Added(peer));

        let job = app
            .engine()
            .queue_send(&self.path, &peer_id)
            .await
            .with_whatever_context(|_| format!("cannot send {}", self.path.display()))?;

        let outcome = tokio::select! {
            outcome = follow(&mut events, &job) => Some(outcome),
            _ = tokio::signal::ctrl_c() => None,
        };
        app.stop().await.whatever_context("failed to stop engine")?;

        match outcome {
            Some(Some(TransferEventKind::Completed {
                bytes,
                destination,
                retry_count,
            })) => {
                let at = destination.map(|d| d.display().to_string()).unwrap_or_default();
                println!("sent {} to {at} ({retry_count} retries)", HumanBytes(bytes));
                Ok(())
            }
            Some(Some(TransferEventKind::Failed { reason, message })) => {
                whatever!("send failed ({reason}): {message}")
            }
            Some(Some(TransferEventKind::Cancelled)) => whatever!("send cancelled"),
            Some(_) => whatever!("engine stopped before the send finished"),
            None => whatever!("interrupted; run the same command again to resume"),
        }
    }
}

fn transfer_bar(filename: String, total: u64, position: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::default_bar()
            .template(
                "{msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} eta {eta}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    bar.set_message(filename);
    bar.set_position(position);
    bar.reset_eta();
    bar
}

/// Renders progress of `job` until it ends.
///
/// `None` when the event stream closes first, i.e. the engine went away.
async fn follow(
    events: &mut UnboundedReceiver<TransferEvent>,
    job: &str,
) -> Option<TransferEventKind> {
    let mut bar: Option<ProgressBar> = None;
    while let Some(event) = events.recv().await {
        if event.id != job {
            continue;
        }
        match event.kind {
            TransferEventKind::Started {
                filename,
                total,
                peer,
                resumed_from,
            } => {
                let line = if resumed_from > 0 {
                    format!(
                        "resuming {filename} to {peer} at {} of {}",
                        HumanBytes(resumed_from),
                        HumanBytes(total)
                    )
                } else {
                    format!("sending {filename} ({}) to {peer}", HumanBytes(total))
                };
                let started = transfer_bar(filename, total, resumed_from);
                started.println(line);
                bar = Some(started);
            }
            TransferEventKind::Progress { bytes, .. } => {
                if let Some(bar) = &bar {
                    bar.set_position(bytes);
                }
            }
            TransferEventKind::Retrying { attempt, delay } => {
                let line = format!("retrying (attempt {attempt}) in {}", HumanDuration(delay));
                match &bar {
                    Some(bar) => bar.println(line),
                    None => eprintln!("{line}"),
                }
            }
            outcome => {
                if let Some(bar) = bar {
                    bar.finish_and_clear();
                }
                return Some(outcome);
            }
        }
    }
    if let Some(bar) = bar {
        bar.abandon();
    }
    None
}

fn parse_endpoint(endpoint: &str) -> Result<(String, u16), Whatever> {
    let Some((host, port)) = endpoint.rsplit_once(':') else {
        whatever!("peer must be host:port, got {endpoint:?}");
    };
    let port = port
        .parse()
        .with_whatever_context(|_| format!("invalid port in {endpoint:?}"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        whatever!("peer must be host:port, got {endpoint:?}");
    }
    Ok((host.to_string(), port))
}

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

List interrupted transfers that can still be resumed.
Examples:

lanxfer pending

")]
struct PendingArgs {}

impl PendingArgs {
    async fn run(self, config: AppConfig) -> Result<(), Whatever> {
        let store = StateStore::open(config.engine.state_dir(), config.engine.state_expiry)
            .await
            .whatever_context("cannot open transfer state")?;

        let mut any = false;
        for direction in [Direction::Outgoing, Direction::Incoming] {
            for record in store.records(direction) {
                any = true;
                let source = record
                    .source_path
                    .as_ref()
                    .map(|p| format!("  {}", p.display()))
                    .unwrap_or_default();
                println!(
                    "{:<8} {:<32} {:<24} {} / {}  {}  {}{source}",
                    record.direction,
                    record.transfer_id,
                    record.filename,
                    HumanBytes(record.offset),
                    HumanBytes(record.total_size),
                    record.status,
                    record.peer,
                );
            }
        }
        if !any {
            println!("no resumable transfers");
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Whatever> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    set_panic_hook();
    let _guards = init_global_logging("lanxfer", &config.logging)
        .whatever_context("failed to initialize logging")?;

    match cli.commands {
        Commands::Serve(args) => args.run(config).await,
        Commands::Send(args) => args.run(config).await,
        Commands::Pending(args) => args.run(config).await,
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() { Cli::command().debug_assert(); }

    #[test]
    fn endpoints_parse_with_and_without_brackets() {
        assert_eq!(
            parse_endpoint("192.168.1.20:8765").unwrap(),
            ("192.168.1.20".to_string(), 8765)
        );
        assert_eq!(
            parse_endpoint("[fe80::1]:9000").unwrap(),
            ("fe80::1".to_string(), 9000)
        );
        assert!(parse_endpoint("desk").is_err());
        assert!(parse_endpoint(":8765").is_err());
        assert!(parse_endpoint("desk:http").is_err());
    }

    fn event(id: &str, kind: TransferEventKind) -> TransferEvent {
        TransferEvent {
            id: id.to_string(),
            direction: Direction::Outgoing,
            kind,
        }
    }

    #[tokio::test]
    async fn follow_returns_the_jobs_outcome() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tx.send(event("other", TransferEventKind::Cancelled)).unwrap();
        tx.send(event("job", TransferEventKind::Progress {
            bytes: 5,
            total: 10,
            rate:  1.0,
        }))
        .unwrap();
        let failed = TransferEventKind::Failed {
            reason:  lanxfer_engine::FailureReason::Network,
            message: "gone".to_string(),
        };
        tx.send(event("job", failed.clone())).unwrap();

        assert_eq!(follow(&mut rx, "job").await, Some(failed));
    }

    #[tokio::test]
    async fn closed_event_stream_is_not_reported_as_cancel() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tx.send(event("other", TransferEventKind::Cancelled)).unwrap();
        drop(tx);

        assert_eq!(follow(&mut rx, "job").await, None);
    }

    #[test]
    fn flags_override_config_and_quiet_one_shot_commands() {
        let cli = Cli::parse_from([
            "lanxfer",
            "--data-dir",
            "/tmp/lx",
            "send",
            "a.bin",
            "--peer",
            "h:1",
            "--log-dir",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.engine.data_dir, PathBuf::from("/tmp/lx"));
        assert_eq!(config.logging.dir, DEFAULT_LOGGING_DIR);
        assert_eq!(config.logging.level.as_deref(), Some("warn"));

        let cli = Cli::parse_from(["lanxfer", "serve", "--port", "9000"]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.logging.level, None);
    }
}
