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

//! The engine's public face and its single control task.
//!
//! [`TransferCoordinator`] owns nothing mutable itself. All transfer state
//! (the receiver, the snapshot list, the peer registry, running sends)
//! lives in one actor task and is reached through [`EngineCommand`]
//! messages. Outgoing sends run one at a time on a separate worker task
//! that reports back through the same channel.

use std::{
    collections::{BTreeMap, HashMap},
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use lanxfer_server::{
    ServiceHandler,
    http::{RestServerConfig, start_rest_server},
};
use snafu::{OptionExt, ResultExt};
use tokio::{
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
        oneshot,
    },
    task::{self, JoinError, JoinHandle, JoinSet},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::TransferConfig,
    error::{
        EngineStoppedSnafu, PeerUnavailableSnafu, ResourceSnafu, Result, ServerSnafu,
        StorageSnafu, TransferError,
    },
    observer::{TransferEvent, TransferEventKind, TransferObserver},
    peer::{Peer, PeerEvent, PeerEventSink, PeerId},
    receiver::{
        CompleteOutcome, ExtractJob, Receiver,
        routes::{self, ReceiverApi},
    },
    sender::{AbortReason, AbortSignal, SendReport, SendUpdate, Sender},
    snapshot::TransferSnapshot,
    store::StateStore,
    types::{
        CancelResponse, ChunkResponse, CompleteResponse, Direction, HealthResponse, InitRequest,
        InitResponse, TransferStatusResponse,
    },
};

type Reply<T> = oneshot::Sender<Result<T>>;

/// Everything the engine task reacts to.
pub enum EngineCommand {
    Init {
        request: InitRequest,
        peer:    String,
        reply:   Reply<InitResponse>,
    },
    Chunk {
        transfer_id:   Option<String>,
        content_range: Option<String>,
        body:          Bytes,
        reply:         Reply<ChunkResponse>,
    },
    Complete {
        transfer_id: String,
        reply:       Reply<CompleteResponse>,
    },
    IncomingStatus {
        transfer_id: String,
        reply:       Reply<TransferStatusResponse>,
    },
    IncomingCancel {
        transfer_id: String,
        reply:       Reply<CancelResponse>,
    },
    Health {
        reply: Reply<HealthResponse>,
    },
    QueueSend {
        source: PathBuf,
        peer:   PeerId,
        reply:  Reply<String>,
    },
    Cancel {
        id:    String,
        reply: oneshot::Sender<bool>,
    },
    Transfers {
        reply: oneshot::Sender<Vec<TransferSnapshot>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<Peer>>,
    },
    ClearFinished {
        reply: oneshot::Sender<usize>,
    },
    Peer(PeerEvent),
    SendUpdate {
        job_id: String,
        update: SendUpdate,
    },
    SendFinished {
        job_id: String,
        result: Result<SendReport>,
    },
}

/// One queued send, handed to the worker.
struct SendJob {
    id:     String,
    source: PathBuf,
    peer:   Peer,
    abort:  AbortSignal,
}

/// Actor-side bookkeeping for a send that has not finished yet.
struct OutgoingJob {
    peer:      PeerId,
    peer_name: String,
    abort:     AbortSignal,
    started:   bool,
}

struct EngineActor {
    config:      Arc<TransferConfig>,
    store:       StateStore,
    receiver:    Receiver,
    observer:    Arc<dyn TransferObserver>,
    peers:       BTreeMap<PeerId, Peer>,
    jobs:        HashMap<String, OutgoingJob>,
    views:       Vec<TransferSnapshot>,
    send_queue:  UnboundedSender<SendJob>,
    shutdown:    CancellationToken,
    /// Archives unpacking on blocking threads.
    extractions: JoinSet<io::Result<PathBuf>>,
    extracting:  HashMap<task::Id, (String, Option<Reply<CompleteResponse>>)>,
}

type Extracted = std::result::Result<(task::Id, io::Result<PathBuf>), JoinError>;

impl EngineActor {
    async fn run(mut self, mut commands: UnboundedReceiver<EngineCommand>) {
        let period = self.config.prune_interval;
        let mut prune = tokio::time::interval_at(Instant::now() + period, period);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                Some(command) = commands.recv() => self.handle(command).await,
                Some(extracted) = self.extractions.join_next_with_id() => {
                    self.on_extracted(extracted).await;
                }
                _ = prune.tick() => self.prune().await,
            }
        }
        // Unpacking cannot be interrupted; let it land before stopping.
        while let Some(extracted) = self.extractions.join_next_with_id().await {
            self.on_extracted(extracted).await;
        }
        info!(
            incoming = self.receiver.active_count(),
            outgoing = self.jobs.len(),
            "engine task stopped"
        );
    }

    async fn handle(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Init {
                request,
                peer,
                reply,
            } => {
                let result = self.receiver.init(request, &peer).await;
                self.flush_receiver();
                let _ = reply.send(result);
            }
            EngineCommand::Chunk {
                transfer_id,
                content_range,
                body,
                reply,
            } => {
                let result = self
                    .receiver
                    .chunk(transfer_id.as_deref(), content_range.as_deref(), body)
                    .await;
                self.flush_receiver();
                let _ = reply.send(result);
            }
            EngineCommand::Complete { transfer_id, reply } => {
                match self.receiver.complete(&transfer_id).await {
                    Ok(CompleteOutcome::Done(done)) => {
                        let _ = reply.send(Ok(done));
                    }
                    Ok(CompleteOutcome::Extract(job)) => self.spawn_extraction(job, Some(reply)),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
                self.flush_receiver();
            }
            EngineCommand::IncomingStatus { transfer_id, reply } => {
                let _ = reply.send(self.receiver.status(&transfer_id));
            }
            EngineCommand::IncomingCancel { transfer_id, reply } => {
                let result = self.receiver.cancel(&transfer_id).await;
                self.flush_receiver();
                let _ = reply.send(result);
            }
            EngineCommand::Health { reply } => {
                let _ = reply.send(Ok(HealthResponse {
                    status:           "ok".to_string(),
                    active_transfers: self.receiver.active_count(),
                }));
            }
            EngineCommand::QueueSend {
                source,
                peer,
                reply,
            } => {
                let _ = reply.send(self.queue_send(source, &peer));
            }
            EngineCommand::Cancel { id, reply } => {
                let cancelled = self.cancel(&id).await;
                let _ = reply.send(cancelled);
            }
            EngineCommand::Transfers { reply } => {
                let _ = reply.send(self.views.clone());
            }
            EngineCommand::Peers { reply } => {
                let _ = reply.send(self.peers.values().cloned().collect());
            }
            EngineCommand::ClearFinished { reply } => {
                let before = self.views.len();
                self.views.retain(|view| !view.status.is_terminal());
                let _ = reply.send(before - self.views.len());
            }
            EngineCommand::Peer(event) => self.on_peer_event(event),
            EngineCommand::SendUpdate { job_id, update } => self.on_send_update(job_id, update),
            EngineCommand::SendFinished { job_id, result } => self.on_send_finished(job_id, result),
        }
    }

    fn spawn_extraction(&mut self, job: ExtractJob, reply: Option<Reply<CompleteResponse>>) {
        let transfer_id = job.transfer_id.clone();
        let task = self.extractions.spawn_blocking(move || job.run());
        self.extracting.insert(task.id(), (transfer_id, reply));
    }

    async fn on_extracted(&mut self, extracted: Extracted) {
        let (task, result) = match extracted {
            Ok((task, result)) => (task, result),
            Err(e) => (e.id(), Err(io::Error::other(e))),
        };
        let Some((transfer_id, reply)) = self.extracting.remove(&task) else {
            return;
        };
        let result = self.receiver.finish_extraction(&transfer_id, result).await;
        self.flush_receiver();
        match (reply, result) {
            (Some(reply), result) => {
                let _ = reply.send(result);
            }
            (None, Err(e)) => warn!(id = %transfer_id, error = %e, "resumed extraction failed"),
            (None, Ok(done)) => debug!(id = %transfer_id, path = %done.path, "resumed extraction done"),
        }
    }

    fn queue_send(&mut self, source: PathBuf, peer_id: &PeerId) -> Result<String> {
        let peer = self
            .peers
            .get(peer_id)
            .cloned()
            .with_context(|| PeerUnavailableSnafu {
                peer: peer_id.to_string(),
            })?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        let filename = source.file_name().map_or_else(
            || source.display().to_string(),
            |name| name.to_string_lossy().into_owned(),
        );
        let abort = AbortSignal::child_of(&self.shutdown);
        self.send_queue
            .send(SendJob {
                id: id.clone(),
                source,
                peer: peer.clone(),
                abort: abort.clone(),
            })
            .map_err(|_| TransferError::EngineStopped)?;

        info!(id = %id, file = %filename, peer = %peer.name, "send queued");
        self.views
            .push(TransferSnapshot::queued(id.clone(), filename, peer.name.clone()));
        self.jobs.insert(
            id.clone(),
            OutgoingJob {
                peer: peer.id,
                peer_name: peer.name,
                abort,
                started: false,
            },
        );
        Ok(id)
    }

    async fn cancel(&mut self, id: &str) -> bool {
        if let Some(job) = self.jobs.get(id) {
            job.abort.abort(AbortReason::Cancelled);
            // Jobs that never reached the peer end here; running ones end when
            // the worker reports back.
            if !job.started {
                self.jobs.remove(id);
                self.emit(TransferEvent {
                    id:        id.to_string(),
                    direction: Direction::Outgoing,
                    kind:      TransferEventKind::Cancelled,
                });
            }
            return true;
        }

        let cancelled = self.receiver.cancel(id).await.is_ok();
        self.flush_receiver();
        cancelled
    }

    fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Added(peer) => {
                debug!(peer = %peer.id, endpoint = %peer.endpoint(), "peer added");
                self.peers.insert(peer.id.clone(), peer);
            }
            PeerEvent::Removed(peer_id) => {
                debug!(peer = %peer_id, "peer removed");
                let Some(peer) = self.peers.remove(&peer_id) else {
                    return;
                };
                let affected: Vec<String> = self
                    .jobs
                    .iter()
                    .filter(|(_, job)| job.peer == peer_id)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in affected {
                    let Some(job) = self.jobs.get(&id) else { continue };
                    job.abort.abort(AbortReason::PeerLost);
                    if !job.started {
                        self.jobs.remove(&id);
                        let err = TransferError::PeerUnavailable {
                            peer: peer.endpoint(),
                        };
                        self.emit_failure(&id, &err);
                    }
                }
            }
        }
    }

    fn on_send_update(&mut self, job_id: String, update: SendUpdate) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        let kind = match update {
            SendUpdate::Started {
                filename,
                total,
                resumed_from,
                ..
            } => {
                job.started = true;
                TransferEventKind::Started {
                    filename,
                    total,
                    peer: job.peer_name.clone(),
                    resumed_from,
                }
            }
            SendUpdate::Progress { bytes, total, rate } => {
                TransferEventKind::Progress { bytes, total, rate }
            }
            SendUpdate::Retrying { attempt, delay } => TransferEventKind::Retrying { attempt, delay },
        };
        self.emit(TransferEvent {
            id: job_id,
            direction: Direction::Outgoing,
            kind,
        });
    }

    fn on_send_finished(&mut self, job_id: String, result: Result<SendReport>) {
        if self.jobs.remove(&job_id).is_none() {
            return;
        }
        let kind = match result {
            Ok(report) => TransferEventKind::Completed {
                bytes:       report.total,
                destination: Some(PathBuf::from(report.remote_path)),
                retry_count: report.retry_count,
            },
            Err(TransferError::Cancelled) => TransferEventKind::Cancelled,
            Err(TransferError::Interrupted) => return,
            Err(e) => {
                self.emit_failure(&job_id, &e);
                return;
            }
        };
        self.emit(TransferEvent {
            id: job_id,
            direction: Direction::Outgoing,
            kind,
        });
    }

    async fn prune(&mut self) {
        match self.store.prune(self.config.state_expiry).await {
            Ok(pruned) => self.receiver.forget_pruned(&pruned).await,
            Err(e) => warn!(error = %e, "failed to prune transfer records"),
        }
    }

    fn flush_receiver(&mut self) {
        for event in self.receiver.drain_events() {
            self.emit(event);
        }
    }

    fn emit_failure(&mut self, id: &str, err: &TransferError) {
        self.emit(TransferEvent {
            id:        id.to_string(),
            direction: Direction::Outgoing,
            kind:      TransferEventKind::Failed {
                reason:  err.failure_reason(),
                message: err.to_string(),
            },
        });
    }

    fn emit(&mut self, event: TransferEvent) {
        if let Some(view) = self
            .views
            .iter_mut()
            .find(|view| view.id == event.id && view.direction == event.direction)
        {
            view.apply(&event);
        } else if let TransferEventKind::Started {
            filename,
            total,
            peer,
            ..
        } = &event.kind
        {
            let mut view = TransferSnapshot::incoming(
                event.id.clone(),
                filename.clone(),
                peer.clone(),
                *total,
            );
            view.apply(&event);
            self.views.push(view);
        }
        self.observer.on_event(&event);
    }
}

/// Runs queued sends strictly one after another.
async fn send_worker(
    sender: Sender,
    mut queue: UnboundedReceiver<SendJob>,
    commands: UnboundedSender<EngineCommand>,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            job = queue.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        if job.abort.is_aborted() {
            let _ = commands.send(EngineCommand::SendFinished {
                job_id: job.id,
                result: Err(TransferError::Cancelled),
            });
            continue;
        }

        let updates = commands.clone();
        let job_id = job.id.clone();
        let progress = move |update: SendUpdate| {
            let _ = updates.send(EngineCommand::SendUpdate {
                job_id: job_id.clone(),
                update,
            });
        };
        let result = sender
            .send_path(&job.source, &job.peer, &job.abort, &progress)
            .await;
        let _ = commands.send(EngineCommand::SendFinished {
            job_id: job.id,
            result,
        });
    }
    debug!("send worker stopped");
}

struct Running {
    commands:   UnboundedSender<EngineCommand>,
    shutdown:   CancellationToken,
    server:     ServiceHandler,
    actor:      JoinHandle<()>,
    worker:     JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Entry point for embedding the transfer engine.
///
/// ```rust,ignore
/// let mut engine = TransferCoordinator::new(TransferConfig::default(), LoggingObserver);
/// let addr = engine.start().await?;
/// engine.peer_sink().unwrap().publish(PeerEvent::Added(peer));
/// let job = engine.queue_send("/tmp/report.pdf", &peer_id).await?;
/// ```
pub struct TransferCoordinator {
    config:   Arc<TransferConfig>,
    observer: Arc<dyn TransferObserver>,
    running:  Option<Running>,
}

impl TransferCoordinator {
    pub fn new(config: TransferConfig, observer: impl TransferObserver) -> Self {
        Self {
            config:   Arc::new(config),
            observer: Arc::new(observer),
            running:  None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &TransferConfig { &self.config }

    /// Restores interrupted incoming transfers, then brings up the HTTP
    /// endpoint, the engine task and the send worker.
    ///
    /// Returns the bound address. Calling it again while running is a no-op.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if let Some(running) = &self.running {
            return Ok(running.local_addr);
        }
        self.config.validate()?;

        let download_dir = self.config.download_dir();
        for dir in [&download_dir, &self.config.outbox_dir()] {
            tokio::fs::create_dir_all(dir)
                .await
                .context(StorageSnafu { path: dir })?;
        }
        let store = StateStore::open(self.config.state_dir(), self.config.state_expiry).await?;
        let mut receiver = Receiver::new(
            download_dir,
            store.clone(),
            self.config.state_expiry_secs(),
        );
        receiver.restore().await?;
        let unextracted = receiver.take_unextracted();
        let sender = Sender::new(self.config.clone(), store.clone())?;

        let (commands, command_rx) = unbounded_channel();
        let (send_queue, queue_rx) = unbounded_channel();
        let shutdown = CancellationToken::new();

        let api = ReceiverApi::new(commands.clone());
        let server_config = RestServerConfig::builder()
            .bind_address(self.config.bind_address())
            .max_body_size(self.config.max_body_size())
            .build();
        let mut server = start_rest_server(server_config, vec![move |router: axum::Router| {
            routes::routes(router, api.clone())
        }])
        .await
        .context(ServerSnafu)?;
        server.wait_for_start().await.context(ServerSnafu)?;
        let local_addr = server.local_addr();

        let mut actor = EngineActor {
            config: self.config.clone(),
            store,
            receiver,
            observer: self.observer.clone(),
            peers: BTreeMap::new(),
            jobs: HashMap::new(),
            views: Vec::new(),
            send_queue,
            shutdown: shutdown.clone(),
            extractions: JoinSet::new(),
            extracting: HashMap::new(),
        };
        for job in unextracted {
            actor.spawn_extraction(job, None);
        }
        let actor = tokio::spawn(actor.run(command_rx));
        let worker = tokio::spawn(send_worker(
            sender,
            queue_rx,
            commands.clone(),
            shutdown.clone(),
        ));

        let download_dir = self.config.download_dir();
        info!(%local_addr, download_dir = %download_dir.display(), "transfer engine started");
        self.running = Some(Running {
            commands,
            shutdown,
            server,
            actor,
            worker,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Stops everything. Partial files and records stay on disk, so
    /// interrupted transfers resume after the next `start`.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        running.shutdown.cancel();
        running.server.shutdown();
        if let Err(e) = running.worker.await {
            warn!(error = %e, "send worker ended abnormally");
        }
        if let Err(e) = running.actor.await {
            warn!(error = %e, "engine task ended abnormally");
        }
        running.server.wait_for_stop().await.context(ServerSnafu)?;
        info!("transfer engine stopped");
        Ok(())
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> { self.running.as_ref().map(|r| r.local_addr) }

    /// Handle for the discovery component; `None` until started.
    #[must_use]
    pub fn peer_sink(&self) -> Option<PeerEventSink> {
        self.running
            .as_ref()
            .map(|r| PeerEventSink::new(r.commands.clone()))
    }

    /// Queues `source` (file or directory) for `peer` and returns the job id.
    ///
    /// No network work happens here; progress and outcome arrive through the
    /// observer.
    pub async fn queue_send(&self, source: impl AsRef<Path>, peer: &PeerId) -> Result<String> {
        let source = source.as_ref();
        tokio::fs::metadata(source)
            .await
            .context(ResourceSnafu { path: source })?;
        let source = source.to_path_buf();
        let peer = peer.clone();
        self.ask(|reply| EngineCommand::QueueSend {
            source,
            peer,
            reply,
        })
        .await?
    }

    /// Cancels a queued or running send, or an incoming transfer.
    ///
    /// `false` for unknown and already finished ids.
    pub async fn cancel(&self, id: &str) -> bool {
        let id = id.to_string();
        self.ask(|reply| EngineCommand::Cancel { id, reply })
            .await
            .unwrap_or(false)
    }

    /// Queued, running and recently finished transfers in arrival order.
    pub async fn transfers(&self) -> Vec<TransferSnapshot> {
        self.ask(|reply| EngineCommand::Transfers { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn peers(&self) -> Vec<Peer> {
        self.ask(|reply| EngineCommand::Peers { reply })
            .await
            .unwrap_or_default()
    }

    /// Drops finished entries from [`Self::transfers`]; returns how many.
    pub async fn clear_finished(&self) -> usize {
        self.ask(|reply| EngineCommand::ClearFinished { reply })
            .await
            .unwrap_or_default()
    }

    async fn ask<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> EngineCommand) -> Result<T> {
        let running = self.running.as_ref().context(EngineStoppedSnafu)?;
        let (reply, answer) = oneshot::channel();
        running
            .commands
            .send(build(reply))
            .map_err(|_| TransferError::EngineStopped)?;
        answer.await.map_err(|_| TransferError::EngineStopped)
    }
}
