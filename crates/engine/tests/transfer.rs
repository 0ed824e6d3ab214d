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

//! Two engines talking over loopback, with a proxy in between that records
//! chunk requests and injects faults.

use std::{
    collections::HashMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use lanxfer_engine::{
    ChannelObserver, Direction, FailureReason, NoopObserver, Peer, PeerEvent, PeerId, StateStore,
    TransferConfig, TransferCoordinator, TransferEvent, TransferEventKind, TransferStatus,
    types::{InitResponse, TRANSFER_ID_HEADER},
};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::{Notify, mpsc::UnboundedReceiver};

const MIB: usize = 1024 * 1024;
const PEER_ID: &str = "desk";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    None,
    /// Answer the n-th chunk request (1-based) with a 500 without
    /// forwarding it.
    FailChunkOnce(usize),
    /// Answer every chunk request with a 500 without forwarding it.
    FailEveryChunk,
    /// Forward the first complete request but answer it with a 502, as if
    /// the receiver's response never arrived.
    LoseFirstCompleteResponse,
    /// Never answer chunk requests that do not start at byte 0.
    HoldLaterChunks,
    /// Flip the first byte of every chunk body.
    Corrupt,
}

#[derive(Default)]
struct ProxyLog {
    chunk_ranges: Vec<String>,
    init_offsets: Vec<u64>,
}

struct ProxyState {
    upstream:  Mutex<SocketAddr>,
    fault:     Mutex<Fault>,
    chunks:    AtomicUsize,
    completes: AtomicUsize,
    log:       Mutex<ProxyLog>,
    held:      Notify,
    client:    reqwest::Client,
}

struct Proxy {
    addr:  SocketAddr,
    state: Arc<ProxyState>,
}

impl Proxy {
    async fn start(upstream: SocketAddr, fault: Fault) -> Self {
        let state = Arc::new(ProxyState {
            upstream:  Mutex::new(upstream),
            fault:     Mutex::new(fault),
            chunks:    AtomicUsize::new(0),
            completes: AtomicUsize::new(0),
            log:       Mutex::new(ProxyLog::default()),
            held:      Notify::new(),
            client:    reqwest::Client::new(),
        });
        let app = Router::new().fallback(forward).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    fn peer(&self) -> Peer {
        Peer::builder()
            .id(PEER_ID)
            .name("Desk")
            .host("127.0.0.1")
            .port(self.addr.port())
            .build()
    }

    fn chunk_ranges(&self) -> Vec<String> { self.state.log.lock().chunk_ranges.clone() }

    fn init_offsets(&self) -> Vec<u64> { self.state.log.lock().init_offsets.clone() }

    /// Chunk requests seen, including rejected ones.
    fn chunk_requests(&self) -> usize { self.state.chunks.load(Ordering::SeqCst) }

    fn complete_requests(&self) -> usize { self.state.completes.load(Ordering::SeqCst) }

    fn reset(&self, upstream: SocketAddr, fault: Fault) {
        *self.state.upstream.lock() = upstream;
        *self.state.fault.lock() = fault;
        self.state.chunks.store(0, Ordering::SeqCst);
        self.state.completes.store(0, Ordering::SeqCst);
        *self.state.log.lock() = ProxyLog::default();
    }
}

async fn forward(
    State(state): State<Arc<ProxyState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let mut body = body;

    if path == "/transfer/chunk" {
        let range = headers
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let seen = state.chunks.fetch_add(1, Ordering::SeqCst) + 1;
        let fault = *state.fault.lock();
        match fault {
            Fault::FailChunkOnce(n) if n == seen => {
                return (StatusCode::INTERNAL_SERVER_ERROR, "injected failure").into_response();
            }
            Fault::FailEveryChunk => {
                return (StatusCode::INTERNAL_SERVER_ERROR, "injected failure").into_response();
            }
            Fault::HoldLaterChunks if !range.starts_with("bytes 0-") => {
                state.held.notify_one();
                std::future::pending::<()>().await;
            }
            Fault::Corrupt => {
                let mut raw = body.to_vec();
                raw[0] ^= 0xff;
                body = Bytes::from(raw);
            }
            _ => {}
        }
        state.log.lock().chunk_ranges.push(range);
    }
    let lose_response = path == "/transfer/complete"
        && state.completes.fetch_add(1, Ordering::SeqCst) == 0
        && *state.fault.lock() == Fault::LoseFirstCompleteResponse;

    let upstream = *state.upstream.lock();
    let url = format!(
        "http://{upstream}{}",
        uri.path_and_query().map_or("/", |p| p.as_str())
    );
    let mut request = state.client.request(method, url).body(body);
    for name in [header::CONTENT_TYPE.as_str(), header::CONTENT_RANGE.as_str(), TRANSFER_ID_HEADER] {
        if let Some(value) = headers.get(name) {
            request = request.header(name, value.clone());
        }
    }
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => return (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    };

    let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
    let bytes = response.bytes().await.unwrap_or_default();
    if lose_response {
        return (StatusCode::BAD_GATEWAY, "upstream response lost").into_response();
    }
    if path == "/transfer/init"
        && status.is_success()
        && let Ok(init) = serde_json::from_slice::<InitResponse>(&bytes)
    {
        state.log.lock().init_offsets.push(init.resume_offset);
    }
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        bytes,
    )
        .into_response()
}

fn config(dir: &Path) -> TransferConfig {
    TransferConfig::builder()
        .host("127.0.0.1")
        .port(0)
        .data_dir(dir)
        .retry_initial_delay(Duration::from_millis(10))
        .retry_max_delay(Duration::from_millis(100))
        .build()
}

fn payload(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| u8::try_from((i * 31 + i / 7) % 251).unwrap())
        .collect()
}

struct Sending {
    engine: TransferCoordinator,
    events: UnboundedReceiver<TransferEvent>,
}

async fn start_sender(dir: &Path, peer: Peer) -> Sending {
    let (observer, events) = ChannelObserver::new();
    let mut engine = TransferCoordinator::new(config(dir), observer);
    engine.start().await.unwrap();
    assert!(engine.peer_sink().unwrap().publish(PeerEvent::Added(peer)));
    Sending { engine, events }
}

async fn start_receiver(dir: &Path) -> (TransferCoordinator, SocketAddr) {
    let mut engine = TransferCoordinator::new(config(dir), NoopObserver);
    let addr = engine.start().await.unwrap();
    (engine, addr)
}

fn is_outcome(kind: &TransferEventKind) -> bool {
    matches!(
        kind,
        TransferEventKind::Completed { .. }
            | TransferEventKind::Failed { .. }
            | TransferEventKind::Cancelled
    )
}

/// Collects events per job until every job in `ids` reached an outcome.
async fn run_until_done(
    events: &mut UnboundedReceiver<TransferEvent>,
    ids: &[&str],
) -> HashMap<String, Vec<TransferEventKind>> {
    let mut seen: HashMap<String, Vec<TransferEventKind>> = HashMap::new();
    tokio::time::timeout(Duration::from_secs(60), async {
        while !ids
            .iter()
            .all(|id| seen.get(*id).and_then(|k| k.last()).is_some_and(is_outcome))
        {
            let event = events.recv().await.expect("engine dropped the observer");
            assert_eq!(event.direction, Direction::Outgoing);
            seen.entry(event.id).or_default().push(event.kind);
        }
    })
    .await
    .expect("transfers did not finish in time");
    seen
}

fn hidden_entries(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.file_name().unwrap().to_string_lossy().starts_with('.'))
        .collect()
}

struct Dirs {
    _root:    TempDir,
    sender:   PathBuf,
    receiver: PathBuf,
    files:    PathBuf,
}

impl Dirs {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let dirs = Self {
            sender: root.path().join("sender"),
            receiver: root.path().join("receiver"),
            files: root.path().join("files"),
            _root: root,
        };
        std::fs::create_dir_all(&dirs.files).unwrap();
        dirs
    }

    fn downloads(&self) -> PathBuf { self.receiver.join("downloads") }

    fn write(&self, name: &str, data: &[u8]) -> PathBuf {
        let path = self.files.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }
}

#[tokio::test]
async fn three_mib_file_goes_in_three_ordered_chunks() {
    lanxfer_common_telemetry::init_default_ut_logging();
    let dirs = Dirs::new();
    let data = payload(3 * MIB);
    let source = dirs.write("payload.bin", &data);

    let (mut receiver, addr) = start_receiver(&dirs.receiver).await;
    let proxy = Proxy::start(addr, Fault::None).await;
    let mut sending = start_sender(&dirs.sender, proxy.peer()).await;

    let id = sending
        .engine
        .queue_send(&source, &PeerId::from(PEER_ID))
        .await
        .unwrap();
    let events = run_until_done(&mut sending.events, &[&id]).await;

    let kinds = &events[&id];
    assert!(matches!(
        kinds.first(),
        Some(TransferEventKind::Started {
            total: 3_145_728,
            resumed_from: 0,
            ..
        })
    ));
    let Some(TransferEventKind::Completed {
        bytes,
        destination,
        retry_count,
    }) = kinds.last()
    else {
        panic!("expected completion, got {kinds:?}");
    };
    assert_eq!(*bytes, 3_145_728);
    assert_eq!(*retry_count, 0);
    assert_eq!(
        destination.as_deref(),
        Some(dirs.downloads().join("payload.bin").as_path())
    );

    assert_eq!(
        proxy.chunk_ranges(),
        [
            "bytes 0-1048575/3145728",
            "bytes 1048576-2097151/3145728",
            "bytes 2097152-3145727/3145728",
        ]
    );
    assert_eq!(
        std::fs::read(dirs.downloads().join("payload.bin")).unwrap(),
        data
    );
    assert!(hidden_entries(&dirs.downloads()).is_empty());

    let snapshots = sending.engine.transfers().await;
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].status, TransferStatus::Completed);
    assert!((snapshots[0].progress_percent() - 100.0).abs() < f64::EPSILON);
    assert_eq!(sending.engine.clear_finished().await, 1);
    assert!(sending.engine.transfers().await.is_empty());

    sending.engine.stop().await.unwrap();
    receiver.stop().await.unwrap();

    let store = StateStore::open(dirs.sender.join("state"), Duration::from_secs(3600))
        .await
        .unwrap();
    assert!(store.records(Direction::Outgoing).is_empty());
}

#[tokio::test]
async fn failed_chunk_is_retried_once() {
    lanxfer_common_telemetry::init_default_ut_logging();
    let dirs = Dirs::new();
    let data = payload(3 * MIB);
    let source = dirs.write("payload.bin", &data);

    let (mut receiver, addr) = start_receiver(&dirs.receiver).await;
    let proxy = Proxy::start(addr, Fault::FailChunkOnce(2)).await;
    let mut sending = start_sender(&dirs.sender, proxy.peer()).await;

    let id = sending
        .engine
        .queue_send(&source, &PeerId::from(PEER_ID))
        .await
        .unwrap();
    let events = run_until_done(&mut sending.events, &[&id]).await;
    let kinds = &events[&id];

    assert_eq!(
        kinds
            .iter()
            .filter(|k| matches!(k, TransferEventKind::Retrying { attempt: 1, .. }))
            .count(),
        1
    );
    assert!(matches!(
        kinds.last(),
        Some(TransferEventKind::Completed { retry_count: 1, .. })
    ));
    assert_eq!(proxy.chunk_ranges().len(), 3);
    assert_eq!(
        std::fs::read(dirs.downloads().join("payload.bin")).unwrap(),
        data
    );
    assert_eq!(sending.engine.transfers().await[0].retry_count, 1);

    sending.engine.stop().await.unwrap();
    receiver.stop().await.unwrap();
}

#[tokio::test]
async fn chunk_failing_past_retry_budget_fails_the_send() {
    lanxfer_common_telemetry::init_default_ut_logging();
    let dirs = Dirs::new();
    let source = dirs.write("payload.bin", &payload(MIB / 2));

    let (mut receiver, addr) = start_receiver(&dirs.receiver).await;
    let proxy = Proxy::start(addr, Fault::FailEveryChunk).await;
    let mut sending = start_sender(&dirs.sender, proxy.peer()).await;

    let id = sending
        .engine
        .queue_send(&source, &PeerId::from(PEER_ID))
        .await
        .unwrap();
    let events = run_until_done(&mut sending.events, &[&id]).await;
    let kinds = &events[&id];

    assert_eq!(proxy.chunk_requests(), 6, "one attempt plus five retries");
    let attempts: Vec<u32> = kinds
        .iter()
        .filter_map(|k| match k {
            TransferEventKind::Retrying { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, [1, 2, 3, 4, 5]);
    assert!(
        matches!(
            kinds.last(),
            Some(TransferEventKind::Failed {
                reason: FailureReason::Network,
                ..
            })
        ),
        "{kinds:?}"
    );
    assert_eq!(proxy.complete_requests(), 0);
    assert!(!dirs.downloads().join("payload.bin").exists());

    sending.engine.stop().await.unwrap();
    receiver.stop().await.unwrap();

    let store = StateStore::open(dirs.sender.join("state"), Duration::from_secs(3600))
        .await
        .unwrap();
    assert!(store.records(Direction::Outgoing).is_empty());
}

#[tokio::test]
async fn lost_complete_response_is_retried() {
    lanxfer_common_telemetry::init_default_ut_logging();
    let dirs = Dirs::new();
    let data = payload(MIB + 5);
    let source = dirs.write("payload.bin", &data);

    let (mut receiver, addr) = start_receiver(&dirs.receiver).await;
    let proxy = Proxy::start(addr, Fault::LoseFirstCompleteResponse).await;
    let mut sending = start_sender(&dirs.sender, proxy.peer()).await;

    let id = sending
        .engine
        .queue_send(&source, &PeerId::from(PEER_ID))
        .await
        .unwrap();
    let events = run_until_done(&mut sending.events, &[&id]).await;

    let Some(TransferEventKind::Completed {
        destination,
        retry_count,
        ..
    }) = events[&id].last()
    else {
        panic!("expected completion, got {:?}", events[&id]);
    };
    let landed = dirs.downloads().join("payload.bin");
    assert_eq!(destination.as_deref(), Some(landed.as_path()));
    assert_eq!(*retry_count, 1);
    assert_eq!(proxy.complete_requests(), 2);
    assert_eq!(std::fs::read(&landed).unwrap(), data);
    assert!(!dirs.downloads().join("payload_1.bin").exists());

    sending.engine.stop().await.unwrap();
    receiver.stop().await.unwrap();

    let store = StateStore::open(dirs.sender.join("state"), Duration::from_secs(3600))
        .await
        .unwrap();
    assert!(store.records(Direction::Outgoing).is_empty());
}

#[tokio::test]
async fn interrupted_send_resumes_after_restart() {
    lanxfer_common_telemetry::init_default_ut_logging();
    let dirs = Dirs::new();
    let data = payload(3 * MIB);
    let source = dirs.write("payload.bin", &data);

    let (mut receiver, addr) = start_receiver(&dirs.receiver).await;
    let proxy = Proxy::start(addr, Fault::HoldLaterChunks).await;
    let mut sending = start_sender(&dirs.sender, proxy.peer()).await;
    sending
        .engine
        .queue_send(&source, &PeerId::from(PEER_ID))
        .await
        .unwrap();

    // The second chunk is only sent after the first one was recorded.
    proxy.state.held.notified().await;
    sending.engine.stop().await.unwrap();
    receiver.stop().await.unwrap();

    let store = StateStore::open(dirs.sender.join("state"), Duration::from_secs(3600))
        .await
        .unwrap();
    let kept = store.records(Direction::Outgoing);
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].offset, 1_048_576);
    drop(store);

    let (mut receiver, addr) = start_receiver(&dirs.receiver).await;
    proxy.reset(addr, Fault::None);
    let mut sending = start_sender(&dirs.sender, proxy.peer()).await;
    let id = sending
        .engine
        .queue_send(&source, &PeerId::from(PEER_ID))
        .await
        .unwrap();
    let events = run_until_done(&mut sending.events, &[&id]).await;

    assert!(matches!(
        events[&id].first(),
        Some(TransferEventKind::Started {
            resumed_from: 1_048_576,
            ..
        })
    ));
    assert!(matches!(
        events[&id].last(),
        Some(TransferEventKind::Completed { .. })
    ));
    assert_eq!(proxy.init_offsets(), [1_048_576]);
    assert_eq!(
        proxy.chunk_ranges(),
        [
            "bytes 1048576-2097151/3145728",
            "bytes 2097152-3145727/3145728",
        ]
    );
    assert_eq!(
        std::fs::read(dirs.downloads().join("payload.bin")).unwrap(),
        data
    );

    sending.engine.stop().await.unwrap();
    receiver.stop().await.unwrap();
}

#[tokio::test]
async fn expired_attempt_is_sent_again_from_zero() {
    lanxfer_common_telemetry::init_default_ut_logging();
    let dirs = Dirs::new();
    let data = payload(3 * MIB);
    let source = dirs.write("payload.bin", &data);

    let (mut receiver, addr) = start_receiver(&dirs.receiver).await;
    let proxy = Proxy::start(addr, Fault::HoldLaterChunks).await;
    let mut sending = start_sender(&dirs.sender, proxy.peer()).await;
    sending
        .engine
        .queue_send(&source, &PeerId::from(PEER_ID))
        .await
        .unwrap();
    proxy.state.held.notified().await;
    sending.engine.stop().await.unwrap();
    receiver.stop().await.unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;

    let short_lived = |dir: &Path| {
        let mut config = config(dir);
        config.state_expiry = Duration::from_secs(1);
        config
    };
    let mut receiver = TransferCoordinator::new(short_lived(&dirs.receiver), NoopObserver);
    let addr = receiver.start().await.unwrap();
    assert!(hidden_entries(&dirs.downloads()).is_empty());

    proxy.reset(addr, Fault::None);
    let (observer, mut events) = ChannelObserver::new();
    let mut sender = TransferCoordinator::new(short_lived(&dirs.sender), observer);
    sender.start().await.unwrap();
    sender
        .peer_sink()
        .unwrap()
        .publish(PeerEvent::Added(proxy.peer()));
    let id = sender
        .queue_send(&source, &PeerId::from(PEER_ID))
        .await
        .unwrap();
    let events = run_until_done(&mut events, &[&id]).await;

    assert!(matches!(
        events[&id].first(),
        Some(TransferEventKind::Started { resumed_from: 0, .. })
    ));
    assert_eq!(proxy.init_offsets(), [0]);
    assert_eq!(proxy.chunk_ranges().len(), 3);
    assert_eq!(
        std::fs::read(dirs.downloads().join("payload.bin")).unwrap(),
        data
    );

    sender.stop().await.unwrap();
    receiver.stop().await.unwrap();
}

#[tokio::test]
async fn directory_arrives_unpacked() {
    lanxfer_common_telemetry::init_default_ut_logging();
    let dirs = Dirs::new();
    let album = dirs.files.join("album");
    std::fs::create_dir_all(album.join("raw")).unwrap();
    std::fs::write(album.join("cover.jpg"), payload(4096)).unwrap();
    std::fs::write(album.join("raw/shot.dng"), payload(MIB + 17)).unwrap();

    let (mut receiver, addr) = start_receiver(&dirs.receiver).await;
    let peer = Peer::builder()
        .id(PEER_ID)
        .name("Desk")
        .host("127.0.0.1")
        .port(addr.port())
        .build();
    let mut sending = start_sender(&dirs.sender, peer).await;

    let id = sending
        .engine
        .queue_send(&album, &PeerId::from(PEER_ID))
        .await
        .unwrap();
    let events = run_until_done(&mut sending.events, &[&id]).await;

    assert!(matches!(
        events[&id].first(),
        Some(TransferEventKind::Started { filename, .. }) if filename == "album.tar"
    ));
    let Some(TransferEventKind::Completed { destination, .. }) = events[&id].last() else {
        panic!("expected completion, got {:?}", events[&id]);
    };
    let unpacked = dirs.downloads().join("album");
    assert_eq!(destination.as_deref(), Some(unpacked.as_path()));
    assert_eq!(
        std::fs::read(unpacked.join("cover.jpg")).unwrap(),
        payload(4096)
    );
    assert_eq!(
        std::fs::read(unpacked.join("raw/shot.dng")).unwrap(),
        payload(MIB + 17)
    );
    assert!(!dirs.downloads().join("album.tar").exists());
    assert!(hidden_entries(&dirs.downloads()).is_empty());
    assert_eq!(
        std::fs::read_dir(dirs.sender.join("outbox")).unwrap().count(),
        0,
        "temporary archive left behind"
    );

    sending.engine.stop().await.unwrap();
    receiver.stop().await.unwrap();
}

#[tokio::test]
async fn corrupted_upload_fails_integrity_check() {
    lanxfer_common_telemetry::init_default_ut_logging();
    let dirs = Dirs::new();
    let source = dirs.write("payload.bin", &payload(MIB / 2));

    let (mut receiver, addr) = start_receiver(&dirs.receiver).await;
    let proxy = Proxy::start(addr, Fault::Corrupt).await;
    let mut sending = start_sender(&dirs.sender, proxy.peer()).await;

    let id = sending
        .engine
        .queue_send(&source, &PeerId::from(PEER_ID))
        .await
        .unwrap();
    let events = run_until_done(&mut sending.events, &[&id]).await;

    assert!(matches!(
        events[&id].last(),
        Some(TransferEventKind::Failed {
            reason: FailureReason::Integrity,
            ..
        })
    ));
    assert!(!dirs.downloads().join("payload.bin").exists());
    assert!(hidden_entries(&dirs.downloads()).is_empty());

    sending.engine.stop().await.unwrap();
    receiver.stop().await.unwrap();
}

#[tokio::test]
async fn cancel_cleans_up_and_queue_moves_on() {
    lanxfer_common_telemetry::init_default_ut_logging();
    let dirs = Dirs::new();
    let big = dirs.write("big.bin", &payload(3 * MIB));
    let small = dirs.write("small.txt", b"hello lan");

    let (mut receiver, addr) = start_receiver(&dirs.receiver).await;
    let proxy = Proxy::start(addr, Fault::HoldLaterChunks).await;
    let mut sending = start_sender(&dirs.sender, proxy.peer()).await;

    let peer = PeerId::from(PEER_ID);
    let first = sending.engine.queue_send(&big, &peer).await.unwrap();
    let second = sending.engine.queue_send(&small, &peer).await.unwrap();
    proxy.state.held.notified().await;

    assert!(sending.engine.cancel(&first).await);
    let events = run_until_done(&mut sending.events, &[&first, &second]).await;

    assert_eq!(
        events[&first].last(),
        Some(&TransferEventKind::Cancelled)
    );
    assert!(matches!(
        events[&second].last(),
        Some(TransferEventKind::Completed { .. })
    ));
    assert!(!sending.engine.cancel(&first).await, "cancel is idempotent");
    assert_eq!(
        std::fs::read(dirs.downloads().join("small.txt")).unwrap(),
        b"hello lan"
    );
    assert!(hidden_entries(&dirs.downloads()).is_empty());

    sending.engine.stop().await.unwrap();
    receiver.stop().await.unwrap();
}

#[tokio::test]
async fn cancelling_a_queued_job_never_contacts_the_peer() {
    lanxfer_common_telemetry::init_default_ut_logging();
    let dirs = Dirs::new();
    let big = dirs.write("big.bin", &payload(3 * MIB));
    let small = dirs.write("small.txt", b"hello lan");

    let (mut receiver, addr) = start_receiver(&dirs.receiver).await;
    let proxy = Proxy::start(addr, Fault::HoldLaterChunks).await;
    let mut sending = start_sender(&dirs.sender, proxy.peer()).await;

    let peer = PeerId::from(PEER_ID);
    let first = sending.engine.queue_send(&big, &peer).await.unwrap();
    let second = sending.engine.queue_send(&small, &peer).await.unwrap();
    proxy.state.held.notified().await;

    assert!(sending.engine.cancel(&second).await);
    assert!(sending.engine.cancel(&first).await);
    let events = run_until_done(&mut sending.events, &[&first, &second]).await;

    assert_eq!(events[&second], [TransferEventKind::Cancelled]);
    assert!(!dirs.downloads().join("small.txt").exists());

    sending.engine.stop().await.unwrap();
    receiver.stop().await.unwrap();
}

#[tokio::test]
async fn lost_peer_fails_active_and_queued_sends() {
    lanxfer_common_telemetry::init_default_ut_logging();
    let dirs = Dirs::new();
    let big = dirs.write("big.bin", &payload(3 * MIB));
    let small = dirs.write("small.txt", b"hello lan");

    let (mut receiver, addr) = start_receiver(&dirs.receiver).await;
    let proxy = Proxy::start(addr, Fault::HoldLaterChunks).await;
    let mut sending = start_sender(&dirs.sender, proxy.peer()).await;

    let peer = PeerId::from(PEER_ID);
    let first = sending.engine.queue_send(&big, &peer).await.unwrap();
    let second = sending.engine.queue_send(&small, &peer).await.unwrap();
    proxy.state.held.notified().await;

    let sink = sending.engine.peer_sink().unwrap();
    assert!(sink.publish(PeerEvent::Removed(peer.clone())));
    let events = run_until_done(&mut sending.events, &[&first, &second]).await;

    for id in [&first, &second] {
        assert!(
            matches!(
                events[id].last(),
                Some(TransferEventKind::Failed {
                    reason: FailureReason::PeerUnavailable,
                    ..
                })
            ),
            "{id}: {:?}",
            events[id]
        );
    }
    assert!(sending.engine.peers().await.is_empty());
    let err = sending.engine.queue_send(&small, &peer).await.unwrap_err();
    assert!(matches!(
        err,
        lanxfer_engine::TransferError::PeerUnavailable { .. }
    ));

    sending.engine.stop().await.unwrap();
    receiver.stop().await.unwrap();
}
