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

//! Outbound side: drives one file or directory to one peer.

use std::{
    future::Future,
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use backon::{ExponentialBuilder, Retryable};
use bytes::Bytes;
use jiff::Timestamp;
use lanxfer_error::{ErrorBody, StatusCode};
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE};
use serde::{Serialize, de::DeserializeOwned};
use snafu::{ResultExt, ensure};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    archive,
    config::TransferConfig,
    digest,
    error::{
        ArchiveSnafu, CancelledSnafu, IntegrityRejectedSnafu, NetworkSnafu, ProtocolSnafu,
        ResourceSnafu, Result, TaskJoinSnafu, TransferError,
    },
    observer::RateMeter,
    peer::Peer,
    store::StateStore,
    types::{
        ChunkResponse, CompleteRequest, CompleteResponse, ContentRange, Direction, InitRequest,
        InitResponse, InitStatus, TRANSFER_ID_HEADER, TransferRecord, TransferStatus,
        TransferStatusResponse, is_valid_transfer_id,
    },
};

/// Why a send was asked to stop early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// User cancel: the peer is told and local state is dropped.
    Cancelled,
    /// The target disappeared from discovery.
    PeerLost,
    /// Engine stop: local state is kept so the next run resumes.
    Shutdown,
}

/// Cooperative stop flag shared between the coordinator and one send.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token:  CancellationToken,
    reason: Arc<OnceLock<AbortReason>>,
}

impl AbortSignal {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Signal that also fires, as [`AbortReason::Shutdown`], when `parent`
    /// is cancelled.
    #[must_use]
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token:  parent.child_token(),
            reason: Arc::default(),
        }
    }

    /// The first reason wins.
    pub fn abort(&self, reason: AbortReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    #[must_use]
    pub fn reason(&self) -> Option<AbortReason> {
        self.token
            .is_cancelled()
            .then(|| self.reason.get().copied().unwrap_or(AbortReason::Shutdown))
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool { self.token.is_cancelled() }

    pub async fn aborted(&self) { self.token.cancelled().await; }
}

/// Progress callback of a running send.
#[derive(Debug, Clone, PartialEq)]
pub enum SendUpdate {
    Started {
        transfer_id:  String,
        filename:     String,
        total:        u64,
        resumed_from: u64,
    },
    Progress {
        bytes: u64,
        total: u64,
        rate:  f64,
    },
    Retrying {
        attempt: u32,
        delay:   Duration,
    },
}

pub type ProgressFn<'a> = dyn Fn(SendUpdate) + Send + Sync + 'a;

/// Outcome of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub transfer_id:  String,
    pub filename:     String,
    pub total:        u64,
    /// Bytes uploaded by this run, excluding the resumed prefix.
    pub bytes_sent:   u64,
    pub resumed_from: u64,
    pub retry_count:  u32,
    /// Where the receiver put the content.
    pub remote_path:  String,
}

/// Temporary archive removed whenever the send ends, however it ends.
struct TempArchive(PathBuf);

impl Drop for TempArchive {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.0.display(), error = %e, "failed to remove temporary archive");
        }
    }
}

struct Payload {
    path:       PathBuf,
    filename:   String,
    is_archive: bool,
    _temp:      Option<TempArchive>,
}

/// Uploads payloads to peers, one at a time per instance of a send.
pub struct Sender {
    client: reqwest::Client,
    config: Arc<TransferConfig>,
    store:  StateStore,
}

impl Sender {
    pub fn new(config: Arc<TransferConfig>, store: StateStore) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context(NetworkSnafu {
                url: "<client setup>",
            })?;
        Ok(Self {
            client,
            config,
            store,
        })
    }

    /// Sends `source` to `peer`, resuming an earlier interrupted attempt of
    /// the same content when the local store remembers one.
    ///
    /// On cancel the peer is told to drop its partial data and the local
    /// record is removed; on shutdown nothing is cleaned up so that a later
    /// run resumes. Temporary archives are removed on every path.
    pub async fn send_path(
        &self,
        source: &Path,
        peer: &Peer,
        abort: &AbortSignal,
        progress: &ProgressFn<'_>,
    ) -> Result<SendReport> {
        let mut transfer_id = None;
        let result = self
            .run(source, peer, abort, progress, &mut transfer_id)
            .await;

        let err = match result {
            Ok(report) => {
                if let Err(e) = self.store.delete(Direction::Outgoing, &report.transfer_id).await {
                    warn!(id = %report.transfer_id, error = %e, "failed to drop outgoing record");
                }
                return Ok(report);
            }
            Err(err) => err,
        };

        match abort.reason() {
            Some(AbortReason::Shutdown) => {
                info!(source = %source.display(), "send interrupted, record kept for resume");
                Err(TransferError::Interrupted)
            }
            reason => {
                if let Some(id) = &transfer_id {
                    if reason == Some(AbortReason::Cancelled) {
                        self.cancel_remote(peer, id).await;
                    }
                    if let Err(e) = self.store.delete(Direction::Outgoing, id).await {
                        warn!(id = %id, error = %e, "failed to drop outgoing record");
                    }
                }
                Err(match reason {
                    Some(AbortReason::Cancelled) => TransferError::Cancelled,
                    Some(AbortReason::PeerLost) => TransferError::PeerUnavailable {
                        peer: peer.endpoint(),
                    },
                    _ => err,
                })
            }
        }
    }

    async fn run(
        &self,
        source: &Path,
        peer: &Peer,
        abort: &AbortSignal,
        progress: &ProgressFn<'_>,
        transfer_id: &mut Option<String>,
    ) -> Result<SendReport> {
        let payload = self.prepare(source).await?;
        ensure!(!abort.is_aborted(), CancelledSnafu);

        let hash_path = payload.path.clone();
        let (hash, total) = tokio::task::spawn_blocking(move || digest::hash_file(&hash_path))
            .await
            .context(TaskJoinSnafu)?
            .context(ResourceSnafu {
                path: &payload.path,
            })?;
        ensure!(!abort.is_aborted(), CancelledSnafu);
        if total == 0 {
            return Err(TransferError::Resource {
                path:   source.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "source is empty"),
            });
        }

        let endpoint = peer.endpoint();
        let base = peer.base_url();
        let resume_key = digest::resume_key(&payload.filename, total, &hash, &endpoint);
        let previous = self
            .store
            .lookup_by_resume_key(Direction::Outgoing, &resume_key);

        let retries = AtomicU32::new(0);
        let init = InitRequest {
            filename:   payload.filename.clone(),
            size:       i64::try_from(total).unwrap_or(i64::MAX),
            hash:       hash.clone(),
            resume_id:  previous.as_ref().map(|r| r.transfer_id.clone()),
            is_archive: payload.is_archive,
        };
        let init_url = format!("{base}/transfer/init");
        let accepted: InitResponse = self
            .with_retry(abort, &retries, progress, is_server_side, || {
                self.post_json(&init_url, &init)
            })
            .await?;

        ensure!(
            is_valid_transfer_id(&accepted.transfer_id),
            ProtocolSnafu {
                reason: format!("peer issued unusable transfer id {:?}", accepted.transfer_id),
            }
        );
        ensure!(
            accepted.resume_offset <= total,
            ProtocolSnafu {
                reason: format!(
                    "peer resumes at {} beyond size {total}",
                    accepted.resume_offset
                ),
            }
        );
        *transfer_id = Some(accepted.transfer_id.clone());
        let resumed_from = match accepted.status {
            InitStatus::Resuming => accepted.resume_offset,
            InitStatus::Ready => 0,
        };

        let now = Timestamp::now().as_second();
        let mut record = TransferRecord {
            transfer_id: accepted.transfer_id.clone(),
            resume_key,
            direction: Direction::Outgoing,
            peer: endpoint,
            filename: payload.filename.clone(),
            total_size: total,
            content_hash: hash,
            offset: resumed_from,
            status: TransferStatus::Transferring,
            retry_count: 0,
            created_at: previous.as_ref().map_or(now, |r| r.created_at),
            updated_at: now,
            is_archive: payload.is_archive,
            source_path: Some(source.to_path_buf()),
        };
        self.store.upsert(&record).await?;

        progress(SendUpdate::Started {
            transfer_id: record.transfer_id.clone(),
            filename: record.filename.clone(),
            total,
            resumed_from,
        });
        info!(
            id = %record.transfer_id,
            file = %record.filename,
            peer = %record.peer,
            total,
            resumed_from,
            "upload started"
        );

        self.upload_chunks(&base, &payload.path, &mut record, abort, &retries, progress)
            .await?;
        ensure!(!abort.is_aborted(), CancelledSnafu);

        let done = self
            .complete(&base, &record.transfer_id, abort, &retries, progress)
            .await?;
        info!(id = %record.transfer_id, path = %done.path, "upload completed");

        Ok(SendReport {
            transfer_id: record.transfer_id,
            filename: record.filename,
            total,
            bytes_sent: total - resumed_from,
            resumed_from,
            retry_count: retries.load(Ordering::Relaxed),
            remote_path: done.path,
        })
    }

    /// Resolves the bytes to send, archiving directories first.
    async fn prepare(&self, source: &Path) -> Result<Payload> {
        let meta = tokio::fs::metadata(source)
            .await
            .context(ResourceSnafu { path: source })?;

        if !meta.is_dir() {
            let filename = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| TransferError::Resource {
                    path:   source.to_path_buf(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "source has no file name",
                    ),
                })?;
            return Ok(Payload {
                path: source.to_path_buf(),
                filename,
                is_archive: false,
                _temp: None,
            });
        }

        let filename = archive::archive_name(source);
        let outbox = self.config.outbox_dir();
        tokio::fs::create_dir_all(&outbox)
            .await
            .context(ResourceSnafu { path: &outbox })?;
        let temp = outbox.join(format!(
            "{}-{filename}",
            uuid::Uuid::new_v4().simple()
        ));
        let guard = TempArchive(temp.clone());
        let dir = source.to_path_buf();
        let dest = temp.clone();
        tokio::task::spawn_blocking(move || archive::create_archive(&dir, &dest))
            .await
            .context(TaskJoinSnafu)?
            .context(ArchiveSnafu { path: source })?;

        Ok(Payload {
            path: temp,
            filename,
            is_archive: true,
            _temp: Some(guard),
        })
    }

    async fn upload_chunks(
        &self,
        base: &str,
        path: &Path,
        record: &mut TransferRecord,
        abort: &AbortSignal,
        retries: &AtomicU32,
        progress: &ProgressFn<'_>,
    ) -> Result<()> {
        let mut file = tokio::fs::File::open(path)
            .await
            .context(ResourceSnafu { path })?;
        file.seek(SeekFrom::Start(record.offset))
            .await
            .context(ResourceSnafu { path })?;

        let chunk_size = self.config.chunk_size.as_bytes();
        let total = record.total_size;
        let mut meter = RateMeter::new();

        while record.offset < total {
            ensure!(!abort.is_aborted(), CancelledSnafu);

            let len = chunk_size.min(total - record.offset);
            let mut buf = vec![0u8; usize::try_from(len).unwrap_or(usize::MAX)];
            file.read_exact(&mut buf)
                .await
                .context(ResourceSnafu { path })?;
            let body = Bytes::from(buf);
            let range = ContentRange::new(record.offset, len, total);

            self.send_chunk(base, &record.transfer_id, range, &body, abort, retries, progress)
                .await?;

            record.offset = range.end + 1;
            record.retry_count = retries.load(Ordering::Relaxed);
            record.touch();
            self.store.upsert(record).await?;

            progress(SendUpdate::Progress {
                bytes: record.offset,
                total,
                rate: meter.record(len),
            });
        }
        Ok(())
    }

    /// Uploads one chunk, retrying the same range with exponential backoff.
    ///
    /// Before each retry the receiver is asked for its offset: if the
    /// previous attempt landed even though the response was lost, the chunk
    /// counts as sent.
    #[allow(clippy::too_many_arguments)]
    async fn send_chunk(
        &self,
        base: &str,
        transfer_id: &str,
        range: ContentRange,
        body: &Bytes,
        abort: &AbortSignal,
        retries: &AtomicU32,
        progress: &ProgressFn<'_>,
    ) -> Result<()> {
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let url = format!("{base}/transfer/chunk");
        let url = url.as_str();

        self.with_retry(abort, retries, progress, TransferError::is_transient, move || async move {
            if attempts.fetch_add(1, Ordering::Relaxed) > 0
                && let Ok(status) = self.remote_status(base, transfer_id).await
                && status.offset == range.end + 1
            {
                debug!(id = transfer_id, %range, "chunk already landed");
                return Ok(());
            }

            let response = self
                .client
                .post(url)
                .header(TRANSFER_ID_HEADER, transfer_id)
                .header(CONTENT_RANGE, range.to_string())
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(body.clone())
                .send()
                .await
                .context(NetworkSnafu { url })?;
            let _: ChunkResponse = decode(url, response).await?;
            Ok(())
        })
        .await
    }

    /// Asks the receiver to verify and finalize. Retried like `init`: the
    /// receiver answers a repeated call for a finished transfer with the
    /// original result, and reports `unavailable` while still unpacking.
    async fn complete(
        &self,
        base: &str,
        transfer_id: &str,
        abort: &AbortSignal,
        retries: &AtomicU32,
        progress: &ProgressFn<'_>,
    ) -> Result<CompleteResponse> {
        let url = format!("{base}/transfer/complete");
        let request = CompleteRequest {
            transfer_id: transfer_id.to_string(),
        };
        let finalized = self
            .with_retry(abort, retries, progress, is_server_side, || {
                self.post_json(&url, &request)
            })
            .await;
        match finalized {
            Err(TransferError::HttpStatus {
                code: Some(StatusCode::IntegrityMismatch),
                message,
                ..
            }) => IntegrityRejectedSnafu { message }.fail(),
            other => other,
        }
    }

    async fn remote_status(&self, base: &str, transfer_id: &str) -> Result<TransferStatusResponse> {
        let url = format!("{base}/transfer/{transfer_id}/status");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context(NetworkSnafu { url: &url })?;
        decode(&url, response).await
    }

    /// Best effort: the peer may already be gone.
    async fn cancel_remote(&self, peer: &Peer, transfer_id: &str) {
        let url = format!("{}/transfer/{transfer_id}", peer.base_url());
        match self
            .client
            .delete(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => debug!(%url, status = %response.status(), "remote cancel sent"),
            Err(e) => debug!(%url, error = %e, "remote cancel failed"),
        }
    }

    async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .context(NetworkSnafu { url })?;
        decode(url, response).await
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.config.retry_initial_delay)
            .with_max_delay(self.config.retry_max_delay)
            .with_factor(2.0)
            .with_max_times(self.config.max_retries)
    }

    /// Runs `op` under the configured backoff until it succeeds, fails with
    /// an error `retry_on` rejects, exhausts the budget, or `abort` fires.
    async fn with_retry<T, F, Fut>(
        &self,
        abort: &AbortSignal,
        retries: &AtomicU32,
        progress: &ProgressFn<'_>,
        retry_on: fn(&TransferError) -> bool,
        op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempt = op
            .retry(self.backoff())
            .when(retry_on)
            .notify(|err: &TransferError, delay: Duration| {
                let attempt = retries.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(error = %err, ?delay, attempt, "request failed, retrying");
                progress(SendUpdate::Retrying { attempt, delay });
            });

        tokio::select! {
            biased;
            () = abort.aborted() => CancelledSnafu.fail(),
            result = attempt => result,
        }
    }
}

/// Retry only failures that are plausibly not the request's fault.
fn is_server_side(err: &TransferError) -> bool {
    match err {
        TransferError::Network { .. } => true,
        TransferError::HttpStatus {
            code: Some(code), ..
        } => code.is_retryable(),
        TransferError::HttpStatus { status, .. } => *status >= 500,
        _ => false,
    }
}

async fn decode<T: DeserializeOwned>(url: &str, response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response.json::<T>().await.context(NetworkSnafu { url });
    }

    let text = response.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => (Some(body.code), body.error),
        Err(_) => (None, text),
    };
    Err(TransferError::HttpStatus {
        url: url.to_string(),
        status: status.as_u16(),
        code,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_reason_defaults_to_shutdown_for_parent_cancel() {
        let parent = CancellationToken::new();
        let signal = AbortSignal::child_of(&parent);
        assert_eq!(signal.reason(), None);
        parent.cancel();
        assert_eq!(signal.reason(), Some(AbortReason::Shutdown));
    }

    #[test]
    fn first_abort_reason_wins() {
        let signal = AbortSignal::new();
        signal.abort(AbortReason::PeerLost);
        signal.abort(AbortReason::Cancelled);
        assert_eq!(signal.reason(), Some(AbortReason::PeerLost));
    }

    #[tokio::test]
    async fn backoff_follows_doubling_schedule() {
        use backon::BackoffBuilder;

        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path(), Duration::from_secs(60))
            .await
            .unwrap();
        let sender = Sender::new(Arc::new(TransferConfig::default()), store).unwrap();

        let delays: Vec<Duration> = sender.backoff().build().collect();
        assert_eq!(
            delays,
            [1, 2, 4, 8, 16].map(Duration::from_secs).to_vec(),
            "five retries after the first attempt"
        );
    }

    #[test]
    fn only_server_side_failures_retry_init() {
        let http = |status| TransferError::HttpStatus {
            url: "u".to_string(),
            status,
            code: None,
            message: String::new(),
        };
        assert!(is_server_side(&http(503)));
        assert!(!is_server_side(&http(400)));
        let coded = |status, code| TransferError::HttpStatus {
            url: "u".to_string(),
            status,
            code: Some(code),
            message: String::new(),
        };
        assert!(is_server_side(&coded(503, StatusCode::Unavailable)));
        let mismatch = coded(422, StatusCode::IntegrityMismatch);
        assert!(!is_server_side(&mismatch));
        assert!(http(400).is_transient());
    }
}
