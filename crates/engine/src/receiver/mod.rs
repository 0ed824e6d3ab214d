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

//! Inbound side of the protocol.
//!
//! [`Receiver`] holds every live incoming transfer and is owned by the
//! engine task; the HTTP layer in [`routes`] only forwards requests to it.
//! Each transfer writes to `<download_dir>/.<transfer_id>.part` until it is
//! completed and moved to its final name.

pub mod routes;

use std::{
    collections::{HashMap, VecDeque},
    io,
    path::{Component, Path, PathBuf},
};

use bytes::Bytes;
use jiff::Timestamp;
use sha2::{Digest, Sha256};
use snafu::{OptionExt, ResultExt, ensure};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};
use tracing::{debug, info, warn};

use crate::{
    archive, digest,
    error::{
        BusySnafu, FailureReason, IntegrityMismatchSnafu, ProtocolSnafu, Result, StorageSnafu,
        TaskJoinSnafu, TransferError, UnknownTransferSnafu, ValidationSnafu,
    },
    observer::{RateMeter, TransferEvent, TransferEventKind},
    store::StateStore,
    types::{
        CancelResponse, ChunkResponse, CompleteResponse, ContentRange, Direction, InitRequest,
        InitResponse, InitStatus, TransferRecord, TransferStatus, TransferStatusResponse,
    },
};

const PART_SUFFIX: &str = ".part";
const EXTRACT_SUFFIX: &str = ".extract";
/// Completed transfers whose `complete` answer is kept for repeated calls.
const COMPLETED_MEMORY: usize = 32;

struct IncomingTransfer {
    record: TransferRecord,
    file:   File,
    hasher: Sha256,
    meter:  RateMeter,
}

/// What `complete` needs from the caller next.
#[derive(Debug)]
pub enum CompleteOutcome {
    Done(CompleteResponse),
    /// Verified archive; unpack it off the engine task, then call
    /// [`Receiver::finish_extraction`].
    Extract(ExtractJob),
}

#[derive(Debug, Clone)]
pub struct ExtractJob {
    pub transfer_id: String,
    pub archive:     PathBuf,
    pub dest_dir:    PathBuf,
    pub staging:     PathBuf,
}

impl ExtractJob {
    /// Blocking.
    pub fn run(&self) -> io::Result<PathBuf> {
        archive::extract_archive(&self.archive, &self.dest_dir, &self.staging)
    }
}

pub struct Receiver {
    download_dir: PathBuf,
    store:        StateStore,
    expiry_secs:  i64,
    transfers:    HashMap<String, IncomingTransfer>,
    events:       Vec<TransferEvent>,
    /// Verified archives whose unpacking was cut short by a restart.
    unextracted:  Vec<ExtractJob>,
    completed:    VecDeque<(String, CompleteResponse)>,
}

impl Receiver {
    pub fn new(download_dir: PathBuf, store: StateStore, expiry_secs: i64) -> Self {
        Self {
            download_dir,
            store,
            expiry_secs,
            transfers: HashMap::new(),
            events: Vec::new(),
            unextracted: Vec::new(),
            completed: VecDeque::new(),
        }
    }

    /// Reloads interrupted transfers and removes stray temp files.
    ///
    /// A record survives only if its temp file holds at least `offset`
    /// bytes. Extra bytes past `offset` are cut off; the digest is rebuilt
    /// from `[0, offset)` without rewriting anything. Archives that were
    /// verified but not yet unpacked are queued again, see
    /// [`Self::take_unextracted`].
    pub async fn restore(&mut self) -> Result<usize> {
        fs::create_dir_all(&self.download_dir)
            .await
            .context(StorageSnafu {
                path: &self.download_dir,
            })?;

        for record in self.store.records(Direction::Incoming) {
            let id = record.transfer_id.clone();
            match self.reopen(record).await {
                Ok(transfer) => {
                    debug!(id = %id, offset = transfer.record.offset, "incoming transfer restored");
                    if transfer.record.status == TransferStatus::Extracting {
                        info!(id = %id, file = %transfer.record.filename, "redoing archive extraction");
                        let job = self.extract_job(&id);
                        self.unextracted.push(job);
                    }
                    self.transfers.insert(id, transfer);
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "dropping unrecoverable incoming transfer");
                    self.discard_files(&id).await;
                    self.store.delete(Direction::Incoming, &id).await?;
                }
            }
        }

        self.collect_garbage().await?;
        info!(restored = self.transfers.len(), "receiver ready");
        Ok(self.transfers.len())
    }

    async fn reopen(&self, record: TransferRecord) -> Result<IncomingTransfer> {
        let path = self.temp_path(&record.transfer_id);
        let extracting = record.status == TransferStatus::Extracting;
        ensure!(
            record.status.accepts_data() || (extracting && record.offset == record.total_size),
            ProtocolSnafu {
                reason: format!("transfer was {} when interrupted", record.status),
            }
        );

        let len = fs::metadata(&path)
            .await
            .context(StorageSnafu { path: &path })?
            .len();
        ensure!(
            len >= record.offset,
            ProtocolSnafu {
                reason: format!("temp file holds {len} bytes, record says {}", record.offset),
            }
        );
        if len > record.offset {
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .context(StorageSnafu { path: &path })?;
            file.set_len(record.offset)
                .await
                .context(StorageSnafu { path: &path })?;
            file.sync_all().await.context(StorageSnafu { path: &path })?;
        }

        // An extracting archive was verified before the restart.
        let hasher = if extracting {
            Sha256::new()
        } else {
            let offset = record.offset;
            let hash_path = path.clone();
            tokio::task::spawn_blocking(move || digest::hash_prefix(&hash_path, offset))
                .await
                .context(TaskJoinSnafu)?
                .context(StorageSnafu { path: &path })?
        };

        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .context(StorageSnafu { path: &path })?;

        Ok(IncomingTransfer {
            record,
            file,
            hasher,
            meter: RateMeter::new(),
        })
    }

    /// Deletes `.part` files and extraction leftovers no live transfer owns.
    async fn collect_garbage(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.download_dir)
            .await
            .context(StorageSnafu {
                path: &self.download_dir,
            })?;
        while let Some(entry) = entries.next_entry().await.context(StorageSnafu {
            path: &self.download_dir,
        })? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };

            if let Some(id) = owned_id(name, PART_SUFFIX)
                && !self.transfers.contains_key(id)
            {
                info!(file = name, "removing orphaned temp file");
                let _ = fs::remove_file(entry.path()).await;
            } else if owned_id(name, EXTRACT_SUFFIX).is_some() {
                info!(dir = name, "removing stale extraction directory");
                let _ = fs::remove_dir_all(entry.path()).await;
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn active_count(&self) -> usize { self.transfers.len() }

    /// Extraction jobs left over from before the last restart. Each must be
    /// run and handed to [`Self::finish_extraction`] like a fresh one.
    pub fn take_unextracted(&mut self) -> Vec<ExtractJob> { std::mem::take(&mut self.unextracted) }

    /// Events produced since the last call, in order.
    pub fn drain_events(&mut self) -> Vec<TransferEvent> { std::mem::take(&mut self.events) }

    /// `POST /transfer/init`.
    ///
    /// `peer` is the sender's address and binds the resume key to it.
    pub async fn init(&mut self, request: InitRequest, peer: &str) -> Result<InitResponse> {
        validate_init(&request)?;
        let total = u64::try_from(request.size).unwrap_or_default();
        let hash = request.hash.to_ascii_lowercase();
        let resume_key = digest::resume_key(&request.filename, total, &hash, peer);

        let same_payload = |t: &IncomingTransfer| {
            t.record.filename == request.filename
                && t.record.total_size == total
                && t.record.content_hash == hash
        };
        let candidate = request
            .resume_id
            .as_deref()
            .filter(|id| self.transfers.get(*id).is_some_and(same_payload))
            .map(str::to_string)
            .or_else(|| {
                self.transfers
                    .values()
                    .find(|t| t.record.resume_key == resume_key)
                    .map(|t| t.record.transfer_id.clone())
            });

        if let Some(id) = candidate {
            let now = Timestamp::now().as_second();
            let expired = self.transfers[&id].record.is_expired(self.expiry_secs, now);
            if expired {
                info!(id = %id, "resumable transfer expired, starting over");
                self.drop_transfer(&id).await?;
            } else {
                return self.resume(&id).await;
            }
        }

        self.start_fresh(request, total, hash, resume_key, peer).await
    }

    async fn resume(&mut self, id: &str) -> Result<InitResponse> {
        let transfer = self
            .transfers
            .get_mut(id)
            .context(UnknownTransferSnafu { transfer_id: id })?;
        ensure!(
            transfer.record.status.accepts_data(),
            ProtocolSnafu {
                reason: format!("transfer {id} is {}", transfer.record.status),
            }
        );
        transfer.record.touch();
        self.store.upsert(&transfer.record).await?;
        transfer.meter = RateMeter::new();

        let record = &transfer.record;
        info!(id, offset = record.offset, file = %record.filename, "resuming incoming transfer");
        self.events.push(TransferEvent {
            id:        id.to_string(),
            direction: Direction::Incoming,
            kind:      TransferEventKind::Started {
                filename:     record.filename.clone(),
                total:        record.total_size,
                peer:         record.peer.clone(),
                resumed_from: record.offset,
            },
        });
        Ok(InitResponse {
            transfer_id:   id.to_string(),
            resume_offset: record.offset,
            status:        InitStatus::Resuming,
        })
    }

    async fn start_fresh(
        &mut self,
        request: InitRequest,
        total: u64,
        hash: String,
        resume_key: String,
        peer: &str,
    ) -> Result<InitResponse> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let path = self.temp_path(&id);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .await
            .context(StorageSnafu { path: &path })?;

        let now = Timestamp::now().as_second();
        let record = TransferRecord {
            transfer_id: id.clone(),
            resume_key,
            direction: Direction::Incoming,
            peer: peer.to_string(),
            filename: request.filename,
            total_size: total,
            content_hash: hash,
            offset: 0,
            status: TransferStatus::Pending,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            is_archive: request.is_archive,
            source_path: None,
        };
        if let Err(e) = self.store.upsert(&record).await {
            drop(file);
            let _ = fs::remove_file(&path).await;
            return Err(e);
        }

        info!(id = %id, file = %record.filename, total, peer, "incoming transfer ready");
        self.events.push(TransferEvent {
            id:        id.clone(),
            direction: Direction::Incoming,
            kind:      TransferEventKind::Started {
                filename: record.filename.clone(),
                total,
                peer: peer.to_string(),
                resumed_from: 0,
            },
        });
        self.transfers.insert(
            id.clone(),
            IncomingTransfer {
                record,
                file,
                hasher: Sha256::new(),
                meter: RateMeter::new(),
            },
        );
        Ok(InitResponse {
            transfer_id:   id,
            resume_offset: 0,
            status:        InitStatus::Ready,
        })
    }

    /// `POST /transfer/chunk`.
    ///
    /// Every check runs before the first byte is written; a rejected chunk
    /// leaves offset, status and file contents untouched.
    pub async fn chunk(
        &mut self,
        transfer_id: Option<&str>,
        content_range: Option<&str>,
        body: Bytes,
    ) -> Result<ChunkResponse> {
        let id = transfer_id.context(ProtocolSnafu {
            reason: "missing X-Transfer-ID header",
        })?;
        let path = self.temp_path(id);
        let transfer = self
            .transfers
            .get_mut(id)
            .context(UnknownTransferSnafu { transfer_id: id })?;
        let record = &transfer.record;

        ensure!(
            record.status.accepts_data()
                && record.status.can_transition_to(TransferStatus::Transferring),
            ProtocolSnafu {
                reason: format!("transfer {id} is {}", record.status),
            }
        );
        let range: ContentRange = content_range
            .context(ProtocolSnafu {
                reason: "missing Content-Range header",
            })?
            .parse()
            .map_err(|reason| TransferError::Protocol { reason })?;
        ensure!(
            range.total == record.total_size,
            ProtocolSnafu {
                reason: format!(
                    "Content-Range total {} does not match declared size {}",
                    range.total, record.total_size
                ),
            }
        );
        ensure!(
            range.start == record.offset,
            ProtocolSnafu {
                reason: format!(
                    "chunk starts at {}, expected {}",
                    range.start, record.offset
                ),
            }
        );
        ensure!(
            range.end < record.total_size,
            ProtocolSnafu {
                reason: format!("chunk ends at {} past size {}", range.end, record.total_size),
            }
        );
        ensure!(
            body.len() as u64 == range.byte_count(),
            ProtocolSnafu {
                reason: format!(
                    "body has {} bytes, Content-Range covers {}",
                    body.len(),
                    range.byte_count()
                ),
            }
        );

        let offset = record.offset;
        let written = async {
            transfer.file.write_all(&body).await?;
            transfer.file.sync_data().await
        }
        .await;
        if let Err(e) = written {
            if let Err(e) = transfer.file.set_len(offset).await {
                warn!(id, error = %e, "failed to roll back partial chunk");
            }
            return Err(e).context(StorageSnafu { path });
        }

        transfer.hasher.update(&body);
        let record = &mut transfer.record;
        record.offset = range.end + 1;
        record.status = TransferStatus::Transferring;
        record.touch();
        let rate = transfer.meter.record(range.byte_count());
        let (received, total) = (record.offset, record.total_size);
        self.events.push(TransferEvent {
            id:        id.to_string(),
            direction: Direction::Incoming,
            kind:      TransferEventKind::Progress {
                bytes: received,
                total,
                rate,
            },
        });
        // Bytes are durable even if this fails; on restart the file is cut
        // back to the last persisted offset.
        self.store.upsert(&transfer.record).await?;

        Ok(ChunkResponse {
            status: "ok".to_string(),
            received,
            total,
        })
    }

    /// `POST /transfer/complete`.
    ///
    /// Repeating the call for a recently completed transfer returns the
    /// first answer again, so a sender whose response got lost can retry.
    pub async fn complete(&mut self, transfer_id: &str) -> Result<CompleteOutcome> {
        if let Some((_, done)) = self.completed.iter().find(|(id, _)| id == transfer_id) {
            debug!(id = transfer_id, "repeated complete for finished transfer");
            return Ok(CompleteOutcome::Done(done.clone()));
        }
        let temp = self.temp_path(transfer_id);
        let transfer = self
            .transfers
            .get_mut(transfer_id)
            .context(UnknownTransferSnafu { transfer_id })?;
        let record = &transfer.record;
        ensure!(
            record.status != TransferStatus::Extracting,
            BusySnafu { transfer_id }
        );
        ensure!(
            record.status.accepts_data(),
            ProtocolSnafu {
                reason: format!("transfer {transfer_id} is {}", record.status),
            }
        );
        ensure!(
            record.offset == record.total_size,
            ProtocolSnafu {
                reason: format!(
                    "only {} of {} bytes received",
                    record.offset, record.total_size
                ),
            }
        );

        let actual = digest::to_hex(transfer.hasher.clone());
        if actual != record.content_hash {
            let expected = record.content_hash.clone();
            warn!(id = transfer_id, %expected, %actual, "content hash mismatch");
            self.fail(transfer_id, FailureReason::Integrity, "content hash mismatch")
                .await?;
            return IntegrityMismatchSnafu { expected, actual }.fail();
        }

        transfer
            .file
            .sync_all()
            .await
            .context(StorageSnafu { path: &temp })?;

        if transfer.record.is_archive {
            ensure!(
                transfer
                    .record
                    .status
                    .can_transition_to(TransferStatus::Extracting),
                ProtocolSnafu {
                    reason: format!("transfer {transfer_id} has not received any data"),
                }
            );
            transfer.record.status = TransferStatus::Extracting;
            transfer.record.touch();
            self.store.upsert(&transfer.record).await?;
            return Ok(CompleteOutcome::Extract(self.extract_job(transfer_id)));
        }

        let dest = archive::unique_destination(&self.download_dir, &transfer.record.filename);
        fs::rename(&temp, &dest)
            .await
            .context(StorageSnafu { path: &dest })?;
        let done = CompleteResponse {
            status: TransferStatus::Completed.to_string(),
            path: dest.display().to_string(),
            size: transfer.record.total_size,
            hash_verified: true,
            extracted: false,
        };
        self.finish(transfer_id, &done).await;
        Ok(CompleteOutcome::Done(done))
    }

    /// Applies the result of an [`ExtractJob`].
    pub async fn finish_extraction(
        &mut self,
        transfer_id: &str,
        result: io::Result<PathBuf>,
    ) -> Result<CompleteResponse> {
        let temp = self.temp_path(transfer_id);
        let size = self
            .transfers
            .get(transfer_id)
            .context(UnknownTransferSnafu { transfer_id })?
            .record
            .total_size;

        match result {
            Ok(dest) => {
                if let Err(e) = fs::remove_file(&temp).await {
                    warn!(id = transfer_id, error = %e, "failed to remove received archive");
                }
                let done = CompleteResponse {
                    status: TransferStatus::Completed.to_string(),
                    path: dest.display().to_string(),
                    size,
                    hash_verified: true,
                    extracted: true,
                };
                self.finish(transfer_id, &done).await;
                Ok(done)
            }
            Err(source) => {
                warn!(id = transfer_id, error = %source, "archive extraction failed");
                self.fail(
                    transfer_id,
                    FailureReason::Storage,
                    &format!("extraction failed: {source}"),
                )
                .await?;
                Err(TransferError::Storage { path: temp, source })
            }
        }
    }

    /// `GET /transfer/{id}/status`.
    pub fn status(&self, transfer_id: &str) -> Result<TransferStatusResponse> {
        let transfer = self
            .transfers
            .get(transfer_id)
            .context(UnknownTransferSnafu { transfer_id })?;
        Ok(TransferStatusResponse {
            status: transfer.record.status,
            offset: transfer.record.offset,
        })
    }

    /// `DELETE /transfer/{id}`: drops partial data and the record.
    pub async fn cancel(&mut self, transfer_id: &str) -> Result<CancelResponse> {
        let status = self
            .transfers
            .get(transfer_id)
            .context(UnknownTransferSnafu { transfer_id })?
            .record
            .status;
        ensure!(
            status.can_transition_to(TransferStatus::Cancelled),
            ProtocolSnafu {
                reason: format!("transfer {transfer_id} is {status} and cannot be cancelled"),
            }
        );

        self.drop_transfer(transfer_id).await?;
        info!(id = transfer_id, "incoming transfer cancelled");
        self.events.push(TransferEvent {
            id:        transfer_id.to_string(),
            direction: Direction::Incoming,
            kind:      TransferEventKind::Cancelled,
        });
        Ok(CancelResponse {
            status: TransferStatus::Cancelled,
        })
    }

    /// Forgets transfers whose records the store just pruned.
    pub async fn forget_pruned(&mut self, pruned: &[TransferRecord]) {
        for record in pruned
            .iter()
            .filter(|r| r.direction == Direction::Incoming)
        {
            let id = &record.transfer_id;
            let extracting = self
                .transfers
                .get(id)
                .is_some_and(|t| t.record.status == TransferStatus::Extracting);
            if extracting {
                continue;
            }
            self.transfers.remove(id);
            self.discard_files(id).await;
            info!(id = %id, "expired incoming transfer removed");
        }
    }

    async fn finish(&mut self, transfer_id: &str, done: &CompleteResponse) {
        let Some(transfer) = self.transfers.remove(transfer_id) else {
            return;
        };
        if self.completed.len() == COMPLETED_MEMORY {
            self.completed.pop_front();
        }
        self.completed
            .push_back((transfer_id.to_string(), done.clone()));
        if let Err(e) = self.store.delete(Direction::Incoming, transfer_id).await {
            warn!(id = transfer_id, error = %e, "failed to drop completed record");
        }
        info!(id = transfer_id, file = %transfer.record.filename, "incoming transfer completed");
        self.events.push(TransferEvent {
            id:        transfer_id.to_string(),
            direction: Direction::Incoming,
            kind:      TransferEventKind::Completed {
                bytes:       transfer.record.total_size,
                destination: Some(PathBuf::from(&done.path)),
                retry_count: 0,
            },
        });
    }

    async fn fail(
        &mut self,
        transfer_id: &str,
        reason: FailureReason,
        message: &str,
    ) -> Result<()> {
        self.drop_transfer(transfer_id).await?;
        self.events.push(TransferEvent {
            id:        transfer_id.to_string(),
            direction: Direction::Incoming,
            kind:      TransferEventKind::Failed {
                reason,
                message: message.to_string(),
            },
        });
        Ok(())
    }

    async fn drop_transfer(&mut self, transfer_id: &str) -> Result<()> {
        self.transfers.remove(transfer_id);
        self.discard_files(transfer_id).await;
        self.store.delete(Direction::Incoming, transfer_id).await
    }

    async fn discard_files(&self, transfer_id: &str) {
        let path = self.temp_path(transfer_id);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove temp file"),
        }
    }

    fn extract_job(&self, transfer_id: &str) -> ExtractJob {
        ExtractJob {
            transfer_id: transfer_id.to_string(),
            archive:     self.temp_path(transfer_id),
            dest_dir:    self.download_dir.clone(),
            staging:     self
                .download_dir
                .join(format!(".{transfer_id}{EXTRACT_SUFFIX}")),
        }
    }

    fn temp_path(&self, transfer_id: &str) -> PathBuf {
        self.download_dir
            .join(format!(".{transfer_id}{PART_SUFFIX}"))
    }
}

fn validate_init(request: &InitRequest) -> Result<()> {
    let name = request.filename.trim();
    ensure!(
        !name.is_empty(),
        ValidationSnafu {
            reason: "filename must not be empty",
        }
    );
    let mut components = Path::new(&request.filename).components();
    ensure!(
        !request.filename.contains(['/', '\\'])
            && matches!(components.next(), Some(Component::Normal(_)))
            && components.next().is_none(),
        ValidationSnafu {
            reason: format!("filename {:?} must not contain path components", request.filename),
        }
    );
    ensure!(
        request.size > 0,
        ValidationSnafu {
            reason: format!("size must be positive, got {}", request.size),
        }
    );
    ensure!(
        !request.hash.is_empty(),
        ValidationSnafu {
            reason: "hash is required",
        }
    );
    ensure!(
        request.hash.len() == 64 && request.hash.bytes().all(|b| b.is_ascii_hexdigit()),
        ValidationSnafu {
            reason: "hash must be a hex SHA-256 digest",
        }
    );
    if let Some(id) = &request.resume_id {
        ensure!(
            crate::types::is_valid_transfer_id(id),
            ValidationSnafu {
                reason: "resume_id is malformed",
            }
        );
    }
    Ok(())
}

/// Transfer id embedded in an engine-owned temp name such as
/// `.<32 hex>.part`, if `name` is one.
fn owned_id<'a>(name: &'a str, suffix: &str) -> Option<&'a str> {
    let id = name.strip_prefix('.')?.strip_suffix(suffix)?;
    (id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit())).then_some(id)
}
