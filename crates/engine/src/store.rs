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

//! Durable transfer records.
//!
//! Each record lives in its own `<direction>-<transfer_id>.json` document.
//! Writes go to a sibling `.tmp` file which is fsynced and then renamed over
//! the old version, so a crash leaves either the previous or the new
//! document, never a torn one.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use jiff::Timestamp;
use parking_lot::Mutex;
use snafu::ResultExt;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::{
    error::{ProtocolSnafu, Result, StateCodecSnafu, StorageSnafu},
    types::{Direction, TransferRecord, is_valid_transfer_id},
};

const RECORD_EXT: &str = "json";
const TMP_EXT: &str = "tmp";

type RecordKey = (Direction, String);

/// Clonable handle to the on-disk record store.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Inner>,
}

struct Inner {
    dir:     PathBuf,
    records: Mutex<HashMap<RecordKey, TransferRecord>>,
}

impl StateStore {
    /// Loads every readable record under `dir` and prunes the ones older
    /// than `expiry`. Unreadable documents and leftover temp files are
    /// deleted.
    pub async fn open(dir: impl AsRef<Path>, expiry: Duration) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .context(StorageSnafu { path: &dir })?;

        let mut records = HashMap::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .context(StorageSnafu { path: &dir })?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .context(StorageSnafu { path: &dir })?
        {
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(RECORD_EXT) => {}
                Some(TMP_EXT) => {
                    let _ = fs::remove_file(&path).await;
                    continue;
                }
                _ => continue,
            }

            match read_record(&path).await {
                Ok(record) if path == record_path(&dir, record.direction, &record.transfer_id) => {
                    records.insert((record.direction, record.transfer_id.clone()), record);
                }
                Ok(record) => {
                    warn!(path = %path.display(), id = %record.transfer_id, "record stored under the wrong name, dropping");
                    let _ = fs::remove_file(&path).await;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable transfer record, dropping");
                    let _ = fs::remove_file(&path).await;
                }
            }
        }

        info!(dir = %dir.display(), records = records.len(), "state store opened");
        let store = Self {
            inner: Arc::new(Inner {
                dir,
                records: Mutex::new(records),
            }),
        };
        store.prune(expiry).await?;
        Ok(store)
    }

    #[must_use]
    pub fn dir(&self) -> &Path { &self.inner.dir }

    /// Writes `record`, replacing any earlier version with the same id.
    ///
    /// Another record in the same direction holding the same `resume_key`
    /// is removed, so a key never points at two resumable attempts.
    pub async fn upsert(&self, record: &TransferRecord) -> Result<()> {
        snafu::ensure!(
            is_valid_transfer_id(&record.transfer_id),
            ProtocolSnafu {
                reason: format!("transfer id {:?} is not storable", record.transfer_id),
            }
        );

        let stale: Vec<String> = self
            .inner
            .records
            .lock()
            .values()
            .filter(|r| {
                r.direction == record.direction
                    && r.resume_key == record.resume_key
                    && r.transfer_id != record.transfer_id
            })
            .map(|r| r.transfer_id.clone())
            .collect();
        for id in stale {
            debug!(id = %id, "superseded by {}", record.transfer_id);
            self.delete(record.direction, &id).await?;
        }

        let path = record_path(&self.inner.dir, record.direction, &record.transfer_id);
        let tmp = path.with_extension(TMP_EXT);
        let data = serde_json::to_vec_pretty(record).context(StateCodecSnafu { path: &path })?;

        let mut file = fs::File::create(&tmp)
            .await
            .context(StorageSnafu { path: &tmp })?;
        file.write_all(&data)
            .await
            .context(StorageSnafu { path: &tmp })?;
        file.sync_all().await.context(StorageSnafu { path: &tmp })?;
        drop(file);
        fs::rename(&tmp, &path)
            .await
            .context(StorageSnafu { path: &path })?;

        self.inner
            .records
            .lock()
            .insert((record.direction, record.transfer_id.clone()), record.clone());
        Ok(())
    }

    #[must_use]
    pub fn lookup_by_transfer_id(&self, direction: Direction, id: &str) -> Option<TransferRecord> {
        self.inner
            .records
            .lock()
            .get(&(direction, id.to_string()))
            .cloned()
    }

    #[must_use]
    pub fn lookup_by_resume_key(&self, direction: Direction, key: &str) -> Option<TransferRecord> {
        self.inner
            .records
            .lock()
            .values()
            .find(|r| r.direction == direction && r.resume_key == key)
            .cloned()
    }

    /// Removes a record. Missing records are not an error.
    pub async fn delete(&self, direction: Direction, id: &str) -> Result<()> {
        let removed = self
            .inner
            .records
            .lock()
            .remove(&(direction, id.to_string()));
        if removed.is_none() || !is_valid_transfer_id(id) {
            return Ok(());
        }
        let path = record_path(&self.inner.dir, direction, id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(StorageSnafu { path }),
        }
    }

    /// Drops every record whose `updated_at` is older than `older_than` and
    /// returns them so owners can clean up their files.
    pub async fn prune(&self, older_than: Duration) -> Result<Vec<TransferRecord>> {
        let now = Timestamp::now().as_second();
        let max_age = i64::try_from(older_than.as_secs()).unwrap_or(i64::MAX);
        let expired: Vec<TransferRecord> = self
            .inner
            .records
            .lock()
            .values()
            .filter(|r| r.is_expired(max_age, now))
            .cloned()
            .collect();

        for record in &expired {
            self.delete(record.direction, &record.transfer_id).await?;
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "pruned expired transfer records");
        }
        Ok(expired)
    }

    /// All records of one direction, oldest first.
    #[must_use]
    pub fn records(&self, direction: Direction) -> Vec<TransferRecord> {
        let mut out: Vec<TransferRecord> = self
            .inner
            .records
            .lock()
            .values()
            .filter(|r| r.direction == direction)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.transfer_id.cmp(&b.transfer_id))
        });
        out
    }
}

fn record_path(dir: &Path, direction: Direction, id: &str) -> PathBuf {
    dir.join(format!("{direction}-{id}.{RECORD_EXT}"))
}

async fn read_record(path: &Path) -> Result<TransferRecord> {
    let data = fs::read(path).await.context(StorageSnafu { path })?;
    serde_json::from_slice(&data).context(StateCodecSnafu { path })
}
