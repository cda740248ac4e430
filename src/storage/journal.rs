//! Durable backend: the in-memory stores fronted by a write-ahead journal.
//!
//! Each mutation is validated against the in-memory state, appended to the
//! journal, then applied. All mutations of one store are serialized by the
//! journal lock, so validation and application observe the same state and a
//! replay of the journal rebuilds it exactly.
//!
//! Every `checkpoint_every` entries the in-memory state is written to a
//! snapshot next to the journal and the journal is cleared. Opening a store
//! loads the snapshot first and replays the journal on top of it.

use super::memory::{MemoryInstanceStore, MemoryOperationStore};
use super::{BindOperationStore, InstanceStore, OperationStore};
use crate::core::{
    BindOperation, BindingKey, BrokerError, Instance, InstanceId, OperationId, OperationRecord,
    OperationState, Result,
};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

pub const INSTANCE_OPERATIONS_JOURNAL: &str = "instance_operations.journal";
pub const BIND_OPERATIONS_JOURNAL: &str = "bind_operations.journal";
pub const INSTANCES_JOURNAL: &str = "instances.journal";

pub const DEFAULT_CHECKPOINT_EVERY: usize = 1000;

// ============================================================================
// Journal file
// ============================================================================

/// Append-only file of length-prefixed MessagePack records.
pub struct JournalFile {
    path: PathBuf,
    file: File,
    /// Length of the file up to the last complete record.
    len: u64,
    sync_writes: bool,
    poisoned: bool,
    entries_since_checkpoint: usize,
    checkpoint_every: usize,
}

impl JournalFile {
    pub fn open<P: AsRef<Path>>(path: P, sync_writes: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                BrokerError::Io(format!(
                    "Failed to create journal directory '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                BrokerError::Io(format!("Failed to open journal '{}': {}", path.display(), e))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            path,
            file,
            len,
            sync_writes,
            poisoned: false,
            entries_since_checkpoint: 0,
            checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sync_writes(&self) -> bool {
        self.sync_writes
    }

    /// Writes one record. A failed write is cut back off the file so the
    /// next record still starts on a boundary; if that fails too, the
    /// journal refuses further appends.
    pub fn append<E: Serialize>(&mut self, entry: &E) -> Result<()> {
        if self.poisoned {
            return Err(BrokerError::Io(format!(
                "journal '{}' is unusable after a failed write",
                self.path.display()
            )));
        }
        let bytes = rmp_serde::to_vec_named(entry).map_err(|e| {
            BrokerError::Serialization(format!("Failed to encode journal entry: {}", e))
        })?;
        let mut frame = Vec::with_capacity(4 + bytes.len());
        frame.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        frame.extend_from_slice(&bytes);

        let written = self.file.write_all(&frame).and_then(|_| {
            if self.sync_writes {
                self.file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(err) = written {
            self.rollback();
            return Err(BrokerError::Io(format!("Failed to write journal: {}", err)));
        }

        self.len += frame.len() as u64;
        self.entries_since_checkpoint += 1;
        Ok(())
    }

    fn rollback(&mut self) {
        if let Err(err) = self.file.set_len(self.len) {
            warn!(
                "journal '{}' could not drop a partial record, refusing further writes: {}",
                self.path.display(),
                err
            );
            self.poisoned = true;
        }
    }

    /// Empties the journal after its entries were captured by a snapshot.
    pub fn clear(&mut self) -> Result<()> {
        self.file.set_len(0).map_err(|e| {
            BrokerError::Io(format!(
                "Failed to truncate journal '{}': {}",
                self.path.display(),
                e
            ))
        })?;
        if self.sync_writes {
            self.file.sync_all()?;
        }
        self.len = 0;
        self.entries_since_checkpoint = 0;
        Ok(())
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.entries_since_checkpoint >= self.checkpoint_every
    }

    pub fn entries_since_checkpoint(&self) -> usize {
        self.entries_since_checkpoint
    }

    pub fn set_checkpoint_every(&mut self, entries: usize) {
        self.checkpoint_every = entries.max(1);
    }

    /// Reads every complete record and opens the file for appending.
    ///
    /// A torn record at the tail (crash during append) ends the read with a
    /// warning and is cut off so later appends start on a record boundary.
    pub fn recover<E: DeserializeOwned, P: AsRef<Path>>(
        path: P,
        sync_writes: bool,
    ) -> Result<(Self, Vec<E>)> {
        let path = path.as_ref();
        let mut entries = Vec::new();
        let mut valid_len = 0u64;
        let mut file_len = 0u64;

        if path.exists() {
            file_len = fs::metadata(path)?.len();
            let file = File::open(path).map_err(|e| {
                BrokerError::Io(format!("Failed to open journal '{}': {}", path.display(), e))
            })?;
            let mut reader = BufReader::new(file);
            loop {
                let mut len_bytes = [0u8; 4];
                match reader.read_exact(&mut len_bytes) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                    Err(e) => {
                        return Err(BrokerError::Io(format!("Failed to read journal: {}", e)));
                    }
                }
                let len = u32::from_le_bytes(len_bytes) as usize;
                let mut buf = vec![0u8; len];
                if let Err(e) = reader.read_exact(&mut buf) {
                    warn!(
                        "journal '{}' ends with a torn record after {} entries: {}",
                        path.display(),
                        entries.len(),
                        e
                    );
                    break;
                }
                let entry = rmp_serde::from_slice(&buf).map_err(|e| {
                    BrokerError::Serialization(format!(
                        "Failed to decode journal entry {} in '{}': {}",
                        entries.len(),
                        path.display(),
                        e
                    ))
                })?;
                entries.push(entry);
                valid_len += 4 + len as u64;
            }
        }

        if valid_len < file_len {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
        }

        let mut journal = Self::open(path, sync_writes)?;
        journal.entries_since_checkpoint = entries.len();
        Ok((journal, entries))
    }
}

// ============================================================================
// Snapshot file
// ============================================================================

/// Compacted state of one store, kept beside its journal.
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn for_journal<P: AsRef<Path>>(journal_path: P) -> Self {
        Self {
            path: journal_path.as_ref().with_extension("snapshot"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the snapshot to a temp file and renames it into place.
    pub fn save<T: Serialize>(&self, state: &T, sync_writes: bool) -> Result<()> {
        let temp_path = self.path.with_extension("snapshot.tmp");
        let bytes = rmp_serde::to_vec_named(state).map_err(|e| {
            BrokerError::Serialization(format!("Failed to encode snapshot: {}", e))
        })?;
        let file = File::create(&temp_path).map_err(|e| {
            BrokerError::Io(format!(
                "Failed to create snapshot '{}': {}",
                temp_path.display(),
                e
            ))
        })?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(&bytes)
            .and_then(|_| writer.flush())
            .map_err(|e| BrokerError::Io(format!("Failed to write snapshot: {}", e)))?;
        if sync_writes {
            writer
                .get_mut()
                .sync_all()
                .map_err(|e| BrokerError::Io(format!("Failed to sync snapshot: {}", e)))?;
        }
        fs::rename(&temp_path, &self.path).map_err(|e| {
            BrokerError::Io(format!(
                "Failed to rename snapshot into '{}': {}",
                self.path.display(),
                e
            ))
        })
    }

    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(BrokerError::Io(format!(
                    "Failed to read snapshot '{}': {}",
                    self.path.display(),
                    e
                )));
            }
        };
        let state = rmp_serde::from_slice(&bytes).map_err(|e| {
            BrokerError::Serialization(format!(
                "Failed to decode snapshot '{}': {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(Some(state))
    }
}

/// Failure leaves the journal intact, so nothing is lost and the next
/// append tries again.
fn checkpoint_or_warn<T: Serialize>(journal: &mut JournalFile, snapshot: &SnapshotFile, state: T) {
    if let Err(err) = checkpoint(journal, snapshot, &state) {
        warn!(
            "checkpoint of journal '{}' failed: {}",
            journal.path().display(),
            err
        );
    }
}

fn checkpoint<T: Serialize>(
    journal: &mut JournalFile,
    snapshot: &SnapshotFile,
    state: &T,
) -> Result<()> {
    let entries = journal.entries_since_checkpoint();
    snapshot.save(state, journal.sync_writes())?;
    journal.clear()?;
    debug!(
        "checkpointed {} journal entries into '{}'",
        entries,
        snapshot.path().display()
    );
    Ok(())
}

// ============================================================================
// Operation log
// ============================================================================

#[derive(Serialize, Deserialize)]
#[serde(bound(
    serialize = "R: Serialize, R::OwnerKey: Serialize",
    deserialize = "R: DeserializeOwned, R::OwnerKey: DeserializeOwned"
))]
enum OperationJournalEntry<R: OperationRecord> {
    Insert(R),
    UpdateState {
        owner: R::OwnerKey,
        operation_id: OperationId,
        state: OperationState,
        description: Option<String>,
    },
    Remove {
        owner: R::OwnerKey,
        operation_id: OperationId,
    },
}

pub struct JournaledOperationStore<R: OperationRecord> {
    inner: MemoryOperationStore<R>,
    journal: Mutex<JournalFile>,
    snapshot: SnapshotFile,
}

impl<R> JournaledOperationStore<R>
where
    R: OperationRecord + Serialize + DeserializeOwned,
    R::OwnerKey: Serialize + DeserializeOwned,
{
    /// Opens the journal at `path`: loads its snapshot, then replays the
    /// records written since.
    pub async fn open<P: AsRef<Path>>(path: P, sync_writes: bool) -> Result<Self> {
        let path = path.as_ref();
        let snapshot = SnapshotFile::for_journal(path);
        let inner = MemoryOperationStore::new();
        let restored = match snapshot.load::<Vec<R>>()? {
            Some(records) => {
                let count = records.len();
                for op in records {
                    inner.restore(op).await;
                }
                count
            }
            None => 0,
        };

        let (journal, entries): (_, Vec<OperationJournalEntry<R>>) =
            JournalFile::recover(path, sync_writes)?;
        let replayed = entries.len();
        for (seq, entry) in entries.into_iter().enumerate() {
            // Entries already covered by the snapshot (crash between saving it
            // and clearing the journal) are rejected here and skipped.
            if let Err(err) = Self::apply(&inner, entry).await {
                warn!(
                    "journal '{}' entry {} was not applied on replay: {}",
                    path.display(),
                    seq,
                    err
                );
            }
        }
        info!(
            "restored {} operations and replayed {} journal entries from '{}'",
            restored,
            replayed,
            path.display()
        );

        Ok(Self {
            inner,
            journal: Mutex::new(journal),
            snapshot,
        })
    }

    /// Sets how many journal entries accumulate before a checkpoint.
    pub fn checkpoint_every(mut self, entries: usize) -> Self {
        self.journal.get_mut().set_checkpoint_every(entries);
        self
    }

    /// Snapshots the current state and clears the journal now.
    pub async fn checkpoint(&self) -> Result<()> {
        let mut journal = self.journal.lock().await;
        checkpoint(&mut journal, &self.snapshot, &self.inner.export().await)
    }

    async fn apply(inner: &MemoryOperationStore<R>, entry: OperationJournalEntry<R>) -> Result<()> {
        match entry {
            OperationJournalEntry::Insert(op) => inner.insert(op).await,
            OperationJournalEntry::UpdateState {
                owner,
                operation_id,
                state,
                description: Some(description),
            } => {
                inner
                    .update_state_desc(&owner, &operation_id, state, description)
                    .await
            }
            OperationJournalEntry::UpdateState {
                owner,
                operation_id,
                state,
                description: None,
            } => inner.update_state(&owner, &operation_id, state).await,
            OperationJournalEntry::Remove {
                owner,
                operation_id,
            } => inner.remove_record(&owner, &operation_id).await,
        }
    }

    /// Appends `entry`, applies it and checkpoints when due. The caller holds
    /// the journal lock and has validated the entry.
    async fn commit(&self, journal: &mut JournalFile, entry: OperationJournalEntry<R>) -> Result<()> {
        journal.append(&entry)?;
        Self::apply(&self.inner, entry).await?;
        if journal.needs_checkpoint() {
            checkpoint_or_warn(journal, &self.snapshot, self.inner.export().await);
        }
        Ok(())
    }

    async fn update(
        &self,
        owner: &R::OwnerKey,
        operation_id: &OperationId,
        state: OperationState,
        description: Option<String>,
    ) -> Result<()> {
        let mut journal = self.journal.lock().await;
        self.inner.get(owner, operation_id).await?;
        let entry = OperationJournalEntry::<R>::UpdateState {
            owner: owner.clone(),
            operation_id: operation_id.clone(),
            state,
            description,
        };
        self.commit(&mut journal, entry).await
    }

    pub(crate) async fn remove_record(
        &self,
        owner: &R::OwnerKey,
        operation_id: &OperationId,
    ) -> Result<()> {
        let mut journal = self.journal.lock().await;
        self.inner.get(owner, operation_id).await?;
        let entry = OperationJournalEntry::<R>::Remove {
            owner: owner.clone(),
            operation_id: operation_id.clone(),
        };
        self.commit(&mut journal, entry).await
    }
}

#[async_trait]
impl<R> OperationStore<R> for JournaledOperationStore<R>
where
    R: OperationRecord + Serialize + DeserializeOwned,
    R::OwnerKey: Serialize + DeserializeOwned,
{
    async fn insert(&self, op: R) -> Result<()> {
        let mut journal = self.journal.lock().await;
        self.inner.check_insert(&op).await?;
        self.commit(&mut journal, OperationJournalEntry::Insert(op))
            .await
    }

    async fn get(&self, owner: &R::OwnerKey, operation_id: &OperationId) -> Result<R> {
        self.inner.get(owner, operation_id).await
    }

    async fn get_all(&self, key: &R::HistoryKey) -> Result<Vec<R>> {
        self.inner.get_all(key).await
    }

    async fn update_state(
        &self,
        owner: &R::OwnerKey,
        operation_id: &OperationId,
        state: OperationState,
    ) -> Result<()> {
        self.update(owner, operation_id, state, None).await
    }

    async fn update_state_desc(
        &self,
        owner: &R::OwnerKey,
        operation_id: &OperationId,
        state: OperationState,
        description: String,
    ) -> Result<()> {
        self.update(owner, operation_id, state, Some(description))
            .await
    }

    async fn list_in_progress(&self) -> Result<Vec<R>> {
        self.inner.list_in_progress().await
    }
}

#[async_trait]
impl BindOperationStore for JournaledOperationStore<BindOperation> {
    async fn remove(&self, owner: &BindingKey, operation_id: &OperationId) -> Result<()> {
        self.remove_record(owner, operation_id).await
    }
}

// ============================================================================
// Instance snapshots
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
enum InstanceJournalEntry {
    Upsert(Instance),
    Remove(InstanceId),
}

pub struct JournaledInstanceStore {
    inner: MemoryInstanceStore,
    journal: Mutex<JournalFile>,
    snapshot: SnapshotFile,
}

impl JournaledInstanceStore {
    pub async fn open<P: AsRef<Path>>(path: P, sync_writes: bool) -> Result<Self> {
        let path = path.as_ref();
        let snapshot = SnapshotFile::for_journal(path);
        let inner = MemoryInstanceStore::new();
        if let Some(instances) = snapshot.load::<Vec<Instance>>()? {
            for instance in instances {
                inner.upsert(instance).await?;
            }
        }

        let (journal, entries): (_, Vec<InstanceJournalEntry>) =
            JournalFile::recover(path, sync_writes)?;
        for (seq, entry) in entries.into_iter().enumerate() {
            if let Err(err) = Self::apply(&inner, entry).await {
                warn!(
                    "journal '{}' entry {} was not applied on replay: {}",
                    path.display(),
                    seq,
                    err
                );
            }
        }

        Ok(Self {
            inner,
            journal: Mutex::new(journal),
            snapshot,
        })
    }

    pub fn checkpoint_every(mut self, entries: usize) -> Self {
        self.journal.get_mut().set_checkpoint_every(entries);
        self
    }

    async fn apply(inner: &MemoryInstanceStore, entry: InstanceJournalEntry) -> Result<()> {
        match entry {
            InstanceJournalEntry::Upsert(instance) => inner.upsert(instance).await,
            InstanceJournalEntry::Remove(id) => inner.remove(&id).await,
        }
    }

    async fn commit(&self, journal: &mut JournalFile, entry: InstanceJournalEntry) -> Result<()> {
        journal.append(&entry)?;
        Self::apply(&self.inner, entry).await?;
        if journal.needs_checkpoint() {
            checkpoint_or_warn(journal, &self.snapshot, self.inner.export().await);
        }
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for JournaledInstanceStore {
    async fn upsert(&self, instance: Instance) -> Result<()> {
        let mut journal = self.journal.lock().await;
        self.commit(&mut journal, InstanceJournalEntry::Upsert(instance))
            .await
    }

    async fn get(&self, id: &InstanceId) -> Result<Instance> {
        self.inner.get(id).await
    }

    async fn remove(&self, id: &InstanceId) -> Result<()> {
        let mut journal = self.journal.lock().await;
        self.inner.get(id).await?;
        self.commit(&mut journal, InstanceJournalEntry::Remove(id.clone()))
            .await
    }
}
