//! Reference in-memory backend.
//!
//! Operation records live in an arena per shard; an index maps each history
//! key to the ordered list of arena handles. Shards are chosen by history key
//! hash so all operations of one instance (and its bindings) share a shard,
//! which keeps the single in-flight check local to one lock.

use super::{BindOperationStore, BindingCredentialStore, InstanceStore, OperationStore};
use crate::core::{
    BindOperation, BindingCredentials, BindingId, BindingKey, BrokerError, Instance, InstanceId,
    OperationId, OperationRecord, OperationState, Result,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::sync::RwLock;

pub const DEFAULT_SHARD_COUNT: usize = 16;

struct OperationShard<R: OperationRecord> {
    arena: Vec<Option<R>>,
    free: Vec<usize>,
    index: HashMap<R::HistoryKey, Vec<usize>>,
}

impl<R: OperationRecord> OperationShard<R> {
    fn new() -> Self {
        Self {
            arena: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn handles(&self, key: &R::HistoryKey) -> &[usize] {
        self.index.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    fn records<'a>(&'a self, key: &'a R::HistoryKey) -> impl Iterator<Item = &'a R> + 'a {
        self.handles(key)
            .iter()
            .filter_map(|handle| self.arena.get(*handle).and_then(Option::as_ref))
    }

    /// Resolves the single arena handle for (owner, operation id).
    fn locate(&self, owner: &R::OwnerKey, operation_id: &OperationId) -> Result<usize> {
        let key = R::history_key_of(owner);
        let mut found = self.handles(&key).iter().copied().filter(|handle| {
            self.arena
                .get(*handle)
                .and_then(Option::as_ref)
                .map(|op| &op.owner_key() == owner && op.operation_id() == operation_id)
                .unwrap_or(false)
        });

        let first = found.next().ok_or_else(|| {
            BrokerError::NotFound(format!("operation {} for {}", operation_id, owner))
        })?;
        if found.next().is_some() {
            return Err(BrokerError::StorageInconsistency(format!(
                "more than one operation {} stored for {}",
                operation_id, owner
            )));
        }
        Ok(first)
    }

    fn check_insert(&self, op: &R) -> Result<()> {
        let owner = op.owner_key();
        for existing in self.records(&op.history_key()) {
            if existing.owner_key() != owner {
                continue;
            }
            if existing.operation_id() == op.operation_id() {
                return Err(BrokerError::AlreadyExists(format!(
                    "operation {} for {}",
                    op.operation_id(),
                    owner
                )));
            }
            if existing.state() == OperationState::InProgress {
                return Err(BrokerError::ActiveOperationInProgress(format!(
                    "operation {} is still in progress for {}",
                    existing.operation_id(),
                    owner
                )));
            }
        }
        Ok(())
    }

    fn insert(&mut self, op: R) -> Result<()> {
        self.check_insert(&op)?;
        self.push(op);
        Ok(())
    }

    fn push(&mut self, op: R) {
        let key = op.history_key();
        let handle = match self.free.pop() {
            Some(handle) => {
                self.arena[handle] = Some(op);
                handle
            }
            None => {
                self.arena.push(Some(op));
                self.arena.len() - 1
            }
        };
        self.index.entry(key).or_default().push(handle);
    }

    fn update(
        &mut self,
        owner: &R::OwnerKey,
        operation_id: &OperationId,
        state: OperationState,
        description: Option<String>,
    ) -> Result<()> {
        let handle = self.locate(owner, operation_id)?;
        if let Some(op) = self.arena[handle].as_mut() {
            op.apply_state(state, description);
        }
        Ok(())
    }

    fn remove(&mut self, owner: &R::OwnerKey, operation_id: &OperationId) -> Result<()> {
        let handle = self.locate(owner, operation_id)?;
        let key = R::history_key_of(owner);
        self.arena[handle] = None;
        self.free.push(handle);

        let now_empty = match self.index.get_mut(&key) {
            Some(handles) => {
                handles.retain(|h| *h != handle);
                handles.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.index.remove(&key);
        }
        Ok(())
    }
}

/// Sharded in-memory operation log, usable for both instance and bind
/// operations.
pub struct MemoryOperationStore<R: OperationRecord> {
    shards: Vec<RwLock<OperationShard<R>>>,
}

impl<R: OperationRecord> MemoryOperationStore<R> {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARD_COUNT)
    }

    pub fn with_shards(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count)
                .map(|_| RwLock::new(OperationShard::new()))
                .collect(),
        }
    }

    fn shard(&self, key: &R::HistoryKey) -> &RwLock<OperationShard<R>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Checks the insert preconditions without mutating anything.
    pub(crate) async fn check_insert(&self, op: &R) -> Result<()> {
        let shard = self.shard(&op.history_key()).read().await;
        shard.check_insert(op)
    }

    pub(crate) async fn remove_record(
        &self,
        owner: &R::OwnerKey,
        operation_id: &OperationId,
    ) -> Result<()> {
        let mut shard = self.shard(&R::history_key_of(owner)).write().await;
        shard.remove(owner, operation_id)
    }

    async fn update(
        &self,
        owner: &R::OwnerKey,
        operation_id: &OperationId,
        state: OperationState,
        description: Option<String>,
    ) -> Result<()> {
        let mut shard = self.shard(&R::history_key_of(owner)).write().await;
        shard.update(owner, operation_id, state, description)
    }

    /// Every record, each history in insertion order.
    pub(crate) async fn export(&self) -> Vec<R> {
        let mut records = Vec::new();
        for shard in &self.shards {
            let shard = shard.read().await;
            for key in shard.index.keys() {
                records.extend(shard.records(key).cloned());
            }
        }
        records
    }

    /// Appends a record from a snapshot as-is, skipping the insert checks.
    pub(crate) async fn restore(&self, op: R) {
        let mut shard = self.shard(&op.history_key()).write().await;
        shard.push(op);
    }
}

impl<R: OperationRecord> Default for MemoryOperationStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: OperationRecord> OperationStore<R> for MemoryOperationStore<R> {
    async fn insert(&self, op: R) -> Result<()> {
        let mut shard = self.shard(&op.history_key()).write().await;
        shard.insert(op)
    }

    async fn get(&self, owner: &R::OwnerKey, operation_id: &OperationId) -> Result<R> {
        let shard = self.shard(&R::history_key_of(owner)).read().await;
        let handle = shard.locate(owner, operation_id)?;
        shard.arena[handle]
            .clone()
            .ok_or_else(|| BrokerError::NotFound(format!("operation {}", operation_id)))
    }

    async fn get_all(&self, key: &R::HistoryKey) -> Result<Vec<R>> {
        let shard = self.shard(key).read().await;
        let history: Vec<R> = shard.records(key).cloned().collect();
        if history.is_empty() {
            return Err(BrokerError::NotFound(format!("no operations for {}", key)));
        }
        Ok(history)
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
        let mut found = Vec::new();
        for shard in &self.shards {
            let shard = shard.read().await;
            for handles in shard.index.values() {
                found.extend(
                    handles
                        .iter()
                        .filter_map(|h| shard.arena.get(*h).and_then(Option::as_ref))
                        .filter(|op| op.state() == OperationState::InProgress)
                        .cloned(),
                );
            }
        }
        found.sort_by_key(|op| op.created_at());
        Ok(found)
    }
}

#[async_trait]
impl BindOperationStore for MemoryOperationStore<BindOperation> {
    async fn remove(&self, owner: &BindingKey, operation_id: &OperationId) -> Result<()> {
        self.remove_record(owner, operation_id).await
    }
}

pub struct MemoryInstanceStore {
    instances: RwLock<HashMap<InstanceId, Instance>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) async fn export(&self) -> Vec<Instance> {
        self.instances.read().await.values().cloned().collect()
    }
}

impl Default for MemoryInstanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn upsert(&self, instance: Instance) -> Result<()> {
        self.instances
            .write()
            .await
            .insert(instance.id.clone(), instance);
        Ok(())
    }

    async fn get(&self, id: &InstanceId) -> Result<Instance> {
        self.instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(format!("instance {}", id)))
    }

    async fn remove(&self, id: &InstanceId) -> Result<()> {
        self.instances
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| BrokerError::NotFound(format!("instance {}", id)))
    }
}

pub struct MemoryCredentialStore {
    records: RwLock<HashMap<BindingId, BindingCredentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BindingCredentialStore for MemoryCredentialStore {
    async fn put(&self, credentials: BindingCredentials) -> Result<()> {
        self.records
            .write()
            .await
            .insert(credentials.binding_id.clone(), credentials);
        Ok(())
    }

    async fn get(&self, binding_id: &BindingId) -> Result<BindingCredentials> {
        self.records
            .read()
            .await
            .get(binding_id)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(format!("credentials for binding {}", binding_id)))
    }

    async fn remove(&self, binding_id: &BindingId) -> Result<()> {
        self.records
            .write()
            .await
            .remove(binding_id)
            .map(|_| ())
            .ok_or_else(|| BrokerError::NotFound(format!("credentials for binding {}", binding_id)))
    }

    async fn remove_for_instance(&self, instance_id: &InstanceId) -> Result<usize> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| &record.instance_id != instance_id);
        Ok(before - records.len())
    }
}
