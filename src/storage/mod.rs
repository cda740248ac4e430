//! Storage contracts for operation history, instance snapshots and binding
//! credentials, plus the in-memory, journaled and file-backed backends.
//!
//! The lifecycle services assume only that a single insert or update through
//! these traits is atomic. Every backend enforces the same rules:
//!
//! - at most one `InProgress` operation per owner (`ActiveOperationInProgress`),
//! - operation ids are unique per owner (`AlreadyExists`),
//! - a history read for an owner with no rows is `NotFound`, not an empty list,
//! - more than one row for the same (owner, operation id) is a
//!   `StorageInconsistency`.

pub mod file;
pub mod journal;
pub mod memory;

use crate::core::{
    BindOperation, BindingCredentials, BindingId, Instance, InstanceId, InstanceOperation,
    OperationId, OperationRecord, OperationState, Result,
};
use async_trait::async_trait;

pub use file::FileCredentialStore;
pub use journal::{JournaledInstanceStore, JournaledOperationStore};
pub use memory::{MemoryCredentialStore, MemoryInstanceStore, MemoryOperationStore};

/// Append-only operation log scoped per owner.
#[async_trait]
pub trait OperationStore<R: OperationRecord>: Send + Sync {
    /// Inserts a new operation, enforcing the single in-flight rule.
    async fn insert(&self, op: R) -> Result<()>;

    async fn get(&self, owner: &R::OwnerKey, operation_id: &OperationId) -> Result<R>;

    /// Returns the history in insertion order, or `NotFound` when empty.
    async fn get_all(&self, key: &R::HistoryKey) -> Result<Vec<R>>;

    async fn update_state(
        &self,
        owner: &R::OwnerKey,
        operation_id: &OperationId,
        state: OperationState,
    ) -> Result<()>;

    async fn update_state_desc(
        &self,
        owner: &R::OwnerKey,
        operation_id: &OperationId,
        state: OperationState,
        description: String,
    ) -> Result<()>;

    /// Every operation currently `InProgress`, across all owners.
    async fn list_in_progress(&self) -> Result<Vec<R>>;
}

pub trait InstanceOperationStore: OperationStore<InstanceOperation> {}

impl<T: OperationStore<InstanceOperation> + ?Sized> InstanceOperationStore for T {}

#[async_trait]
pub trait BindOperationStore: OperationStore<BindOperation> {
    /// Drops a single bind operation. Used for binding cleanup only; instance
    /// history is never deleted.
    async fn remove(
        &self,
        owner: &<BindOperation as OperationRecord>::OwnerKey,
        operation_id: &OperationId,
    ) -> Result<()>;
}

/// Current snapshot of each instance, keyed by instance id.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn upsert(&self, instance: Instance) -> Result<()>;

    async fn get(&self, id: &InstanceId) -> Result<Instance>;

    /// `NotFound` when no snapshot exists.
    async fn remove(&self, id: &InstanceId) -> Result<()>;
}

/// Resolved binding credentials keyed by binding id.
#[async_trait]
pub trait BindingCredentialStore: Send + Sync {
    async fn put(&self, credentials: BindingCredentials) -> Result<()>;

    async fn get(&self, binding_id: &BindingId) -> Result<BindingCredentials>;

    /// `NotFound` when no record exists.
    async fn remove(&self, binding_id: &BindingId) -> Result<()>;

    /// Removes every record owned by the instance and returns how many went.
    async fn remove_for_instance(&self, instance_id: &InstanceId) -> Result<usize>;
}

/// Treats `NotFound` as a completed removal.
pub(crate) fn tolerate_absent(result: Result<()>) -> Result<()> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}
