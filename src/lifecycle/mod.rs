//! Operation lifecycle services.
//!
//! Every mutating call runs the same pipeline: decide (new, duplicate of an
//! in-flight operation, duplicate of a completed one, or conflicting), record
//! the operation, hand the side effect to the background executor, answer
//! immediately, and let the background job write the single final state
//! transition.
//!
//! The decision phase runs under a lock scoped to the service (sharded by
//! owner key when configured). The lock only makes read-then-insert atomic;
//! the per-owner guarantee itself comes from the store rejecting a second
//! in-progress operation.

pub mod binding;
pub mod instance;

use crate::core::{
    BindingId, Credentials, InstanceId, Namespace, OperationId, OperationRecord, OperationState,
    ParamsHash, PlanId, ServiceId,
};
use crate::storage::OperationStore;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error};

pub use binding::BindingService;
pub use instance::InstanceService;

#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionRequest {
    pub instance_id: InstanceId,
    pub service_id: ServiceId,
    pub plan_id: PlanId,
    pub namespace: Namespace,
    pub parameters: Map<String, Value>,
    pub accepts_incomplete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeprovisionRequest {
    pub instance_id: InstanceId,
    pub accepts_incomplete: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindRequest {
    pub instance_id: InstanceId,
    pub binding_id: BindingId,
    pub parameters: Map<String, Value>,
    pub accepts_incomplete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnbindRequest {
    pub instance_id: InstanceId,
    pub binding_id: BindingId,
    pub accepts_incomplete: bool,
}

/// Answer to a mutating request.
///
/// `is_async == false` means the requested state already holds and nothing
/// was started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationResponse {
    #[serde(skip)]
    pub is_async: bool,
    #[serde(rename = "operation", skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<OperationId>,
}

impl OperationResponse {
    pub fn accepted(operation_id: OperationId) -> Self {
        Self {
            is_async: true,
            operation_id: Some(operation_id),
        }
    }

    pub fn completed() -> Self {
        Self {
            is_async: false,
            operation_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindResponse {
    #[serde(skip)]
    pub is_async: bool,
    #[serde(rename = "operation", skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<OperationId>,
    /// Present only when the binding already exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

impl BindResponse {
    pub fn accepted(operation_id: OperationId) -> Self {
        Self {
            is_async: true,
            operation_id: Some(operation_id),
            credentials: None,
        }
    }

    pub fn completed(credentials: Credentials) -> Self {
        Self {
            is_async: false,
            operation_id: None,
            credentials: Some(credentials),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastOperationResponse {
    pub state: OperationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl LastOperationResponse {
    pub(crate) fn from_record<R: OperationRecord>(op: &R) -> Self {
        Self {
            state: op.state(),
            description: op.state_description().map(str::to_string),
        }
    }
}

/// Decision-phase locks of one service. With a single shard every decision
/// of the service is serialized; with more, owners are partitioned by hash.
pub(crate) struct DecisionLocks {
    shards: Vec<Mutex<()>>,
}

impl DecisionLocks {
    pub(crate) fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    pub(crate) async fn lock<K: Hash>(&self, key: &K) -> MutexGuard<'_, ()> {
        let idx = if self.shards.len() == 1 {
            0
        } else {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            (hasher.finish() as usize) % self.shards.len()
        };
        self.shards[idx].lock().await
    }
}

/// Compares the idempotency token of an existing operation with a request.
pub(crate) fn same_params<R: OperationRecord>(existing: &R, requested: &ParamsHash) -> bool {
    existing.params_hash() == Some(requested)
}

/// Writes the one terminal transition of a background job.
///
/// A failed write is logged and nothing else: the operation then stays
/// `InProgress` for pollers until the startup sweep sees it.
pub(crate) async fn finish_operation<R, S>(
    store: &S,
    owner: &R::OwnerKey,
    operation_id: &OperationId,
    state: OperationState,
    description: String,
) where
    R: OperationRecord,
    S: OperationStore<R> + ?Sized,
{
    debug!(%owner, %operation_id, %state, %description, "completing operation");
    if let Err(err) = store
        .update_state_desc(owner, operation_id, state, description)
        .await
    {
        error!(
            %owner,
            %operation_id,
            error = %err,
            "cannot record final operation state; operation stays in progress"
        );
    }
}
