//! State predicates derived by folding an owner's operation history.
//!
//! History is folded front to back; the last `Create/Succeeded` or
//! `Remove/Succeeded` decides, never simply the latest row. A missing history
//! (`NotFound` from the store) always reads as "no", never as an error.

use crate::core::{
    BindOperation, BindingKey, InstanceId, InstanceOperation, OperationRecord, OperationState,
    OperationType, Result,
};
use crate::storage::{BindOperationStore, InstanceOperationStore, OperationStore};
use std::sync::Arc;

/// The `Create/Succeeded` record still in effect, if any.
pub fn effective_create<R: OperationRecord>(history: &[R]) -> Option<&R> {
    history.iter().fold(None, |acc, op| match (op.op_type(), op.state()) {
        (OperationType::Create, OperationState::Succeeded) => Some(op),
        (OperationType::Remove, OperationState::Succeeded) => None,
        _ => acc,
    })
}

pub fn is_created<R: OperationRecord>(history: &[R]) -> bool {
    effective_create(history).is_some()
}

pub fn is_removed<R: OperationRecord>(history: &[R]) -> bool {
    history
        .iter()
        .fold(false, |acc, op| match (op.op_type(), op.state()) {
            (OperationType::Remove, OperationState::Succeeded) => true,
            (OperationType::Create, OperationState::Succeeded) => false,
            _ => acc,
        })
}

/// First operation of `op_type` still in progress.
pub fn in_progress<R: OperationRecord>(history: &[R], op_type: OperationType) -> Option<&R> {
    history
        .iter()
        .find(|op| op.op_type() == op_type && op.state() == OperationState::InProgress)
}

fn or_empty<R>(result: Result<Vec<R>>) -> Result<Vec<R>> {
    match result {
        Err(err) if err.is_not_found() => Ok(Vec::new()),
        other => other,
    }
}

/// Provisioning predicates over an instance's operation history.
#[derive(Clone)]
pub struct InstanceStateReader {
    operations: Arc<dyn InstanceOperationStore>,
}

impl InstanceStateReader {
    pub fn new(operations: Arc<dyn InstanceOperationStore>) -> Self {
        Self { operations }
    }

    pub async fn history(&self, instance_id: &InstanceId) -> Result<Vec<InstanceOperation>> {
        or_empty(self.operations.get_all(instance_id).await)
    }

    pub async fn is_provisioned(&self, instance_id: &InstanceId) -> Result<bool> {
        Ok(is_created(&self.history(instance_id).await?))
    }

    /// The `Create` operation that made the instance provisioned, carrying the
    /// parameter hash it was accepted with.
    pub async fn provisioned_operation(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<InstanceOperation>> {
        Ok(effective_create(&self.history(instance_id).await?).cloned())
    }

    pub async fn provisioning_in_progress(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<InstanceOperation>> {
        Ok(in_progress(&self.history(instance_id).await?, OperationType::Create).cloned())
    }

    pub async fn is_deprovisioned(&self, instance_id: &InstanceId) -> Result<bool> {
        Ok(is_removed(&self.history(instance_id).await?))
    }

    pub async fn deprovisioning_in_progress(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<InstanceOperation>> {
        Ok(in_progress(&self.history(instance_id).await?, OperationType::Remove).cloned())
    }
}

/// Binding predicates: the instance's bind history filtered by binding id.
#[derive(Clone)]
pub struct BindingStateReader {
    operations: Arc<dyn BindOperationStore>,
}

impl BindingStateReader {
    pub fn new(operations: Arc<dyn BindOperationStore>) -> Self {
        Self { operations }
    }

    pub async fn history(&self, key: &BindingKey) -> Result<Vec<BindOperation>> {
        let all = or_empty(self.operations.get_all(&key.instance_id).await)?;
        Ok(all
            .into_iter()
            .filter(|op| op.binding_id == key.binding_id)
            .collect())
    }

    pub async fn is_bound(&self, key: &BindingKey) -> Result<bool> {
        Ok(self.bound_operation(key).await?.is_some())
    }

    /// The `Create/Succeeded` record backing the binding, if it is bound.
    pub async fn bound_operation(&self, key: &BindingKey) -> Result<Option<BindOperation>> {
        Ok(effective_create(&self.history(key).await?).cloned())
    }

    pub async fn binding_in_progress(&self, key: &BindingKey) -> Result<Option<BindOperation>> {
        Ok(in_progress(&self.history(key).await?, OperationType::Create).cloned())
    }

    pub async fn is_unbound(&self, key: &BindingKey) -> Result<bool> {
        Ok(is_removed(&self.history(key).await?))
    }

    pub async fn unbinding_in_progress(&self, key: &BindingKey) -> Result<Option<BindOperation>> {
        Ok(in_progress(&self.history(key).await?, OperationType::Remove).cloned())
    }
}
