//! Startup sweep over operations left `InProgress` by a previous process.
//!
//! Background jobs are not persisted, so after a restart nothing will ever
//! complete these operations. Under `RecoveryPolicy::Report` they are only
//! logged and returned; `MarkFailed` closes them so their owners accept new
//! requests again.

use crate::config::RecoveryPolicy;
use crate::core::{BindOperation, InstanceOperation, OperationRecord, OperationState, Result};
use crate::storage::{BindOperationStore, InstanceOperationStore, OperationStore};
use tracing::{info, warn};

pub const INTERRUPTED_DESCRIPTION: &str = "operation interrupted by broker restart";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub instance_operations: Vec<InstanceOperation>,
    pub bind_operations: Vec<BindOperation>,
    pub marked_failed: usize,
}

impl RecoveryReport {
    pub fn stale_count(&self) -> usize {
        self.instance_operations.len() + self.bind_operations.len()
    }

    pub fn is_clean(&self) -> bool {
        self.stale_count() == 0
    }
}

pub async fn sweep(
    instance_operations: &dyn InstanceOperationStore,
    bind_operations: &dyn BindOperationStore,
    policy: RecoveryPolicy,
) -> Result<RecoveryReport> {
    let stale_instances = instance_operations
        .list_in_progress()
        .await
        .map_err(|e| e.context("listing in-progress instance operations"))?;
    let stale_bindings = bind_operations
        .list_in_progress()
        .await
        .map_err(|e| e.context("listing in-progress bind operations"))?;

    let mut marked_failed = 0;
    marked_failed += settle(instance_operations, &stale_instances, policy).await?;
    marked_failed += settle(bind_operations, &stale_bindings, policy).await?;

    let report = RecoveryReport {
        instance_operations: stale_instances,
        bind_operations: stale_bindings,
        marked_failed,
    };
    if report.is_clean() {
        info!("recovery sweep found no stale operations");
    } else {
        warn!(
            stale = report.stale_count(),
            marked_failed = report.marked_failed,
            ?policy,
            "recovery sweep found stale operations"
        );
    }
    Ok(report)
}

async fn settle<R, S>(store: &S, stale: &[R], policy: RecoveryPolicy) -> Result<usize>
where
    R: OperationRecord,
    S: OperationStore<R> + ?Sized,
{
    let mut marked = 0;
    for op in stale {
        let owner = op.owner_key();
        match policy {
            RecoveryPolicy::Report => {
                warn!(
                    %owner,
                    operation_id = %op.operation_id(),
                    op_type = %op.op_type(),
                    created_at = %op.created_at(),
                    "operation was in progress at shutdown"
                );
            }
            RecoveryPolicy::MarkFailed => {
                store
                    .update_state_desc(
                        &owner,
                        op.operation_id(),
                        OperationState::Failed,
                        INTERRUPTED_DESCRIPTION.to_string(),
                    )
                    .await
                    .map_err(|e| e.context(format!("failing stale operation of {}", owner)))?;
                warn!(%owner, operation_id = %op.operation_id(), "marked stale operation failed");
                marked += 1;
            }
        }
    }
    Ok(marked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BindingKey, InstanceId};
    use crate::storage::MemoryOperationStore;

    async fn seeded() -> (
        MemoryOperationStore<InstanceOperation>,
        MemoryOperationStore<BindOperation>,
    ) {
        let instances = MemoryOperationStore::<InstanceOperation>::new();
        instances
            .insert(InstanceOperation::new_create("i1".into(), "op1".into(), "h".into()))
            .await
            .unwrap();
        instances
            .insert(InstanceOperation::new_create("i2".into(), "op2".into(), "h".into()))
            .await
            .unwrap();
        instances
            .update_state(&"i2".into(), &"op2".into(), OperationState::Succeeded)
            .await
            .unwrap();

        let bindings = MemoryOperationStore::<BindOperation>::new();
        bindings
            .insert(BindOperation::new_create(
                BindingKey::new("i2".into(), "b1".into()),
                "op3".into(),
                "h".into(),
            ))
            .await
            .unwrap();
        (instances, bindings)
    }

    #[tokio::test]
    async fn test_report_leaves_operations_untouched() {
        let (instances, bindings) = seeded().await;
        let report = sweep(&instances, &bindings, RecoveryPolicy::Report)
            .await
            .unwrap();

        assert_eq!(report.stale_count(), 2);
        assert_eq!(report.marked_failed, 0);
        let op = instances.get(&"i1".into(), &"op1".into()).await.unwrap();
        assert_eq!(op.state, OperationState::InProgress);
    }

    #[tokio::test]
    async fn test_mark_failed_closes_stale_operations() {
        let (instances, bindings) = seeded().await;
        let report = sweep(&instances, &bindings, RecoveryPolicy::MarkFailed)
            .await
            .unwrap();
        assert_eq!(report.marked_failed, 2);

        let op = instances.get(&InstanceId::new("i1"), &"op1".into()).await.unwrap();
        assert_eq!(op.state, OperationState::Failed);
        assert_eq!(op.state_description.as_deref(), Some(INTERRUPTED_DESCRIPTION));
        assert!(instances.list_in_progress().await.unwrap().is_empty());
        assert!(bindings.list_in_progress().await.unwrap().is_empty());

        let again = sweep(&instances, &bindings, RecoveryPolicy::MarkFailed)
            .await
            .unwrap();
        assert!(again.is_clean());
    }
}
