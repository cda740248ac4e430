mod common;

use common::*;
use osb_broker::core::{BindingId, InstanceId, InstanceOperation, OperationState, params_hash};
use osb_broker::recovery::INTERRUPTED_DESCRIPTION;
use osb_broker::storage::journal::INSTANCE_OPERATIONS_JOURNAL;
use osb_broker::storage::{JournaledOperationStore, OperationStore};
use osb_broker::{BrokerConfig, RecoveryPolicy};
use serde_json::json;
use std::path::Path;
use tempfile::TempDir;

fn durable_config(root: &Path) -> BrokerConfig {
    BrokerConfig::new()
        .journal_dir(root.join("journal"))
        .persisted_credentials(root.join("credentials"))
}

async fn seed_stale_provision(root: &Path, instance_id: &str, parameters: serde_json::Value) {
    let store = JournaledOperationStore::<InstanceOperation>::open(
        root.join("journal").join(INSTANCE_OPERATIONS_JOURNAL),
        true,
    )
    .await
    .unwrap();
    store
        .insert(InstanceOperation::new_create(
            instance_id.into(),
            "op-stale".into(),
            params_hash(&common::params(parameters)),
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = TempDir::new().unwrap();

    let (provision_id, bind_id) = {
        let h = Harness::open(CountingInstaller::new(), durable_config(dir.path())).await;
        let provision_id = h.provisioned("i1", json!({"replicas": 2})).await;
        let bind_id = h
            .broker
            .bind(bind_req("i1", "b1", json!({})))
            .await
            .unwrap()
            .operation_id
            .unwrap();
        h.broker.shutdown().await;
        (provision_id, bind_id)
    };

    let h = Harness::open(CountingInstaller::new(), durable_config(dir.path())).await;
    assert!(h.broker.recovery_report().is_clean());
    assert_eq!(h.state_of("i1", &provision_id).await, OperationState::Succeeded);
    assert_eq!(
        h.binding_state_of("i1", "b1", &bind_id).await,
        OperationState::Succeeded
    );

    let instance = h.broker.get_instance(&InstanceId::new("i1")).await.unwrap();
    assert_eq!(instance.release.unwrap().release_name, "osb-i1");

    // Same parameters after restart: already done, nothing reinstalled.
    let again = h
        .broker
        .provision(provision_req("i1", BINDABLE_SERVICE, json!({"replicas": 2})))
        .await
        .unwrap();
    assert!(!again.is_async);
    assert_eq!(h.installer.install_count(), 0);

    // Persisted credentials are returned for a repeated bind.
    let rebound = h.broker.bind(bind_req("i1", "b1", json!({}))).await.unwrap();
    assert!(!rebound.is_async);
    assert_eq!(
        rebound.credentials.unwrap().get("host").map(String::as_str),
        Some("osb-i1")
    );
}

#[tokio::test]
async fn test_memory_credentials_are_lost_on_restart() {
    let dir = TempDir::new().unwrap();
    let config = BrokerConfig::new().journal_dir(dir.path().join("journal"));

    {
        let h = Harness::open(CountingInstaller::new(), config.clone()).await;
        h.provisioned("i1", json!({})).await;
        h.broker.bind(bind_req("i1", "b1", json!({}))).await.unwrap();
        h.broker.shutdown().await;
    }

    let h = Harness::open(CountingInstaller::new(), config).await;
    let err = h
        .broker
        .bind(bind_req("i1", "b1", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, osb_broker::BrokerError::Dependency(_)), "{err}");

    // Unbind then bind again recovers the binding.
    h.broker.unbind(unbind_req("i1", "b1")).await.unwrap();
    h.broker.wait_idle().await;
    h.broker.bind(bind_req("i1", "b1", json!({}))).await.unwrap();
    h.broker.wait_idle().await;
    assert!(
        h.broker
            .get_binding(&InstanceId::new("i1"), &BindingId::new("b1"))
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn test_recovery_report_keeps_stale_operation() {
    let dir = TempDir::new().unwrap();
    seed_stale_provision(dir.path(), "i1", json!({"a": 1})).await;

    let h = Harness::open(CountingInstaller::new(), durable_config(dir.path())).await;
    let report = h.broker.recovery_report();
    assert_eq!(report.stale_count(), 1);
    assert_eq!(report.marked_failed, 0);
    assert_eq!(
        report.instance_operations[0].operation_id.as_str(),
        "op-stale"
    );

    // The stale operation still owns the instance.
    let joined = h
        .broker
        .provision(provision_req("i1", BINDABLE_SERVICE, json!({"a": 1})))
        .await
        .unwrap();
    assert_eq!(joined.operation_id.unwrap().as_str(), "op-stale");
    assert_eq!(h.installer.install_count(), 0);
}

#[tokio::test]
async fn test_recovery_mark_failed_releases_owner() {
    let dir = TempDir::new().unwrap();
    seed_stale_provision(dir.path(), "i1", json!({"a": 1})).await;

    let config = durable_config(dir.path()).recovery(RecoveryPolicy::MarkFailed);
    let h = Harness::open(CountingInstaller::new(), config).await;
    assert_eq!(h.broker.recovery_report().marked_failed, 1);

    let stale = h
        .broker
        .last_operation(&InstanceId::new("i1"), Some(&"op-stale".into()))
        .await
        .unwrap();
    assert_eq!(stale.state, OperationState::Failed);
    assert_eq!(stale.description.as_deref(), Some(INTERRUPTED_DESCRIPTION));

    let fresh = h.provisioned("i1", json!({"a": 1})).await;
    assert_ne!(fresh.as_str(), "op-stale");
    assert_eq!(h.installer.install_count(), 1);
}
