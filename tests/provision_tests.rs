mod common;

use common::*;
use osb_broker::core::{InstanceId, InstanceOperation, OperationState, params_hash};
use osb_broker::storage::OperationStore;
use osb_broker::{BrokerError, BrokerProblem, BrokerStores};
use serde_json::json;
use std::sync::atomic::Ordering;

#[tokio::test]
async fn test_provision_runs_install_and_succeeds() {
    let h = Harness::new().await;

    let response = h
        .broker
        .provision(provision_req("i1", BINDABLE_SERVICE, json!({"replicas": 3})))
        .await
        .unwrap();
    assert!(response.is_async);
    let operation_id = response.operation_id.unwrap();
    assert_eq!(operation_id.as_str(), "op-1");

    h.broker.wait_idle().await;
    let last = h
        .broker
        .last_operation(&InstanceId::new("i1"), Some(&operation_id))
        .await
        .unwrap();
    assert_eq!(last.state, OperationState::Succeeded);
    assert_eq!(last.description.as_deref(), Some("provisioning succeeded"));
    assert_eq!(h.installer.install_count(), 1);

    let instance = h.broker.get_instance(&InstanceId::new("i1")).await.unwrap();
    let release = instance.release.unwrap();
    assert_eq!(release.release_name, "osb-i1");
}

#[tokio::test]
async fn test_provision_merges_plan_defaults_with_parameters() {
    let h = Harness::new().await;
    h.provisioned("i1", json!({"auth": {"user": "app"}, "tls": true}))
        .await;

    let installed = h.installer.installed();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].0, "osb-i1");
    assert_eq!(
        installed[0].1,
        json!({
            "replicas": 1,
            "auth": {"enabled": true, "user": "app"},
            "tls": true
        })
    );
}

#[tokio::test]
async fn test_provisional_snapshot_is_visible_before_install_finishes() {
    let h = Harness::with_installer(CountingInstaller::gated()).await;
    let params = json!({"replicas": 2});

    h.broker
        .provision(provision_req("i1", BINDABLE_SERVICE, params.clone()))
        .await
        .unwrap();

    let instance = h.broker.get_instance(&InstanceId::new("i1")).await.unwrap();
    assert!(instance.release.is_none());
    assert_eq!(instance.params_hash, params_hash(&common::params(params)));

    h.installer.release(1);
    h.broker.wait_idle().await;
    let instance = h.broker.get_instance(&InstanceId::new("i1")).await.unwrap();
    assert!(instance.release.is_some());
}

#[tokio::test]
async fn test_identical_provision_before_completion_shares_operation() {
    // P1
    let h = Harness::with_installer(CountingInstaller::gated()).await;
    let params = json!({"replicas": 2, "tier": "gold"});
    let reordered = json!({"tier": "gold", "replicas": 2});

    let first = h
        .broker
        .provision(provision_req("i1", BINDABLE_SERVICE, params))
        .await
        .unwrap();
    let second = h
        .broker
        .provision(provision_req("i1", BINDABLE_SERVICE, reordered))
        .await
        .unwrap();

    assert!(first.is_async && second.is_async);
    assert_eq!(first.operation_id, second.operation_id);

    h.installer.release(2);
    h.broker.wait_idle().await;
    assert_eq!(h.installer.install_count(), 1);
    assert_eq!(h.broker.executor_stats().completed, 1);
}

#[tokio::test]
async fn test_different_parameters_conflict_while_in_progress() {
    // P2, first request still running
    let h = Harness::with_installer(CountingInstaller::gated()).await;
    let p1 = json!({"replicas": 1});
    let p2 = json!({"replicas": 5});

    h.broker
        .provision(provision_req("i1", BINDABLE_SERVICE, p1.clone()))
        .await
        .unwrap();
    let err = h
        .broker
        .provision(provision_req("i1", BINDABLE_SERVICE, p2))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Conflict(_)), "{err}");
    assert_eq!(BrokerProblem::from(&err).status, 409);

    h.installer.release(1);
    h.broker.wait_idle().await;
    let instance = h.broker.get_instance(&InstanceId::new("i1")).await.unwrap();
    assert_eq!(instance.params_hash, params_hash(&common::params(p1)));
}

#[tokio::test]
async fn test_different_parameters_conflict_after_success() {
    // P2, first request done
    let h = Harness::new().await;
    let p1 = json!({"replicas": 1});
    h.provisioned("i1", p1.clone()).await;

    let err = h
        .broker
        .provision(provision_req("i1", BINDABLE_SERVICE, json!({"replicas": 9})))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Conflict(_)));

    let again = h
        .broker
        .provision(provision_req("i1", BINDABLE_SERVICE, p1.clone()))
        .await
        .unwrap();
    assert!(!again.is_async);
    assert!(again.operation_id.is_none());
    assert_eq!(h.installer.install_count(), 1);

    let instance = h.broker.get_instance(&InstanceId::new("i1")).await.unwrap();
    assert_eq!(instance.params_hash, params_hash(&common::params(p1)));
}

#[tokio::test]
async fn test_scenario_a_in_progress_operation_is_returned() {
    let params = json!({"size": "large"});
    let stores = BrokerStores::in_memory();
    stores
        .instance_operations
        .insert(InstanceOperation::new_create(
            "i1".into(),
            "op-existing".into(),
            params_hash(&common::params(params.clone())),
        ))
        .await
        .unwrap();

    let h = Harness::with_stores(
        CountingInstaller::new(),
        stores.clone(),
        osb_broker::BrokerConfig::new(),
    )
    .await;

    let response = h
        .broker
        .provision(provision_req("i1", BINDABLE_SERVICE, params))
        .await
        .unwrap();
    assert!(response.is_async);
    assert_eq!(response.operation_id.unwrap().as_str(), "op-existing");

    let history = stores
        .instance_operations
        .get_all(&InstanceId::new("i1"))
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(h.installer.install_count(), 0);
}

#[tokio::test]
async fn test_scenario_b_succeeded_history_decides_by_hash() {
    let h1 = json!({"version": "7"});
    let h2 = json!({"version": "8"});
    let stores = BrokerStores::in_memory();
    let iid = InstanceId::new("i1");
    stores
        .instance_operations
        .insert(InstanceOperation::new_create(
            iid.clone(),
            "op-0".into(),
            params_hash(&common::params(h1.clone())),
        ))
        .await
        .unwrap();
    stores
        .instance_operations
        .update_state(&iid, &"op-0".into(), OperationState::Succeeded)
        .await
        .unwrap();

    let h = Harness::with_stores(
        CountingInstaller::new(),
        stores,
        osb_broker::BrokerConfig::new(),
    )
    .await;

    let err = h
        .broker
        .provision(provision_req("i1", BINDABLE_SERVICE, h2))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Conflict(_)));

    let response = h
        .broker
        .provision(provision_req("i1", BINDABLE_SERVICE, h1))
        .await
        .unwrap();
    assert!(!response.is_async);
}

#[tokio::test]
async fn test_synchronous_request_is_rejected() {
    let h = Harness::new().await;
    let mut req = provision_req("i1", BINDABLE_SERVICE, json!({}));
    req.accepts_incomplete = false;

    let err = h.broker.provision(req).await.unwrap_err();
    assert_eq!(err, BrokerError::AsyncRequired);
    let problem = BrokerProblem::from(&err);
    assert_eq!((problem.status, problem.code), (422, "AsyncRequired"));
    assert!(h.broker.get_instance(&InstanceId::new("i1")).await.is_err());
}

#[tokio::test]
async fn test_unknown_service_or_plan_is_bad_request() {
    let h = Harness::new().await;

    let err = h
        .broker
        .provision(provision_req("i1", "postgres", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Validation(_)), "{err}");

    let mut req = provision_req("i1", BINDABLE_SERVICE, json!({}));
    req.plan_id = "huge".into();
    let err = h.broker.provision(req).await.unwrap_err();
    assert!(matches!(err, BrokerError::Validation(_)), "{err}");
    assert_eq!(BrokerProblem::from(&err).code, "BadRequest");

    // Nothing was recorded for the rejected requests.
    assert!(
        h.broker
            .stores()
            .instance_operations
            .get_all(&InstanceId::new("i1"))
            .await
            .unwrap_err()
            .is_not_found()
    );
}

#[tokio::test]
async fn test_failed_install_is_reported_and_retryable() {
    let h = Harness::new().await;
    h.installer.fail_installs_with("chart pull failed");

    let first = h
        .broker
        .provision(provision_req("i1", BINDABLE_SERVICE, json!({"a": 1})))
        .await
        .unwrap()
        .operation_id
        .unwrap();
    h.broker.wait_idle().await;

    let last = h
        .broker
        .last_operation(&InstanceId::new("i1"), Some(&first))
        .await
        .unwrap();
    assert_eq!(last.state, OperationState::Failed);
    assert!(last.description.unwrap().contains("chart pull failed"));

    h.installer.clear_failures();
    let second = h
        .broker
        .provision(provision_req("i1", BINDABLE_SERVICE, json!({"a": 2})))
        .await
        .unwrap()
        .operation_id
        .unwrap();
    assert_ne!(first, second);
    h.broker.wait_idle().await;
    assert_eq!(h.state_of("i1", &second).await, OperationState::Succeeded);
}

#[tokio::test]
async fn test_id_provider_failure_is_surfaced_without_recording() {
    let h = Harness::new().await;
    h.ids.fail.store(true, Ordering::SeqCst);

    let err = h
        .broker
        .provision(provision_req("i1", BINDABLE_SERVICE, json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Dependency(_)));
    assert_eq!(BrokerProblem::from(&err).status, 500);
    assert!(h.broker.get_instance(&InstanceId::new("i1")).await.is_err());
}

#[tokio::test]
async fn test_requests_after_shutdown_fail_their_operation() {
    let h = Harness::new().await;
    h.broker.shutdown().await;

    let err = h
        .broker
        .provision(provision_req("i1", BINDABLE_SERVICE, json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Dependency(_)));

    let op = h
        .broker
        .stores()
        .instance_operations
        .get(&InstanceId::new("i1"), &"op-1".into())
        .await
        .unwrap();
    assert_eq!(op.state, OperationState::Failed);
    assert_eq!(h.installer.install_count(), 0);
}
