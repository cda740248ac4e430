//! Provision and deprovision of service instances.

use super::{
    DecisionLocks, DeprovisionRequest, LastOperationResponse, OperationResponse,
    ProvisionRequest, finish_operation, same_params,
};
use crate::core::{
    BrokerError, ChartRef, Instance, InstanceId, InstanceOperation, OperationId,
    OperationState, ParamsHash, Result, params_hash,
};
use crate::external::Collaborators;
use crate::predicate::InstanceStateReader;
use crate::storage::{
    BindOperationStore, BindingCredentialStore, InstanceOperationStore, InstanceStore,
    OperationStore, tolerate_absent,
};
use crate::worker::BackgroundExecutor;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, info_span, warn};

/// Release names are capped the way the workload tooling caps them.
const MAX_RELEASE_NAME_LEN: usize = 53;

/// Stores and capabilities shared between the decision phase and the
/// background jobs it launches.
struct InstanceShared {
    operations: Arc<dyn InstanceOperationStore>,
    instances: Arc<dyn InstanceStore>,
    bind_operations: Arc<dyn BindOperationStore>,
    credentials: Arc<dyn BindingCredentialStore>,
    state: InstanceStateReader,
    collaborators: Collaborators,
}

#[derive(Clone)]
pub struct InstanceService {
    shared: Arc<InstanceShared>,
    executor: BackgroundExecutor,
    locks: Arc<DecisionLocks>,
}

/// Everything the install job needs, captured at decision time.
struct ProvisionTask {
    operation_id: OperationId,
    instance: Instance,
    chart: ChartRef,
    values: Value,
    release_name: String,
}

struct DeprovisionTask {
    operation_id: OperationId,
    instance: Instance,
}

impl InstanceService {
    pub fn new(
        operations: Arc<dyn InstanceOperationStore>,
        instances: Arc<dyn InstanceStore>,
        bind_operations: Arc<dyn BindOperationStore>,
        credentials: Arc<dyn BindingCredentialStore>,
        collaborators: Collaborators,
        executor: BackgroundExecutor,
        lock_shards: usize,
    ) -> Self {
        Self {
            shared: Arc::new(InstanceShared {
                state: InstanceStateReader::new(operations.clone()),
                operations,
                instances,
                bind_operations,
                credentials,
                collaborators,
            }),
            executor,
            locks: Arc::new(DecisionLocks::new(lock_shards)),
        }
    }

    pub(crate) fn decision_locks(&self) -> Arc<DecisionLocks> {
        self.locks.clone()
    }

    pub fn state(&self) -> &InstanceStateReader {
        &self.shared.state
    }

    pub async fn provision(&self, req: ProvisionRequest) -> Result<OperationResponse> {
        if !req.accepts_incomplete {
            return Err(BrokerError::AsyncRequired);
        }
        if req.instance_id.is_empty() {
            return Err(BrokerError::Validation("instance_id is required".to_string()));
        }
        if req.namespace.is_empty() {
            return Err(BrokerError::Validation("namespace is required".to_string()));
        }

        let iid = &req.instance_id;
        let hash = params_hash(&req.parameters);
        let shared = &self.shared;
        let _guard = self.locks.lock(iid).await;

        if let Some(done) = shared
            .state
            .provisioned_operation(iid)
            .await
            .map_err(|e| e.context("checking if instance is provisioned"))?
        {
            if same_params(&done, &hash) {
                info!(instance_id = %iid, "instance already provisioned with the same parameters");
                return Ok(OperationResponse::completed());
            }
            return Err(params_conflict(iid, "already provisioned"));
        }

        if let Some(running) = shared
            .state
            .provisioning_in_progress(iid)
            .await
            .map_err(|e| e.context("checking if provisioning is in progress"))?
        {
            return Self::join_running(iid, running, &hash);
        }

        let addon = shared
            .collaborators
            .catalog
            .get_by_id(&req.namespace, &req.service_id)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    BrokerError::Validation(format!(
                        "service {} is not offered in namespace {}",
                        req.service_id, req.namespace
                    ))
                } else {
                    e.into_broker("looking up catalog entry")
                }
            })?;
        let plan = addon.plan(&req.plan_id).cloned().ok_or_else(|| {
            BrokerError::Validation(format!(
                "plan {} does not exist in service {}",
                req.plan_id, req.service_id
            ))
        })?;

        let operation_id = shared
            .collaborators
            .operation_ids
            .next_id()
            .map_err(|e| e.into_broker("generating operation id"))?;

        let op = InstanceOperation::new_create(iid.clone(), operation_id.clone(), hash.clone());
        if let Err(err) = shared.operations.insert(op).await {
            if err.is_active_operation_in_progress() {
                // Another decision won the insert; converge on its operation.
                if let Some(running) = shared.state.provisioning_in_progress(iid).await? {
                    return Self::join_running(iid, running, &hash);
                }
            }
            return Err(err.context("inserting provision operation"));
        }

        let instance = Instance {
            id: iid.clone(),
            namespace: req.namespace.clone(),
            service_id: req.service_id.clone(),
            plan_id: req.plan_id.clone(),
            params_hash: hash,
            release: None,
        };
        if let Err(err) = shared.instances.upsert(instance.clone()).await {
            self.abandon(iid, &operation_id, &err).await;
            return Err(err.context("storing instance"));
        }

        let task = ProvisionTask {
            operation_id: operation_id.clone(),
            release_name: release_name_for(iid),
            values: merge_values(&plan.default_values, &req.parameters),
            chart: plan.chart_ref,
            instance,
        };
        let span = info_span!("provision", instance_id = %iid, operation_id = %operation_id);
        let job_shared = self.shared.clone();
        if let Err(err) = self
            .executor
            .submit(span, async move { Self::run_provision(job_shared, task).await })
        {
            self.abandon(iid, &operation_id, &err).await;
            return Err(err);
        }

        info!(instance_id = %iid, %operation_id, "provisioning accepted");
        Ok(OperationResponse::accepted(operation_id))
    }

    pub async fn deprovision(&self, req: DeprovisionRequest) -> Result<OperationResponse> {
        if !req.accepts_incomplete {
            return Err(BrokerError::AsyncRequired);
        }

        let iid = &req.instance_id;
        let shared = &self.shared;
        let _guard = self.locks.lock(iid).await;

        if shared
            .state
            .is_deprovisioned(iid)
            .await
            .map_err(|e| e.context("checking if instance is deprovisioned"))?
        {
            return Ok(OperationResponse::completed());
        }

        if let Some(running) = shared
            .state
            .deprovisioning_in_progress(iid)
            .await
            .map_err(|e| e.context("checking if deprovisioning is in progress"))?
        {
            return Ok(OperationResponse::accepted(running.operation_id));
        }

        let instance = match shared.instances.get(iid).await {
            Ok(instance) => instance,
            Err(err) if err.is_not_found() => {
                return Err(BrokerError::Gone(format!("instance {} does not exist", iid)));
            }
            Err(err) => return Err(err.context("getting instance")),
        };

        let bind_history = match shared.bind_operations.get_all(iid).await {
            Ok(history) => history,
            Err(err) if err.is_not_found() => Vec::new(),
            Err(err) => return Err(err.context("checking binding operations")),
        };
        if let Some(running) = bind_history
            .iter()
            .find(|op| op.state == OperationState::InProgress)
        {
            return Err(BrokerError::ActiveOperationInProgress(format!(
                "binding {} of instance {} has operation {} in progress",
                running.binding_id,
                iid,
                running.operation_id
            )));
        }

        let operation_id = shared
            .collaborators
            .operation_ids
            .next_id()
            .map_err(|e| e.into_broker("generating operation id"))?;

        let op = InstanceOperation::new_remove(iid.clone(), operation_id.clone());
        if let Err(err) = shared.operations.insert(op).await {
            if err.is_active_operation_in_progress() {
                if let Some(running) = shared.state.deprovisioning_in_progress(iid).await? {
                    return Ok(OperationResponse::accepted(running.operation_id));
                }
            }
            return Err(err.context("inserting deprovision operation"));
        }

        let task = DeprovisionTask {
            operation_id: operation_id.clone(),
            instance,
        };
        let span = info_span!("deprovision", instance_id = %iid, operation_id = %operation_id);
        let job_shared = self.shared.clone();
        if let Err(err) = self
            .executor
            .submit(span, async move { Self::run_deprovision(job_shared, task).await })
        {
            self.abandon(iid, &operation_id, &err).await;
            return Err(err);
        }

        info!(instance_id = %iid, %operation_id, "deprovisioning accepted");
        Ok(OperationResponse::accepted(operation_id))
    }

    /// Polls an operation. The broker cannot pick "the latest" operation for
    /// the caller, so the id is mandatory.
    pub async fn last_operation(
        &self,
        instance_id: &InstanceId,
        operation_id: Option<&OperationId>,
    ) -> Result<LastOperationResponse> {
        let operation_id = operation_id.ok_or_else(|| {
            BrokerError::Validation(format!(
                "operation id is required to poll instance {}",
                instance_id
            ))
        })?;
        match self.shared.operations.get(instance_id, operation_id).await {
            Ok(op) => Ok(LastOperationResponse::from_record(&op)),
            Err(err) if err.is_not_found() => Err(BrokerError::Gone(format!(
                "operation {} of instance {} does not exist",
                operation_id, instance_id
            ))),
            Err(err) => Err(err.context("getting instance operation")),
        }
    }

    pub async fn get_instance(&self, instance_id: &InstanceId) -> Result<Instance> {
        self.shared.instances.get(instance_id).await
    }

    fn join_running(
        iid: &InstanceId,
        running: InstanceOperation,
        hash: &ParamsHash,
    ) -> Result<OperationResponse> {
        if same_params(&running, hash) {
            info!(instance_id = %iid, operation_id = %running.operation_id, "joining in-flight provisioning");
            return Ok(OperationResponse::accepted(running.operation_id));
        }
        Err(params_conflict(iid, "being provisioned"))
    }

    /// Fails an accepted operation that could not be launched.
    async fn abandon(&self, iid: &InstanceId, operation_id: &OperationId, cause: &BrokerError) {
        finish_operation::<InstanceOperation, _>(
            self.shared.operations.as_ref(),
            iid,
            operation_id,
            OperationState::Failed,
            format!("operation could not be started: {}", cause),
        )
        .await;
    }

    async fn run_provision(shared: Arc<InstanceShared>, task: ProvisionTask) {
        let ProvisionTask {
            operation_id,
            mut instance,
            chart,
            values,
            release_name,
        } = task;
        let iid = instance.id.clone();

        let outcome: Result<()> = async {
            let release = shared
                .collaborators
                .installer
                .install(&chart, &values, &release_name, &instance.namespace)
                .await
                .map_err(|e| e.into_broker(format!("installing release {}", release_name)))?;
            instance.release = Some(release);
            shared
                .instances
                .upsert(instance)
                .await
                .map_err(|e| e.context("storing release metadata"))
        }
        .await;

        let (state, description) = match outcome {
            Ok(()) => {
                info!(instance_id = %iid, %chart, "provisioning succeeded");
                (OperationState::Succeeded, "provisioning succeeded".to_string())
            }
            Err(err) => {
                warn!(instance_id = %iid, error = %err, "provisioning failed");
                (OperationState::Failed, format!("provisioning failed: {}", err))
            }
        };
        finish_operation::<InstanceOperation, _>(
            shared.operations.as_ref(),
            &iid,
            &operation_id,
            state,
            description,
        )
        .await;
    }

    async fn run_deprovision(shared: Arc<InstanceShared>, task: DeprovisionTask) {
        let DeprovisionTask {
            operation_id,
            instance,
        } = task;
        let iid = instance.id.clone();

        let outcome = Self::tear_down(&shared, &instance).await;
        let (state, description) = match outcome {
            Ok(()) => {
                info!(instance_id = %iid, "deprovisioning succeeded");
                (OperationState::Succeeded, "deprovisioning succeeded".to_string())
            }
            Err(err) => {
                warn!(instance_id = %iid, error = %err, "deprovisioning failed");
                (OperationState::Failed, format!("deprovisioning failed: {}", err))
            }
        };
        finish_operation::<InstanceOperation, _>(
            shared.operations.as_ref(),
            &iid,
            &operation_id,
            state,
            description,
        )
        .await;
    }

    /// Removes the release, binding data and snapshot. Every step accepts
    /// "already absent", so running it twice is harmless.
    async fn tear_down(shared: &InstanceShared, instance: &Instance) -> Result<()> {
        let iid = &instance.id;
        let release_name = instance
            .release
            .as_ref()
            .map(|release| release.release_name.clone())
            .unwrap_or_else(|| release_name_for(iid));

        match shared
            .collaborators
            .installer
            .delete(&release_name, &instance.namespace)
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                info!(instance_id = %iid, %release_name, "release already absent");
            }
            Err(err) => {
                return Err(err.into_broker(format!("deleting release {}", release_name)));
            }
        }

        let removed = shared
            .credentials
            .remove_for_instance(iid)
            .await
            .map_err(|e| e.context("removing binding credentials"))?;
        if removed > 0 {
            info!(instance_id = %iid, removed, "removed binding credentials");
        }

        let bind_history = match shared.bind_operations.get_all(iid).await {
            Ok(history) => history,
            Err(err) if err.is_not_found() => Vec::new(),
            Err(err) => return Err(err.context("reading binding operations")),
        };
        for op in bind_history {
            tolerate_absent(
                shared
                    .bind_operations
                    .remove(&op.binding_key(), &op.operation_id)
                    .await,
            )
            .map_err(|e| e.context("removing binding operations"))?;
        }

        tolerate_absent(shared.instances.remove(iid).await)
            .map_err(|e| e.context("removing instance"))
    }
}

fn params_conflict(iid: &InstanceId, what: &str) -> BrokerError {
    BrokerError::Conflict(format!(
        "instance {} is {} with different parameters",
        iid, what
    ))
}

/// Deterministic release name for an instance.
pub fn release_name_for(instance_id: &InstanceId) -> String {
    let mut name: String = format!("osb-{}", instance_id)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    name.truncate(MAX_RELEASE_NAME_LEN);
    name.trim_end_matches('-').to_string()
}

/// Plan defaults overlaid with request parameters; nested objects merge key
/// by key, anything else in `overrides` replaces the default.
pub fn merge_values(defaults: &Map<String, Value>, overrides: &Map<String, Value>) -> Value {
    let mut merged = defaults.clone();
    for (key, value) in overrides {
        let combined = match (merged.get(key), value) {
            (Some(Value::Object(base)), Value::Object(over)) => merge_values(base, over),
            _ => value.clone(),
        };
        merged.insert(key.clone(), combined);
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_release_name_is_sanitized_and_capped() {
        assert_eq!(release_name_for(&"ABC_123".into()), "osb-abc-123");
        let long = "x".repeat(80);
        assert_eq!(release_name_for(&long.as_str().into()).len(), MAX_RELEASE_NAME_LEN);
    }

    #[test]
    fn test_merge_values_deep() {
        let defaults = json!({"replicas": 1, "db": {"user": "admin", "size": "1Gi"}});
        let overrides = json!({"db": {"size": "5Gi"}, "tls": true});
        let merged = merge_values(
            defaults.as_object().unwrap(),
            overrides.as_object().unwrap(),
        );
        assert_eq!(
            merged,
            json!({"replicas": 1, "db": {"user": "admin", "size": "5Gi"}, "tls": true})
        );
    }
}
