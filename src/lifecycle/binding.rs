//! Bind and unbind of service bindings.
//!
//! A binding has no row of its own. It exists when its operation history
//! (the instance's bind history filtered by binding id) folds to "created",
//! and its credentials live in the credential store under the binding id.

use super::{
    BindRequest, BindResponse, DecisionLocks, LastOperationResponse, OperationResponse,
    UnbindRequest, finish_operation, same_params,
};
use super::instance::InstanceService;
use crate::core::{
    BindOperation, BindingCredentials, BindingId, BindingKey, BrokerError, ChartRef,
    Credentials, Instance, InstanceId, OperationId, OperationState, OperationType, ParamsHash,
    Result, params_hash,
};
use crate::external::Collaborators;
use crate::predicate::{
    BindingStateReader, InstanceStateReader, in_progress, is_created, is_removed,
};
use crate::storage::{
    BindOperationStore, BindingCredentialStore, InstanceOperationStore, InstanceStore,
    OperationStore, tolerate_absent,
};
use crate::worker::BackgroundExecutor;
use std::sync::Arc;
use tracing::{info, info_span, warn};

struct BindingShared {
    operations: Arc<dyn BindOperationStore>,
    instances: Arc<dyn InstanceStore>,
    credentials: Arc<dyn BindingCredentialStore>,
    state: BindingStateReader,
    instance_state: InstanceStateReader,
    collaborators: Collaborators,
}

#[derive(Clone)]
pub struct BindingService {
    shared: Arc<BindingShared>,
    executor: BackgroundExecutor,
    locks: Arc<DecisionLocks>,
    /// Held around bind and unbind decisions so they never interleave with
    /// a deprovision decision for the same instance.
    instance_locks: Arc<DecisionLocks>,
}

/// How credentials are produced for a bind.
enum CredentialSource {
    /// Non-bindable plan or no template: the bind completes with nothing.
    Empty,
    Template { template: String, chart: ChartRef },
}

struct BindTask {
    key: BindingKey,
    operation_id: OperationId,
    instance: Instance,
    source: CredentialSource,
}

impl BindingService {
    pub fn new(
        operations: Arc<dyn BindOperationStore>,
        instance_operations: Arc<dyn InstanceOperationStore>,
        instances: Arc<dyn InstanceStore>,
        credentials: Arc<dyn BindingCredentialStore>,
        collaborators: Collaborators,
        executor: BackgroundExecutor,
        lock_shards: usize,
    ) -> Self {
        Self {
            shared: Arc::new(BindingShared {
                state: BindingStateReader::new(operations.clone()),
                instance_state: InstanceStateReader::new(instance_operations),
                operations,
                instances,
                credentials,
                collaborators,
            }),
            executor,
            locks: Arc::new(DecisionLocks::new(lock_shards)),
            instance_locks: Arc::new(DecisionLocks::new(lock_shards)),
        }
    }

    /// Serializes binding decisions with the instance decisions of `instances`.
    pub fn sharing_instance_locks(mut self, instances: &InstanceService) -> Self {
        self.instance_locks = instances.decision_locks();
        self
    }

    pub fn state(&self) -> &BindingStateReader {
        &self.shared.state
    }

    pub async fn bind(&self, req: BindRequest) -> Result<BindResponse> {
        if !req.accepts_incomplete {
            return Err(BrokerError::AsyncRequired);
        }
        if req.binding_id.is_empty() {
            return Err(BrokerError::Validation("binding_id is required".to_string()));
        }

        let key = BindingKey::new(req.instance_id.clone(), req.binding_id.clone());
        let hash = params_hash(&req.parameters);
        let shared = &self.shared;
        let _guard = self.locks.lock(&key).await;
        let _instance_guard = self.instance_locks.lock(&key.instance_id).await;

        if let Some(done) = shared
            .state
            .bound_operation(&key)
            .await
            .map_err(|e| e.context("checking if binding exists"))?
        {
            if !same_params(&done, &hash) {
                return Err(params_conflict(&key, "already bound"));
            }
            let stored = shared.credentials.get(&key.binding_id).await.map_err(|e| {
                if e.is_not_found() {
                    BrokerError::Dependency(format!(
                        "binding {} is bound but its credentials are gone",
                        key
                    ))
                } else {
                    e.context("reading binding credentials")
                }
            })?;
            info!(binding = %key, "binding already exists with the same parameters");
            return Ok(BindResponse::completed(stored.credentials));
        }

        if let Some(running) = shared
            .state
            .binding_in_progress(&key)
            .await
            .map_err(|e| e.context("checking if binding is in progress"))?
        {
            return Self::join_running(&key, running, &hash);
        }

        if !shared
            .instance_state
            .is_provisioned(&key.instance_id)
            .await
            .map_err(|e| e.context("checking if instance is provisioned"))?
        {
            return Err(BrokerError::Validation(format!(
                "instance {} is not provisioned",
                key.instance_id
            )));
        }
        Self::ensure_not_deprovisioning(shared, &key).await?;
        let instance = shared.instances.get(&key.instance_id).await.map_err(|e| {
            if e.is_not_found() {
                BrokerError::Validation(format!("instance {} does not exist", key.instance_id))
            } else {
                e.context("getting instance")
            }
        })?;

        let source = Self::credential_source(shared, &instance).await?;

        let operation_id = shared
            .collaborators
            .operation_ids
            .next_id()
            .map_err(|e| e.into_broker("generating operation id"))?;

        let op = BindOperation::new_create(key.clone(), operation_id.clone(), hash.clone());
        if let Err(err) = shared.operations.insert(op).await {
            if err.is_active_operation_in_progress() {
                if let Some(running) = shared.state.binding_in_progress(&key).await? {
                    return Self::join_running(&key, running, &hash);
                }
            }
            return Err(err.context("inserting bind operation"));
        }

        let task = BindTask {
            key: key.clone(),
            operation_id: operation_id.clone(),
            instance,
            source,
        };
        let span = info_span!(
            "bind",
            instance_id = %key.instance_id,
            binding_id = %key.binding_id,
            operation_id = %operation_id
        );
        let job_shared = self.shared.clone();
        if let Err(err) = self
            .executor
            .submit(span, async move { Self::run_bind(job_shared, task).await })
        {
            self.abandon(&key, &operation_id, &err).await;
            return Err(err);
        }

        info!(binding = %key, %operation_id, "binding accepted");
        Ok(BindResponse::accepted(operation_id))
    }

    pub async fn unbind(&self, req: UnbindRequest) -> Result<OperationResponse> {
        if !req.accepts_incomplete {
            return Err(BrokerError::AsyncRequired);
        }

        let key = BindingKey::new(req.instance_id, req.binding_id);
        let shared = &self.shared;
        let _guard = self.locks.lock(&key).await;
        let _instance_guard = self.instance_locks.lock(&key.instance_id).await;

        let history = shared
            .state
            .history(&key)
            .await
            .map_err(|e| e.context("reading binding history"))?;
        if is_removed(&history) {
            return Ok(OperationResponse::completed());
        }
        if let Some(running) = in_progress(&history, OperationType::Remove) {
            return Ok(OperationResponse::accepted(running.operation_id.clone()));
        }
        if let Some(running) = in_progress(&history, OperationType::Create) {
            return Err(BrokerError::ActiveOperationInProgress(format!(
                "binding {} is being created by operation {}",
                key, running.operation_id
            )));
        }
        if !is_created(&history) {
            return Err(BrokerError::Gone(format!("binding {} does not exist", key)));
        }
        Self::ensure_not_deprovisioning(shared, &key).await?;

        let operation_id = shared
            .collaborators
            .operation_ids
            .next_id()
            .map_err(|e| e.into_broker("generating operation id"))?;

        let op = BindOperation::new_remove(key.clone(), operation_id.clone());
        if let Err(err) = shared.operations.insert(op).await {
            if err.is_active_operation_in_progress() {
                if let Some(running) = shared.state.unbinding_in_progress(&key).await? {
                    return Ok(OperationResponse::accepted(running.operation_id));
                }
            }
            return Err(err.context("inserting unbind operation"));
        }

        let span = info_span!(
            "unbind",
            instance_id = %key.instance_id,
            binding_id = %key.binding_id,
            operation_id = %operation_id
        );
        let job_shared = self.shared.clone();
        let job_key = key.clone();
        let job_id = operation_id.clone();
        if let Err(err) = self.executor.submit(span, async move {
            Self::run_unbind(job_shared, job_key, job_id).await
        }) {
            self.abandon(&key, &operation_id, &err).await;
            return Err(err);
        }

        info!(binding = %key, %operation_id, "unbinding accepted");
        Ok(OperationResponse::accepted(operation_id))
    }

    pub async fn last_operation(
        &self,
        instance_id: &InstanceId,
        binding_id: &BindingId,
        operation_id: Option<&OperationId>,
    ) -> Result<LastOperationResponse> {
        let key = BindingKey::new(instance_id.clone(), binding_id.clone());
        let operation_id = operation_id.ok_or_else(|| {
            BrokerError::Validation(format!("operation id is required to poll binding {}", key))
        })?;
        match self.shared.operations.get(&key, operation_id).await {
            Ok(op) => Ok(LastOperationResponse::from_record(&op)),
            Err(err) if err.is_not_found() => Err(BrokerError::Gone(format!(
                "operation {} of binding {} does not exist",
                operation_id, key
            ))),
            Err(err) => Err(err.context("getting bind operation")),
        }
    }

    /// Credentials of a binding that is currently bound.
    pub async fn get_binding(
        &self,
        instance_id: &InstanceId,
        binding_id: &BindingId,
    ) -> Result<BindingCredentials> {
        let key = BindingKey::new(instance_id.clone(), binding_id.clone());
        if !self.shared.state.is_bound(&key).await? {
            return Err(BrokerError::NotFound(format!("binding {} is not bound", key)));
        }
        self.shared
            .credentials
            .get(binding_id)
            .await
            .map_err(|e| e.context(format!("reading credentials of binding {}", key)))
    }

    async fn credential_source(
        shared: &BindingShared,
        instance: &Instance,
    ) -> Result<CredentialSource> {
        let addon = shared
            .collaborators
            .catalog
            .get_by_id(&instance.namespace, &instance.service_id)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    BrokerError::Validation(format!(
                        "service {} is no longer offered in namespace {}",
                        instance.service_id, instance.namespace
                    ))
                } else {
                    e.into_broker("looking up catalog entry")
                }
            })?;
        let plan = addon.plan(&instance.plan_id).ok_or_else(|| {
            BrokerError::Validation(format!(
                "plan {} does not exist in service {}",
                instance.plan_id, instance.service_id
            ))
        })?;

        Ok(match (&plan.bind_template, addon.bindable) {
            (Some(template), true) => CredentialSource::Template {
                template: template.clone(),
                chart: plan.chart_ref.clone(),
            },
            _ => CredentialSource::Empty,
        })
    }

    async fn ensure_not_deprovisioning(shared: &BindingShared, key: &BindingKey) -> Result<()> {
        if let Some(running) = shared
            .instance_state
            .deprovisioning_in_progress(&key.instance_id)
            .await
            .map_err(|e| e.context("checking if instance is being deprovisioned"))?
        {
            return Err(BrokerError::ActiveOperationInProgress(format!(
                "instance {} is being deprovisioned by operation {}",
                key.instance_id, running.operation_id
            )));
        }
        Ok(())
    }

    fn join_running(
        key: &BindingKey,
        running: BindOperation,
        hash: &ParamsHash,
    ) -> Result<BindResponse> {
        if same_params(&running, hash) {
            info!(binding = %key, operation_id = %running.operation_id, "joining in-flight binding");
            return Ok(BindResponse::accepted(running.operation_id));
        }
        Err(params_conflict(key, "being bound"))
    }

    async fn abandon(&self, key: &BindingKey, operation_id: &OperationId, cause: &BrokerError) {
        finish_operation::<BindOperation, _>(
            self.shared.operations.as_ref(),
            key,
            operation_id,
            OperationState::Failed,
            format!("operation could not be started: {}", cause),
        )
        .await;
    }

    async fn run_bind(shared: Arc<BindingShared>, task: BindTask) {
        let BindTask {
            key,
            operation_id,
            instance,
            source,
        } = task;

        let outcome: Result<usize> = async {
            let credentials = match source {
                CredentialSource::Empty => Credentials::new(),
                CredentialSource::Template { template, chart } => {
                    let rendered = shared
                        .collaborators
                        .renderer
                        .render(&template, &instance, &chart)
                        .await
                        .map_err(|e| e.into_broker("rendering bind template"))?;
                    shared
                        .collaborators
                        .resolver
                        .resolve(&rendered, &instance.namespace)
                        .await
                        .map_err(|e| e.into_broker("resolving bind data"))?
                }
            };
            let count = credentials.len();
            shared
                .credentials
                .put(BindingCredentials {
                    instance_id: key.instance_id.clone(),
                    binding_id: key.binding_id.clone(),
                    credentials,
                })
                .await
                .map_err(|e| e.context("storing binding credentials"))?;
            Ok(count)
        }
        .await;

        let (state, description) = match outcome {
            Ok(count) => {
                info!(binding = %key, credentials = count, "binding succeeded");
                (OperationState::Succeeded, "binding succeeded".to_string())
            }
            Err(err) => {
                warn!(binding = %key, error = %err, "binding failed");
                (OperationState::Failed, format!("binding failed: {}", err))
            }
        };
        finish_operation::<BindOperation, _>(
            shared.operations.as_ref(),
            &key,
            &operation_id,
            state,
            description,
        )
        .await;
    }

    async fn run_unbind(shared: Arc<BindingShared>, key: BindingKey, operation_id: OperationId) {
        let (state, description) =
            match tolerate_absent(shared.credentials.remove(&key.binding_id).await) {
                Ok(()) => {
                    info!(binding = %key, "unbinding succeeded");
                    (OperationState::Succeeded, "unbinding succeeded".to_string())
                }
                Err(err) => {
                    warn!(binding = %key, error = %err, "unbinding failed");
                    (OperationState::Failed, format!("unbinding failed: {}", err))
                }
            };
        finish_operation::<BindOperation, _>(
            shared.operations.as_ref(),
            &key,
            &operation_id,
            state,
            description,
        )
        .await;
    }
}

fn params_conflict(key: &BindingKey, what: &str) -> BrokerError {
    BrokerError::Conflict(format!(
        "binding {} is {} with different parameters",
        key, what
    ))
}
