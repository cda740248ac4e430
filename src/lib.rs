// ============================================================================
// OSB Broker Library
// ============================================================================

pub mod config;
pub mod core;
pub mod external;
pub mod lifecycle;
pub mod predicate;
pub mod prelude;
pub mod recovery;
pub mod storage;
pub mod web;
pub mod worker;

// Re-export main types for convenience
pub use config::{BrokerConfig, CredentialDurability, RecoveryPolicy, StorageBackend};
pub use core::{BrokerError, CollaboratorError, Result};
pub use external::Collaborators;
pub use lifecycle::{
    BindRequest, BindResponse, BindingService, DeprovisionRequest, InstanceService,
    LastOperationResponse, OperationResponse, ProvisionRequest, UnbindRequest,
};
pub use recovery::RecoveryReport;
pub use web::BrokerProblem;
pub use worker::{BackgroundExecutor, ExecutorStats};

use crate::core::{
    BindOperation, BindingCredentials, BindingId, Instance, InstanceId, InstanceOperation,
    OperationId,
};
use crate::storage::journal::{
    BIND_OPERATIONS_JOURNAL, INSTANCE_OPERATIONS_JOURNAL, INSTANCES_JOURNAL,
};
use crate::storage::{
    BindOperationStore, BindingCredentialStore, FileCredentialStore, InstanceOperationStore,
    InstanceStore, JournaledInstanceStore, JournaledOperationStore, MemoryCredentialStore,
    MemoryInstanceStore, MemoryOperationStore,
};
use std::sync::Arc;
use tracing::info;

// ============================================================================
// Store wiring
// ============================================================================

/// The four collections a broker runs on.
#[derive(Clone)]
pub struct BrokerStores {
    pub instance_operations: Arc<dyn InstanceOperationStore>,
    pub bind_operations: Arc<dyn BindOperationStore>,
    pub instances: Arc<dyn InstanceStore>,
    pub credentials: Arc<dyn BindingCredentialStore>,
}

impl BrokerStores {
    pub fn in_memory() -> Self {
        Self {
            instance_operations: Arc::new(MemoryOperationStore::<InstanceOperation>::new()),
            bind_operations: Arc::new(MemoryOperationStore::<BindOperation>::new()),
            instances: Arc::new(MemoryInstanceStore::new()),
            credentials: Arc::new(MemoryCredentialStore::new()),
        }
    }

    /// Opens the backends selected by `config`, replaying journals if any.
    pub async fn open(config: &BrokerConfig) -> Result<Self> {
        let mut stores = Self::in_memory();

        if let StorageBackend::Journal {
            dir,
            sync_writes,
            checkpoint_every,
        } = &config.storage
        {
            let instance_operations = JournaledOperationStore::<InstanceOperation>::open(
                dir.join(INSTANCE_OPERATIONS_JOURNAL),
                *sync_writes,
            )
            .await?
            .checkpoint_every(*checkpoint_every);
            let bind_operations = JournaledOperationStore::<BindOperation>::open(
                dir.join(BIND_OPERATIONS_JOURNAL),
                *sync_writes,
            )
            .await?
            .checkpoint_every(*checkpoint_every);
            let instances = JournaledInstanceStore::open(dir.join(INSTANCES_JOURNAL), *sync_writes)
                .await?
                .checkpoint_every(*checkpoint_every);

            stores.instance_operations = Arc::new(instance_operations);
            stores.bind_operations = Arc::new(bind_operations);
            stores.instances = Arc::new(instances);
        }

        if let CredentialDurability::Persisted { dir } = &config.credential_durability {
            stores.credentials = Arc::new(FileCredentialStore::open(dir).await?);
        }

        Ok(stores)
    }
}

// ============================================================================
// Broker facade
// ============================================================================

/// Entry point for the platform-facing layer: one method per OSB verb.
///
/// # Examples
///
/// ```no_run
/// # use osb_broker::{Broker, BrokerConfig, Collaborators, ProvisionRequest};
/// # async fn run(collaborators: Collaborators) -> osb_broker::Result<()> {
/// let broker = Broker::open(BrokerConfig::new().journal_dir("/var/lib/broker"), collaborators)
///     .await?;
///
/// let response = broker
///     .provision(ProvisionRequest {
///         instance_id: "i1".into(),
///         service_id: "redis".into(),
///         plan_id: "small".into(),
///         namespace: "team-a".into(),
///         parameters: Default::default(),
///         accepts_incomplete: true,
///     })
///     .await?;
/// println!("accepted as {:?}", response.operation_id);
///
/// broker.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Broker {
    config: BrokerConfig,
    stores: BrokerStores,
    instances: InstanceService,
    bindings: BindingService,
    executor: BackgroundExecutor,
    recovery: RecoveryReport,
}

impl Broker {
    /// Opens the configured stores, runs the startup recovery sweep, and
    /// starts the background executor.
    pub async fn open(config: BrokerConfig, collaborators: Collaborators) -> Result<Self> {
        let stores = BrokerStores::open(&config).await?;
        Self::with_stores(config, stores, collaborators).await
    }

    /// Like [`Broker::open`] over caller-provided stores.
    pub async fn with_stores(
        config: BrokerConfig,
        stores: BrokerStores,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;

        let recovery = recovery::sweep(
            stores.instance_operations.as_ref(),
            stores.bind_operations.as_ref(),
            config.recovery,
        )
        .await?;

        let executor = BackgroundExecutor::new(config.worker_pool_size);
        let instances = InstanceService::new(
            stores.instance_operations.clone(),
            stores.instances.clone(),
            stores.bind_operations.clone(),
            stores.credentials.clone(),
            collaborators.clone(),
            executor.clone(),
            config.decision_lock_shards,
        );
        let bindings = BindingService::new(
            stores.bind_operations.clone(),
            stores.instance_operations.clone(),
            stores.instances.clone(),
            stores.credentials.clone(),
            collaborators,
            executor.clone(),
            config.decision_lock_shards,
        )
        .sharing_instance_locks(&instances);

        info!(
            worker_pool_size = config.worker_pool_size,
            decision_lock_shards = config.decision_lock_shards,
            stale_operations = recovery.stale_count(),
            "broker started"
        );

        Ok(Self {
            config,
            stores,
            instances,
            bindings,
            executor,
            recovery,
        })
    }

    pub async fn provision(&self, req: ProvisionRequest) -> Result<OperationResponse> {
        self.instances.provision(req).await
    }

    pub async fn deprovision(&self, req: DeprovisionRequest) -> Result<OperationResponse> {
        self.instances.deprovision(req).await
    }

    pub async fn bind(&self, req: BindRequest) -> Result<BindResponse> {
        self.bindings.bind(req).await
    }

    pub async fn unbind(&self, req: UnbindRequest) -> Result<OperationResponse> {
        self.bindings.unbind(req).await
    }

    pub async fn last_operation(
        &self,
        instance_id: &InstanceId,
        operation_id: Option<&OperationId>,
    ) -> Result<LastOperationResponse> {
        self.instances.last_operation(instance_id, operation_id).await
    }

    pub async fn binding_last_operation(
        &self,
        instance_id: &InstanceId,
        binding_id: &BindingId,
        operation_id: Option<&OperationId>,
    ) -> Result<LastOperationResponse> {
        self.bindings
            .last_operation(instance_id, binding_id, operation_id)
            .await
    }

    pub async fn get_binding(
        &self,
        instance_id: &InstanceId,
        binding_id: &BindingId,
    ) -> Result<BindingCredentials> {
        self.bindings.get_binding(instance_id, binding_id).await
    }

    pub async fn get_instance(&self, instance_id: &InstanceId) -> Result<Instance> {
        self.instances.get_instance(instance_id).await
    }

    pub fn instances(&self) -> &InstanceService {
        &self.instances
    }

    pub fn bindings(&self) -> &BindingService {
        &self.bindings
    }

    pub fn stores(&self) -> &BrokerStores {
        &self.stores
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// What the startup sweep found.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn executor_stats(&self) -> ExecutorStats {
        self.executor.stats()
    }

    /// Waits until every accepted background job has finished.
    pub async fn wait_idle(&self) {
        self.executor.wait_idle().await
    }

    /// Stops accepting background work and drains what was accepted.
    /// Later mutating requests fail with a dependency error.
    pub async fn shutdown(&self) {
        self.executor.shutdown().await;
        info!("broker stopped");
    }
}
