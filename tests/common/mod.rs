#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use osb_broker::core::{
    Addon, BindingId, ChartRef, CollaboratorError, Credentials, Instance, InstanceId, Namespace,
    OperationId, OperationState, Plan, PlanId, ReleaseInfo, ServiceId,
};
use osb_broker::external::{
    BindRenderer, BindResolver, CatalogLookup, CollaboratorResult, Collaborators,
    OperationIdProvider, WorkloadInstaller,
};
use osb_broker::{
    BindRequest, Broker, BrokerConfig, BrokerStores, DeprovisionRequest, ProvisionRequest,
    UnbindRequest,
};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

pub const NAMESPACE: &str = "team-a";
pub const BINDABLE_SERVICE: &str = "redis";
pub const PLAIN_SERVICE: &str = "batch";
pub const PLAN: &str = "small";

// ============================================================================
// Workload installer
// ============================================================================

/// Installer that counts calls and can be held, failed or told releases are
/// already gone.
#[derive(Default)]
pub struct CountingInstaller {
    pub installs: AtomicUsize,
    pub deletes: AtomicUsize,
    fail_install: Mutex<Option<String>>,
    fail_delete: Mutex<Option<String>>,
    release_missing: AtomicBool,
    gate: Option<Semaphore>,
    installed: Mutex<Vec<(String, Value)>>,
}

impl CountingInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs block until [`CountingInstaller::release`] lets them through.
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    pub fn release(&self, installs: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(installs);
        }
    }

    pub fn fail_installs_with(&self, message: &str) {
        *self.fail_install.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_deletes_with(&self, message: &str) {
        *self.fail_delete.lock().unwrap() = Some(message.to_string());
    }

    pub fn clear_failures(&self) {
        *self.fail_install.lock().unwrap() = None;
        *self.fail_delete.lock().unwrap() = None;
    }

    pub fn report_release_missing(&self) {
        self.release_missing.store(true, Ordering::SeqCst);
    }

    pub fn install_count(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// (release name, values) of every install, in call order.
    pub fn installed(&self) -> Vec<(String, Value)> {
        self.installed.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkloadInstaller for CountingInstaller {
    async fn install(
        &self,
        _chart: &ChartRef,
        values: &Value,
        release_name: &str,
        _namespace: &Namespace,
    ) -> CollaboratorResult<ReleaseInfo> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| CollaboratorError::Failed(e.to_string()))?
                .forget();
        }
        if let Some(message) = self.fail_install.lock().unwrap().clone() {
            return Err(CollaboratorError::Failed(message));
        }
        self.installed
            .lock()
            .unwrap()
            .push((release_name.to_string(), values.clone()));
        Ok(ReleaseInfo {
            release_name: release_name.to_string(),
            revision: 1,
            installed_at: Utc::now(),
            config_values: values.clone(),
        })
    }

    async fn delete(&self, release_name: &str, _namespace: &Namespace) -> CollaboratorResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.release_missing.load(Ordering::SeqCst) {
            return Err(CollaboratorError::NotFound(format!(
                "release: {} not found",
                release_name
            )));
        }
        if let Some(message) = self.fail_delete.lock().unwrap().clone() {
            return Err(CollaboratorError::Failed(message));
        }
        Ok(())
    }
}

// ============================================================================
// Catalog
// ============================================================================

pub struct StaticCatalog {
    addons: HashMap<(Namespace, ServiceId), Addon>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self {
            addons: HashMap::new(),
        }
    }

    pub fn with_addon(mut self, namespace: &str, addon: Addon) -> Self {
        self.addons
            .insert((Namespace::new(namespace), addon.id.clone()), addon);
        self
    }

    /// A bindable "redis" and a non-bindable "batch" service, both with a
    /// "small" plan, offered in [`NAMESPACE`].
    pub fn standard() -> Self {
        Self::new()
            .with_addon(
                NAMESPACE,
                addon(
                    BINDABLE_SERVICE,
                    true,
                    Some("host: {{ .Release.Name }}"),
                    json!({"replicas": 1, "auth": {"enabled": true, "user": "default"}}),
                ),
            )
            .with_addon(NAMESPACE, addon(PLAIN_SERVICE, false, None, json!({})))
    }
}

pub fn addon(id: &str, bindable: bool, bind_template: Option<&str>, defaults: Value) -> Addon {
    let plan = Plan {
        id: PlanId::new(PLAN),
        name: format!("{} {}", id, PLAN),
        chart_ref: ChartRef {
            name: id.to_string(),
            version: "1.0.0".to_string(),
        },
        default_values: defaults.as_object().cloned().unwrap_or_default(),
        bind_template: bind_template.map(str::to_string),
    };
    Addon {
        id: ServiceId::new(id),
        name: id.to_string(),
        bindable,
        plans: BTreeMap::from([(plan.id.clone(), plan)]),
    }
}

#[async_trait]
impl CatalogLookup for StaticCatalog {
    async fn get_by_id(
        &self,
        namespace: &Namespace,
        addon_id: &ServiceId,
    ) -> CollaboratorResult<Addon> {
        self.addons
            .get(&(namespace.clone(), addon_id.clone()))
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound(format!("addon {}", addon_id)))
    }
}

// ============================================================================
// Bind renderer and resolver
// ============================================================================

#[derive(Default)]
pub struct EchoRenderer {
    pub renders: AtomicUsize,
}

#[async_trait]
impl BindRenderer for EchoRenderer {
    async fn render(
        &self,
        template: &str,
        instance: &Instance,
        _chart: &ChartRef,
    ) -> CollaboratorResult<String> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        let release = instance
            .release
            .as_ref()
            .map(|release| release.release_name.as_str())
            .ok_or_else(|| CollaboratorError::Failed("instance has no release".to_string()))?;
        Ok(template.replace("{{ .Release.Name }}", release))
    }
}

/// Parses `key: value` lines into credentials.
#[derive(Default)]
pub struct LineResolver {
    pub fail: AtomicBool,
}

#[async_trait]
impl BindResolver for LineResolver {
    async fn resolve(
        &self,
        rendered: &str,
        namespace: &Namespace,
    ) -> CollaboratorResult<Credentials> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Failed("secret lookup timed out".to_string()));
        }
        let mut credentials: Credentials = rendered
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        credentials.insert("namespace".to_string(), namespace.to_string());
        Ok(credentials)
    }
}

// ============================================================================
// Operation ids
// ============================================================================

#[derive(Default)]
pub struct SequentialIds {
    next: AtomicU64,
    pub fail: AtomicBool,
}

impl OperationIdProvider for SequentialIds {
    fn next_id(&self) -> CollaboratorResult<OperationId> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Failed("id source exhausted".to_string()));
        }
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(OperationId::new(format!("op-{}", n)))
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub broker: Broker,
    pub installer: Arc<CountingInstaller>,
    pub renderer: Arc<EchoRenderer>,
    pub resolver: Arc<LineResolver>,
    pub ids: Arc<SequentialIds>,
}

pub struct Fakes {
    pub installer: Arc<CountingInstaller>,
    pub renderer: Arc<EchoRenderer>,
    pub resolver: Arc<LineResolver>,
    pub ids: Arc<SequentialIds>,
}

impl Fakes {
    pub fn new(installer: CountingInstaller) -> Self {
        Self {
            installer: Arc::new(installer),
            renderer: Arc::new(EchoRenderer::default()),
            resolver: Arc::new(LineResolver::default()),
            ids: Arc::new(SequentialIds::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            self.installer.clone(),
            Arc::new(StaticCatalog::standard()),
            self.renderer.clone(),
            self.resolver.clone(),
        )
        .with_operation_ids(self.ids.clone())
    }

    pub fn into_harness(self, broker: Broker) -> Harness {
        Harness {
            broker,
            installer: self.installer,
            renderer: self.renderer,
            resolver: self.resolver,
            ids: self.ids,
        }
    }
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_installer(CountingInstaller::new()).await
    }

    pub async fn with_installer(installer: CountingInstaller) -> Self {
        Self::with_stores(installer, BrokerStores::in_memory(), BrokerConfig::new()).await
    }

    pub async fn with_stores(
        installer: CountingInstaller,
        stores: BrokerStores,
        config: BrokerConfig,
    ) -> Self {
        let fakes = Fakes::new(installer);
        let broker = Broker::with_stores(config, stores, fakes.collaborators())
            .await
            .unwrap();
        fakes.into_harness(broker)
    }

    pub async fn open(installer: CountingInstaller, config: BrokerConfig) -> Self {
        let fakes = Fakes::new(installer);
        let broker = Broker::open(config, fakes.collaborators()).await.unwrap();
        fakes.into_harness(broker)
    }

    pub async fn state_of(&self, instance_id: &str, operation_id: &OperationId) -> OperationState {
        self.broker
            .last_operation(&InstanceId::new(instance_id), Some(operation_id))
            .await
            .unwrap()
            .state
    }

    pub async fn binding_state_of(
        &self,
        instance_id: &str,
        binding_id: &str,
        operation_id: &OperationId,
    ) -> OperationState {
        self.broker
            .binding_last_operation(
                &InstanceId::new(instance_id),
                &BindingId::new(binding_id),
                Some(operation_id),
            )
            .await
            .unwrap()
            .state
    }

    /// Provisions `instance_id` and waits for the install to finish.
    pub async fn provisioned(&self, instance_id: &str, params: Value) -> OperationId {
        let response = self
            .broker
            .provision(provision_req(instance_id, BINDABLE_SERVICE, params))
            .await
            .unwrap();
        let operation_id = response.operation_id.unwrap();
        self.broker.wait_idle().await;
        assert_eq!(
            self.state_of(instance_id, &operation_id).await,
            OperationState::Succeeded
        );
        operation_id
    }
}

// ============================================================================
// Requests
// ============================================================================

pub fn params(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

pub fn provision_req(instance_id: &str, service: &str, parameters: Value) -> ProvisionRequest {
    ProvisionRequest {
        instance_id: InstanceId::new(instance_id),
        service_id: ServiceId::new(service),
        plan_id: PlanId::new(PLAN),
        namespace: Namespace::new(NAMESPACE),
        parameters: params(parameters),
        accepts_incomplete: true,
    }
}

pub fn deprovision_req(instance_id: &str) -> DeprovisionRequest {
    DeprovisionRequest {
        instance_id: InstanceId::new(instance_id),
        accepts_incomplete: true,
    }
}

pub fn bind_req(instance_id: &str, binding_id: &str, parameters: Value) -> BindRequest {
    BindRequest {
        instance_id: InstanceId::new(instance_id),
        binding_id: BindingId::new(binding_id),
        parameters: params(parameters),
        accepts_incomplete: true,
    }
}

pub fn unbind_req(instance_id: &str, binding_id: &str) -> UnbindRequest {
    UnbindRequest {
        instance_id: InstanceId::new(instance_id),
        binding_id: BindingId::new(binding_id),
        accepts_incomplete: true,
    }
}
