//! Capabilities the broker consumes but does not implement.

use crate::core::{
    Addon, ChartRef, CollaboratorError, Credentials, Instance, Namespace, OperationId,
    ReleaseInfo, ServiceId,
};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

pub type CollaboratorResult<T> = std::result::Result<T, CollaboratorError>;

/// Materializes and destroys workload releases.
#[async_trait]
pub trait WorkloadInstaller: Send + Sync {
    async fn install(
        &self,
        chart: &ChartRef,
        values: &serde_json::Value,
        release_name: &str,
        namespace: &Namespace,
    ) -> CollaboratorResult<ReleaseInfo>;

    /// A missing release is reported as `CollaboratorError::NotFound`.
    async fn delete(&self, release_name: &str, namespace: &Namespace) -> CollaboratorResult<()>;
}

#[async_trait]
pub trait CatalogLookup: Send + Sync {
    /// `CollaboratorError::NotFound` when the namespace offers no such addon.
    async fn get_by_id(&self, namespace: &Namespace, addon_id: &ServiceId)
    -> CollaboratorResult<Addon>;
}

/// Renders a plan's bind template against the provisioned instance.
#[async_trait]
pub trait BindRenderer: Send + Sync {
    async fn render(
        &self,
        template: &str,
        instance: &Instance,
        chart: &ChartRef,
    ) -> CollaboratorResult<String>;
}

/// Resolves rendered bind data into concrete credentials.
#[async_trait]
pub trait BindResolver: Send + Sync {
    async fn resolve(&self, rendered: &str, namespace: &Namespace)
    -> CollaboratorResult<Credentials>;
}

pub trait OperationIdProvider: Send + Sync {
    fn next_id(&self) -> CollaboratorResult<OperationId>;
}

/// Random v4 UUID operation ids.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidOperationIds;

impl OperationIdProvider for UuidOperationIds {
    fn next_id(&self) -> CollaboratorResult<OperationId> {
        Ok(OperationId::new(Uuid::new_v4().to_string()))
    }
}

/// Everything the lifecycle services call out to.
#[derive(Clone)]
pub struct Collaborators {
    pub installer: Arc<dyn WorkloadInstaller>,
    pub catalog: Arc<dyn CatalogLookup>,
    pub renderer: Arc<dyn BindRenderer>,
    pub resolver: Arc<dyn BindResolver>,
    pub operation_ids: Arc<dyn OperationIdProvider>,
}

impl Collaborators {
    pub fn new(
        installer: Arc<dyn WorkloadInstaller>,
        catalog: Arc<dyn CatalogLookup>,
        renderer: Arc<dyn BindRenderer>,
        resolver: Arc<dyn BindResolver>,
    ) -> Self {
        Self {
            installer,
            catalog,
            renderer,
            resolver,
            operation_ids: Arc::new(UuidOperationIds),
        }
    }

    pub fn with_operation_ids(mut self, operation_ids: Arc<dyn OperationIdProvider>) -> Self {
        self.operation_ids = operation_ids;
        self
    }
}
