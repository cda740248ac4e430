//! Everything a platform-facing layer needs to drive the broker.
//!
//! `use osb_broker::prelude::*;` brings in the facade, its configuration,
//! the request/response shapes and the collaborator traits to implement.

pub use crate::config::{BrokerConfig, CredentialDurability, RecoveryPolicy, StorageBackend};
pub use crate::core::{
    Addon, BindingId, BrokerError, ChartRef, CollaboratorError, Credentials, Instance,
    InstanceId, Namespace, OperationId, OperationState, Plan, PlanId, ReleaseInfo, Result,
    ServiceId,
};
pub use crate::external::{
    BindRenderer, BindResolver, CatalogLookup, CollaboratorResult, Collaborators,
    OperationIdProvider, WorkloadInstaller,
};
pub use crate::lifecycle::{
    BindRequest, BindResponse, DeprovisionRequest, LastOperationResponse, OperationResponse,
    ProvisionRequest, UnbindRequest,
};
pub use crate::web::BrokerProblem;
pub use crate::{Broker, BrokerStores};
