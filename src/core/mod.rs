pub mod error;
pub mod hash;
pub mod types;

pub use error::{BrokerError, CollaboratorError, Result};
pub use hash::params_hash;
pub use types::{
    Addon, BindOperation, BindingCredentials, BindingId, BindingKey, ChartRef, Credentials,
    Instance, InstanceId, InstanceOperation, Namespace, OperationId, OperationRecord,
    OperationState, OperationType, ParamsHash, Plan, PlanId, ReleaseInfo, ServiceId,
};
