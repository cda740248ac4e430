use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier of a provisioned service instance.
    InstanceId
);
string_id!(
    /// Identifier of a binding owned by an instance.
    BindingId
);
string_id!(
    /// Identifier of an asynchronous operation, unique within its owner.
    OperationId
);
string_id!(
    /// Catalog service (addon) identifier.
    ServiceId
);
string_id!(PlanId);
string_id!(Namespace);
string_id!(
    /// Content hash of request parameters used as the idempotency token.
    ParamsHash
);

/// Immutable kind of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    Create,
    Remove,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Create => "create",
            Self::Remove => "remove",
        };
        write!(f, "{label}")
    }
}

/// Mutable progress of an operation. Serialized with the OSB wire labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationState {
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::InProgress => "in progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        write!(f, "{label}")
    }
}

/// Owner key of a binding's operations: the binding scoped under its instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BindingKey {
    pub instance_id: InstanceId,
    pub binding_id: BindingId,
}

impl BindingKey {
    pub fn new(instance_id: InstanceId, binding_id: BindingId) -> Self {
        Self {
            instance_id,
            binding_id,
        }
    }
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instance_id, self.binding_id)
    }
}

/// Common shape of instance and bind operations.
///
/// `OwnerKey` is the scope of the single in-flight invariant; `HistoryKey` is
/// the scope a history read returns. For instance operations both are the
/// instance id. Bind operations are owned by (instance, binding) but their
/// history is read per instance and filtered by binding.
pub trait OperationRecord: Clone + fmt::Debug + Send + Sync + 'static {
    type OwnerKey: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static;
    type HistoryKey: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static;

    fn owner_key(&self) -> Self::OwnerKey;
    fn history_key_of(owner: &Self::OwnerKey) -> Self::HistoryKey;
    fn operation_id(&self) -> &OperationId;
    fn op_type(&self) -> OperationType;
    fn state(&self) -> OperationState;
    fn state_description(&self) -> Option<&str>;
    fn params_hash(&self) -> Option<&ParamsHash>;
    fn created_at(&self) -> DateTime<Utc>;
    fn apply_state(&mut self, state: OperationState, description: Option<String>);

    fn history_key(&self) -> Self::HistoryKey {
        Self::history_key_of(&self.owner_key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceOperation {
    pub instance_id: InstanceId,
    pub operation_id: OperationId,
    pub op_type: OperationType,
    pub state: OperationState,
    pub state_description: Option<String>,
    /// Only set for `Create`.
    pub params_hash: Option<ParamsHash>,
    pub created_at: DateTime<Utc>,
}

impl InstanceOperation {
    pub fn new_create(
        instance_id: InstanceId,
        operation_id: OperationId,
        params_hash: ParamsHash,
    ) -> Self {
        Self {
            instance_id,
            operation_id,
            op_type: OperationType::Create,
            state: OperationState::InProgress,
            state_description: None,
            params_hash: Some(params_hash),
            created_at: Utc::now(),
        }
    }

    pub fn new_remove(instance_id: InstanceId, operation_id: OperationId) -> Self {
        Self {
            instance_id,
            operation_id,
            op_type: OperationType::Remove,
            state: OperationState::InProgress,
            state_description: None,
            params_hash: None,
            created_at: Utc::now(),
        }
    }
}

impl OperationRecord for InstanceOperation {
    type OwnerKey = InstanceId;
    type HistoryKey = InstanceId;

    fn owner_key(&self) -> InstanceId {
        self.instance_id.clone()
    }

    fn history_key_of(owner: &InstanceId) -> InstanceId {
        owner.clone()
    }

    fn operation_id(&self) -> &OperationId {
        &self.operation_id
    }

    fn op_type(&self) -> OperationType {
        self.op_type
    }

    fn state(&self) -> OperationState {
        self.state
    }

    fn state_description(&self) -> Option<&str> {
        self.state_description.as_deref()
    }

    fn params_hash(&self) -> Option<&ParamsHash> {
        self.params_hash.as_ref()
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn apply_state(&mut self, state: OperationState, description: Option<String>) {
        self.state = state;
        if description.is_some() {
            self.state_description = description;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindOperation {
    pub instance_id: InstanceId,
    pub binding_id: BindingId,
    pub operation_id: OperationId,
    pub op_type: OperationType,
    pub state: OperationState,
    pub state_description: Option<String>,
    pub params_hash: Option<ParamsHash>,
    pub created_at: DateTime<Utc>,
}

impl BindOperation {
    pub fn new_create(key: BindingKey, operation_id: OperationId, params_hash: ParamsHash) -> Self {
        Self {
            instance_id: key.instance_id,
            binding_id: key.binding_id,
            operation_id,
            op_type: OperationType::Create,
            state: OperationState::InProgress,
            state_description: None,
            params_hash: Some(params_hash),
            created_at: Utc::now(),
        }
    }

    pub fn new_remove(key: BindingKey, operation_id: OperationId) -> Self {
        Self {
            instance_id: key.instance_id,
            binding_id: key.binding_id,
            operation_id,
            op_type: OperationType::Remove,
            state: OperationState::InProgress,
            state_description: None,
            params_hash: None,
            created_at: Utc::now(),
        }
    }

    pub fn binding_key(&self) -> BindingKey {
        BindingKey::new(self.instance_id.clone(), self.binding_id.clone())
    }
}

impl OperationRecord for BindOperation {
    type OwnerKey = BindingKey;
    type HistoryKey = InstanceId;

    fn owner_key(&self) -> BindingKey {
        self.binding_key()
    }

    fn history_key_of(owner: &BindingKey) -> InstanceId {
        owner.instance_id.clone()
    }

    fn operation_id(&self) -> &OperationId {
        &self.operation_id
    }

    fn op_type(&self) -> OperationType {
        self.op_type
    }

    fn state(&self) -> OperationState {
        self.state
    }

    fn state_description(&self) -> Option<&str> {
        self.state_description.as_deref()
    }

    fn params_hash(&self) -> Option<&ParamsHash> {
        self.params_hash.as_ref()
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn apply_state(&mut self, state: OperationState, description: Option<String>) {
        self.state = state;
        if description.is_some() {
            self.state_description = description;
        }
    }
}

/// Reference to the packaged workload a plan installs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartRef {
    pub name: String,
    pub version: String,
}

impl fmt::Display for ChartRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.version)
    }
}

/// Metadata of an installed workload release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub release_name: String,
    pub revision: u32,
    pub installed_at: DateTime<Utc>,
    /// Effective values the release was installed with.
    pub config_values: serde_json::Value,
}

/// Current snapshot of a service instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub namespace: Namespace,
    pub service_id: ServiceId,
    pub plan_id: PlanId,
    pub params_hash: ParamsHash,
    /// Populated once provisioning succeeds.
    pub release: Option<ReleaseInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    pub chart_ref: ChartRef,
    #[serde(default)]
    pub default_values: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub bind_template: Option<String>,
}

/// Catalog entry a service id resolves to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Addon {
    pub id: ServiceId,
    pub name: String,
    pub bindable: bool,
    pub plans: BTreeMap<PlanId, Plan>,
}

impl Addon {
    pub fn plan(&self, plan_id: &PlanId) -> Option<&Plan> {
        self.plans.get(plan_id)
    }
}

pub type Credentials = BTreeMap<String, String>;

/// Resolved credentials of a binding, keyed by binding id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingCredentials {
    pub instance_id: InstanceId,
    pub binding_id: BindingId,
    pub credentials: Credentials,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_state_wire_labels() {
        let json = serde_json::to_string(&OperationState::InProgress).unwrap();
        assert_eq!(json, "\"in progress\"");
        let back: OperationState = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(back, OperationState::Failed);
        assert!(OperationState::Succeeded.is_terminal());
        assert!(!OperationState::InProgress.is_terminal());
    }

    #[test]
    fn test_bind_operation_keys() {
        let op = BindOperation::new_create(
            BindingKey::new("i1".into(), "b1".into()),
            "op1".into(),
            "h".into(),
        );
        assert_eq!(op.owner_key().to_string(), "i1/b1");
        assert_eq!(op.history_key(), InstanceId::new("i1"));
    }

    #[test]
    fn test_apply_state_keeps_description_when_absent() {
        let mut op = InstanceOperation::new_remove("i1".into(), "op1".into());
        op.apply_state(OperationState::InProgress, Some("deleting".into()));
        op.apply_state(OperationState::Succeeded, None);
        assert_eq!(op.state, OperationState::Succeeded);
        assert_eq!(op.state_description.as_deref(), Some("deleting"));
    }
}
