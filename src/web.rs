use crate::core::BrokerError;
use serde::Serialize;
use std::fmt;

/// Framework-agnostic OSB error payload.
///
/// Serializes to the OSB error body `{"error": code, "description": text}`;
/// the status is for the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerProblem {
    /// HTTP status code.
    #[serde(skip)]
    pub status: u16,
    /// Stable machine-readable code.
    #[serde(rename = "error")]
    pub code: &'static str,
    /// Human-readable description.
    pub description: String,
}

impl BrokerProblem {
    fn new(status: u16, code: &'static str, description: impl Into<String>) -> Self {
        Self {
            status,
            code,
            description: description.into(),
        }
    }
}

impl From<&BrokerError> for BrokerProblem {
    fn from(err: &BrokerError) -> Self {
        let description = err.to_string();
        match err {
            BrokerError::AsyncRequired => Self::new(422, "AsyncRequired", description),
            BrokerError::ActiveOperationInProgress(_) => {
                Self::new(422, "ConcurrencyError", description)
            }
            BrokerError::Conflict(_) | BrokerError::AlreadyExists(_) => {
                Self::new(409, "Conflict", description)
            }
            BrokerError::Gone(_) => Self::new(410, "Gone", description),
            BrokerError::NotFound(_) => Self::new(404, "NotFound", description),
            BrokerError::Validation(_) => Self::new(400, "BadRequest", description),
            BrokerError::Dependency(_)
            | BrokerError::StorageInconsistency(_)
            | BrokerError::Lock(_)
            | BrokerError::Io(_)
            | BrokerError::Serialization(_) => Self::new(500, "InternalError", description),
        }
    }
}

impl From<BrokerError> for BrokerProblem {
    fn from(err: BrokerError) -> Self {
        Self::from(&err)
    }
}

impl fmt::Display for BrokerProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.status, self.code, self.description)
    }
}
