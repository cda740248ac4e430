use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Another operation is in progress: {0}")]
    ActiveOperationInProgress(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("This service plan requires client support for asynchronous service operations")]
    AsyncRequired,

    #[error("Gone: {0}")]
    Gone(String),

    #[error("Dependency error: {0}")]
    Dependency(String),

    #[error("Storage inconsistency: {0}")]
    StorageInconsistency(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

impl BrokerError {
    /// Prefixes the message with the layer that observed the failure.
    ///
    /// The variant is preserved, so callers can still branch on `NotFound`
    /// after several layers have wrapped it.
    pub fn context(self, ctx: impl AsRef<str>) -> Self {
        let ctx = ctx.as_ref();
        match self {
            Self::NotFound(msg) => Self::NotFound(format!("{ctx}: {msg}")),
            Self::AlreadyExists(msg) => Self::AlreadyExists(format!("{ctx}: {msg}")),
            Self::ActiveOperationInProgress(msg) => {
                Self::ActiveOperationInProgress(format!("{ctx}: {msg}"))
            }
            Self::Conflict(msg) => Self::Conflict(format!("{ctx}: {msg}")),
            Self::Validation(msg) => Self::Validation(format!("{ctx}: {msg}")),
            Self::AsyncRequired => Self::AsyncRequired,
            Self::Gone(msg) => Self::Gone(format!("{ctx}: {msg}")),
            Self::Dependency(msg) => Self::Dependency(format!("{ctx}: {msg}")),
            Self::StorageInconsistency(msg) => {
                Self::StorageInconsistency(format!("{ctx}: {msg}"))
            }
            Self::Lock(msg) => Self::Lock(format!("{ctx}: {msg}")),
            Self::Io(msg) => Self::Io(format!("{ctx}: {msg}")),
            Self::Serialization(msg) => Self::Serialization(format!("{ctx}: {msg}")),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_active_operation_in_progress(&self) -> bool {
        matches!(self, Self::ActiveOperationInProgress(_))
    }
}

impl<T> From<std::sync::PoisonError<T>> for BrokerError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Failure reported by an external capability (installer, catalog, renderer,
/// resolver, id provider).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    /// The addressed object does not exist. For the installer this is the
    /// non-fatal "release not found" kind.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Failed(String),
}

impl CollaboratorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Converts into a broker error carrying the layer context.
    ///
    /// `NotFound` keeps its variant; everything else becomes `Dependency`.
    pub fn into_broker(self, ctx: impl AsRef<str>) -> BrokerError {
        match self {
            Self::NotFound(msg) => BrokerError::NotFound(msg).context(ctx),
            Self::Failed(msg) => BrokerError::Dependency(msg).context(ctx),
        }
    }
}
