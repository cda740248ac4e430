use crate::core::{BrokerError, Result};
use crate::storage::journal::DEFAULT_CHECKPOINT_EVERY;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where operation history and instance snapshots live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageBackend {
    /// Process memory; lost on restart.
    #[default]
    Memory,
    /// Write-ahead journal files under `dir`, replayed on startup.
    Journal {
        dir: PathBuf,
        #[serde(default = "default_true")]
        sync_writes: bool,
        /// Journal entries written before the state is snapshotted and the
        /// journal cleared.
        #[serde(default = "default_checkpoint_every")]
        checkpoint_every: usize,
    },
}

/// Where resolved binding credentials are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialDurability {
    /// Credentials are lost on restart. A bound binding then fails to return
    /// its credentials until it is unbound and bound again.
    #[default]
    Memory,
    /// One JSON document per binding under `dir`.
    Persisted { dir: PathBuf },
}

/// What the startup sweep does with operations still `InProgress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Log and report them; pollers keep seeing "in progress".
    #[default]
    Report,
    /// Transition them to `Failed` so the owner accepts new requests.
    MarkFailed,
}

/// Broker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Maximum number of background jobs running at once
    pub worker_pool_size: usize,

    /// Decision-phase lock shards per service. 1 serializes every decision of
    /// a service behind one lock; more shards partition by owner key.
    pub decision_lock_shards: usize,

    pub storage: StorageBackend,

    pub credential_durability: CredentialDurability,

    pub recovery: RecoveryPolicy,
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_every() -> usize {
    DEFAULT_CHECKPOINT_EVERY
}

impl BrokerConfig {
    pub fn new() -> Self {
        Self {
            worker_pool_size: 8,
            decision_lock_shards: 1,
            storage: StorageBackend::Memory,
            credential_durability: CredentialDurability::Memory,
            recovery: RecoveryPolicy::Report,
        }
    }

    /// Set the background worker pool size
    pub fn worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    /// Set the number of decision lock shards
    pub fn decision_lock_shards(mut self, shards: usize) -> Self {
        self.decision_lock_shards = shards;
        self
    }

    /// Keep operations and instances in journal files under `dir`
    pub fn journal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage = StorageBackend::Journal {
            dir: dir.into(),
            sync_writes: true,
            checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
        };
        self
    }

    /// Checkpoint the journals every `entries` records. No effect on the
    /// memory backend.
    pub fn journal_checkpoint_every(mut self, entries: usize) -> Self {
        if let StorageBackend::Journal {
            checkpoint_every, ..
        } = &mut self.storage
        {
            *checkpoint_every = entries;
        }
        self
    }

    /// Persist binding credentials under `dir`
    pub fn persisted_credentials(mut self, dir: impl Into<PathBuf>) -> Self {
        self.credential_durability = CredentialDurability::Persisted { dir: dir.into() };
        self
    }

    pub fn recovery(mut self, policy: RecoveryPolicy) -> Self {
        self.recovery = policy;
        self
    }

    /// Load from a JSON document; absent fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| BrokerError::Validation(format!("invalid broker config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            BrokerError::Io(format!("Failed to read config '{}': {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.worker_pool_size == 0 {
            return Err(BrokerError::Validation(
                "worker_pool_size must be > 0".to_string(),
            ));
        }

        if self.decision_lock_shards == 0 {
            return Err(BrokerError::Validation(
                "decision_lock_shards must be > 0".to_string(),
            ));
        }

        if let StorageBackend::Journal {
            dir,
            checkpoint_every,
            ..
        } = &self.storage
        {
            if dir.as_os_str().is_empty() {
                return Err(BrokerError::Validation(
                    "storage.dir cannot be empty".to_string(),
                ));
            }
            if *checkpoint_every == 0 {
                return Err(BrokerError::Validation(
                    "storage.checkpoint_every must be > 0".to_string(),
                ));
            }
        }

        if let CredentialDurability::Persisted { dir } = &self.credential_durability {
            if dir.as_os_str().is_empty() {
                return Err(BrokerError::Validation(
                    "credential_durability.dir cannot be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new()
    }
}
