//! Binding credentials persisted as one JSON document per binding.

use super::BindingCredentialStore;
use crate::core::{BindingCredentials, BindingId, BrokerError, InstanceId, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

const CREDENTIALS_EXTENSION: &str = "json";

/// Longest binding id stored under its plain hex form. Longer ids would
/// overrun the 255 byte file name limit and are stored under their digest.
const MAX_HEX_NAMED_ID_LEN: usize = 100;

pub struct FileCredentialStore {
    root: PathBuf,
}

impl FileCredentialStore {
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await.map_err(|err| {
            BrokerError::Io(format!(
                "Failed to create credentials directory '{}': {}",
                root.display(),
                err
            ))
        })?;
        Ok(Self { root })
    }

    /// Binding ids are caller supplied, so the file name is their hex form,
    /// or a sha256 of the id once that would be too long.
    fn path_for(&self, binding_id: &BindingId) -> PathBuf {
        let id = binding_id.as_str();
        let stem = if id.len() <= MAX_HEX_NAMED_ID_LEN {
            hex::encode(id)
        } else {
            format!("sha256-{}", hex::encode(Sha256::digest(id.as_bytes())))
        };
        self.root.join(stem).with_extension(CREDENTIALS_EXTENSION)
    }

    async fn read(path: &Path) -> Result<Option<BindingCredentials>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(BrokerError::Io(format!(
                "Failed to read credentials '{}': {}",
                path.display(),
                err
            ))),
        }
    }
}

#[async_trait]
impl BindingCredentialStore for FileCredentialStore {
    async fn put(&self, credentials: BindingCredentials) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&credentials)?;
        atomic_write(&self.path_for(&credentials.binding_id), &bytes).await
    }

    async fn get(&self, binding_id: &BindingId) -> Result<BindingCredentials> {
        Self::read(&self.path_for(binding_id))
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("credentials for binding {}", binding_id)))
    }

    async fn remove(&self, binding_id: &BindingId) -> Result<()> {
        match fs::remove_file(self.path_for(binding_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(BrokerError::NotFound(format!(
                "credentials for binding {}",
                binding_id
            ))),
            Err(err) => Err(err.into()),
        }
    }

    async fn remove_for_instance(&self, instance_id: &InstanceId) -> Result<usize> {
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(CREDENTIALS_EXTENSION) {
                continue;
            }
            let Some(record) = Self::read(&path).await? else {
                continue;
            };
            if &record.instance_id != instance_id {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(removed)
    }
}

async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await.map_err(|err| {
        BrokerError::Io(format!(
            "Failed to write temp file '{}': {}",
            tmp.display(),
            err
        ))
    })?;

    fs::rename(&tmp, path).await.map_err(|err| {
        BrokerError::Io(format!(
            "Failed to rename temp file '{}' -> '{}': {}",
            tmp.display(),
            path.display(),
            err
        ))
    })?;
    Ok(())
}
