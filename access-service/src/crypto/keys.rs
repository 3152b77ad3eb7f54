//! Root keys and data keys.
//!
//! A root key never leaves its provider. It encrypts a data key, only the
//! encrypted data key is stored, and the provider is asked to decrypt it again
//! at startup.

use super::seal::{seal_raw, unseal_raw, SymmetricKey};
use async_trait::async_trait;
use service_core::error::AppError;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

/// Arbitrary named secrets (files, a vault, a cloud secret manager).
#[async_trait]
pub trait SecretStorage: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<Option<Vec<u8>>, AppError>;
    async fn set_secret(&self, name: &str, secret: &[u8]) -> Result<(), AppError>;
}

/// Encryption as a service: wraps and unwraps data keys with a root key.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn generate_data_key(&self, root_key_id: &str) -> Result<SymmetricKey, AppError>;
    async fn decrypt_data_key(
        &self,
        root_key_id: &str,
        encrypted: &[u8],
    ) -> Result<SymmetricKey, AppError>;
}

/// Secrets stored as files in one directory.
#[derive(Debug, Clone)]
pub struct FileSecretStorage {
    dir: PathBuf,
}

impl FileSecretStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, AppError> {
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "invalid secret name {:?}",
                name
            )));
        }
        Ok(self.dir.join(name))
    }
}

#[async_trait]
impl SecretStorage for FileSecretStorage {
    async fn get_secret(&self, name: &str) -> Result<Option<Vec<u8>>, AppError> {
        let path = self.path_for(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::InternalError(anyhow::anyhow!(
                "reading secret {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn set_secret(&self, name: &str, secret: &[u8]) -> Result<(), AppError> {
        let path = self.path_for(name)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, secret).await?;
        restrict_permissions(&path).await
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<(), AppError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<(), AppError> {
    Ok(())
}

/// Root keys kept in a [`SecretStorage`], created on first use.
pub struct NativeKeyProvider<S> {
    storage: S,
}

impl<S: SecretStorage> NativeKeyProvider<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    #[instrument(skip(self))]
    async fn root_key(&self, root_key_id: &str) -> Result<SymmetricKey, AppError> {
        let material = match self.storage.get_secret(root_key_id).await? {
            Some(material) => material,
            None => {
                info!(root_key_id, "Creating root key");
                let material = SymmetricKey::generate_plain();
                self.storage.set_secret(root_key_id, &material).await?;
                material
            }
        };
        Ok(SymmetricKey::new(
            material,
            root_key_id.as_bytes().to_vec(),
            root_key_id,
        ))
    }
}

#[async_trait]
impl<S: SecretStorage> SecretProvider for NativeKeyProvider<S> {
    async fn generate_data_key(&self, root_key_id: &str) -> Result<SymmetricKey, AppError> {
        let root = self.root_key(root_key_id).await?;
        let plain = SymmetricKey::generate_plain();
        let encrypted = seal_raw(&root, &plain)
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("sealing data key: {}", e)))?;
        Ok(SymmetricKey::new(plain, encrypted, root_key_id))
    }

    async fn decrypt_data_key(
        &self,
        root_key_id: &str,
        encrypted: &[u8],
    ) -> Result<SymmetricKey, AppError> {
        let root = self.root_key(root_key_id).await?;
        let plain = unseal_raw(&root, encrypted)
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("opening data key: {}", e)))?;
        Ok(SymmetricKey::new(plain, encrypted.to_vec(), root_key_id))
    }
}
