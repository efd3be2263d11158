use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::StoreError;
use crate::session::SessionKey;

/// Narrow persistence hook for device credentials
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load_credential(&self, key: &SessionKey) -> Result<Option<serde_json::Value>, StoreError>;

    async fn save_credential(&self, key: &SessionKey, blob: &serde_json::Value) -> Result<(), StoreError>;

    /// Remove everything stored for the key. Missing data is not an error.
    async fn delete_credential(&self, key: &SessionKey) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct FileStorage {
    base_path: PathBuf,
}

impl FileStorage {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Directory owned by one user
    fn owner_dir(&self, owner_id: &str) -> PathBuf {
        self.base_path.join(path_segment(owner_id))
    }

    /// Directory holding everything persisted for one device session
    pub fn session_dir(&self, key: &SessionKey) -> PathBuf {
        self.owner_dir(&key.owner_id).join(path_segment(&key.device_id))
    }

    fn credentials_file(&self, key: &SessionKey) -> PathBuf {
        self.session_dir(key).join("creds.json")
    }
}

#[async_trait]
impl CredentialStore for FileStorage {
    async fn load_credential(&self, key: &SessionKey) -> Result<Option<serde_json::Value>, StoreError> {
        let path = self.credentials_file(key);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn save_credential(&self, key: &SessionKey, blob: &serde_json::Value) -> Result<(), StoreError> {
        let dir = self.session_dir(key);
        fs::create_dir_all(&dir).await?;

        // Write then rename so a crash never leaves half a credential file
        let tmp = dir.join("creds.json.tmp");
        fs::write(&tmp, serde_json::to_vec(blob)?).await?;
        fs::rename(&tmp, self.credentials_file(key)).await?;
        Ok(())
    }

    async fn delete_credential(&self, key: &SessionKey) -> Result<(), StoreError> {
        match fs::remove_dir_all(self.session_dir(key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // Drop the owner directory once its last device is gone
        let _ = fs::remove_dir(self.owner_dir(&key.owner_id)).await;
        Ok(())
    }
}

/// Delete a temporary upload. Returns false if it was already gone.
pub async fn remove_temp_file(path: &Path) -> std::io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// One path component per id. Hex keeps distinct ids in distinct
/// directories and never yields separators, dots or an empty name.
fn path_segment(id: &str) -> String {
    format!("id-{}", hex::encode(id.as_bytes()))
}
