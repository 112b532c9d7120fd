use std::path::{Path, PathBuf};

use botpanel_process::ConfigRecord;
use tokio::io::AsyncWriteExt;

pub const CREDENTIAL_FILE: &str = "appstate.json";
pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no credential file has been uploaded")]
    NotFound,
    #[error("credential file is not valid JSON: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("failed to encode config record: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

pub fn parse_credentials(bytes: &[u8]) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Durable home of the uploaded credential file and the configuration record.
///
/// Both live at fixed names under one data root. There is no locking here;
/// callers serialize writers.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    root: PathBuf,
}

impl CredentialStore {
    /// Creates the data root if needed and checks it is writable.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| StoreError::io("create data root", &root, e))?;
        let store = Self { root };
        store.probe_writable().await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn credential_path(&self) -> PathBuf {
        self.root.join(CREDENTIAL_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub async fn probe_writable(&self) -> Result<(), StoreError> {
        let probe = self.root.join(".botpanel_write_probe");
        tokio::fs::write(&probe, b"ok\n")
            .await
            .map_err(|e| StoreError::io("write probe", &probe, e))?;
        tokio::fs::remove_file(&probe)
            .await
            .map_err(|e| StoreError::io("remove probe", &probe, e))
    }

    pub async fn save(&self, bytes: &[u8]) -> Result<(), StoreError> {
        write_atomic(&self.credential_path(), bytes).await
    }

    pub async fn load(&self) -> Result<Vec<u8>, StoreError> {
        let path = self.credential_path();
        match tokio::fs::read(&path).await {
            Ok(b) => Ok(b),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(e) => Err(StoreError::io("read credential file", &path, e)),
        }
    }

    pub async fn load_json(&self) -> Result<serde_json::Value, StoreError> {
        let bytes = self.load().await?;
        parse_credentials(&bytes).map_err(StoreError::Parse)
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(self.credential_path())
            .await
            .unwrap_or(false)
    }

    pub async fn delete(&self) -> Result<(), StoreError> {
        remove_if_present(&self.credential_path()).await
    }

    /// A missing or unreadable record is treated as empty.
    pub async fn load_config(&self) -> ConfigRecord {
        let path = self.config_path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return ConfigRecord::default(),
            Err(err) => {
                tracing::warn!(%err, path = %path.display(), "failed to read config record");
                return ConfigRecord::default();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(%err, path = %path.display(), "ignoring malformed config record");
                ConfigRecord::default()
            }
        }
    }

    pub async fn save_config(&self, config: &ConfigRecord) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(config).map_err(StoreError::Encode)?;
        write_atomic(&self.config_path(), &data).await
    }

    pub async fn reset_config(&self) -> Result<(), StoreError> {
        self.save_config(&ConfigRecord::default()).await
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| StoreError::io("create", &tmp, e))?;
    f.write_all(data)
        .await
        .map_err(|e| StoreError::io("write", &tmp, e))?;
    f.flush().await.ok();
    drop(f);
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::io("persist", path, e))
}

async fn remove_if_present(path: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io("remove", path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, CredentialStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path().join("data")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn save_load_delete() {
        let (_dir, store) = store().await;
        assert!(!store.exists().await);
        assert!(matches!(store.load().await, Err(StoreError::NotFound)));

        store.save(br#"[{"key":"c_user"}]"#).await.unwrap();
        assert!(store.exists().await);
        let v = store.load_json().await.unwrap();
        assert_eq!(v[0]["key"], "c_user");

        store.save(b"{}").await.unwrap();
        assert_eq!(store.load().await.unwrap(), b"{}");

        store.delete().await.unwrap();
        assert!(!store.exists().await);
        // Deleting again is a no-op.
        store.delete().await.unwrap();
    }

    #[tokio::test]
    async fn load_json_rejects_garbage() {
        let (_dir, store) = store().await;
        store.save(b"{\"cookies\": [").await.unwrap();
        assert!(matches!(store.load_json().await, Err(StoreError::Parse(_))));
    }

    #[tokio::test]
    async fn config_round_trip_and_reset() {
        let (_dir, store) = store().await;
        assert!(store.load_config().await.is_empty());

        let config = ConfigRecord {
            owner_id: Some("1001".to_string()),
            last_started_at: Some(chrono::Utc::now()),
            running: true,
        };
        store.save_config(&config).await.unwrap();
        assert_eq!(store.load_config().await, config);

        store.reset_config().await.unwrap();
        assert!(store.load_config().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_config_reads_as_empty() {
        let (_dir, store) = store().await;
        tokio::fs::write(store.config_path(), b"not json")
            .await
            .unwrap();
        assert!(store.load_config().await.is_empty());
    }

    #[tokio::test]
    async fn open_fails_when_root_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        tokio::fs::write(&file, b"x").await.unwrap();
        let err = CredentialStore::open(&file).await.unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
    }
}
