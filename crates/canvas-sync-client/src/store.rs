//! Snapshot persistence for `save_to_cloud` requests.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use canvas_sync_core::{Snapshot, SyncError};

/// Persists document snapshots on behalf of an editor.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Save a snapshot and return the id it was stored under. A missing `id`
    /// gets a fresh one.
    async fn save(
        &self,
        name: Option<&str>,
        id: Option<&str>,
        snapshot: &Snapshot,
    ) -> anyhow::Result<String>;
}

/// One stored document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub saved_at: DateTime<Utc>,
    pub snapshot: Snapshot,
}

/// Store writing one JSON file per document.
///
/// Layout: `<base>/<id>.json`
pub struct DirectorySnapshotStore {
    base: PathBuf,
}

impl DirectorySnapshotStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.base.join(format!("{id}.json"))
    }

    pub async fn load(&self, id: &str) -> anyhow::Result<Option<StoredSnapshot>> {
        check_id(id)?;
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&data)?))
    }
}

fn check_id(id: &str) -> Result<(), SyncError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SyncError::Store(format!("invalid snapshot id: {id:?}")))
    }
}

#[async_trait]
impl SnapshotStore for DirectorySnapshotStore {
    async fn save(
        &self,
        name: Option<&str>,
        id: Option<&str>,
        snapshot: &Snapshot,
    ) -> anyhow::Result<String> {
        let id = match id {
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        check_id(&id)?;

        let record = StoredSnapshot {
            id: id.clone(),
            name: name.map(String::from),
            saved_at: Utc::now(),
            snapshot: snapshot.clone(),
        };

        tokio::fs::create_dir_all(&self.base).await?;
        let path = self.path_for(&id);
        // Write to a temp file then rename so readers never see a partial file.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&record)?).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(id = %id, path = %path.display(), "Snapshot saved");
        Ok(id)
    }
}
