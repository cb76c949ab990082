//! Prior file content, saved before every overwrite

use crate::error::PatchError;
use std::sync::Arc;
use warden_artifact::{ContentHash, TargetPath};
use warden_store::{CodeVersion, PatchId, PatchStore};

/// Append-only history of target files
#[derive(Clone)]
pub struct VersionStore {
    store: Arc<dyn PatchStore>,
}

impl std::fmt::Debug for VersionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionStore").finish_non_exhaustive()
    }
}

impl VersionStore {
    #[must_use]
    pub fn new(store: Arc<dyn PatchStore>) -> Self {
        Self { store }
    }

    /// Save the current content of `target`; returns the new version id.
    ///
    /// # Errors
    /// [`PatchError::Store`] if the version cannot be persisted.
    pub async fn backup(
        &self,
        target: &TargetPath,
        content: &[u8],
        patch_id: Option<PatchId>,
    ) -> Result<i64, PatchError> {
        let version_id = self
            .store
            .insert_code_version(target.relative(), content, patch_id)
            .await?;
        tracing::debug!(target_path = %target, version_id, bytes = content.len(), "backed up");
        Ok(version_id)
    }

    /// Fetch one version, checking that its content still matches its hash.
    ///
    /// # Errors
    /// - [`PatchError::VersionNotFound`] for an unknown id
    /// - [`PatchError::Internal`] if the stored bytes no longer match
    pub async fn get(&self, version_id: i64) -> Result<CodeVersion, PatchError> {
        let version = self
            .store
            .code_version(version_id)
            .await?
            .ok_or(PatchError::VersionNotFound(version_id))?;
        if ContentHash::compute(&version.content) != version.content_hash {
            return Err(PatchError::Internal(format!(
                "stored version {version_id} of {} is corrupt",
                version.file_path
            )));
        }
        Ok(version)
    }

    /// Every saved version of a root-relative path, newest first
    ///
    /// # Errors
    /// [`PatchError::Store`] on database failure.
    pub async fn history(&self, relative: &str) -> Result<Vec<CodeVersion>, PatchError> {
        Ok(self.store.code_versions_for(relative).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_artifact::ConfinedRoot;
    use warden_store::SqliteStore;

    #[tokio::test]
    async fn backup_get_history() {
        let dir = tempfile::tempdir().unwrap();
        let root = ConfinedRoot::new(dir.path()).unwrap();
        let target = root.resolve("src/app.py").unwrap();
        let versions = VersionStore::new(Arc::new(SqliteStore::in_memory().unwrap()));

        let first = versions.backup(&target, b"v1\n", None).await.unwrap();
        let second = versions.backup(&target, b"v2\n", None).await.unwrap();
        assert_ne!(first, second);

        assert_eq!(versions.get(first).await.unwrap().content, b"v1\n");
        let history = versions.history("src/app.py").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version_id, second);
    }

    #[tokio::test]
    async fn unknown_version() {
        let versions = VersionStore::new(Arc::new(SqliteStore::in_memory().unwrap()));
        assert!(matches!(
            versions.get(42).await,
            Err(PatchError::VersionNotFound(42))
        ));
    }
}
