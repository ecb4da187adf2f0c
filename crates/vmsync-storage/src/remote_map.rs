use std::collections::HashMap;

use vmsync_model::PlatformPath;

use crate::error::Result;
use crate::store::Store;

/// In-memory view of the platform-path to remote-ID index.
///
/// Keys are derived from platform IDs only; remote IDs are strictly the
/// map's values. Absence of a mapping is the authoritative signal that an
/// entity has not been created remotely yet.
pub struct RemoteIdMap {
    entries: HashMap<String, String>,
    pending: Vec<(String, String)>,
}

impl RemoteIdMap {
    pub async fn load(store: &Store) -> Result<Self> {
        let entries = store.list_remote_ids().await?.into_iter().collect();
        Ok(Self {
            entries,
            pending: Vec::new(),
        })
    }

    pub fn get(&self, path: &PlatformPath) -> Option<&str> {
        self.entries.get(&path.key()).map(String::as_str)
    }

    /// A child path only resolves once every ancestor level resolves.
    pub fn resolvable(&self, path: &PlatformPath) -> bool {
        let mut current = Some(path.clone());
        while let Some(p) = current {
            if !self.entries.contains_key(&p.key()) {
                return false;
            }
            current = p.parent();
        }
        true
    }

    /// Stage a mapping for the next [`RemoteIdMap::save`].
    pub fn put(&mut self, path: &PlatformPath, remote_id: String) {
        self.entries.insert(path.key(), remote_id.clone());
        self.pending.push((path.key(), remote_id));
    }

    /// Record a mapping already persisted elsewhere (the pipeline commits
    /// map rows transactionally with the entity status).
    pub fn insert_synced(&mut self, path: &PlatformPath, remote_id: String) {
        self.entries.insert(path.key(), remote_id);
    }

    pub fn forget(&mut self, path: &PlatformPath) {
        self.entries.remove(&path.key());
    }

    /// Persist pending inserts in one batch.
    pub async fn save(&mut self, store: &Store) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        store.insert_remote_ids(&self.pending).await?;
        self.pending.clear();
        Ok(())
    }
}
