//! On-disk key-value store
//!
//! Stores each key as `{key}.json` in a directory. Writes go to a temporary
//! file first and are renamed into place so readers never see a torn record.
//! Notifications only reach handles opened in this process; other processes
//! sharing the directory see the data on their next read.

use std::path::{Path, PathBuf};

use tokio::sync::broadcast;

use super::{ContextId, KeyValueStore, StoreChange, StoreError, StoreWatcher};

#[derive(Clone)]
pub struct FileStore {
    dir: PathBuf,
    context_id: ContextId,
    changes: broadcast::Sender<StoreChange>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>, context_id: impl Into<ContextId>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::Io(e.to_string()))?;
        let (changes, _) = broadcast::channel(256);
        Ok(Self {
            dir,
            context_id: context_id.into(),
            changes,
        })
    }

    /// Another context over the same directory sharing notifications.
    pub fn handle(&self, context_id: impl Into<ContextId>) -> Self {
        Self {
            dir: self.dir.clone(),
            context_id: context_id.into(),
            changes: self.changes.clone(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }

    fn notify(&self, key: &str, removed: bool) {
        let _ = self.changes.send(StoreChange {
            key: key.to_string(),
            writer: self.context_id.clone(),
            removed,
        });
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key)?;
        match std::fs::read_to_string(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let tmp = self
            .dir
            .join(format!(".{key}.{}.tmp", std::process::id()));
        std::fs::write(&tmp, value).map_err(|e| StoreError::Io(e.to_string()))?;
        std::fs::rename(&tmp, &path).map_err(|e| StoreError::Io(e.to_string()))?;
        self.notify(key, false);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                self.notify(key, true);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    fn context_id(&self) -> &str {
        &self.context_id
    }

    fn watch(&self) -> StoreWatcher {
        StoreWatcher::new(self.changes.subscribe(), self.context_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_get_remove() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::open(tmp.path(), "p1").unwrap();

        assert_eq!(store.get("queue").unwrap(), None);
        store.set("queue", r#"{"entries":[]}"#).unwrap();
        assert_eq!(store.get("queue").unwrap().as_deref(), Some(r#"{"entries":[]}"#));
        assert!(tmp.path().join("queue.json").exists());

        store.remove("queue").unwrap();
        assert_eq!(store.get("queue").unwrap(), None);
        store.remove("queue").unwrap();
    }

    #[test]
    fn test_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let store = FileStore::open(tmp.path(), "p1").unwrap();
            store.set("opsync.leases", "{}").unwrap();
        }
        let reopened = FileStore::open(tmp.path(), "p2").unwrap();
        assert_eq!(reopened.get("opsync.leases").unwrap().as_deref(), Some("{}"));
    }

    #[test]
    fn test_rejects_path_like_keys() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::open(tmp.path(), "p1").unwrap();
        for key in ["", "../escape", "a/b", ".hidden"] {
            assert!(matches!(store.get(key), Err(StoreError::InvalidKey(_))), "{key}");
        }
    }

    #[test]
    fn test_handles_share_notifications() {
        let tmp = TempDir::new().unwrap();
        let a = FileStore::open(tmp.path(), "a").unwrap();
        let b = a.handle("b");
        let mut watch_b = b.watch();
        let mut watch_a = a.watch();

        a.set("k", "1").unwrap();
        let change = watch_b.try_changed().unwrap();
        assert_eq!(change.writer, "a");
        assert!(watch_a.try_changed().is_none());
    }
}
