//! Global safelist backed by a plain-text file.

use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::ConfigError;
use crate::whitelist::WhitelistSet;

/// Item list and the matcher built from it, replaced together.
#[derive(Debug)]
pub struct SafelistState {
    pub items: Vec<String>,
    pub set: Arc<WhitelistSet>,
}

impl SafelistState {
    fn new(items: Vec<String>) -> Self {
        let set = Arc::new(WhitelistSet::from_items(&items));
        Self { items, set }
    }
}

/// Process-wide safelist. Readers take a cheap snapshot; every mutation
/// rewrites the file and swaps in a freshly built state.
pub struct Safelist {
    path: Option<PathBuf>,
    state: RwLock<Arc<SafelistState>>,
    write_lock: Mutex<()>,
}

impl Safelist {
    /// Safelist without a backing file.
    pub fn from_items(items: Vec<String>) -> Self {
        Self {
            path: None,
            state: RwLock::new(Arc::new(SafelistState::new(items))),
            write_lock: Mutex::new(()),
        }
    }

    /// Load the safelist file. A missing file yields an empty safelist.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let items = read_items(&path).await?;
        tracing::info!(path = %path.display(), entries = items.len(), "Loaded global safelist");
        let mut safelist = Self::from_items(items);
        safelist.path = Some(path);
        Ok(safelist)
    }

    pub fn snapshot(&self) -> Arc<WhitelistSet> {
        self.state.read().set.clone()
    }

    /// Items and matcher from the same generation.
    pub fn state(&self) -> Arc<SafelistState> {
        self.state.read().clone()
    }

    /// Re-read the backing file and swap the snapshot.
    pub async fn reload(&self) -> Result<usize, ConfigError> {
        let _guard = self.write_lock.lock().await;
        let Some(path) = &self.path else {
            return Ok(self.state.read().items.len());
        };
        let items = read_items(path).await?;
        let count = items.len();
        self.swap(items);
        Ok(count)
    }

    /// Add an item. Returns false if it was already present.
    pub async fn add(&self, item: &str) -> Result<bool, ConfigError> {
        let item = item.trim();
        let _guard = self.write_lock.lock().await;
        let mut items = self.state.read().items.clone();
        if item.is_empty() || items.iter().any(|i| i == item) {
            return Ok(false);
        }
        items.push(item.to_string());
        self.persist(&items).await?;
        self.swap(items);
        Ok(true)
    }

    /// Remove an item. Returns false if it was not present.
    pub async fn remove(&self, item: &str) -> Result<bool, ConfigError> {
        let item = item.trim();
        let _guard = self.write_lock.lock().await;
        let mut items = self.state.read().items.clone();
        let before = items.len();
        items.retain(|i| i != item);
        if items.len() == before {
            return Ok(false);
        }
        self.persist(&items).await?;
        self.swap(items);
        Ok(true)
    }

    fn swap(&self, items: Vec<String>) {
        let state = Arc::new(SafelistState::new(items));
        *self.state.write() = state;
    }

    async fn persist(&self, items: &[String]) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_err = |source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        };
        let mut body = items.join("\n");
        body.push('\n');
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, body).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
        Ok(())
    }
}

async fn read_items(path: &Path) -> Result<Vec<String>, ConfigError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "Safelist file not found, starting empty");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            })
        }
    };
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_and_remove_rewrite_file_and_swap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("safelist.txt");
        tokio::fs::write(&path, "# known good\n8.8.8.8\n").await.unwrap();

        let safelist = Safelist::load(&path).await.unwrap();
        let before = safelist.snapshot();
        assert!(before.matches("8.8.8.8").is_some());
        assert!(before.matches("10.1.2.3").is_none());

        assert!(safelist.add("10.0.0.0/8").await.unwrap());
        assert!(!safelist.add("10.0.0.0/8").await.unwrap());
        assert!(safelist.snapshot().matches("10.1.2.3").is_some());
        // Snapshots taken earlier are never mutated.
        assert!(before.matches("10.1.2.3").is_none());

        let on_disk = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(on_disk, "8.8.8.8\n10.0.0.0/8\n");

        assert!(safelist.remove("8.8.8.8").await.unwrap());
        assert!(!safelist.remove("8.8.8.8").await.unwrap());
        assert!(safelist.snapshot().matches("8.8.8.8").is_none());
    }

    #[tokio::test]
    async fn items_and_matcher_change_together() {
        let safelist = Safelist::from_items(vec!["8.8.8.8".to_string()]);
        let old = safelist.state();
        assert!(safelist.add("192.0.2.0/24").await.unwrap());

        let new = safelist.state();
        assert_eq!(new.items, vec!["8.8.8.8", "192.0.2.0/24"]);
        assert!(new.set.matches("192.0.2.7").is_some());
        assert_eq!(old.items, vec!["8.8.8.8"]);
        assert!(old.set.matches("192.0.2.7").is_none());
        assert!(Arc::ptr_eq(&new.set, &safelist.snapshot()));
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let safelist = Safelist::load(dir.path().join("absent.txt")).await.unwrap();
        assert!(safelist.snapshot().is_empty());
        assert_eq!(safelist.reload().await.unwrap(), 0);
    }
}
