// ===============================
// src/store.rs
// ===============================
//
// Opaque key -> object store used by the supervisor to persist the fixture
// overview map between runs.
// - FileStore   : one `{key}.json` per key, written to a temp file and renamed
// - MemoryStore : HashMap behind a mutex (tests / ephemeral runs)
//
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::overview::FixtureOverview;

pub type FixtureMap = BTreeMap<String, FixtureOverview>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Ok(None) when the key has never been written.
    async fn get_object(&self, key: &str) -> Result<Option<FixtureMap>, StoreError>;
    async fn set_object(&self, key: &str, value: &FixtureMap) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // key dipakai sebagai nama file, buang separator
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn get_object(&self, key: &str) -> Result<Option<FixtureMap>, StoreError> {
        let path = self.path_for(key);
        let raw = match fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let map: FixtureMap = serde_json::from_str(&raw)?;
        debug!(path = %path.display(), fixtures = map.len(), "store: loaded");
        Ok(Some(map))
    }

    async fn set_object(&self, key: &str, value: &FixtureMap) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");

        let body = serde_json::to_vec_pretty(value)?;
        let mut f = fs::File::create(&tmp).await?;
        f.write_all(&body).await?;
        f.flush().await?;
        f.sync_all().await?;
        drop(f);

        fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), fixtures = value.len(), "store: saved");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keeps serialized JSON so corruption behaves like the file store.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store raw text under `key`, bypassing serialization.
    pub fn insert_raw(&self, key: &str, raw: impl Into<String>) {
        self.objects.lock().insert(key.to_string(), raw.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().contains_key(key)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_object(&self, key: &str) -> Result<Option<FixtureMap>, StoreError> {
        let raw = self.objects.lock().get(key).cloned();
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn set_object(&self, key: &str, value: &FixtureMap) -> Result<(), StoreError> {
        let s = serde_json::to_string(value)?;
        self.objects.lock().insert(key.to_string(), s);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.objects.lock().remove(key);
        Ok(())
    }
}
