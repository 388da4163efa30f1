//! Local key/value persistence
//!
//! `JsonFileStore` keeps every key in one JSON document and rewrites it
//! atomically (temp file, then rename). `MemoryStore` backs tests.

use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::engine::updater::capabilities::KeyValueStore;
use crate::engine::updater::state::StateError;

pub struct JsonFileStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Map<String, Value>, StateError> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let content =
            fs::read_to_string(&self.path).map_err(|e| StateError::ReadError(e.to_string()))?;
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        serde_json::from_str(&content).map_err(|e| StateError::ParseError(e.to_string()))
    }

    fn save(&self, map: &Map<String, Value>) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StateError::WriteError(e.to_string()))?;
        }
        let content = serde_json::to_string_pretty(map)
            .map_err(|e| StateError::SerializeError(e.to_string()))?;

        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, &content).map_err(|e| StateError::WriteError(e.to_string()))?;
        fs::rename(&temp_path, &self.path).map_err(|e| StateError::WriteError(e.to_string()))?;
        Ok(())
    }

    fn update<F>(&self, apply: F) -> Result<(), StateError>
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        let _held = self.guard.lock().map_err(|_| StateError::Poisoned)?;
        let mut map = self.load()?;
        apply(&mut map);
        self.save(&map)
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StateError> {
        let _held = self.guard.lock().map_err(|_| StateError::Poisoned)?;
        Ok(self.load()?.remove(key))
    }

    fn put(&self, key: &str, value: Value) -> Result<(), StateError> {
        self.update(|map| {
            map.insert(key.to_string(), value);
        })
    }

    fn remove(&self, key: &str) -> Result<(), StateError> {
        self.update(|map| {
            map.remove(key);
        })
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<Map<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StateError> {
        let entries = self.entries.lock().map_err(|_| StateError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: Value) -> Result<(), StateError> {
        let mut entries = self.entries.lock().map_err(|_| StateError::Poisoned)?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StateError> {
        let mut entries = self.entries.lock().map_err(|_| StateError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}
