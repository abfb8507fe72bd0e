//! Persistence layer for the state cache

use crate::codec::Json;
use crate::error::{KernelError, StorageError};
use crate::interfaces::Cache;
use async_trait::async_trait;
use std::path::Path;

/// Sled-based implementation of [`Cache`]
///
/// Values are stored as their JSON text, so entries written by one process are
/// readable by any other kernel pointed at the same directory.
pub struct SledCache {
    db: sled::Db,
}

impl SledCache {
    /// Open (or create) a cache database in the directory at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| {
            StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to open sled database: {}", e),
            ))
        })?;
        Ok(Self { db })
    }

    /// Get the underlying sled database (for advanced operations)
    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    pub fn read(&self, key: &str) -> Result<Option<Json>, StorageError> {
        validate_key(key)?;
        match self.db.get(key.as_bytes()).map_err(|e| {
            StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to get cache entry: {}", e),
            ))
        })? {
            Some(value) => {
                let json = serde_json::from_slice(&value).map_err(|e| StorageError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(Some(json))
            }
            None => Ok(None),
        }
    }

    pub fn write(&self, key: &str, value: &Json) -> Result<(), StorageError> {
        validate_key(key)?;
        let bytes = serde_json::to_vec(value).map_err(|e| {
            StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Failed to serialize cache entry: {}", e),
            ))
        })?;
        self.db.insert(key.as_bytes(), bytes).map_err(|e| {
            StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to put cache entry: {}", e),
            ))
        })?;
        Ok(())
    }

    /// Every key, optionally restricted to those starting with `prefix`.
    pub fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StorageError> {
        let iter = match prefix {
            Some(prefix) => self.db.scan_prefix(prefix.as_bytes()),
            None => self.db.iter(),
        };
        let mut keys = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(|e| {
                StorageError::IoError(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("Failed to iterate cache: {}", e),
                ))
            })?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(|e| {
            StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to flush cache: {}", e),
            ))
        })?;
        Ok(())
    }
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() || !key.contains("://") {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[async_trait]
impl Cache for SledCache {
    async fn get(&self, key: &str) -> Result<Option<Json>, KernelError> {
        Ok(self.read(key)?)
    }

    async fn set(&self, key: &str, value: Json) -> Result<(), KernelError> {
        Ok(self.write(key, &value)?)
    }
}
