//! Sled-backed persistent backend.
//!
//! Each bucket maps to one sled tree of the same name. Trees are created by the first write;
//! reads and deletes on a bucket that was never written do not create one.

use super::backend::{Bucket, KeyValueBackend, KeyValuePairs};
use super::types::StoreError;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct SledBackend {
    db: sled::Db,
}

impl SledBackend {
    /// Open or create the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)
            .map_err(|e| StoreError::Backend(format!("Failed to open sled db: {}", e)))?;
        Ok(Self { db })
    }

    fn tree(&self, bucket: &Bucket) -> Result<sled::Tree, StoreError> {
        let name = bucket.name();
        self.db
            .open_tree(name.as_bytes())
            .map_err(|e| StoreError::Backend(format!("Failed to open {} tree: {}", name, e)))
    }

    fn existing_tree(&self, bucket: &Bucket) -> Result<Option<sled::Tree>, StoreError> {
        let name = bucket.name();
        let exists = self
            .db
            .tree_names()
            .iter()
            .any(|tree| &tree[..] == name.as_bytes());
        if exists {
            self.tree(bucket).map(Some)
        } else {
            Ok(None)
        }
    }
}

fn backend_error(e: sled::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl KeyValueBackend for SledBackend {
    fn get(&self, bucket: &Bucket, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(tree) = self.existing_tree(bucket)? else {
            return Ok(None);
        };
        Ok(tree
            .get(key)
            .map_err(backend_error)?
            .map(|value| value.to_vec()))
    }

    fn put(&self, bucket: &Bucket, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.tree(bucket)?.insert(key, value).map_err(backend_error)?;
        Ok(())
    }

    fn delete(&self, bucket: &Bucket, key: &[u8]) -> Result<(), StoreError> {
        if let Some(tree) = self.existing_tree(bucket)? {
            tree.remove(key).map_err(backend_error)?;
        }
        Ok(())
    }

    fn scan(&self, bucket: &Bucket) -> Result<KeyValuePairs, StoreError> {
        let Some(tree) = self.existing_tree(bucket)? else {
            return Ok(Vec::new());
        };
        tree.iter()
            .map(|entry| {
                entry
                    .map(|(key, value)| (key.to_vec(), value.to_vec()))
                    .map_err(backend_error)
            })
            .collect()
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(backend_error)?;
        Ok(())
    }
}
