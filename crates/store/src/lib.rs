//! Thin facade over the embedded key-value database.
//!
//! A [`Client`] owns one on-disk database; named [`Bucket`]s are created
//! idempotently on first access and give single-writer, multi-reader access
//! to their keyspace. `get` returns an owned copy; `get_func` lends the
//! stored bytes to a closure so the borrow cannot outlive the read.

use std::fmt;
use std::fs;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("failed to create database directory: {0}")]
    CreateDir(#[source] std::io::Error),
}

/// Handle to the embedded database.
#[derive(Clone)]
pub struct Client {
    db: sled::Db,
}

impl Client {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(StoreError::CreateDir)?;
        }
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Get a named bucket, creating it if absent.
    pub fn bucket(&self, name: &str) -> Result<Bucket, StoreError> {
        let tree = self.db.open_tree(name)?;
        Ok(Bucket {
            db: self.db.clone(),
            tree,
            name: name.to_string(),
        })
    }

    /// Flush all pending writes to disk. Called on shutdown, after every
    /// worker has stopped.
    pub fn close(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

/// A named keyspace inside the database.
#[derive(Clone)]
pub struct Bucket {
    db: sled::Db,
    tree: sled::Tree,
    name: String,
}

impl Bucket {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.tree.insert(key, value)?;
        self.tree.flush()?;
        Ok(())
    }

    /// Owned copy of the value, if present.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    /// Borrowing read: the value is lent to `f` for the duration of the call.
    pub fn get_func<R>(
        &self,
        key: &[u8],
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<Option<R>, StoreError> {
        Ok(self.tree.get(key)?.map(|v| f(&v)))
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.tree.remove(key)?;
        self.tree.flush()?;
        Ok(())
    }

    /// Visit every key/value pair in key order.
    pub fn for_each(
        &self,
        mut f: impl FnMut(&[u8], &[u8]) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        for entry in self.tree.iter() {
            let (k, v) = entry?;
            f(&k, &v)?;
        }
        Ok(())
    }

    /// The first row in key order, if any.
    pub fn first(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        Ok(self.tree.first()?.map(|(k, v)| (k.to_vec(), v.to_vec())))
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.tree.contains_key(key)?)
    }

    pub fn count(&self) -> usize {
        self.tree.len()
    }

    /// Drop the whole bucket and its contents.
    pub fn delete_bucket(self) -> Result<(), StoreError> {
        self.db.drop_tree(self.name.as_bytes())?;
        Ok(())
    }
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket").field("name", &self.name).finish()
    }
}
