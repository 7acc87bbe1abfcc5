//! Ordered, bucketed key-value backends.

use super::types::StoreError;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Named key spaces of the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Bucket {
    /// Singleton cursor and height values.
    Meta,
    /// Watched addresses; keys only.
    Addresses,
    /// Global `(txid, vout)` index of indexed outputs.
    Utxos,
    /// Spending txid to consumed outputs.
    SpentLedger,
    /// Per-address output namespace.
    AddressUtxos(String),
}

impl Bucket {
    pub fn name(&self) -> Cow<'static, str> {
        match self {
            Bucket::Meta => Cow::Borrowed("meta"),
            Bucket::Addresses => Cow::Borrowed("address"),
            Bucket::Utxos => Cow::Borrowed("utxo"),
            Bucket::SpentLedger => Cow::Borrowed("spent"),
            Bucket::AddressUtxos(address) => Cow::Owned(format!("tx-{}", address)),
        }
    }
}

pub type KeyValuePairs = Vec<(Vec<u8>, Vec<u8>)>;

pub trait KeyValueBackend: Send + Sync {
    fn get(&self, bucket: &Bucket, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, bucket: &Bucket, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    fn delete(&self, bucket: &Bucket, key: &[u8]) -> Result<(), StoreError>;

    /// All entries of `bucket` in key order. A bucket never written to is empty.
    fn scan(&self, bucket: &Bucket) -> Result<KeyValuePairs, StoreError>;

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl<T: KeyValueBackend + ?Sized> KeyValueBackend for Arc<T> {
    fn get(&self, bucket: &Bucket, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(bucket, key)
    }

    fn put(&self, bucket: &Bucket, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        (**self).put(bucket, key, value)
    }

    fn delete(&self, bucket: &Bucket, key: &[u8]) -> Result<(), StoreError> {
        (**self).delete(bucket, key)
    }

    fn scan(&self, bucket: &Bucket) -> Result<KeyValuePairs, StoreError> {
        (**self).scan(bucket)
    }

    fn flush(&self) -> Result<(), StoreError> {
        (**self).flush()
    }
}

type MemoryBackendMap = BTreeMap<(String, Vec<u8>), Vec<u8>>;

#[derive(Default)]
pub struct MemoryBackend {
    inner: RwLock<MemoryBackendMap>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueBackend for MemoryBackend {
    fn get(&self, bucket: &Bucket, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.inner.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(guard.get(&(bucket.name().into_owned(), key.to_vec())).cloned())
    }

    fn put(&self, bucket: &Bucket, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        guard.insert((bucket.name().into_owned(), key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, bucket: &Bucket, key: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        guard.remove(&(bucket.name().into_owned(), key.to_vec()));
        Ok(())
    }

    fn scan(&self, bucket: &Bucket) -> Result<KeyValuePairs, StoreError> {
        let guard = self.inner.read().map_err(|_| StoreError::LockPoisoned)?;
        let name = bucket.name();
        let start = (name.clone().into_owned(), Vec::new());
        Ok(guard
            .range(start..)
            .take_while(|((entry_bucket, _), _)| entry_bucket.as_str() == name.as_ref())
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }
}

/// Memory backend whose writes can be made to fail with a transient backend error.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct FlakyBackend {
    inner: MemoryBackend,
    failing_puts: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl FlakyBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` writes; `usize::MAX` fails every write.
    pub(crate) fn fail_next_puts(&self, count: usize) {
        self.failing_puts
            .store(count, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl KeyValueBackend for FlakyBackend {
    fn get(&self, bucket: &Bucket, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(bucket, key)
    }

    fn put(&self, bucket: &Bucket, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        use std::sync::atomic::Ordering;
        let failing = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                usize::MAX => Some(usize::MAX),
                left => Some(left - 1),
            })
            .is_ok();
        if failing {
            return Err(StoreError::Backend("injected write failure".to_string()));
        }
        self.inner.put(bucket, key, value)
    }

    fn delete(&self, bucket: &Bucket, key: &[u8]) -> Result<(), StoreError> {
        self.inner.delete(bucket, key)
    }

    fn scan(&self, bucket: &Bucket) -> Result<KeyValuePairs, StoreError> {
        self.inner.scan(bucket)
    }
}
