//! Capacity-bounded in-memory object store.
//!
//! Objects are immutable `Bytes` handles. [`ObjectStore::locate`] hands out a
//! cheap clone that stays valid after the object is overwritten or deleted,
//! so an outbound frame can hold it until fully flushed.
//!
//! The store is owned by the server event loop and needs no locking.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use shardstore::store::ObjectStore;
//!
//! let mut store = ObjectStore::new(1024);
//! store.new_object_from_string(b"quokka", Bytes::from_static(b"1234")).unwrap();
//! assert_eq!(store.locate(b"quokka").unwrap().bytes(), Bytes::from_static(b"1234"));
//! assert_eq!(store.total_size(), 4);
//! ```

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use crate::error::StoreError;

/// A stored object.
#[derive(Debug, Clone)]
pub struct Blob {
    mutable: bool,
    data: Bytes,
}

impl Blob {
    /// Shared handle to the content.
    #[inline]
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// False once committed.
    #[inline]
    pub fn is_mutable(&self) -> bool {
        self.mutable
    }
}

/// Key to blob map with a byte budget.
#[derive(Debug)]
pub struct ObjectStore {
    objects: HashMap<Bytes, Blob>,
    total_size: usize,
    max_size: usize,
}

fn key_string(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

impl ObjectStore {
    pub fn new(max_size: usize) -> Self {
        Self {
            objects: HashMap::new(),
            total_size: 0,
            max_size,
        }
    }

    /// Fail unless `requested` more bytes fit.
    fn reserve(&self, requested: usize) -> Result<(), StoreError> {
        if requested > self.max_size - self.total_size {
            return Err(StoreError::CapacityExceeded {
                requested,
                used: self.total_size,
                max: self.max_size,
            });
        }
        Ok(())
    }

    fn check_absent(&self, key: &[u8]) -> Result<(), StoreError> {
        if self.objects.contains_key(key) {
            return Err(StoreError::KeyExists(key_string(key)));
        }
        Ok(())
    }

    fn get_mut(&mut self, key: &[u8]) -> Result<&mut Blob, StoreError> {
        self.objects
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key_string(key)))
    }

    /// Create a mutable, zero-filled object of `size` bytes.
    ///
    /// Nothing is allocated unless the whole request succeeds.
    pub fn new_object(&mut self, key: &[u8], size: usize) -> Result<&Blob, StoreError> {
        self.check_absent(key)?;
        self.reserve(size)?;
        self.total_size += size;
        let blob = Blob {
            mutable: true,
            data: Bytes::from(vec![0u8; size]),
        };
        Ok(self
            .objects
            .entry(Bytes::copy_from_slice(key))
            .or_insert(blob))
    }

    /// Create an object holding `content`. Same checks as [`Self::new_object`].
    pub fn new_object_from_string(&mut self, key: &[u8], content: Bytes) -> Result<(), StoreError> {
        self.check_absent(key)?;
        self.reserve(content.len())?;
        self.total_size += content.len();
        self.objects.insert(
            Bytes::copy_from_slice(key),
            Blob {
                mutable: true,
                data: content,
            },
        );
        Ok(())
    }

    /// Insert, or replace an existing mutable object.
    ///
    /// Returns true when an object was replaced. Capacity is checked against
    /// the size difference only.
    pub fn overwrite_from_bytes(&mut self, key: &[u8], content: Bytes) -> Result<bool, StoreError> {
        let Some(old) = self.objects.get(key) else {
            self.new_object_from_string(key, content)?;
            return Ok(false);
        };
        if !old.mutable {
            return Err(StoreError::Immutable(key_string(key)));
        }
        let old_size = old.size();
        let new_size = content.len();
        if new_size > old_size {
            self.reserve(new_size - old_size)?;
        }
        self.total_size = self.total_size - old_size + new_size;
        let blob = self.get_mut(key)?;
        blob.data = content;
        Ok(true)
    }

    /// O(1) lookup.
    #[inline]
    pub fn locate(&self, key: &[u8]) -> Option<&Blob> {
        self.objects.get(key)
    }

    #[inline]
    pub fn contains(&self, key: &[u8]) -> bool {
        self.objects.contains_key(key)
    }

    /// Remove an object and release its bytes from the budget.
    pub fn delete_object(&mut self, key: &[u8]) -> Result<(), StoreError> {
        let blob = self
            .objects
            .remove(key)
            .ok_or_else(|| StoreError::NotFound(key_string(key)))?;
        self.total_size -= blob.size();
        Ok(())
    }

    /// Make an object immutable.
    pub fn commit(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.get_mut(key)?.mutable = false;
        Ok(())
    }

    /// Extend a mutable object by `delta` zero bytes.
    pub fn grow(&mut self, key: &[u8], delta: usize) -> Result<(), StoreError> {
        let blob = self
            .objects
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key_string(key)))?;
        if !blob.mutable {
            return Err(StoreError::Immutable(key_string(key)));
        }
        self.reserve(delta)?;

        let blob = self.get_mut(key)?;
        let mut data = BytesMut::with_capacity(blob.size() + delta);
        data.extend_from_slice(&blob.data);
        data.resize(blob.size() + delta, 0);
        blob.data = data.freeze();
        self.total_size += delta;
        Ok(())
    }

    /// Copy `bytes` into a mutable object at `offset`.
    ///
    /// Handles previously returned by `locate` keep the old content.
    pub fn write_object(&mut self, key: &[u8], offset: usize, bytes: &[u8]) -> Result<(), StoreError> {
        let blob = self.get_mut(key)?;
        if !blob.mutable {
            return Err(StoreError::Immutable(key_string(key)));
        }
        let size = blob.size();
        let end = offset
            .checked_add(bytes.len())
            .filter(|end| *end <= size)
            .ok_or_else(|| StoreError::OutOfBounds {
                key: key_string(key),
                offset,
                len: bytes.len(),
                size,
            })?;

        let mut data = BytesMut::from(&blob.data[..]);
        data[offset..end].copy_from_slice(bytes);
        blob.data = data.freeze();
        Ok(())
    }

    /// Bytes currently allocated.
    #[inline]
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of objects.
    #[inline]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
