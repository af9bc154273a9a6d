//! Tag pool for correlating forwarded requests with their replies.
//!
//! `emit` always hands out the lowest free tag in `[0, capacity)`, so tags
//! stay small and reuse is deterministic.

use std::collections::BTreeSet;

use crate::error::TagError;
use crate::protocol::Tag;

#[derive(Debug)]
pub struct TagAllocator {
    available: BTreeSet<Tag>,
    capacity: usize,
}

impl TagAllocator {
    pub fn new(capacity: usize) -> Self {
        let top = Tag::try_from(capacity).unwrap_or(Tag::MAX);
        Self {
            available: (0..top).collect(),
            capacity: top as usize,
        }
    }

    /// Take the lowest available tag.
    pub fn emit(&mut self) -> Result<Tag, TagError> {
        self.available
            .pop_first()
            .ok_or(TagError::PoolExhausted(self.capacity))
    }

    /// Return a tag to the pool.
    ///
    /// The pool is left unchanged on error.
    pub fn allow(&mut self, tag: Tag) -> Result<(), TagError> {
        if tag as usize >= self.capacity {
            return Err(TagError::OutOfRange {
                tag,
                capacity: self.capacity,
            });
        }
        if !self.available.insert(tag) {
            return Err(TagError::NotOutstanding(tag));
        }
        Ok(())
    }

    pub fn is_outstanding(&self, tag: Tag) -> bool {
        (tag as usize) < self.capacity && !self.available.contains(&tag)
    }

    /// Number of tags currently handed out.
    pub fn outstanding(&self) -> usize {
        self.capacity - self.available.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
