//! Reference-counted immutable byte buffers
//!
//! A `Blob` is the payload cell shared between blob-bearing packets and
//! pending storage writes. Cloning bumps a refcount; the buffer is freed when
//! the last holder drops.

use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
pub struct Blob {
    inner: Arc<Box<[u8]>>,
}

impl Blob {
    pub fn new(data: impl Into<Box<[u8]>>) -> Self {
        Self {
            inner: Arc::new(data.into()),
        }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::new(data.to_vec())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Number of live holders of this buffer. Observable so tests can assert
    /// the share-on-duplicate and release-on-dispose contracts.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// True when both blobs share the same underlying buffer.
    pub fn ptr_eq(&self, other: &Blob) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Blob {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.as_slice() == other.as_slice()
    }
}

impl Eq for Blob {}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("len", &self.len())
            .field("refcount", &self.refcount())
            .finish()
    }
}

impl From<Vec<u8>> for Blob {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<&[u8]> for Blob {
    fn from(data: &[u8]) -> Self {
        Self::from_slice(data)
    }
}
