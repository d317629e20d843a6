// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Named shared buffers.
//!
//! A shared buffer is a fixed-size byte region plus an [`AsyncLock`],
//! registered under a name on its scheduler. Asking for the same name
//! again returns a handle to the same region. The region is released
//! when its last handle is dropped; the name can then be reused.
//!
//! The buffer does not enforce its lock. Callers take `mutex()` in
//! write mode around mutation when other tasks might observe it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::boxed::Boxed;
use crate::context;
use crate::error::MemoryError;
use crate::mutex::AsyncLock;

struct Segment {
    name: String,
    bytes: Boxed<Box<[u8]>>,
    lock: AsyncLock,
}

/// Handle to a named shared byte region. Clones alias the same region.
#[derive(Clone)]
pub struct SharedBuffer {
    segment: Rc<Segment>,
}

/// Look up or create the shared buffer `name` on the running scheduler.
///
/// # Panics
///
/// When called off the scheduler thread.
pub fn make_shared_buffer(name: &str, size: usize) -> Result<SharedBuffer, MemoryError> {
    context::expect_scheduler("make_shared_buffer").shared_buffer(name, size)
}

/// Per-scheduler name table. Holds weak references only.
#[derive(Default)]
pub(crate) struct SharedRegistry {
    segments: RefCell<HashMap<String, Weak<Segment>>>,
}

impl SharedRegistry {
    pub fn get_or_create(&self, name: &str, size: usize) -> Result<SharedBuffer, MemoryError> {
        if name.is_empty() || size == 0 {
            return Err(MemoryError::InvalidSegment {
                name: name.to_string(),
                size,
            });
        }
        let mut segments = self.segments.borrow_mut();
        if let Some(segment) = segments.get(name).and_then(Weak::upgrade) {
            return Ok(SharedBuffer { segment });
        }
        segments.retain(|_, weak| weak.strong_count() > 0);
        let segment = Rc::new(Segment {
            name: name.to_string(),
            bytes: Boxed::new(vec![0; size].into_boxed_slice()),
            lock: AsyncLock::new(),
        });
        segments.insert(name.to_string(), Rc::downgrade(&segment));
        debug!(name, size, "shared buffer created");
        Ok(SharedBuffer { segment })
    }

    #[cfg(test)]
    fn live(&self) -> usize {
        self.segments
            .borrow()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl SharedBuffer {
    pub fn name(&self) -> &str {
        &self.segment.name
    }

    pub fn len(&self) -> usize {
        self.segment.bytes.read(|b| b.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The lock associated with this region.
    pub fn mutex(&self) -> &AsyncLock {
        &self.segment.lock
    }

    /// Whether both handles refer to the same region.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.segment, &other.segment)
    }

    pub fn get(&self, index: usize) -> Result<u8, MemoryError> {
        self.segment.bytes.read(|bytes| {
            bytes
                .get(index)
                .copied()
                .ok_or_else(|| out_of_bounds(index, 1, bytes.len()))
        })
    }

    pub fn set(&self, index: usize, value: u8) -> Result<(), MemoryError> {
        self.segment.bytes.write(|bytes| {
            let size = bytes.len();
            let byte = bytes
                .get_mut(index)
                .ok_or_else(|| out_of_bounds(index, 1, size))?;
            *byte = value;
            Ok(())
        })
    }

    /// Copy `buf.len()` bytes starting at `offset` into `buf`.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.segment.bytes.read(|bytes| {
            let src = bytes
                .get(offset..offset.saturating_add(buf.len()))
                .ok_or_else(|| out_of_bounds(offset, buf.len(), bytes.len()))?;
            buf.copy_from_slice(src);
            Ok(())
        })
    }

    /// Copy `data` into the region starting at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        self.segment.bytes.write(|bytes| {
            let size = bytes.len();
            let dst = bytes
                .get_mut(offset..offset.saturating_add(data.len()))
                .ok_or_else(|| out_of_bounds(offset, data.len(), size))?;
            dst.copy_from_slice(data);
            Ok(())
        })
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.segment.bytes.read(|bytes| f(bytes))
    }

    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.segment.bytes.write(|bytes| f(bytes))
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.segment.bytes.read(|bytes| bytes.to_vec())
    }
}

fn out_of_bounds(offset: usize, len: usize, size: usize) -> MemoryError {
    MemoryError::OutOfBounds { offset, len, size }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("name", &self.segment.name)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_name_aliases() {
        let registry = SharedRegistry::default();
        let a = registry.get_or_create("x", 4).unwrap();
        let b = registry.get_or_create("x", 4).unwrap();
        a.set(0, 42).unwrap();
        assert_eq!(b.get(0).unwrap(), 42);
        assert!(a.ptr_eq(&b));
        assert_eq!(a.mutex().id(), b.mutex().id());
    }

    #[test]
    fn existing_name_ignores_requested_size() {
        let registry = SharedRegistry::default();
        let a = registry.get_or_create("seg", 8).unwrap();
        let b = registry.get_or_create("seg", 2).unwrap();
        assert_eq!(b.len(), 8);
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn invalid_requests_rejected() {
        let registry = SharedRegistry::default();
        assert_eq!(
            registry.get_or_create("", 4).unwrap_err(),
            MemoryError::InvalidSegment {
                name: String::new(),
                size: 4
            }
        );
        assert!(matches!(
            registry.get_or_create("zero", 0),
            Err(MemoryError::InvalidSegment { size: 0, .. })
        ));
    }

    #[test]
    fn released_with_last_handle() {
        let registry = SharedRegistry::default();
        let a = registry.get_or_create("tmp", 2).unwrap();
        a.set(1, 7).unwrap();
        let b = a.clone();
        drop(a);
        assert_eq!(registry.live(), 1);
        drop(b);
        assert_eq!(registry.live(), 0);
        let fresh = registry.get_or_create("tmp", 2).unwrap();
        assert_eq!(fresh.to_vec(), vec![0, 0]);
    }

    #[test]
    fn ranged_access() {
        let registry = SharedRegistry::default();
        let buf = registry.get_or_create("r", 6).unwrap();
        buf.write_at(2, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 4];
        buf.read_at(1, &mut out).unwrap();
        assert_eq!(out, [0, 1, 2, 3]);
        assert_eq!(
            buf.write_at(5, &[9, 9]),
            Err(MemoryError::OutOfBounds {
                offset: 5,
                len: 2,
                size: 6
            })
        );
        assert!(buf.get(6).is_err());
        buf.with_bytes_mut(|b| b.fill(0xff));
        assert!(buf.with_bytes(|b| b.iter().all(|&x| x == 0xff)));
    }
}
