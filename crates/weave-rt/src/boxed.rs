// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Reference cell.
//!
//! A single heap slot with shared identity: clones of a [`Boxed`] alias
//! the same value, so a write through one handle is seen through every
//! other. There is no locking. Tasks that must coordinate updates across
//! suspension points wrap access in an [`AsyncLock`](crate::AsyncLock).

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Shared mutable slot. Cloning copies the reference, not the value.
pub struct Boxed<T> {
    slot: Rc<RefCell<T>>,
}

/// Box `value` in a new reference cell.
pub fn make_ref<T>(value: T) -> Boxed<T> {
    Boxed::new(value)
}

impl<T> Boxed<T> {
    pub fn new(value: T) -> Self {
        Self {
            slot: Rc::new(RefCell::new(value)),
        }
    }

    /// Store `value`, dropping the previous one.
    pub fn set(&self, value: T) {
        let _old = self.replace(value);
    }

    /// Store `value` and return the previous one.
    pub fn replace(&self, value: T) -> T {
        self.slot.replace(value)
    }

    /// Shared access to the slot (closure-scoped, no escaping borrow).
    ///
    /// # Panics
    ///
    /// If `f` writes to the same cell.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.slot.borrow())
    }

    /// Exclusive access to the slot.
    ///
    /// # Panics
    ///
    /// If `f` accesses the same cell again.
    pub fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.slot.borrow_mut())
    }

    /// Whether both handles alias the same slot.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.slot, &other.slot)
    }

    /// Number of live handles to this slot.
    pub fn handle_count(&self) -> usize {
        Rc::strong_count(&self.slot)
    }
}

impl<T: Clone> Boxed<T> {
    pub fn get(&self) -> T {
        self.slot.borrow().clone()
    }
}

impl<T: Default> Boxed<T> {
    /// Take the value, leaving `T::default()` behind.
    pub fn take(&self) -> T {
        self.slot.take()
    }
}

impl<T> Clone for Boxed<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T: Default> Default for Boxed<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Boxed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slot.try_borrow() {
            Ok(value) => f.debug_tuple("Boxed").field(&*value).finish(),
            Err(_) => f.write_str("Boxed(<borrowed>)"),
        }
    }
}
