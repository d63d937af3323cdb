//! Copy-on-write versioned cell
//!
//! Readers take an `Arc` to the current value and never wait for writers
//! beyond the pointer copy. Writers clone the value, mutate the clone and
//! publish it with a compare-and-swap on the version counter, so a reader
//! always sees either the old or the new value, never a half-applied update.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::error::Result;

/// A published value together with its version
#[derive(Debug)]
pub struct Snapshot<T> {
    value: Arc<T>,
    version: u64,
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            version: self.version,
        }
    }
}

impl<T> Snapshot<T> {
    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn into_arc(self) -> Arc<T> {
        self.value
    }
}

impl<T> std::ops::Deref for Snapshot<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

/// Versioned copy-on-write cell
#[derive(Debug)]
pub struct SnapshotCell<T> {
    current: RwLock<Snapshot<T>>,
    /// Serializes writers; readers never take it
    writer: Mutex<()>,
}

impl<T: Clone> SnapshotCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: RwLock::new(Snapshot {
                value: Arc::new(value),
                version: 0,
            }),
            writer: Mutex::new(()),
        }
    }

    /// Current value and version
    pub fn load(&self) -> Snapshot<T> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn version(&self) -> u64 {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .version
    }

    /// Publish `value` only if the current version is still `expected`
    ///
    /// Returns the new version, or `None` when another write got there first.
    pub fn compare_and_swap(&self, expected: u64, value: T) -> Option<u64> {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if current.version != expected {
            return None;
        }
        current.value = Arc::new(value);
        current.version += 1;
        Some(current.version)
    }

    /// Apply `mutate` to a private copy and publish it
    ///
    /// Nothing is published when `mutate` fails. Returns the closure's output
    /// and the version that was published.
    ///
    /// Updates are serialized against each other by the writer lock. The
    /// version check only fails when a direct [`compare_and_swap`] call lands
    /// while `mutate` runs; `update` then retries on the newer value, so
    /// `mutate` may be called more than once.
    ///
    /// [`compare_and_swap`]: SnapshotCell::compare_and_swap
    pub fn update<R>(&self, mut mutate: impl FnMut(&mut T) -> Result<R>) -> Result<(R, u64)> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let base = self.load();
            let mut next = T::clone(&base.value);
            let output = mutate(&mut next)?;
            if let Some(version) = self.compare_and_swap(base.version, next) {
                return Ok((output, version));
            }
        }
    }
}
