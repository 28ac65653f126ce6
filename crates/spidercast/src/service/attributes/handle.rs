//! Application handle on the local attribute table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::domain::{AttributeError, SharedTable};

/// Clonable, thread-safe access to the local node's attributes.
///
/// Writes only take the table lock; the node picks the change up on its next
/// `AttributeUpdate` run.
#[derive(Debug, Clone)]
pub struct AttributeHandle {
    table: SharedTable,
    closed: Arc<AtomicBool>,
}

impl AttributeHandle {
    pub(crate) fn new(table: SharedTable, closed: Arc<AtomicBool>) -> Self {
        Self { table, closed }
    }

    fn ensure_open(&self) -> Result<(), AttributeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AttributeError::Closed);
        }
        Ok(())
    }

    /// Set `key`, returning the previous value.
    pub fn set(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
    ) -> Result<Option<Vec<u8>>, AttributeError> {
        self.ensure_open()?;
        self.table.lock().set(key, value.into())
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.table.lock().get(key).map(<[u8]>::to_vec)
    }

    /// Remove `key`, returning the removed value.
    pub fn remove(&self, key: &str) -> Result<Option<Vec<u8>>, AttributeError> {
        self.ensure_open()?;
        self.table.lock().remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.table.lock().keys()
    }

    /// Remove every key.
    pub fn clear(&self) -> Result<usize, AttributeError> {
        self.ensure_open()?;
        Ok(self.table.lock().clear())
    }

    /// Current version of the local table.
    pub fn version(&self) -> u64 {
        self.table.lock().version()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
