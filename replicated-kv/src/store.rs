//! In-memory key-value storage with optional last-writer-wins resolution.
//!
//! Every node (leader and followers) owns one [`KvStore`]. Writes arrive with
//! an optional timestamp: untimed writes overwrite unconditionally, timed
//! writes go through the LWW rule so replicas converge regardless of the
//! order in which they receive the same set of writes.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// A stored value and the timestamp of the write that produced it.
///
/// A timestamp of 0 marks an entry written without one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub value: String,
    pub timestamp: u64,
}

/// A mutation to apply to a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Write<'a> {
    Set { key: &'a str, value: &'a str },
    Delete { key: &'a str },
}

impl Write<'_> {
    pub fn key(&self) -> &str {
        match self {
            Write::Set { key, .. } | Write::Delete { key } => key,
        }
    }
}

/// Thread-safe key-value store.
///
/// BTreeMap keeps LIST output and snapshots in key order.
#[derive(Debug, Default)]
pub struct KvStore {
    data: Mutex<BTreeMap<String, Entry>>,
}

impl KvStore {
    /// Creates an empty key-value store.
    pub fn new() -> Self {
        Self {
            data: Mutex::new(BTreeMap::new()),
        }
    }

    /// Stores a key-value pair, overwriting any existing value.
    pub fn set(&self, key: &str, value: &str) {
        self.data.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                timestamp: 0,
            },
        );
    }

    /// Stores a key-value pair if `timestamp` is not older than the stored one.
    ///
    /// Ties favour the incoming write.
    pub fn set_at(&self, key: &str, value: &str, timestamp: u64) -> Result<()> {
        let mut data = self.data.lock();
        if let Some(existing) = data.get(key) {
            check_fresh(key, existing, timestamp)?;
        }
        data.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                timestamp,
            },
        );
        Ok(())
    }

    /// Retrieves the current value for a key.
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.lock().get(key).map(|entry| entry.value.clone())
    }

    /// Retrieves the value together with its write timestamp.
    pub fn entry(&self, key: &str) -> Option<Entry> {
        self.data.lock().get(key).cloned()
    }

    /// Removes a key. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.data.lock().remove(key).is_some()
    }

    /// Removes a key under the LWW rule.
    ///
    /// Returns `Ok(false)` when the key is already gone.
    pub fn delete_at(&self, key: &str, timestamp: u64) -> Result<bool> {
        let mut data = self.data.lock();
        let Some(existing) = data.get(key) else {
            return Ok(false);
        };
        check_fresh(key, existing, timestamp)?;
        data.remove(key);
        Ok(true)
    }

    /// Applies a write, using LWW when a timestamp is given.
    ///
    /// Returns whether the store changed a key: always `true` for SET, and
    /// whether a key was removed for DELETE.
    pub fn apply(&self, write: Write<'_>, timestamp: Option<u64>) -> Result<bool> {
        match (write, timestamp) {
            (Write::Set { key, value }, None) => {
                self.set(key, value);
                Ok(true)
            }
            (Write::Set { key, value }, Some(ts)) => self.set_at(key, value, ts).map(|()| true),
            (Write::Delete { key }, None) => Ok(self.delete(key)),
            (Write::Delete { key }, Some(ts)) => self.delete_at(key, ts),
        }
    }

    /// Returns a snapshot of all entries.
    ///
    /// Clones the map so the lock is not held while the caller iterates.
    pub fn snapshot(&self) -> BTreeMap<String, Entry> {
        self.data.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}

fn check_fresh(key: &str, existing: &Entry, incoming: u64) -> Result<()> {
    if incoming < existing.timestamp {
        return Err(Error::StaleWrite {
            key: key.to_string(),
            incoming,
            current: existing.timestamp,
        });
    }
    Ok(())
}

/// Wall-clock milliseconds since the Unix epoch, used to stamp LWW writes.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
