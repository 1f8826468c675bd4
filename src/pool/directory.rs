// ABOUTME: Bounded key -> value directory used for destination pools and service endpoints
//
// Inserts fail with a capacity error once the directory is full instead of
// silently dropping the row. Keys are unique: a second insert of the same key
// is rejected, so a lookup always sees the first value inserted for that key.

use std::collections::HashMap;

use thiserror::Error;

/// Errors returned when a directory row cannot be added
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    /// Directory already holds `capacity` rows
    #[error("Directory full: capacity {capacity}, rejected key '{key}'")]
    CapacityExceeded {
        /// Fixed capacity of the directory
        capacity: usize,
        /// Key that could not be inserted
        key: String,
    },

    /// Key is already present
    #[error("Key already present: '{0}'")]
    DuplicateKey(String),
}

/// String-keyed association table with an optional fixed capacity
#[derive(Debug, Clone)]
pub struct Directory<V> {
    entries: HashMap<String, V>,
    capacity: Option<usize>,
}

impl<V> Directory<V> {
    /// Create a directory; `None` means it may grow without bound
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity.unwrap_or_default()),
            capacity,
        }
    }

    /// Directory with no capacity limit
    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Add a row, copying `key`
    ///
    /// Fails without touching the directory when it is full or the key exists.
    pub fn insert(&mut self, key: &str, value: V) -> Result<(), DirectoryError> {
        if self.entries.contains_key(key) {
            return Err(DirectoryError::DuplicateKey(key.to_string()));
        }
        self.check_capacity(key)?;
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    /// Replace the value for an existing key, or add a new row if there is room
    ///
    /// Returns the previous value when the key was already present.
    pub fn upsert(&mut self, key: &str, value: V) -> Result<Option<V>, DirectoryError> {
        if let Some(slot) = self.entries.get_mut(key) {
            return Ok(Some(std::mem::replace(slot, value)));
        }
        self.check_capacity(key)?;
        self.entries.insert(key.to_string(), value);
        Ok(None)
    }

    /// Value stored for `key`, if any
    pub fn lookup_first(&self, key: &str) -> Option<&V> {
        self.entries.get(key)
    }

    /// Drop the row for `key`, freeing its capacity slot
    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.entries.remove(key)
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the directory has no rows
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all rows in arbitrary order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn check_capacity(&self, key: &str) -> Result<(), DirectoryError> {
        match self.capacity {
            Some(capacity) if self.entries.len() >= capacity => {
                Err(DirectoryError::CapacityExceeded {
                    capacity,
                    key: key.to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

impl<V> Default for Directory<V> {
    fn default() -> Self {
        Self::unbounded()
    }
}
