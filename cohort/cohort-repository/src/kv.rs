//! Versioned key-value store with optimistic version checks.
//!
//! Values are keyed by guid. Every successful update must advance the stored
//! version; updates that name a stale version fail with `VersionMismatch`.

use cohort_core::error::{CohortError, Result};
use cohort_core::id::Guid;
use cohort_core::types::{EntityDetail, Relationship, TypeDef};
use dashmap::DashMap;

/// A value the store can key and version.
pub trait Versioned: Clone + Send + Sync + 'static {
    fn store_key(&self) -> Guid;

    fn stored_version(&self) -> u64;
}

impl Versioned for EntityDetail {
    fn store_key(&self) -> Guid {
        self.header.guid
    }

    fn stored_version(&self) -> u64 {
        self.header.version
    }
}

impl Versioned for Relationship {
    fn store_key(&self) -> Guid {
        self.header.guid
    }

    fn stored_version(&self) -> u64 {
        self.header.version
    }
}

impl Versioned for TypeDef {
    fn store_key(&self) -> Guid {
        self.guid
    }

    fn stored_version(&self) -> u64 {
        self.version
    }
}

/// Concurrent versioned map
pub struct VersionedStore<V> {
    /// Store name used in error keys
    name: &'static str,
    entries: DashMap<Guid, V>,
    not_found: fn(Guid) -> CohortError,
}

impl<V: Versioned> VersionedStore<V> {
    pub fn new(name: &'static str, not_found: fn(Guid) -> CohortError) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            not_found,
        }
    }

    pub fn get(&self, key: &Guid) -> Result<V> {
        self.entries
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| (self.not_found)(*key))
    }

    pub fn contains(&self, key: &Guid) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of all values
    pub fn values(&self) -> Vec<V> {
        self.entries.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Insert a value whose key must not exist yet
    pub fn insert_new(&self, value: V, operation: &str) -> Result<()> {
        use dashmap::mapref::entry::Entry;

        match self.entries.entry(value.store_key()) {
            Entry::Occupied(entry) => Err(CohortError::invalid_parameter(
                "guid",
                operation,
                format!("{} {} already exists", self.name, entry.key()),
            )),
            Entry::Vacant(entry) => {
                entry.insert(value);
                Ok(())
            }
        }
    }

    /// Insert, or replace the stored value if `value` carries a higher version.
    ///
    /// Returns whether the value was stored.
    pub fn put_newer(&self, value: V) -> bool {
        use dashmap::mapref::entry::Entry;

        match self.entries.entry(value.store_key()) {
            Entry::Occupied(mut entry) => {
                if value.stored_version() > entry.get().stored_version() {
                    entry.insert(value);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(value);
                true
            }
        }
    }

    /// Apply `change` to the value if its stored version equals `expected_version`
    pub fn update<F>(&self, key: Guid, expected_version: u64, change: F) -> Result<V>
    where
        F: FnOnce(&mut V) -> Result<()>,
    {
        let mut entry = self.entries.get_mut(&key).ok_or_else(|| (self.not_found)(key))?;
        let current = entry.stored_version();
        if current != expected_version {
            return Err(CohortError::VersionMismatch {
                key: format!("{}/{}", self.name, key),
                expected: expected_version,
                actual: current,
            });
        }
        Self::apply(entry.value_mut(), current, change)
    }

    /// Apply `change` to the value at whatever version it holds
    pub fn modify<F>(&self, key: Guid, change: F) -> Result<V>
    where
        F: FnOnce(&mut V) -> Result<()>,
    {
        let mut entry = self.entries.get_mut(&key).ok_or_else(|| (self.not_found)(key))?;
        let current = entry.stored_version();
        Self::apply(entry.value_mut(), current, change)
    }

    fn apply<F>(entry: &mut V, current: u64, change: F) -> Result<V>
    where
        F: FnOnce(&mut V) -> Result<()>,
    {
        let mut next = entry.clone();
        change(&mut next)?;
        if next.stored_version() <= current {
            return Err(CohortError::internal(format!(
                "update of {} did not advance version {}",
                next.store_key(),
                current
            )));
        }
        *entry = next.clone();
        Ok(next)
    }

    /// Remove the value if `check` accepts it
    pub fn remove_checked<F>(&self, key: Guid, check: F) -> Result<V>
    where
        F: FnOnce(&V) -> Result<()>,
    {
        let mut failure = None;
        let removed = self.entries.remove_if(&key, |_, value| match check(value) {
            Ok(()) => true,
            Err(e) => {
                failure = Some(e);
                false
            }
        });
        match removed {
            Some((_, value)) => Ok(value),
            None => Err(failure.unwrap_or_else(|| (self.not_found)(key))),
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
