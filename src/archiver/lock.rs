//! Cluster-wide single-flight lock for archive runs
//!
//! The lock is a lease stored in a cluster property: its value is
//! `<owner>@<acquired-millis>`. Acquisition is a compare-and-set from "absent"
//! or from a lease older than the staleness window, so a node that crashed
//! mid-run stops blocking the cluster once its lease expires. Holders refresh
//! the timestamp between batches.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, VigilError};

/// Property name holding the archiver lease
pub const ARCHIVER_LOCK_PROPERTY: &str = "audit.archiver.lock";

/// Distributed property store with atomic compare-and-set
pub trait ClusterPropertyStore: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<String>>;

    /// Replace `expected` with `value` atomically; `None` means absent.
    /// Returns `false` when the current value is not `expected`.
    fn compare_and_set(&self, name: &str, expected: Option<&str>, value: Option<&str>)
        -> Result<bool>;
}

impl<S: ClusterPropertyStore + ?Sized> ClusterPropertyStore for Arc<S> {
    fn get(&self, name: &str) -> Result<Option<String>> {
        (**self).get(name)
    }

    fn compare_and_set(
        &self,
        name: &str,
        expected: Option<&str>,
        value: Option<&str>,
    ) -> Result<bool> {
        (**self).compare_and_set(name, expected, value)
    }
}

/// Process-local property store
#[derive(Debug, Default)]
pub struct MemoryPropertyStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryPropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite unconditionally
    pub fn put(&self, name: &str, value: &str) {
        self.values.lock().insert(name.to_string(), value.to_string());
    }
}

impl ClusterPropertyStore for MemoryPropertyStore {
    fn get(&self, name: &str) -> Result<Option<String>> {
        Ok(self.values.lock().get(name).cloned())
    }

    fn compare_and_set(
        &self,
        name: &str,
        expected: Option<&str>,
        value: Option<&str>,
    ) -> Result<bool> {
        let mut values = self.values.lock();
        if values.get(name).map(String::as_str) != expected {
            return Ok(false);
        }
        match value {
            Some(v) => values.insert(name.to_string(), v.to_string()),
            None => values.remove(name),
        };
        Ok(true)
    }
}

/// Non-blocking cluster lock
pub trait DistributedLock: Send + Sync {
    /// Take the lock if free (or stale); never waits
    fn try_lock(&self, stale_after: Duration) -> Result<bool>;

    /// Extend a held lock; `false` when it was lost
    fn refresh(&self) -> Result<bool>;

    fn unlock(&self) -> Result<()>;
}

/// Releases a held lock when dropped
pub struct LockGuard<'a> {
    lock: &'a dyn DistributedLock,
}

impl<'a> LockGuard<'a> {
    /// Try the lock; `None` when another holder has it
    pub fn try_acquire(lock: &'a dyn DistributedLock, stale_after: Duration) -> Result<Option<Self>> {
        if lock.try_lock(stale_after)? {
            Ok(Some(Self { lock }))
        } else {
            Ok(None)
        }
    }

    pub fn refresh(&self) -> Result<bool> {
        self.lock.refresh()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            warn!("Failed to release archiver lock: {}", e);
        }
    }
}

/// Lease lock backed by a [`ClusterPropertyStore`]
pub struct PropertyLease<S: ClusterPropertyStore> {
    store: S,
    property: String,
    owner: String,
    held: Mutex<Option<String>>,
}

fn lease_value(owner: &str) -> String {
    format!("{}@{}", owner, Utc::now().timestamp_millis())
}

fn lease_age(value: &str) -> Option<Duration> {
    let (_, acquired) = value.rsplit_once('@')?;
    let acquired: i64 = acquired.parse().ok()?;
    let age = Utc::now().timestamp_millis().saturating_sub(acquired);
    Some(Duration::from_millis(age.max(0) as u64))
}

impl<S: ClusterPropertyStore> PropertyLease<S> {
    pub fn new(store: S, property: &str, owner: &str) -> Self {
        Self {
            store,
            property: property.to_string(),
            owner: owner.to_string(),
            held: Mutex::new(None),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn is_held(&self) -> bool {
        self.held.lock().is_some()
    }
}

impl<S: ClusterPropertyStore> DistributedLock for PropertyLease<S> {
    fn try_lock(&self, stale_after: Duration) -> Result<bool> {
        let mut held = self.held.lock();
        if held.is_some() {
            return Err(VigilError::Lock(format!(
                "lease '{}' already held by this node",
                self.property
            )));
        }

        let current = self.store.get(&self.property)?;
        if let Some(ref value) = current {
            // Unparseable leases are treated as stale
            let stale = lease_age(value).map_or(true, |age| age > stale_after);
            if !stale {
                debug!("Lease '{}' held by {}", self.property, value);
                return Ok(false);
            }
            info!("Taking over stale lease '{}' ({})", self.property, value);
        }

        let value = lease_value(&self.owner);
        if self
            .store
            .compare_and_set(&self.property, current.as_deref(), Some(&value))?
        {
            *held = Some(value);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn refresh(&self) -> Result<bool> {
        let mut held = self.held.lock();
        let Some(ref current) = *held else {
            return Ok(false);
        };
        let value = lease_value(&self.owner);
        if self
            .store
            .compare_and_set(&self.property, Some(current), Some(&value))?
        {
            *held = Some(value);
            Ok(true)
        } else {
            warn!("Lease '{}' was taken over by another node", self.property);
            *held = None;
            Ok(false)
        }
    }

    fn unlock(&self) -> Result<()> {
        let mut held = self.held.lock();
        if let Some(value) = held.take() {
            if !self
                .store
                .compare_and_set(&self.property, Some(&value), None)?
            {
                debug!("Lease '{}' changed hands before release", self.property);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_single_holder() {
        let store = Arc::new(MemoryPropertyStore::new());
        let a = PropertyLease::new(store.clone(), ARCHIVER_LOCK_PROPERTY, "node-a");
        let b = PropertyLease::new(store.clone(), ARCHIVER_LOCK_PROPERTY, "node-b");

        assert!(a.try_lock(MINUTE).unwrap());
        assert!(!b.try_lock(MINUTE).unwrap());
        assert!(store
            .get(ARCHIVER_LOCK_PROPERTY)
            .unwrap()
            .unwrap()
            .starts_with("node-a@"));

        a.unlock().unwrap();
        assert!(store.get(ARCHIVER_LOCK_PROPERTY).unwrap().is_none());
        assert!(b.try_lock(MINUTE).unwrap());
    }

    #[test]
    fn test_stale_lease_taken_over() {
        let store = Arc::new(MemoryPropertyStore::new());
        let stale = format!("node-a@{}", Utc::now().timestamp_millis() - 120_000);
        store.put(ARCHIVER_LOCK_PROPERTY, &stale);

        let b = PropertyLease::new(store.clone(), ARCHIVER_LOCK_PROPERTY, "node-b");
        assert!(b.try_lock(MINUTE).unwrap());
        assert!(b.is_held());
    }

    #[test]
    fn test_garbage_lease_is_stale() {
        let store = Arc::new(MemoryPropertyStore::new());
        store.put(ARCHIVER_LOCK_PROPERTY, "garbage");
        let b = PropertyLease::new(store, ARCHIVER_LOCK_PROPERTY, "node-b");
        assert!(b.try_lock(MINUTE).unwrap());
    }

    #[test]
    fn test_refresh_detects_takeover() {
        let store = Arc::new(MemoryPropertyStore::new());
        let a = PropertyLease::new(store.clone(), ARCHIVER_LOCK_PROPERTY, "node-a");
        assert!(a.try_lock(MINUTE).unwrap());
        assert!(a.refresh().unwrap());

        store.put(ARCHIVER_LOCK_PROPERTY, "node-b@0");
        assert!(!a.refresh().unwrap());
        assert!(!a.is_held());
        // Releasing a lost lease leaves the new holder alone
        a.unlock().unwrap();
        assert_eq!(
            store.get(ARCHIVER_LOCK_PROPERTY).unwrap().as_deref(),
            Some("node-b@0")
        );
    }

    #[test]
    fn test_double_acquire_is_error() {
        let a = PropertyLease::new(MemoryPropertyStore::new(), ARCHIVER_LOCK_PROPERTY, "node-a");
        assert!(a.try_lock(MINUTE).unwrap());
        assert!(matches!(a.try_lock(MINUTE), Err(VigilError::Lock(_))));
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let lease = PropertyLease::new(MemoryPropertyStore::new(), ARCHIVER_LOCK_PROPERTY, "n");
        {
            let guard = LockGuard::try_acquire(&lease, MINUTE).unwrap();
            assert!(guard.is_some());
            assert!(LockGuard::try_acquire(&lease, MINUTE).is_err());
        }
        assert!(!lease.is_held());
        assert!(LockGuard::try_acquire(&lease, MINUTE).unwrap().is_some());
    }
}
