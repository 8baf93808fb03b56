//! Resource Lock Manager
//!
//! Mutual exclusion keyed by `(scope, id)`. Operations on the same resource
//! are serialized; different resources proceed in parallel. Guards are held
//! across driver calls, so the mutexes are async.
//!
//! Multi-resource operations take their locks through [`ResourceLocks::lock_all`],
//! which acquires in [`LockScope`] order (volume, snapshot, attachment,
//! backup) and then by id, so two operations never wait on each other in
//! opposite order.

use dashmap::DashMap;
use prometheus::IntGauge;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Kind of resource a lock protects; the derive order is the acquisition order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockScope {
    Volume,
    Snapshot,
    Attachment,
    Backup,
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockScope::Volume => write!(f, "volume"),
            LockScope::Snapshot => write!(f, "snapshot"),
            LockScope::Attachment => write!(f, "attachment"),
            LockScope::Backup => write!(f, "backup"),
        }
    }
}

/// Lock key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    pub scope: LockScope,
    pub id: String,
}

impl ResourceKey {
    pub fn new(scope: LockScope, id: impl Into<String>) -> Self {
        Self {
            scope,
            id: id.into(),
        }
    }

    pub fn volume(id: impl Into<String>) -> Self {
        Self::new(LockScope::Volume, id)
    }

    pub fn snapshot(id: impl Into<String>) -> Self {
        Self::new(LockScope::Snapshot, id)
    }

    pub fn attachment(id: impl Into<String>) -> Self {
        Self::new(LockScope::Attachment, id)
    }

    pub fn backup(id: impl Into<String>) -> Self {
        Self::new(LockScope::Backup, id)
    }

    /// Backend object being brought under management as a new volume
    pub fn manage_reference(backend: &str, identifier: &str) -> Self {
        Self::volume(format!("{}/{}", backend, identifier))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.scope, self.id)
    }
}

type LockTable = DashMap<ResourceKey, Arc<Mutex<()>>>;

// =============================================================================
// Guard
// =============================================================================

/// Held lock on one resource; released on drop
pub struct ResourceGuard {
    key: ResourceKey,
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<LockTable>,
    gauge: Option<IntGauge>,
}

impl ResourceGuard {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }
}

impl fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGuard").field("key", &self.key).finish()
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the table still references an idle mutex
        self.table
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
        if let Some(ref gauge) = self.gauge {
            gauge.dec();
        }
        debug!("Released lock on {}", self.key);
    }
}

// =============================================================================
// Lock Manager
// =============================================================================

/// Per-resource lock table
#[derive(Clone)]
pub struct ResourceLocks {
    table: Arc<LockTable>,
    timeout: Option<Duration>,
    gauge: Option<IntGauge>,
}

impl ResourceLocks {
    /// Locks that wait indefinitely
    pub fn new() -> Self {
        Self {
            table: Arc::new(DashMap::new()),
            timeout: None,
            gauge: None,
        }
    }

    /// Fail with `ResourceBusy` when a lock is not acquired within `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Track the number of held locks in `gauge`
    pub fn with_gauge(mut self, gauge: IntGauge) -> Self {
        self.gauge = Some(gauge);
        self
    }

    fn mutex_for(&self, key: &ResourceKey) -> Arc<Mutex<()>> {
        self.table
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn guard(&self, key: ResourceKey, guard: OwnedMutexGuard<()>) -> ResourceGuard {
        if let Some(ref gauge) = self.gauge {
            gauge.inc();
        }
        debug!("Acquired lock on {}", key);
        ResourceGuard {
            key,
            guard: Some(guard),
            table: self.table.clone(),
            gauge: self.gauge.clone(),
        }
    }

    /// Wait for the lock on one resource
    pub async fn lock(&self, key: ResourceKey) -> Result<ResourceGuard> {
        let mutex = self.mutex_for(&key);
        let guard = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, mutex.lock_owned()).await {
                Ok(guard) => guard,
                Err(_) => {
                    warn!("Timed out after {:?} waiting for lock on {}", timeout, key);
                    return Err(Error::ResourceBusy {
                        resource: key.to_string(),
                    });
                }
            },
            None => mutex.lock_owned().await,
        };
        Ok(self.guard(key, guard))
    }

    /// Take the lock only if it is free
    pub fn try_lock(&self, key: ResourceKey) -> Result<ResourceGuard> {
        let mutex = self.mutex_for(&key);
        match mutex.try_lock_owned() {
            Ok(guard) => Ok(self.guard(key, guard)),
            Err(_) => Err(Error::ResourceBusy {
                resource: key.to_string(),
            }),
        }
    }

    /// Lock several resources in canonical order; duplicates are locked once
    pub async fn lock_all(&self, keys: Vec<ResourceKey>) -> Result<Vec<ResourceGuard>> {
        let mut keys = keys;
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(key).await?);
        }
        Ok(guards)
    }

    /// Whether someone holds the lock on `key`
    pub fn is_locked(&self, key: &ResourceKey) -> bool {
        self.table
            .get(key)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of lock entries currently tracked
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Default for ResourceLocks {
    fn default() -> Self {
        Self::new()
    }
}
