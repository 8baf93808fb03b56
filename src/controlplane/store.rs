//! Resource Store
//!
//! In-memory tables for volumes, attachments, snapshots and backups. Rows
//! are soft-deleted: a deleted row is invisible to lookups but kept for
//! history. Status changes go through [`Table::update`], which applies a
//! closure under the table's write lock.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::domain::model::{Attachment, Backup, Snapshot, Volume};
use crate::error::{Error, Result};

/// A row stored in a [`Table`]
pub trait Record: Clone + Send + Sync {
    fn id(&self) -> &str;

    fn deleted_at(&self) -> Option<DateTime<Utc>>;

    fn set_deleted_at(&mut self, at: DateTime<Utc>);

    fn not_found(id: &str) -> Error;

    fn is_deleted(&self) -> bool {
        self.deleted_at().is_some()
    }
}

impl Record for Volume {
    fn id(&self) -> &str {
        &self.id
    }

    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    fn set_deleted_at(&mut self, at: DateTime<Utc>) {
        self.deleted_at = Some(at);
        self.updated_at = at;
    }

    fn not_found(id: &str) -> Error {
        Error::VolumeNotFound {
            volume_id: id.to_string(),
        }
    }
}

impl Record for Attachment {
    fn id(&self) -> &str {
        &self.id
    }

    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    fn set_deleted_at(&mut self, at: DateTime<Utc>) {
        self.deleted_at = Some(at);
    }

    fn not_found(id: &str) -> Error {
        Error::AttachmentNotFound {
            attachment_id: id.to_string(),
        }
    }
}

impl Record for Snapshot {
    fn id(&self) -> &str {
        &self.id
    }

    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    fn set_deleted_at(&mut self, at: DateTime<Utc>) {
        self.deleted_at = Some(at);
    }

    fn not_found(id: &str) -> Error {
        Error::SnapshotNotFound {
            snapshot_id: id.to_string(),
        }
    }
}

impl Record for Backup {
    fn id(&self) -> &str {
        &self.id
    }

    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    fn set_deleted_at(&mut self, at: DateTime<Utc>) {
        self.deleted_at = Some(at);
    }

    fn not_found(id: &str) -> Error {
        Error::BackupNotFound {
            backup_id: id.to_string(),
        }
    }
}

// =============================================================================
// Table
// =============================================================================

/// One table of records keyed by id
pub struct Table<T: Record> {
    rows: RwLock<BTreeMap<String, T>>,
}

impl<T: Record> Default for Table<T> {
    fn default() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<T: Record> Table<T> {
    pub fn insert(&self, row: T) -> T {
        self.rows.write().insert(row.id().to_string(), row.clone());
        row
    }

    /// Live row by id
    pub fn get(&self, id: &str) -> Result<T> {
        self.rows
            .read()
            .get(id)
            .filter(|r| !r.is_deleted())
            .cloned()
            .ok_or_else(|| T::not_found(id))
    }

    /// Apply `f` to a live row under the write lock and return the new row
    pub fn update<F>(&self, id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut T),
    {
        let mut rows = self.rows.write();
        let row = rows
            .get_mut(id)
            .filter(|r| !r.is_deleted())
            .ok_or_else(|| T::not_found(id))?;
        f(row);
        Ok(row.clone())
    }

    /// Apply `f` only if `expected` holds for the current row
    pub fn update_if<P, F>(&self, id: &str, expected: P, f: F) -> Result<Option<T>>
    where
        P: FnOnce(&T) -> bool,
        F: FnOnce(&mut T),
    {
        let mut rows = self.rows.write();
        let row = rows
            .get_mut(id)
            .filter(|r| !r.is_deleted())
            .ok_or_else(|| T::not_found(id))?;
        if !expected(row) {
            return Ok(None);
        }
        f(row);
        Ok(Some(row.clone()))
    }

    pub fn soft_delete(&self, id: &str) -> Result<T> {
        self.update(id, |row| row.set_deleted_at(Utc::now()))
    }

    /// Live rows matching `filter`, ordered by id
    pub fn list<P>(&self, filter: P) -> Vec<T>
    where
        P: Fn(&T) -> bool,
    {
        self.rows
            .read()
            .values()
            .filter(|r| !r.is_deleted() && filter(r))
            .cloned()
            .collect()
    }

    pub fn count<P>(&self, filter: P) -> usize
    where
        P: Fn(&T) -> bool,
    {
        self.rows
            .read()
            .values()
            .filter(|r| !r.is_deleted() && filter(r))
            .count()
    }
}

// =============================================================================
// Resource Store
// =============================================================================

/// All lifecycle tables
#[derive(Default)]
pub struct ResourceStore {
    pub volumes: Table<Volume>,
    pub attachments: Table<Attachment>,
    pub snapshots: Table<Snapshot>,
    pub backups: Table<Backup>,
}

impl ResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live attachments of a volume
    pub fn attachments_for(&self, volume_id: &str) -> Vec<Attachment> {
        self.attachments.list(|a| a.volume_id == volume_id)
    }

    /// Live snapshots of a volume
    pub fn snapshots_for(&self, volume_id: &str) -> Vec<Snapshot> {
        self.snapshots.list(|s| s.volume_id == volume_id)
    }
}
