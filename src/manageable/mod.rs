//! Manage-Existing / List-Manageable Helper
//!
//! Drivers describe their backend objects; this module classifies them as
//! safe or unsafe to manage and applies sorting and pagination, so every
//! driver answers list-manageable calls the same way.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::domain::ports::{
    ExistingRef, ManageableDescriptor, ManageableQuery, SortDir, SortKey,
};
use crate::error::{Error, Result};

/// Reason given for objects that already back a volume or snapshot
pub const REASON_ALREADY_MANAGED: &str = "Already managed";

/// Reason given for objects that are attached or open
pub const REASON_IN_USE: &str = "Volume in use";

/// Backend object as reported by a driver
#[derive(Debug, Clone)]
pub struct BackendObject {
    pub reference: ExistingRef,
    /// Size in GB
    pub size: u64,
    /// Whether the backend reports the object open or exported
    pub in_use: bool,
    /// Resource id the object belongs to, derived from its backend name
    pub cinder_id: Option<String>,
    pub extra_info: Option<String>,
}

// =============================================================================
// Validation
// =============================================================================

/// A reference must be non-empty and name the object by source-name or source-id
pub fn validate_reference(reference: &ExistingRef) -> Result<()> {
    if reference.is_empty() {
        return Err(Error::ManageExistingInvalidReference {
            reference: reference.to_string(),
            reason: "reference must not be empty".to_string(),
        });
    }
    if reference.identifier().is_none() {
        return Err(Error::ManageExistingInvalidReference {
            reference: reference.to_string(),
            reason: "reference must contain source-name or source-id".to_string(),
        });
    }
    Ok(())
}

/// Parse user supplied sort keys; only `size` and `reference` are accepted
pub fn parse_sort_keys(keys: &[String]) -> Result<Vec<SortKey>> {
    keys.iter()
        .map(|key| match key.trim() {
            "size" => Ok(SortKey::Size),
            "reference" => Ok(SortKey::Reference),
            other => Err(Error::InvalidInput {
                reason: format!("invalid sort key {}, expected size or reference", other),
            }),
        })
        .collect()
}

pub fn parse_sort_dirs(dirs: &[String]) -> Result<Vec<SortDir>> {
    dirs.iter()
        .map(|dir| match dir.trim() {
            "asc" => Ok(SortDir::Asc),
            "desc" => Ok(SortDir::Desc),
            other => Err(Error::InvalidInput {
                reason: format!("invalid sort dir {}, expected asc or desc", other),
            }),
        })
        .collect()
}

// =============================================================================
// Classification
// =============================================================================

/// Build descriptors, marking managed and in-use objects unsafe
pub fn classify_manageable(
    objects: Vec<BackendObject>,
    managed_ids: &HashSet<String>,
) -> Vec<ManageableDescriptor> {
    objects
        .into_iter()
        .map(|object| {
            let managed = object
                .cinder_id
                .as_ref()
                .filter(|id| managed_ids.contains(*id))
                .cloned();

            let (safe, reason) = if managed.is_some() {
                (false, Some(REASON_ALREADY_MANAGED.to_string()))
            } else if object.in_use {
                (false, Some(REASON_IN_USE.to_string()))
            } else {
                (true, None)
            };

            ManageableDescriptor {
                reference: object.reference,
                size: object.size,
                safe_to_manage: safe,
                reason_not_safe: reason,
                cinder_id: managed,
                extra_info: object.extra_info,
            }
        })
        .collect()
}

// =============================================================================
// Sorting and Pagination
// =============================================================================

fn compare_key(a: &ManageableDescriptor, b: &ManageableDescriptor, key: SortKey) -> Ordering {
    match key {
        SortKey::Size => a.size.cmp(&b.size),
        SortKey::Reference => a.reference.sort_value().cmp(&b.reference.sort_value()),
    }
}

/// Sort by the composite key, then apply marker, offset and limit.
///
/// Without sort keys the input order is kept. Missing directions default
/// to ascending. The marker must be the reference of an entry.
pub fn paginate_entries(
    entries: Vec<ManageableDescriptor>,
    query: &ManageableQuery,
) -> Result<Vec<ManageableDescriptor>> {
    let mut entries = entries;

    if !query.sort_keys.is_empty() {
        let comparers: Vec<(SortKey, SortDir)> = query
            .sort_keys
            .iter()
            .enumerate()
            .map(|(i, key)| (*key, query.sort_dirs.get(i).copied().unwrap_or_default()))
            .collect();

        entries.sort_by(|a, b| {
            for (key, dir) in &comparers {
                let ord = compare_key(a, b, *key);
                if ord != Ordering::Equal {
                    return match dir {
                        SortDir::Asc => ord,
                        SortDir::Desc => ord.reverse(),
                    };
                }
            }
            Ordering::Equal
        });
    }

    let mut start = 0;
    if let Some(ref marker) = query.marker {
        start = entries
            .iter()
            .position(|e| e.reference == *marker)
            .map(|i| i + 1)
            .ok_or_else(|| Error::InvalidInput {
                reason: format!("marker not found: {}", marker),
            })?;
    }

    Ok(entries
        .into_iter()
        .skip(start + query.offset)
        .take(query.limit.unwrap_or(usize::MAX))
        .collect())
}

/// Classify and paginate in one step, as drivers do
pub fn list_manageable(
    objects: Vec<BackendObject>,
    managed_ids: &HashSet<String>,
    query: &ManageableQuery,
) -> Result<Vec<ManageableDescriptor>> {
    paginate_entries(classify_manageable(objects, managed_ids), query)
}
