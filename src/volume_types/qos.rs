//! QoS / Extra-Specs Resolver
//!
//! Merges a volume type's extra specs with its QoS specs into the flat
//! policy handed to drivers, and builds the front-end QoS block returned in
//! connection info, scaling `*_per_gb` limits by the volume size.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Options that accept per-GB scaling
pub const TUNE_OPTIONS: [&str; 6] = [
    "read_iops_sec",
    "read_bytes_sec",
    "write_iops_sec",
    "write_bytes_sec",
    "total_iops_sec",
    "total_bytes_sec",
];

// =============================================================================
// QoS Specs
// =============================================================================

/// Where QoS limits are enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QosConsumer {
    /// Enforced by the hypervisor; delivered in connection info
    #[serde(rename = "front-end")]
    FrontEnd,
    /// Enforced by the storage backend only
    #[default]
    #[serde(rename = "back-end")]
    BackEnd,
    #[serde(rename = "both")]
    Both,
}

impl QosConsumer {
    /// Whether limits are returned to the attach layer
    pub fn is_front_end(&self) -> bool {
        matches!(self, QosConsumer::FrontEnd | QosConsumer::Both)
    }
}

impl FromStr for QosConsumer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "front-end" => Ok(QosConsumer::FrontEnd),
            "back-end" => Ok(QosConsumer::BackEnd),
            "both" => Ok(QosConsumer::Both),
            other => Err(Error::InvalidInput {
                reason: format!(
                    "invalid QoS consumer '{}', expected front-end, back-end or both",
                    other
                ),
            }),
        }
    }
}

impl std::fmt::Display for QosConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QosConsumer::FrontEnd => write!(f, "front-end"),
            QosConsumer::BackEnd => write!(f, "back-end"),
            QosConsumer::Both => write!(f, "both"),
        }
    }
}

/// Named set of QoS limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QosSpecs {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub consumer: QosConsumer,
    #[serde(default)]
    pub specs: BTreeMap<String, String>,
}

// =============================================================================
// Resolution
// =============================================================================

/// Merge extra specs and QoS specs; QoS values win on key collision
pub fn resolve_policy(
    extra_specs: &BTreeMap<String, String>,
    qos: Option<&QosSpecs>,
) -> BTreeMap<String, String> {
    let mut policy = extra_specs.clone();
    if let Some(qos) = qos {
        for (key, value) in &qos.specs {
            policy.insert(key.clone(), value.clone());
        }
    }
    policy
}

/// QoS block for connection info, or `None` when the specs are back-end only
pub fn front_end_qos(
    qos: Option<&QosSpecs>,
    size_gb: u64,
) -> Result<Option<serde_json::Map<String, serde_json::Value>>> {
    match qos {
        Some(qos) if qos.consumer.is_front_end() => scale_per_gb(&qos.specs, size_gb).map(Some),
        _ => Ok(None),
    }
}

/// Replace every `<opt>_per_gb` with an absolute `<opt>`.
///
/// `effective = min(max(per_gb * size, floor), ceiling)` where the floor is
/// `<opt>_per_gb_min` (or `<opt>_min`) and the ceiling `<opt>_max`. The
/// helper keys are consumed; all other keys pass through as strings.
pub fn scale_per_gb(
    specs: &BTreeMap<String, String>,
    size_gb: u64,
) -> Result<serde_json::Map<String, serde_json::Value>> {
    let mut remaining = specs.clone();
    let mut scaled: BTreeMap<String, u64> = BTreeMap::new();

    for option in TUNE_OPTIONS {
        let per_gb_key = format!("{}_per_gb", option);
        let Some(per_gb) = remaining.remove(&per_gb_key) else {
            continue;
        };
        let per_gb = parse_limit(&per_gb_key, &per_gb)?;

        let floor = take_limit(&mut remaining, &format!("{}_per_gb_min", option))?
            .or(take_limit(&mut remaining, &format!("{}_min", option))?)
            .unwrap_or(0);
        let value = per_gb.saturating_mul(size_gb).max(floor);
        let ceiling = take_limit(&mut remaining, &format!("{}_max", option))?.unwrap_or(value);

        scaled.insert(option.to_string(), value.min(ceiling));
    }

    let mut out = serde_json::Map::new();
    for (key, value) in remaining {
        out.insert(key, serde_json::Value::String(value));
    }
    for (key, value) in scaled {
        out.insert(key, serde_json::Value::from(value));
    }
    Ok(out)
}

fn take_limit(specs: &mut BTreeMap<String, String>, key: &str) -> Result<Option<u64>> {
    specs.remove(key).map(|v| parse_limit(key, &v)).transpose()
}

fn parse_limit(key: &str, value: &str) -> Result<u64> {
    let trimmed = value.trim();
    trimmed
        .parse::<u64>()
        .or_else(|_| {
            trimmed
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| f as u64)
                .ok_or(())
        })
        .map_err(|_| Error::InvalidInput {
            reason: format!("QoS value for {} must be a non-negative number, got '{}'", key, value),
        })
}
