//! Volume Type Registry
//!
//! Holds volume types, their extra specs and QoS specs associations. The
//! configured default type always exists and cannot be deleted.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use super::qos::{resolve_policy, QosConsumer, QosSpecs};
use crate::domain::model::new_id;
use crate::error::{Error, Result};

/// Name Cinder gives its built-in default type
pub const DEFAULT_VOLUME_TYPE_NAME: &str = "__DEFAULT__";

/// A volume type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeType {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub is_public: bool,
    #[serde(default)]
    pub extra_specs: BTreeMap<String, String>,
    pub qos_specs_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Registry of volume types and QoS specs
pub struct VolumeTypeRegistry {
    types: RwLock<IndexMap<String, VolumeType>>,
    qos_specs: RwLock<IndexMap<String, QosSpecs>>,
    default_type_id: String,
}

impl VolumeTypeRegistry {
    /// Create a registry holding a default type named `default_name`
    pub fn new(default_name: &str) -> Self {
        let default_type = VolumeType {
            id: new_id(),
            name: default_name.to_string(),
            description: Some("Default Volume Type".to_string()),
            is_public: true,
            extra_specs: BTreeMap::new(),
            qos_specs_id: None,
            created_at: Utc::now(),
        };
        let default_type_id = default_type.id.clone();
        let mut types = IndexMap::new();
        types.insert(default_type.id.clone(), default_type);

        Self {
            types: RwLock::new(types),
            qos_specs: RwLock::new(IndexMap::new()),
            default_type_id,
        }
    }

    // =========================================================================
    // Volume Types
    // =========================================================================

    pub fn create(
        &self,
        name: &str,
        extra_specs: BTreeMap<String, String>,
        description: Option<String>,
    ) -> Result<VolumeType> {
        let mut types = self.types.write();
        if types.values().any(|t| t.name == name) {
            return Err(Error::VolumeTypeExists {
                name: name.to_string(),
            });
        }
        let vtype = VolumeType {
            id: new_id(),
            name: name.to_string(),
            description,
            is_public: true,
            extra_specs,
            qos_specs_id: None,
            created_at: Utc::now(),
        };
        types.insert(vtype.id.clone(), vtype.clone());
        info!("Created volume type {} ({})", vtype.name, vtype.id);
        Ok(vtype)
    }

    pub fn get(&self, type_id: &str) -> Result<VolumeType> {
        self.types
            .read()
            .get(type_id)
            .cloned()
            .ok_or_else(|| Error::VolumeTypeNotFound {
                type_id: type_id.to_string(),
            })
    }

    pub fn get_by_name(&self, name: &str) -> Result<VolumeType> {
        self.types
            .read()
            .values()
            .find(|t| t.name == name)
            .cloned()
            .ok_or_else(|| Error::VolumeTypeNotFound {
                type_id: name.to_string(),
            })
    }

    /// Look a type up by id, falling back to name
    pub fn find(&self, name_or_id: &str) -> Result<VolumeType> {
        self.get(name_or_id).or_else(|_| self.get_by_name(name_or_id))
    }

    pub fn default_type(&self) -> Result<VolumeType> {
        self.get(&self.default_type_id)
    }

    pub fn list(&self) -> Vec<VolumeType> {
        self.types.read().values().cloned().collect()
    }

    /// Delete a type; the default type and referenced types are refused
    pub fn delete(&self, type_id: &str, referenced: bool) -> Result<()> {
        let mut types = self.types.write();
        let vtype = types.get(type_id).ok_or_else(|| Error::VolumeTypeNotFound {
            type_id: type_id.to_string(),
        })?;
        if type_id == self.default_type_id {
            return Err(Error::VolumeTypeInUse {
                name: vtype.name.clone(),
                reason: "the default volume type cannot be deleted".to_string(),
            });
        }
        if referenced {
            return Err(Error::VolumeTypeInUse {
                name: vtype.name.clone(),
                reason: "volumes still reference this type".to_string(),
            });
        }
        types.shift_remove(type_id);
        info!("Deleted volume type {}", type_id);
        Ok(())
    }

    pub fn set_extra_specs(
        &self,
        type_id: &str,
        specs: BTreeMap<String, String>,
    ) -> Result<VolumeType> {
        let mut types = self.types.write();
        let vtype = types.get_mut(type_id).ok_or_else(|| Error::VolumeTypeNotFound {
            type_id: type_id.to_string(),
        })?;
        vtype.extra_specs.extend(specs);
        Ok(vtype.clone())
    }

    pub fn unset_extra_spec(&self, type_id: &str, key: &str) -> Result<VolumeType> {
        let mut types = self.types.write();
        let vtype = types.get_mut(type_id).ok_or_else(|| Error::VolumeTypeNotFound {
            type_id: type_id.to_string(),
        })?;
        if vtype.extra_specs.remove(key).is_none() {
            return Err(Error::InvalidInput {
                reason: format!("volume type {} has no extra spec {}", type_id, key),
            });
        }
        Ok(vtype.clone())
    }

    // =========================================================================
    // QoS Specs
    // =========================================================================

    pub fn create_qos(
        &self,
        name: &str,
        consumer: QosConsumer,
        specs: BTreeMap<String, String>,
    ) -> Result<QosSpecs> {
        let mut all = self.qos_specs.write();
        if all.values().any(|q| q.name == name) {
            return Err(Error::InvalidInput {
                reason: format!("QoS specs {} already exist", name),
            });
        }
        let qos = QosSpecs {
            id: new_id(),
            name: name.to_string(),
            consumer,
            specs,
        };
        all.insert(qos.id.clone(), qos.clone());
        info!("Created QoS specs {} ({}, consumer {})", qos.name, qos.id, qos.consumer);
        Ok(qos)
    }

    pub fn get_qos(&self, qos_id: &str) -> Result<QosSpecs> {
        self.qos_specs
            .read()
            .get(qos_id)
            .cloned()
            .ok_or_else(|| Error::QosSpecsNotFound {
                qos_id: qos_id.to_string(),
            })
    }

    pub fn list_qos(&self) -> Vec<QosSpecs> {
        self.qos_specs.read().values().cloned().collect()
    }

    pub fn associate_qos(&self, type_id: &str, qos_id: &str) -> Result<()> {
        self.get_qos(qos_id)?;
        let mut types = self.types.write();
        let vtype = types.get_mut(type_id).ok_or_else(|| Error::VolumeTypeNotFound {
            type_id: type_id.to_string(),
        })?;
        if let Some(ref current) = vtype.qos_specs_id {
            if current != qos_id {
                return Err(Error::InvalidInput {
                    reason: format!(
                        "volume type {} is already associated with QoS specs {}",
                        type_id, current
                    ),
                });
            }
        }
        vtype.qos_specs_id = Some(qos_id.to_string());
        info!("Associated QoS specs {} with volume type {}", qos_id, type_id);
        Ok(())
    }

    pub fn disassociate_qos(&self, type_id: &str) -> Result<()> {
        let mut types = self.types.write();
        let vtype = types.get_mut(type_id).ok_or_else(|| Error::VolumeTypeNotFound {
            type_id: type_id.to_string(),
        })?;
        vtype.qos_specs_id = None;
        Ok(())
    }

    /// QoS specs of a type, if associated
    pub fn qos_for_type(&self, type_id: &str) -> Result<Option<QosSpecs>> {
        let vtype = self.get(type_id)?;
        vtype.qos_specs_id.map(|id| self.get_qos(&id)).transpose()
    }

    /// Flat policy of a type: extra specs overlaid with QoS specs
    pub fn resolve_policy(&self, type_id: &str) -> Result<BTreeMap<String, String>> {
        let vtype = self.get(type_id)?;
        let qos = self.qos_for_type(type_id)?;
        Ok(resolve_policy(&vtype.extra_specs, qos.as_ref()))
    }
}

impl Default for VolumeTypeRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_VOLUME_TYPE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn specs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_type_exists() {
        let registry = VolumeTypeRegistry::default();
        let default = registry.default_type().unwrap();
        assert_eq!(default.name, DEFAULT_VOLUME_TYPE_NAME);
        assert_matches!(
            registry.delete(&default.id, false),
            Err(Error::VolumeTypeInUse { .. })
        );
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_create_duplicate_and_delete() {
        let registry = VolumeTypeRegistry::default();
        let gold = registry.create("gold", BTreeMap::new(), None).unwrap();
        assert_matches!(
            registry.create("gold", BTreeMap::new(), None),
            Err(Error::VolumeTypeExists { .. })
        );
        assert_matches!(registry.delete(&gold.id, true), Err(Error::VolumeTypeInUse { .. }));
        registry.delete(&gold.id, false).unwrap();
        assert!(registry.get(&gold.id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_extra_specs_and_qos_policy() {
        let registry = VolumeTypeRegistry::default();
        let gold = registry
            .create("gold", specs(&[("k", "1"), ("thin", "true")]), None)
            .unwrap();
        let qos = registry
            .create_qos("fast", QosConsumer::Both, specs(&[("k", "2")]))
            .unwrap();
        registry.associate_qos(&gold.id, &qos.id).unwrap();

        let policy = registry.resolve_policy(&gold.id).unwrap();
        assert_eq!(policy.get("k").map(String::as_str), Some("2"));
        assert_eq!(policy.get("thin").map(String::as_str), Some("true"));

        registry.disassociate_qos(&gold.id).unwrap();
        let policy = registry.resolve_policy(&gold.id).unwrap();
        assert_eq!(policy.get("k").map(String::as_str), Some("1"));

        registry.unset_extra_spec(&gold.id, "thin").unwrap();
        assert!(registry.unset_extra_spec(&gold.id, "thin").is_err());
        assert_eq!(registry.find("gold").unwrap().id, gold.id);
    }
}
