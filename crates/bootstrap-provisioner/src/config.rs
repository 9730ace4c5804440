//! Provisioning configuration
//!
//! The installer writes its Terraform variables as JSON files. They are merged
//! key by key in order, later files overriding earlier ones, then decoded into
//! a [`ProvisioningConfig`] and validated before any hypervisor call is made.

use crate::error::ConfigError;
use crate::names::BootstrapNames;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

pub const DEFAULT_MEMORY_MIB: u64 = 20480;
pub const DEFAULT_VCPUS: u32 = 4;
/// 32 GiB
pub const DEFAULT_DISK_BYTES: u64 = 34_359_738_368;
pub const DEFAULT_POOL_DIR: &str = "/var/lib/libvirt/openshift-images";

/// Host bridge the bootstrap VM attaches to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bridge {
    pub name: String,
    /// MAC address pinned on the VM's interface
    pub mac: String,
}

/// Input of one bootstrap run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    pub cluster_id: String,
    /// Path or URL of the bootstrap OS image
    pub bootstrap_os_image: String,
    /// Serialized Ignition config
    pub ignition_bootstrap: String,
    pub libvirt_uri: String,
    #[serde(default)]
    pub bridges: Vec<Bridge>,
    #[serde(default = "default_memory_mib")]
    pub bootstrap_memory_mib: u64,
    #[serde(default = "default_vcpus")]
    pub bootstrap_vcpus: u32,
    #[serde(default = "default_disk_bytes")]
    pub bootstrap_disk_bytes: u64,
    /// Parent directory of the storage pool
    #[serde(default = "default_pool_dir")]
    pub bootstrap_pool_dir: String,
}

fn default_memory_mib() -> u64 {
    DEFAULT_MEMORY_MIB
}

fn default_vcpus() -> u32 {
    DEFAULT_VCPUS
}

fn default_disk_bytes() -> u64 {
    DEFAULT_DISK_BYTES
}

fn default_pool_dir() -> String {
    DEFAULT_POOL_DIR.to_string()
}

impl ProvisioningConfig {
    /// Load, merge and validate Terraform variable files
    pub fn from_var_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self, ConfigError> {
        let merged = merge_var_files(paths)?;
        Self::from_value(Value::Object(merged))
    }

    /// Decode and validate already merged variables
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let config: ProvisioningConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the config before touching the hypervisor
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_cluster_id(&self.cluster_id)?;
        require_non_empty("bootstrap_os_image", &self.bootstrap_os_image)?;
        require_non_empty("ignition_bootstrap", &self.ignition_bootstrap)?;
        validate_uri(&self.libvirt_uri)?;

        if self.bootstrap_memory_mib == 0 {
            return Err(ConfigError::invalid("bootstrap_memory_mib", "must be positive"));
        }
        if self.bootstrap_vcpus == 0 {
            return Err(ConfigError::invalid("bootstrap_vcpus", "must be positive"));
        }
        if self.bootstrap_disk_bytes == 0 {
            return Err(ConfigError::invalid("bootstrap_disk_bytes", "must be positive"));
        }
        if !self.bootstrap_pool_dir.starts_with('/') {
            return Err(ConfigError::invalid("bootstrap_pool_dir", "must be an absolute path"));
        }

        for (index, bridge) in self.bridges.iter().enumerate() {
            if bridge.name.trim().is_empty() {
                return Err(ConfigError::invalid(format!("bridges[{}].name", index), "must not be empty"));
            }
            if !is_valid_mac(&bridge.mac) {
                return Err(ConfigError::invalid(
                    format!("bridges[{}].mac", index),
                    format!("'{}' is not a MAC address", bridge.mac),
                ));
            }
        }
        Ok(())
    }

    /// Names of the resources this config provisions
    pub fn names(&self) -> BootstrapNames {
        BootstrapNames::new(&self.cluster_id)
    }

    /// Directory backing the storage pool
    pub fn pool_path(&self) -> String {
        format!(
            "{}/{}",
            self.bootstrap_pool_dir.trim_end_matches('/'),
            self.names().pool
        )
    }
}

/// Merge JSON variable files into one object; later files win per key
pub fn merge_var_files<P: AsRef<Path>>(paths: &[P]) -> Result<Map<String, Value>, ConfigError> {
    let mut merged = Map::new();
    for path in paths {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let value: Value = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        match value {
            Value::Object(map) => merged.extend(map),
            _ => return Err(ConfigError::NotAnObject(path.to_path_buf())),
        }
    }
    Ok(merged)
}

/// Check that a cluster ID can prefix pool, volume and domain names
pub fn validate_cluster_id(cluster_id: &str) -> Result<(), ConfigError> {
    require_non_empty("cluster_id", cluster_id)?;
    if cluster_id.contains('/') {
        return Err(ConfigError::invalid("cluster_id", "must not contain '/'"));
    }
    Ok(())
}

/// Check that a libvirt connection URI parses and names a driver scheme
pub fn validate_uri(uri: &str) -> Result<(), ConfigError> {
    if uri.trim().is_empty() {
        return Err(ConfigError::invalid("libvirt_uri", "must not be empty"));
    }
    let parsed = reqwest::Url::parse(uri)
        .map_err(|e| ConfigError::invalid("libvirt_uri", format!("'{}': {}", uri, e)))?;
    if parsed.scheme().is_empty() {
        return Err(ConfigError::invalid("libvirt_uri", format!("'{}' has no scheme", uri)));
    }
    Ok(())
}

/// Colon-separated, six two-digit hex groups
pub fn is_valid_mac(mac: &str) -> bool {
    let groups: Vec<&str> = mac.split(':').collect();
    groups.len() == 6
        && groups
            .iter()
            .all(|group| group.len() == 2 && group.chars().all(|c| c.is_ascii_hexdigit()))
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::invalid(field, "must not be empty"))
    } else {
        Ok(())
    }
}
