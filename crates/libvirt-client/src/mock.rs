//! Mock hypervisor for unit testing
//!
//! This module provides an in-memory implementation of `Hypervisor` that can be
//! used in unit tests without requiring a running libvirtd. It follows the
//! state rules libvirt enforces for directory pools (volumes need an active
//! pool, refresh needs an active pool, a pool directory must be empty before
//! it is deleted, ...), records every call and supports error injection.

use crate::domain::DomainDefinition;
use crate::error::{ErrorCode, HypervisorError};
use crate::hypervisor_trait::{Hypervisor, VolumeWriter};
use crate::models::*;
use crate::xml::XmlWriter;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Storage pool held by the mock
#[derive(Debug, Clone)]
pub struct MockPool {
    pub definition: StoragePoolDefinition,
    pub built: bool,
    pub active: bool,
    pub autostart: bool,
    pub volumes: BTreeMap<String, MockVolume>,
}

/// Storage volume held by the mock
#[derive(Debug, Clone)]
pub struct MockVolume {
    pub definition: StorageVolumeDefinition,
    pub path: String,
    pub data: Vec<u8>,
    pub mtime: SystemTime,
}

/// Domain held by the mock
#[derive(Debug, Clone)]
pub struct MockDomain {
    pub definition: DomainDefinition,
    pub active: bool,
}

/// Mock hypervisor for testing
#[derive(Clone)]
pub struct MockHypervisor {
    uri: String,
    arch: Arc<Mutex<String>>,
    pools: Arc<Mutex<HashMap<String, MockPool>>>,
    domains: Arc<Mutex<HashMap<String, MockDomain>>>,
    // One-shot errors per operation, consumed in order
    failures: Arc<Mutex<HashMap<String, VecDeque<(ErrorCode, String)>>>>,
    // Errors returned on every call of an operation
    persistent_failures: Arc<Mutex<HashMap<String, (ErrorCode, String)>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockHypervisor {
    /// Create a new mock on an x86_64 host
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            arch: Arc::new(Mutex::new("x86_64".to_string())),
            pools: Arc::new(Mutex::new(HashMap::new())),
            domains: Arc::new(Mutex::new(HashMap::new())),
            failures: Arc::new(Mutex::new(HashMap::new())),
            persistent_failures: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Set the host architecture reported by `capabilities`
    pub fn set_arch(&self, arch: impl Into<String>) {
        *self.arch.lock().unwrap() = arch.into();
    }

    /// Make the next call of `operation` fail with `code`
    ///
    /// Operations are named after the virsh commands (`pool-define`,
    /// `vol-dumpxml`, `undefine`, ...).
    pub fn fail_next(&self, operation: &str, code: ErrorCode, message: impl Into<String>) {
        self.failures
            .lock()
            .unwrap()
            .entry(operation.to_string())
            .or_default()
            .push_back((code, message.into()));
    }

    /// Make every call of `operation` fail with `code`
    pub fn fail_always(&self, operation: &str, code: ErrorCode, message: impl Into<String>) {
        self.persistent_failures
            .lock()
            .unwrap()
            .insert(operation.to_string(), (code, message.into()));
    }

    /// Stop failing `operation`
    pub fn clear_failures(&self, operation: &str) {
        self.failures.lock().unwrap().remove(operation);
        self.persistent_failures.lock().unwrap().remove(operation);
    }

    /// Every call made so far, formatted like a virsh command line
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls of one operation
    pub fn calls_for(&self, operation: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.split_whitespace().next() == Some(operation))
            .collect()
    }

    /// Snapshot of a pool
    pub fn pool(&self, name: &str) -> Option<MockPool> {
        self.pools.lock().unwrap().get(name).cloned()
    }

    /// Snapshot of a volume
    pub fn volume(&self, pool: &str, name: &str) -> Option<MockVolume> {
        self.pools
            .lock()
            .unwrap()
            .get(pool)
            .and_then(|p| p.volumes.get(name).cloned())
    }

    /// Snapshot of a domain
    pub fn domain(&self, name: &str) -> Option<MockDomain> {
        self.domains.lock().unwrap().get(name).cloned()
    }

    /// Override a volume's recorded modification time (for test setup)
    pub fn set_volume_mtime(&self, pool: &str, name: &str, mtime: SystemTime) {
        if let Some(volume) = self
            .pools
            .lock()
            .unwrap()
            .get_mut(pool)
            .and_then(|p| p.volumes.get_mut(name))
        {
            volume.mtime = mtime;
        }
    }

    /// Record a call and return any injected failure
    fn record(&self, operation: &str, args: &[&str]) -> Result<(), HypervisorError> {
        let mut line = operation.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        self.calls.lock().unwrap().push(line);

        if let Some((code, message)) = self
            .failures
            .lock()
            .unwrap()
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            return Err(HypervisorError::with_code(code, message));
        }
        if let Some((code, message)) = self.persistent_failures.lock().unwrap().get(operation) {
            return Err(HypervisorError::with_code(*code, message.clone()));
        }
        Ok(())
    }

    fn no_pool(name: &str) -> HypervisorError {
        HypervisorError::with_code(
            ErrorCode::NoStoragePool,
            format!("Storage pool not found: no storage pool with matching name '{}'", name),
        )
    }

    fn no_volume(name: &str) -> HypervisorError {
        HypervisorError::with_code(
            ErrorCode::NoStorageVol,
            format!("Storage volume not found: no storage vol with matching name '{}'", name),
        )
    }

    fn no_domain(name: &str) -> HypervisorError {
        HypervisorError::with_code(
            ErrorCode::NoDomain,
            format!("Domain not found: no domain with matching name '{}'", name),
        )
    }

    fn with_pool<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut MockPool) -> Result<T, HypervisorError>,
    ) -> Result<T, HypervisorError> {
        let mut pools = self.pools.lock().unwrap();
        let pool = pools.get_mut(name).ok_or_else(|| Self::no_pool(name))?;
        f(pool)
    }

    fn with_volume<T>(
        &self,
        pool: &str,
        name: &str,
        f: impl FnOnce(&mut MockVolume) -> Result<T, HypervisorError>,
    ) -> Result<T, HypervisorError> {
        self.with_pool(pool, |p| {
            let volume = p.volumes.get_mut(name).ok_or_else(|| Self::no_volume(name))?;
            f(volume)
        })
    }

    fn describe(volume: &MockVolume) -> VolumeDescription {
        VolumeDescription {
            name: volume.definition.name.clone(),
            path: volume.path.clone(),
            format: volume.definition.format.as_str().to_string(),
            capacity: Some(volume.definition.capacity),
            physical: Some(volume.data.len() as u64),
            backing_store: volume.definition.backing_store.clone(),
            mtime: Some(volume.mtime),
        }
    }

    fn volume_to_xml(volume: &MockVolume) -> String {
        let capacity = volume.definition.capacity.to_string();
        let physical = volume.data.len().to_string();
        let mtime = format_epoch_timestamp(volume.mtime);
        let mut xml = XmlWriter::new();
        xml.open("volume", &[("type", "file")]);
        xml.text("name", &[], &volume.definition.name);
        xml.text("key", &[], &volume.path);
        xml.text("capacity", &[("unit", "bytes")], &capacity);
        xml.text("physical", &[("unit", "bytes")], &physical);
        xml.open("target", &[]);
        xml.text("path", &[], &volume.path);
        xml.empty("format", &[("type", volume.definition.format.as_str())]);
        xml.open("timestamps", &[]);
        xml.text("mtime", &[], &mtime);
        xml.close("timestamps");
        xml.close("target");
        if let Some(backing) = &volume.definition.backing_store {
            xml.open("backingStore", &[]);
            xml.text("path", &[], &backing.path);
            xml.empty("format", &[("type", backing.format.as_str())]);
            xml.close("backingStore");
        }
        xml.close("volume");
        xml.finish()
    }
}

#[async_trait::async_trait]
impl Hypervisor for MockHypervisor {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn capabilities(&self) -> Result<HostCapabilities, HypervisorError> {
        self.record("capabilities", &[])?;
        Ok(HostCapabilities {
            arch: self.arch.lock().unwrap().clone(),
        })
    }

    async fn lookup_pool(&self, name: &str) -> Result<Option<PoolInfo>, HypervisorError> {
        self.record("pool-info", &[name])?;
        Ok(self.pools.lock().unwrap().get(name).map(|pool| PoolInfo {
            name: name.to_string(),
            active: pool.active,
            autostart: pool.autostart,
        }))
    }

    async fn define_pool(&self, pool: &StoragePoolDefinition) -> Result<(), HypervisorError> {
        self.record("pool-define", &[pool.name.as_str()])?;
        let mut pools = self.pools.lock().unwrap();
        if pools.contains_key(&pool.name) {
            return Err(HypervisorError::with_code(
                ErrorCode::OperationFailed,
                format!("operation failed: pool '{}' already exists", pool.name),
            ));
        }
        pools.insert(
            pool.name.clone(),
            MockPool {
                definition: pool.clone(),
                built: false,
                active: false,
                autostart: false,
                volumes: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn build_pool(&self, name: &str) -> Result<(), HypervisorError> {
        self.record("pool-build", &[name])?;
        self.with_pool(name, |pool| {
            pool.built = true;
            Ok(())
        })
    }

    async fn set_pool_autostart(&self, name: &str, autostart: bool) -> Result<(), HypervisorError> {
        if autostart {
            self.record("pool-autostart", &[name])?;
        } else {
            self.record("pool-autostart", &[name, "--disable"])?;
        }
        self.with_pool(name, |pool| {
            pool.autostart = autostart;
            Ok(())
        })
    }

    async fn start_pool(&self, name: &str) -> Result<(), HypervisorError> {
        self.record("pool-start", &[name])?;
        self.with_pool(name, |pool| {
            if pool.active {
                return Err(HypervisorError::with_code(
                    ErrorCode::OperationInvalid,
                    format!("Requested operation is not valid: storage pool '{}' is already active", name),
                ));
            }
            pool.active = true;
            Ok(())
        })
    }

    async fn refresh_pool(&self, name: &str) -> Result<(), HypervisorError> {
        self.record("pool-refresh", &[name])?;
        self.with_pool(name, |pool| {
            if !pool.active {
                return Err(HypervisorError::with_code(
                    ErrorCode::OperationInvalid,
                    format!("Requested operation is not valid: storage pool '{}' is not active", name),
                ));
            }
            Ok(())
        })
    }

    async fn destroy_pool(&self, name: &str) -> Result<(), HypervisorError> {
        self.record("pool-destroy", &[name])?;
        self.with_pool(name, |pool| {
            if !pool.active {
                return Err(HypervisorError::with_code(
                    ErrorCode::OperationInvalid,
                    format!("Requested operation is not valid: storage pool '{}' is not active", name),
                ));
            }
            pool.active = false;
            Ok(())
        })
    }

    async fn delete_pool(&self, name: &str) -> Result<(), HypervisorError> {
        self.record("pool-delete", &[name])?;
        self.with_pool(name, |pool| {
            if pool.active {
                return Err(HypervisorError::with_code(
                    ErrorCode::OperationInvalid,
                    format!("Requested operation is not valid: storage pool '{}' is still active", name),
                ));
            }
            if !pool.volumes.is_empty() {
                return Err(HypervisorError::with_code(
                    ErrorCode::OperationFailed,
                    format!("operation failed: cannot remove directory '{}': Directory not empty", pool.definition.path),
                ));
            }
            pool.built = false;
            Ok(())
        })
    }

    async fn undefine_pool(&self, name: &str) -> Result<(), HypervisorError> {
        self.record("pool-undefine", &[name])?;
        let mut pools = self.pools.lock().unwrap();
        match pools.get(name).map(|pool| pool.active) {
            None => Err(Self::no_pool(name)),
            Some(true) => Err(HypervisorError::with_code(
                ErrorCode::OperationInvalid,
                format!("Requested operation is not valid: storage pool '{}' is still active", name),
            )),
            Some(false) => {
                pools.remove(name);
                Ok(())
            }
        }
    }

    async fn lookup_volume(&self, pool: &str, name: &str) -> Result<Option<VolumeDescription>, HypervisorError> {
        self.record("vol-info", &["--pool", pool, name])?;
        // A missing pool is a not-found lookup, the same as a missing volume
        Ok(self
            .pools
            .lock()
            .unwrap()
            .get(pool)
            .and_then(|p| p.volumes.get(name))
            .map(Self::describe))
    }

    async fn create_volume(&self, pool: &str, volume: &StorageVolumeDefinition) -> Result<(), HypervisorError> {
        self.record("vol-create", &["--pool", pool, volume.name.as_str()])?;
        let mut pools = self.pools.lock().unwrap();

        if let Some(backing) = &volume.backing_store {
            let backing_exists = pools
                .values()
                .flat_map(|p| p.volumes.values())
                .any(|v| v.path == backing.path);
            if !backing_exists {
                return Err(HypervisorError::with_code(
                    ErrorCode::OperationFailed,
                    format!("operation failed: backing store '{}' does not exist", backing.path),
                ));
            }
        }

        let p = pools.get_mut(pool).ok_or_else(|| Self::no_pool(pool))?;
        if !p.active {
            return Err(HypervisorError::with_code(
                ErrorCode::OperationInvalid,
                format!("Requested operation is not valid: storage pool '{}' is not active", pool),
            ));
        }
        if p.volumes.contains_key(&volume.name) {
            return Err(HypervisorError::with_code(
                ErrorCode::Other,
                format!("storage volume name '{}' already in use.", volume.name),
            ));
        }
        let path = format!("{}/{}", p.definition.path.trim_end_matches('/'), volume.name);
        p.volumes.insert(
            volume.name.clone(),
            MockVolume {
                definition: volume.clone(),
                path,
                data: Vec::new(),
                mtime: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn volume_path(&self, pool: &str, name: &str) -> Result<String, HypervisorError> {
        self.record("vol-path", &["--pool", pool, name])?;
        self.with_volume(pool, name, |v| Ok(v.path.clone()))
    }

    async fn volume_xml(&self, pool: &str, name: &str) -> Result<String, HypervisorError> {
        self.record("vol-dumpxml", &["--pool", pool, name])?;
        self.with_volume(pool, name, |v| Ok(Self::volume_to_xml(v)))
    }

    async fn upload_volume(&self, pool: &str, name: &str) -> Result<Box<dyn VolumeWriter>, HypervisorError> {
        self.record("vol-upload", &["--pool", pool, name])?;
        self.with_volume(pool, name, |_| Ok(()))?;
        Ok(Box::new(MockUpload {
            pools: Arc::clone(&self.pools),
            pool: pool.to_string(),
            name: name.to_string(),
            buffer: Vec::new(),
        }))
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> Result<(), HypervisorError> {
        self.record("vol-delete", &["--pool", pool, name])?;
        self.with_pool(pool, |p| {
            p.volumes
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| Self::no_volume(name))
        })
    }

    async fn lookup_domain(&self, name: &str) -> Result<Option<DomainState>, HypervisorError> {
        self.record("domstate", &[name])?;
        Ok(self.domains.lock().unwrap().get(name).map(|domain| {
            if domain.active {
                DomainState::Running
            } else {
                DomainState::ShutOff
            }
        }))
    }

    async fn define_domain(&self, domain: &DomainDefinition) -> Result<(), HypervisorError> {
        self.record("define", &[domain.name.as_str()])?;
        let mut domains = self.domains.lock().unwrap();
        let active = domains.get(&domain.name).is_some_and(|d| d.active);
        domains.insert(
            domain.name.clone(),
            MockDomain {
                definition: domain.clone(),
                active,
            },
        );
        Ok(())
    }

    async fn start_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.record("start", &[name])?;
        let mut domains = self.domains.lock().unwrap();
        let domain = domains.get_mut(name).ok_or_else(|| Self::no_domain(name))?;
        if domain.active {
            return Err(HypervisorError::with_code(
                ErrorCode::OperationInvalid,
                "Requested operation is not valid: domain is already running",
            ));
        }
        domain.active = true;
        Ok(())
    }

    async fn destroy_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.record("destroy", &[name])?;
        let mut domains = self.domains.lock().unwrap();
        let domain = domains.get_mut(name).ok_or_else(|| Self::no_domain(name))?;
        if !domain.active {
            return Err(HypervisorError::with_code(
                ErrorCode::OperationInvalid,
                "Requested operation is not valid: domain is not running",
            ));
        }
        domain.active = false;
        Ok(())
    }

    async fn undefine_domain(&self, name: &str, flags: UndefineFlags) -> Result<(), HypervisorError> {
        let mut args = vec![name];
        args.extend(flags.as_args());
        self.record("undefine", &args)?;
        self.domains
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::no_domain(name))
    }
}

/// Upload into a mock volume; content lands on `finish`
struct MockUpload {
    pools: Arc<Mutex<HashMap<String, MockPool>>>,
    pool: String,
    name: String,
    buffer: Vec<u8>,
}

#[async_trait::async_trait]
impl VolumeWriter for MockUpload {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), HypervisorError> {
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<u64, HypervisorError> {
        let MockUpload {
            pools,
            pool,
            name,
            buffer,
        } = *self;
        let mut pools = pools.lock().unwrap();
        let volume = pools
            .get_mut(&pool)
            .ok_or_else(|| MockHypervisor::no_pool(&pool))?
            .volumes
            .get_mut(&name)
            .ok_or_else(|| MockHypervisor::no_volume(&name))?;
        let written = buffer.len() as u64;
        volume.data = buffer;
        volume.mtime = SystemTime::now();
        Ok(written)
    }
}
