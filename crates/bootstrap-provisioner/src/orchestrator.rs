//! Bootstrap orchestrator
//!
//! Sequences pool, volume, ignition and domain creation for one bootstrap node,
//! and tears everything down again in reverse. Progress is kept in a
//! [`ProvisioningRecord`].
//!
//! Create path: `Uninitialized → PoolCreated → BaseVolumeReady →
//! MainVolumeReady → IgnitionUploaded → DomainRunning`.
//! Teardown path: `Undefined → VolumesDeleted → PoolDeleted`.
//!
//! A failing step aborts the run without cleanup. Every step reuses resources
//! an earlier run left behind and teardown treats missing resources as already
//! removed, so both directions can be re-run after a failure.

use crate::config::ProvisioningConfig;
use crate::domain::{boot_domain, build_domain};
use crate::error::{BootstrapError, BootstrapStep, StepContext};
use crate::ignition;
use crate::names::BootstrapNames;
use crate::overrides::HostOverrides;
use crate::volume::{create_base_volume, create_main_volume, create_pool};
use libvirt_client::{ErrorCode, Hypervisor, HypervisorError, UndefineFlags};
use tracing::{debug, info, warn};

/// How far a create or teardown run got
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootstrapPhase {
    Uninitialized,
    PoolCreated,
    BaseVolumeReady,
    MainVolumeReady,
    IgnitionUploaded,
    DomainRunning,
    Undefined,
    VolumesDeleted,
    PoolDeleted,
}

/// What a step did to its resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// Created by this run
    Created,
    /// Left by an earlier run and reused
    Reused,
    /// Removed by this run
    Deleted,
    /// Already absent when teardown reached it
    Absent,
}

/// Kinds of resources owned by a bootstrap node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Pool,
    BaseVolume,
    MainVolume,
    IgnitionVolume,
    Domain,
}

/// One resource touched by a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub kind: ResourceKind,
    pub name: String,
    /// Path on the hypervisor host, for pools and volumes
    pub path: Option<String>,
    pub state: ResourceState,
}

/// Progress of a create or teardown run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningRecord {
    pub phase: BootstrapPhase,
    pub resources: Vec<ResourceRecord>,
}

impl ProvisioningRecord {
    pub fn new() -> Self {
        Self {
            phase: BootstrapPhase::Uninitialized,
            resources: Vec::new(),
        }
    }

    /// Last record of a resource kind
    pub fn get(&self, kind: ResourceKind) -> Option<&ResourceRecord> {
        self.resources.iter().rev().find(|r| r.kind == kind)
    }

    fn track(&mut self, kind: ResourceKind, name: &str, path: Option<String>, state: ResourceState) {
        debug!("{:?} {} {:?}", kind, name, state);
        self.resources.push(ResourceRecord {
            kind,
            name: name.to_string(),
            path,
            state,
        });
    }

    fn advance(&mut self, phase: BootstrapPhase) {
        debug!("Bootstrap phase {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }
}

impl Default for ProvisioningRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates and tears down the bootstrap node on one hypervisor connection
pub struct Bootstrapper {
    hypervisor: Box<dyn Hypervisor>,
}

impl std::fmt::Debug for Bootstrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bootstrapper")
            .field("uri", &self.hypervisor.uri())
            .finish()
    }
}

impl Bootstrapper {
    pub fn new(hypervisor: impl Hypervisor + 'static) -> Self {
        Self {
            hypervisor: Box::new(hypervisor),
        }
    }

    /// Provision the bootstrap node
    pub async fn create(
        &self,
        config: &ProvisioningConfig,
        overrides: &HostOverrides,
    ) -> Result<ProvisioningRecord, BootstrapError> {
        config.validate()?;
        let hypervisor = self.hypervisor.as_ref();
        let names = config.names();
        let pool_path = config.pool_path();
        let mut record = ProvisioningRecord::new();

        info!("Creating storage pool {} at {}", names.pool, pool_path);
        let state = create_pool(hypervisor, &names.pool, &pool_path)
            .await
            .step(BootstrapStep::CreatePool)?;
        record.track(ResourceKind::Pool, &names.pool, Some(pool_path.clone()), state);
        record.advance(BootstrapPhase::PoolCreated);

        info!("Creating base volume {} from {}", names.base_volume, config.bootstrap_os_image);
        let base_in_use = self
            .base_in_use(&names)
            .await
            .step(BootstrapStep::CreateBaseVolume)?;
        let (base, state) = create_base_volume(
            hypervisor,
            &names.pool,
            &names.base_volume,
            &config.bootstrap_os_image,
            base_in_use,
        )
        .await
        .step(BootstrapStep::CreateBaseVolume)?;
        record.track(ResourceKind::BaseVolume, &names.base_volume, Some(base.path), state);
        record.advance(BootstrapPhase::BaseVolumeReady);

        info!("Creating main volume {}", names.main_volume);
        let (main, state) = create_main_volume(
            hypervisor,
            &names.pool,
            &names.main_volume,
            &names.base_volume,
            config.bootstrap_disk_bytes,
        )
        .await
        .step(BootstrapStep::CreateMainVolume)?;
        record.track(ResourceKind::MainVolume, &names.main_volume, Some(main.path.clone()), state);
        record.advance(BootstrapPhase::MainVolumeReady);

        info!("Uploading ignition config to {}", names.ignition_volume);
        let ignition = ignition::create_and_upload(
            hypervisor,
            &names.pool,
            &names.ignition_volume,
            &config.ignition_bootstrap,
        )
        .await
        .step(BootstrapStep::UploadIgnition)?;
        record.track(
            ResourceKind::IgnitionVolume,
            &names.ignition_volume,
            Some(ignition.path.clone()),
            ResourceState::Created,
        );
        record.advance(BootstrapPhase::IgnitionUploaded);

        info!("Creating bootstrap domain {}", names.domain);
        let capabilities = hypervisor
            .capabilities()
            .await
            .step(BootstrapStep::CreateDomain)?;
        debug!("Host architecture is {}", capabilities.arch);
        let definition = build_domain(
            &names.domain,
            &capabilities.arch,
            config,
            overrides,
            &main.path,
            &ignition.path,
        );
        let state = boot_domain(hypervisor, &definition)
            .await
            .step(BootstrapStep::CreateDomain)?;
        record.track(ResourceKind::Domain, &names.domain, None, state);
        record.advance(BootstrapPhase::DomainRunning);

        info!("Bootstrap domain {} is running", names.domain);
        Ok(record)
    }

    /// Whether the main volume or the domain already sits on the base volume
    async fn base_in_use(&self, names: &BootstrapNames) -> Result<bool, HypervisorError> {
        let hypervisor = self.hypervisor.as_ref();
        if hypervisor.lookup_volume(&names.pool, &names.main_volume).await?.is_some() {
            return Ok(true);
        }
        Ok(hypervisor.lookup_domain(&names.domain).await?.is_some())
    }

    /// Tear down the bootstrap node
    pub async fn destroy(&self, names: &BootstrapNames) -> Result<ProvisioningRecord, BootstrapError> {
        let hypervisor = self.hypervisor.as_ref();
        let mut record = ProvisioningRecord::new();

        info!("Destroying bootstrap domain {}", names.domain);
        let domain_state = hypervisor
            .lookup_domain(&names.domain)
            .await
            .step(BootstrapStep::DestroyDomain)?;
        match domain_state {
            None => {
                debug!("Domain {} does not exist", names.domain);
                record.track(ResourceKind::Domain, &names.domain, None, ResourceState::Absent);
            }
            Some(state) => {
                if state.is_active() {
                    match hypervisor.destroy_domain(&names.domain).await {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() || e.code() == Some(ErrorCode::OperationInvalid) => {
                            debug!("Domain {} is not running: {}", names.domain, e);
                        }
                        Err(e) => return Err(e).step(BootstrapStep::DestroyDomain),
                    }
                }

                info!("Undefining bootstrap domain {}", names.domain);
                let state = ignore_not_found(undefine_domain(hypervisor, &names.domain).await)
                    .step(BootstrapStep::UndefineDomain)?;
                record.track(ResourceKind::Domain, &names.domain, None, state);
            }
        }
        record.advance(BootstrapPhase::Undefined);

        info!("Deleting bootstrap volumes");
        // Overlay before its backing store
        for (kind, volume) in [
            (ResourceKind::IgnitionVolume, &names.ignition_volume),
            (ResourceKind::MainVolume, &names.main_volume),
            (ResourceKind::BaseVolume, &names.base_volume),
        ] {
            let state = ignore_not_found(hypervisor.delete_volume(&names.pool, volume).await)
                .step(BootstrapStep::DeleteVolumes)?;
            record.track(kind, volume, None, state);
        }
        record.advance(BootstrapPhase::VolumesDeleted);

        info!("Deleting storage pool {}", names.pool);
        let state = delete_pool(hypervisor, &names.pool)
            .await
            .step(BootstrapStep::DeletePool)?;
        record.track(ResourceKind::Pool, &names.pool, None, state);
        record.advance(BootstrapPhase::PoolDeleted);

        info!("Bootstrap resources for {} removed", names.domain);
        Ok(record)
    }
}

/// Undefine a domain with all cleanup flags
///
/// Drivers that reject the flags (`NoSupport`, `InvalidArg`) get one plain
/// undefine instead. Any other error is returned as is.
pub async fn undefine_domain(hypervisor: &dyn Hypervisor, name: &str) -> Result<(), HypervisorError> {
    match hypervisor.undefine_domain(name, UndefineFlags::ALL).await {
        Err(e) if matches!(e.code(), Some(ErrorCode::NoSupport | ErrorCode::InvalidArg)) => {
            warn!("Undefine flags rejected for {} ({}), falling back to plain undefine", name, e);
            hypervisor.undefine_domain(name, UndefineFlags::NONE).await
        }
        result => result,
    }
}

/// Destroy, delete and undefine a pool, skipping what is already gone
async fn delete_pool(hypervisor: &dyn Hypervisor, name: &str) -> Result<ResourceState, HypervisorError> {
    let Some(info) = hypervisor.lookup_pool(name).await? else {
        debug!("Storage pool {} does not exist", name);
        return Ok(ResourceState::Absent);
    };

    if info.active {
        match hypervisor.destroy_pool(name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() || e.code() == Some(ErrorCode::OperationInvalid) => {
                debug!("Storage pool {} is not active: {}", name, e);
            }
            Err(e) => return Err(e),
        }
    }
    ignore_not_found(hypervisor.delete_pool(name).await)?;
    ignore_not_found(hypervisor.undefine_pool(name).await)
}

/// Map a not-found error to `Absent`
fn ignore_not_found(result: Result<(), HypervisorError>) -> Result<ResourceState, HypervisorError> {
    match result {
        Ok(()) => Ok(ResourceState::Deleted),
        Err(e) if e.is_not_found() => {
            debug!("Already removed: {}", e);
            Ok(ResourceState::Absent)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::QCOW2_MAGIC;
    use libvirt_client::MockHypervisor;
    use serde_json::json;
    use std::io::Write;

    struct Fixture {
        mock: MockHypervisor,
        config: ProvisioningConfig,
        image: tempfile::NamedTempFile,
    }

    fn fixture() -> Fixture {
        let mut image = tempfile::NamedTempFile::new().unwrap();
        image.write_all(&QCOW2_MAGIC).unwrap();
        image.write_all(&[0u8; 1016]).unwrap();

        let config = ProvisioningConfig::from_value(json!({
            "cluster_id": "abc123",
            "bootstrap_os_image": image.path().to_str().unwrap(),
            "ignition_bootstrap": "{\"ignition\":{\"version\":\"3.2.0\"}}",
            "libvirt_uri": "test:///default",
            "bridges": [{"name": "baremetal", "mac": "52:54:00:aa:bb:cc"}],
            "bootstrap_pool_dir": "/images"
        }))
        .unwrap();

        Fixture {
            mock: MockHypervisor::new("test:///default"),
            config,
            image,
        }
    }

    #[tokio::test]
    async fn test_create_reaches_domain_running() {
        let f = fixture();
        let bootstrapper = Bootstrapper::new(f.mock.clone());

        let record = bootstrapper.create(&f.config, &HostOverrides::default()).await.unwrap();
        assert_eq!(record.phase, BootstrapPhase::DomainRunning);
        assert!(record.resources.iter().all(|r| r.state == ResourceState::Created));
        assert_eq!(
            record.get(ResourceKind::IgnitionVolume).unwrap().path.as_deref(),
            Some("/images/abc123-bootstrap/abc123-bootstrap.ign")
        );

        let domain = f.mock.domain("abc123-bootstrap").unwrap();
        assert!(domain.active);
        assert_eq!(domain.definition.disks[0].source_file, "/images/abc123-bootstrap/abc123-bootstrap");
    }

    #[tokio::test]
    async fn test_create_is_rerunnable() {
        let f = fixture();
        let bootstrapper = Bootstrapper::new(f.mock.clone());
        bootstrapper.create(&f.config, &HostOverrides::default()).await.unwrap();

        let record = bootstrapper.create(&f.config, &HostOverrides::default()).await.unwrap();
        assert_eq!(record.phase, BootstrapPhase::DomainRunning);
        assert_eq!(record.get(ResourceKind::Pool).unwrap().state, ResourceState::Reused);
        assert_eq!(record.get(ResourceKind::MainVolume).unwrap().state, ResourceState::Reused);
        assert_eq!(record.get(ResourceKind::Domain).unwrap().state, ResourceState::Reused);
        assert_eq!(f.mock.calls_for("pool-define").len(), 1);
        assert_eq!(f.mock.calls_for("define").len(), 1);
        // The running domain's overlay still reads from the base
        assert_eq!(
            f.mock.calls_for("vol-upload")
                .iter()
                .filter(|call| call.ends_with("abc123-bootstrap-base"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_rerun_with_changed_image_keeps_base_in_use() {
        let mut f = fixture();
        let bootstrapper = Bootstrapper::new(f.mock.clone());
        bootstrapper.create(&f.config, &HostOverrides::default()).await.unwrap();
        f.image.write_all(&[0u8; 4096]).unwrap();
        f.image.flush().unwrap();

        let err = bootstrapper.create(&f.config, &HostOverrides::default()).await.unwrap_err();
        assert_eq!(err.step(), Some(BootstrapStep::CreateBaseVolume));
        assert!(matches!(
            err,
            BootstrapError::Step { ref source, .. } if matches!(**source, BootstrapError::StaleResource { .. })
        ));
        let base = f.mock.volume("abc123-bootstrap", "abc123-bootstrap-base").unwrap();
        assert_eq!(base.definition.capacity, 1024);
        assert_eq!(base.data.len(), 1024);
        assert!(f.mock.domain("abc123-bootstrap").unwrap().active);
    }

    #[tokio::test]
    async fn test_failed_step_is_named_and_not_cleaned_up() {
        let f = fixture();
        f.mock.fail_next("vol-create", ErrorCode::OperationFailed, "operation failed: no space");
        let bootstrapper = Bootstrapper::new(f.mock.clone());

        let err = bootstrapper.create(&f.config, &HostOverrides::default()).await.unwrap_err();
        assert_eq!(err.step(), Some(BootstrapStep::CreateBaseVolume));
        assert!(err.to_string().starts_with("create base volume: "));
        // The pool stays for the caller's explicit teardown
        assert!(f.mock.pool("abc123-bootstrap").is_some());
        assert!(f.mock.calls_for("pool-delete").is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_hypervisor() {
        let f = fixture();
        let mut config = f.config.clone();
        config.libvirt_uri = "::".to_string();

        let err = Bootstrapper::new(f.mock.clone())
            .create(&config, &HostOverrides::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Config(_)));
        assert!(f.mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_removes_everything_in_order() {
        let f = fixture();
        let bootstrapper = Bootstrapper::new(f.mock.clone());
        bootstrapper.create(&f.config, &HostOverrides::default()).await.unwrap();

        let record = bootstrapper.destroy(&f.config.names()).await.unwrap();
        assert_eq!(record.phase, BootstrapPhase::PoolDeleted);
        assert!(f.mock.pool("abc123-bootstrap").is_none());
        assert!(f.mock.domain("abc123-bootstrap").is_none());

        let deletes = f.mock.calls_for("vol-delete");
        assert_eq!(
            deletes,
            vec![
                "vol-delete --pool abc123-bootstrap abc123-bootstrap.ign",
                "vol-delete --pool abc123-bootstrap abc123-bootstrap",
                "vol-delete --pool abc123-bootstrap abc123-bootstrap-base",
            ]
        );
        assert_eq!(
            f.mock.calls_for("undefine"),
            vec!["undefine abc123-bootstrap --nvram --managed-save --snapshots-metadata"]
        );
    }

    #[tokio::test]
    async fn test_destroy_when_nothing_exists() {
        let f = fixture();
        let record = Bootstrapper::new(f.mock.clone())
            .destroy(&f.config.names())
            .await
            .unwrap();
        assert_eq!(record.phase, BootstrapPhase::PoolDeleted);
        assert!(record.resources.iter().all(|r| r.state == ResourceState::Absent));
    }

    #[tokio::test]
    async fn test_undefine_falls_back_once_on_no_support() {
        let f = fixture();
        let bootstrapper = Bootstrapper::new(f.mock.clone());
        bootstrapper.create(&f.config, &HostOverrides::default()).await.unwrap();
        f.mock.fail_next(
            "undefine",
            ErrorCode::NoSupport,
            "this function is not supported by the connection driver: virDomainUndefineFlags",
        );

        bootstrapper.destroy(&f.config.names()).await.unwrap();
        assert_eq!(
            f.mock.calls_for("undefine"),
            vec![
                "undefine abc123-bootstrap --nvram --managed-save --snapshots-metadata",
                "undefine abc123-bootstrap",
            ]
        );
    }

    #[tokio::test]
    async fn test_undefine_falls_back_on_invalid_arg() {
        let f = fixture();
        let bootstrapper = Bootstrapper::new(f.mock.clone());
        bootstrapper.create(&f.config, &HostOverrides::default()).await.unwrap();
        f.mock.fail_next("undefine", ErrorCode::InvalidArg, "invalid argument: unsupported flags (0x4)");

        bootstrapper.destroy(&f.config.names()).await.unwrap();
        assert_eq!(f.mock.calls_for("undefine").len(), 2);
    }

    #[tokio::test]
    async fn test_undefine_other_errors_are_fatal() {
        let f = fixture();
        let bootstrapper = Bootstrapper::new(f.mock.clone());
        bootstrapper.create(&f.config, &HostOverrides::default()).await.unwrap();
        f.mock.fail_next("undefine", ErrorCode::OperationFailed, "operation failed: locked");

        let err = bootstrapper.destroy(&f.config.names()).await.unwrap_err();
        assert_eq!(err.step(), Some(BootstrapStep::UndefineDomain));
        assert_eq!(f.mock.calls_for("undefine").len(), 1);
        assert!(f.mock.calls_for("vol-delete").is_empty());
    }

    #[tokio::test]
    async fn test_fallback_failure_is_not_retried_again() {
        let f = fixture();
        let bootstrapper = Bootstrapper::new(f.mock.clone());
        bootstrapper.create(&f.config, &HostOverrides::default()).await.unwrap();
        f.mock.fail_always("undefine", ErrorCode::NoSupport, "this function is not supported");

        assert!(bootstrapper.destroy(&f.config.names()).await.is_err());
        assert_eq!(f.mock.calls_for("undefine").len(), 2);
    }

    #[tokio::test]
    async fn test_destroy_tolerates_stopped_domain() {
        let f = fixture();
        let bootstrapper = Bootstrapper::new(f.mock.clone());
        bootstrapper.create(&f.config, &HostOverrides::default()).await.unwrap();
        f.mock.destroy_domain("abc123-bootstrap").await.unwrap();

        bootstrapper.destroy(&f.config.names()).await.unwrap();
        // Only the manual destroy above; teardown saw the domain shut off
        assert_eq!(f.mock.calls_for("destroy").len(), 1);
        assert!(f.mock.domain("abc123-bootstrap").is_none());
    }
}
