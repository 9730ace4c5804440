//! End-to-end create and teardown against the mock hypervisor

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bootstrap_provisioner::image::QCOW2_MAGIC;
use bootstrap_provisioner::{
    BootstrapPhase, BootstrapStep, Bootstrapper, HostOverrides, ProvisioningConfig, ResourceKind, ResourceState,
};
use libvirt_client::{ErrorCode, GraphicsKind, MockHypervisor, XmlDocument};
use serde_json::json;
use std::sync::Arc;

/// Serves an image published long before any volume exists, so every
/// conditional GET is answered 304 like a real web server would
async fn image(State(content): State<Arc<Vec<u8>>>, headers: HeaderMap) -> Response {
    if headers.get(header::RANGE).is_some_and(|range| range == "bytes=0-7") {
        return (StatusCode::PARTIAL_CONTENT, content[..8].to_vec()).into_response();
    }
    if headers.contains_key(header::IF_MODIFIED_SINCE) {
        return StatusCode::NOT_MODIFIED.into_response();
    }
    (
        [(header::LAST_MODIFIED, "Sun, 06 Nov 1994 08:49:37 GMT")],
        content.to_vec(),
    )
        .into_response()
}

async fn serve_image(content: Vec<u8>) -> String {
    let app = Router::new()
        .route("/rhcos.qcow2", get(image))
        .with_state(Arc::new(content));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/rhcos.qcow2", addr)
}

fn config(image: &str) -> ProvisioningConfig {
    ProvisioningConfig::from_value(json!({
        "cluster_id": "abc123",
        "bootstrap_os_image": image,
        "ignition_bootstrap": "{\"ignition\":{\"version\":\"3.2.0\"}}",
        "libvirt_uri": "qemu:///system",
        "bridges": [
            {"name": "baremetal", "mac": "52:54:00:aa:bb:cc"},
            {"name": "provisioning", "mac": "52:54:00:dd:ee:ff"}
        ]
    }))
    .unwrap()
}

fn image_content() -> Vec<u8> {
    let mut content = QCOW2_MAGIC.to_vec();
    content.resize(64 * 1024, 0);
    content
}

#[tokio::test]
async fn test_create_from_remote_image_on_x86_64() {
    let url = serve_image(image_content()).await;
    let config = config(&url);
    let mock = MockHypervisor::new("qemu:///system");

    let record = Bootstrapper::new(mock.clone())
        .create(&config, &HostOverrides::default())
        .await
        .unwrap();
    assert_eq!(record.phase, BootstrapPhase::DomainRunning);

    let pool_dir = "/var/lib/libvirt/openshift-images/abc123-bootstrap";
    assert_eq!(mock.pool("abc123-bootstrap").unwrap().definition.path, pool_dir);

    // A new base volume is downloaded unconditionally
    let base = mock.volume("abc123-bootstrap", "abc123-bootstrap-base").unwrap();
    assert_eq!(base.definition.capacity, 64 * 1024);
    assert_eq!(base.data, image_content());
    assert_eq!(record.get(ResourceKind::BaseVolume).unwrap().state, ResourceState::Created);

    let main = mock.volume("abc123-bootstrap", "abc123-bootstrap").unwrap();
    assert_eq!(main.definition.capacity, 34_359_738_368);
    assert_eq!(
        main.definition.backing_store.unwrap().path,
        format!("{}/abc123-bootstrap-base", pool_dir)
    );

    let ignition = mock.volume("abc123-bootstrap", "abc123-bootstrap.ign").unwrap();
    assert_eq!(ignition.data, config.ignition_bootstrap.as_bytes());

    let domain = mock.domain("abc123-bootstrap").unwrap();
    assert!(domain.active);
    assert_eq!(domain.definition.graphics.len(), 1);
    assert_eq!(domain.definition.graphics[0].kind, GraphicsKind::Vnc);
    assert_eq!(domain.definition.interfaces.len(), 2);

    let doc = XmlDocument::parse(&domain.definition.to_xml()).unwrap();
    let fw_cfg = doc
        .all("domain/qemu:commandline/qemu:arg")
        .filter_map(|arg| arg.attr("value"))
        .nth(1)
        .map(str::to_string);
    assert_eq!(
        fw_cfg,
        Some(format!("name=opt/com.coreos/config,file={}/abc123-bootstrap.ign", pool_dir))
    );
}

#[tokio::test]
async fn test_create_on_aarch64_uses_efi_without_graphics() {
    let url = serve_image(image_content()).await;
    let mock = MockHypervisor::new("qemu:///system");
    mock.set_arch("aarch64");

    Bootstrapper::new(mock.clone())
        .create(&config(&url), &HostOverrides::default())
        .await
        .unwrap();

    let domain = mock.domain("abc123-bootstrap").unwrap().definition;
    assert_eq!(domain.os.arch.as_deref(), Some("aarch64"));
    assert_eq!(domain.os.firmware.as_deref(), Some("efi"));
    assert!(domain.graphics.is_empty());
}

#[tokio::test]
async fn test_resume_after_failed_domain_step() {
    let url = serve_image(image_content()).await;
    let config = config(&url);
    let mock = MockHypervisor::new("qemu:///system");
    let bootstrapper = Bootstrapper::new(mock.clone());

    mock.fail_next("define", ErrorCode::OperationFailed, "operation failed: bad xml");
    let err = bootstrapper.create(&config, &HostOverrides::default()).await.unwrap_err();
    assert_eq!(err.step(), Some(BootstrapStep::CreateDomain));
    assert!(mock.volume("abc123-bootstrap", "abc123-bootstrap.ign").is_some());

    let record = bootstrapper.create(&config, &HostOverrides::default()).await.unwrap();
    assert_eq!(record.phase, BootstrapPhase::DomainRunning);
    assert_eq!(record.get(ResourceKind::Pool).unwrap().state, ResourceState::Reused);
    assert_eq!(record.get(ResourceKind::BaseVolume).unwrap().state, ResourceState::Reused);
    assert_eq!(record.get(ResourceKind::Domain).unwrap().state, ResourceState::Created);
}

#[tokio::test]
async fn test_teardown_twice() {
    let url = serve_image(image_content()).await;
    let config = config(&url);
    let mock = MockHypervisor::new("qemu:///system");
    let bootstrapper = Bootstrapper::new(mock.clone());
    bootstrapper.create(&config, &HostOverrides::default()).await.unwrap();

    let first = bootstrapper.destroy(&config.names()).await.unwrap();
    assert_eq!(first.phase, BootstrapPhase::PoolDeleted);
    assert!(first.resources.iter().all(|r| r.state == ResourceState::Deleted));

    let second = bootstrapper.destroy(&config.names()).await.unwrap();
    assert_eq!(second.phase, BootstrapPhase::PoolDeleted);
    assert!(second.resources.iter().all(|r| r.state == ResourceState::Absent));
    assert!(mock.pool("abc123-bootstrap").is_none());
}
