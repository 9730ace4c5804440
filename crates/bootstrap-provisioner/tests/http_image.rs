//! Remote image behavior against an in-process HTTP server

use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use bootstrap_provisioner::image::{HttpImage, Image, ImportOutcome, QCOW2_MAGIC};
use bootstrap_provisioner::volume::{create_base_volume, create_pool, VolumeCopier};
use bootstrap_provisioner::{ImageError, ResourceState};
use libvirt_client::{Hypervisor, MockHypervisor, StoragePoolDefinition, StorageVolumeDefinition, VolumeDescription};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

#[derive(Clone, Default)]
struct ImageServer {
    content: Arc<Vec<u8>>,
    reject_head: bool,
    answer_not_modified: bool,
    /// Server errors returned before the first successful GET
    failures: Arc<AtomicUsize>,
    failure_status: Option<StatusCode>,
    heads: Arc<AtomicUsize>,
    gets: Arc<AtomicUsize>,
    get_times: Arc<Mutex<Vec<Instant>>>,
    if_modified_since: Arc<Mutex<Option<String>>>,
}

impl ImageServer {
    fn new(content: Vec<u8>) -> Self {
        Self {
            content: Arc::new(content),
            ..Self::default()
        }
    }

    fn failing(mut self, count: usize, status: StatusCode) -> Self {
        self.failures = Arc::new(AtomicUsize::new(count));
        self.failure_status = Some(status);
        self
    }

    async fn serve(self) -> String {
        let app = Router::new()
            .route("/rhcos.qcow2", any(handle))
            .with_state(self);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/rhcos.qcow2", addr)
    }
}

async fn handle(State(server): State<ImageServer>, method: Method, headers: HeaderMap) -> Response {
    let length = server.content.len().to_string();

    if method == Method::HEAD {
        server.heads.fetch_add(1, Ordering::SeqCst);
        if server.reject_head {
            return StatusCode::FORBIDDEN.into_response();
        }
        return ([(header::CONTENT_LENGTH, length)], server.content.to_vec()).into_response();
    }

    server.gets.fetch_add(1, Ordering::SeqCst);
    server.get_times.lock().unwrap().push(Instant::now());

    if let Some(range) = headers.get(header::RANGE) {
        if range == "bytes=0-7" {
            let end = server.content.len().min(8);
            return (
                StatusCode::PARTIAL_CONTENT,
                [(header::CONTENT_RANGE, format!("bytes 0-7/{}", length))],
                server.content[..end].to_vec(),
            )
                .into_response();
        }
    }

    if let Some(since) = headers.get(header::IF_MODIFIED_SINCE) {
        *server.if_modified_since.lock().unwrap() = since.to_str().ok().map(str::to_string);
        if server.answer_not_modified {
            return StatusCode::NOT_MODIFIED.into_response();
        }
    }

    if let Some(status) = server.failure_status {
        let remaining = server.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            server.failures.store(remaining - 1, Ordering::SeqCst);
            return status.into_response();
        }
    }

    (StatusCode::OK, server.content.to_vec()).into_response()
}

fn qcow2_content() -> Vec<u8> {
    let mut content = QCOW2_MAGIC.to_vec();
    content.extend(std::iter::repeat_n(0xAB, 4096));
    content
}

/// Mock pool with an empty base volume to import into
async fn target_volume(size: u64) -> (MockHypervisor, VolumeDescription) {
    let mock = MockHypervisor::new("test:///default");
    mock.define_pool(&StoragePoolDefinition::new("p", "/images/p")).await.unwrap();
    mock.start_pool("p").await.unwrap();
    mock.create_volume("p", &StorageVolumeDefinition::new("base", size)).await.unwrap();
    let mut target = mock.lookup_volume("p", "base").await.unwrap().unwrap();
    target.mtime = None;
    (mock, target)
}

#[tokio::test]
async fn test_size_from_head() {
    let server = ImageServer::new(qcow2_content());
    let url = server.clone().serve().await;

    let image = HttpImage::new(url).unwrap();
    assert_eq!(image.size().await.unwrap(), 4104);
    assert_eq!(server.heads.load(Ordering::SeqCst), 1);
    assert_eq!(server.gets.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_size_falls_back_to_one_get_on_403() {
    let server = ImageServer {
        reject_head: true,
        ..ImageServer::new(qcow2_content())
    };
    let url = server.clone().serve().await;

    let image = HttpImage::new(url).unwrap();
    assert_eq!(image.size().await.unwrap(), 4104);
    assert_eq!(server.heads.load(Ordering::SeqCst), 1);
    assert_eq!(server.gets.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_size_fails_on_missing_image() {
    let server = ImageServer::new(qcow2_content());
    let url = server.serve().await.replace("rhcos.qcow2", "missing.qcow2");

    let err = HttpImage::new(url).unwrap().size().await.unwrap_err();
    assert!(matches!(err, ImageError::UnexpectedStatus { status: 404, .. }));
}

#[tokio::test]
async fn test_qcow2_header_sniffed_with_range_request() {
    let qcow2 = ImageServer::new(qcow2_content()).serve().await;
    assert!(HttpImage::new(qcow2).unwrap().is_qcow2().await.unwrap());

    let raw = ImageServer::new(vec![0u8; 512]).serve().await;
    assert!(!HttpImage::new(raw).unwrap().is_qcow2().await.unwrap());
}

#[tokio::test]
async fn test_import_streams_body() {
    let content = qcow2_content();
    let url = ImageServer::new(content.clone()).serve().await;
    let (mock, target) = target_volume(content.len() as u64).await;

    let copier = VolumeCopier::new(&mock, "p", "base");
    let outcome = HttpImage::new(url).unwrap().import(&copier, &target).await.unwrap();

    assert_eq!(outcome, ImportOutcome::Copied { bytes: content.len() as u64 });
    assert_eq!(mock.volume("p", "base").unwrap().data, content);
}

#[tokio::test]
async fn test_import_not_modified_skips_copy() {
    let server = ImageServer {
        answer_not_modified: true,
        ..ImageServer::new(qcow2_content())
    };
    let url = server.clone().serve().await;
    let (mock, mut target) = target_volume(4104).await;
    target.mtime = Some(SystemTime::UNIX_EPOCH + Duration::from_secs(784_111_777));

    let copier = VolumeCopier::new(&mock, "p", "base");
    let outcome = HttpImage::new(url).unwrap().import(&copier, &target).await.unwrap();

    assert_eq!(outcome, ImportOutcome::Skipped);
    assert_eq!(
        server.if_modified_since.lock().unwrap().as_deref(),
        Some("Sun, 06 Nov 1994 08:49:37 GMT")
    );
    assert!(mock.calls_for("vol-upload").is_empty());
}

#[tokio::test]
async fn test_import_retries_server_errors() {
    let content = qcow2_content();
    let server = ImageServer::new(content.clone()).failing(2, StatusCode::SERVICE_UNAVAILABLE);
    let url = server.clone().serve().await;
    let (mock, target) = target_volume(content.len() as u64).await;

    let wait = Duration::from_millis(200);
    let image = HttpImage::new(url).unwrap().with_retry_wait(wait);
    let copier = VolumeCopier::new(&mock, "p", "base");
    let outcome = image.import(&copier, &target).await.unwrap();

    assert_eq!(outcome, ImportOutcome::Copied { bytes: content.len() as u64 });
    assert_eq!(server.gets.load(Ordering::SeqCst), 3);
    let times = server.get_times.lock().unwrap().clone();
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= wait);
    }
    assert_eq!(mock.volume("p", "base").unwrap().data, content);
}

#[tokio::test]
async fn test_import_retry_spacing_defaults_to_two_seconds() {
    let server = ImageServer::new(qcow2_content()).failing(2, StatusCode::SERVICE_UNAVAILABLE);
    let url = server.clone().serve().await;
    let (mock, target) = target_volume(4104).await;

    let started = Instant::now();
    let copier = VolumeCopier::new(&mock, "p", "base");
    HttpImage::new(url).unwrap().import(&copier, &target).await.unwrap();

    assert_eq!(server.gets.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= Duration::from_secs(4));
}

#[tokio::test]
async fn test_import_gives_up_after_three_attempts() {
    let server = ImageServer::new(qcow2_content()).failing(10, StatusCode::BAD_GATEWAY);
    let url = server.clone().serve().await;
    let (mock, target) = target_volume(4104).await;

    let image = HttpImage::new(url).unwrap().with_retry_wait(Duration::from_millis(10));
    let copier = VolumeCopier::new(&mock, "p", "base");
    let err = image.import(&copier, &target).await.unwrap_err();

    assert!(matches!(err, ImageError::RetriesExhausted { attempts: 3, status: 502, .. }));
    assert_eq!(server.gets.load(Ordering::SeqCst), 3);
    assert!(mock.calls_for("vol-upload").is_empty());
}

#[tokio::test]
async fn test_import_client_error_is_terminal() {
    let server = ImageServer::new(qcow2_content()).failing(1, StatusCode::UNAUTHORIZED);
    let url = server.clone().serve().await;
    let (mock, target) = target_volume(4104).await;

    let image = HttpImage::new(url).unwrap().with_retry_wait(Duration::from_millis(10));
    let copier = VolumeCopier::new(&mock, "p", "base");
    let err = image.import(&copier, &target).await.unwrap_err();

    assert!(matches!(err, ImageError::UnexpectedStatus { status: 401, .. }));
    assert_eq!(server.gets.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_new_base_volume_downloads_unconditionally() {
    let content = qcow2_content();
    let server = ImageServer {
        answer_not_modified: true,
        ..ImageServer::new(content.clone())
    };
    let url = server.clone().serve().await;
    let mock = MockHypervisor::new("test:///default");
    create_pool(&mock, "p", "/images/p").await.unwrap();

    let (volume, state) = create_base_volume(&mock, "p", "base", &url, false).await.unwrap();

    assert_eq!(state, ResourceState::Created);
    assert_eq!(volume.physical, Some(content.len() as u64));
    assert_eq!(mock.volume("p", "base").unwrap().data, content);
    assert_eq!(*server.if_modified_since.lock().unwrap(), None);
}
