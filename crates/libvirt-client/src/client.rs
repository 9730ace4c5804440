//! virsh-backed hypervisor client
//!
//! Every call runs one `virsh -c <uri> <command>` process. Definitions are
//! written to a temporary XML file for the define/create commands, and volume
//! uploads stream into `vol-upload` through the child's stdin.

use crate::domain::DomainDefinition;
use crate::error::{ErrorCode, HypervisorError};
use crate::hypervisor_trait::{Hypervisor, VolumeWriter};
use crate::models::*;
use std::future::Future;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::debug;

/// libvirt client driving the `virsh` command-line tool
#[derive(Debug, Clone)]
pub struct VirshClient {
    uri: String,
    program: String,
    call_timeout: Option<Duration>,
}

impl VirshClient {
    /// Create a new client
    ///
    /// # Arguments
    /// * `uri` - libvirt connection URI (e.g., "qemu:///system")
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            program: "virsh".to_string(),
            call_timeout: None,
        }
    }

    /// Bound every call by a deadline; the virsh process is killed when it passes
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Use a different virsh binary
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-c").arg(&self.uri).args(args).kill_on_drop(true);
        cmd
    }

    async fn within_deadline<F, T>(&self, operation: &str, future: F) -> Result<T, HypervisorError>
    where
        F: Future<Output = Result<T, HypervisorError>>,
    {
        match self.call_timeout {
            Some(timeout) => tokio::time::timeout(timeout, future)
                .await
                .map_err(|_elapsed| HypervisorError::Timeout {
                    operation: operation.to_string(),
                    timeout,
                })?,
            None => future.await,
        }
    }

    /// Run a virsh command and return its stdout
    async fn run(&self, args: &[&str]) -> Result<String, HypervisorError> {
        let operation = args.first().copied().unwrap_or("virsh");
        debug!("virsh -c {} {}", self.uri, args.join(" "));

        let output = self
            .within_deadline(operation, async {
                self.command(args).output().await.map_err(HypervisorError::Io)
            })
            .await?;
        check_output(operation, &output)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a virsh command that reads an XML document from a file argument
    async fn run_with_document(&self, args: &[&str], xml: &str) -> Result<String, HypervisorError> {
        let file = tempfile::Builder::new()
            .prefix("virsh-")
            .suffix(".xml")
            .tempfile()?;
        tokio::fs::write(file.path(), xml).await?;

        let path = file.path().to_string_lossy().into_owned();
        let mut full_args = args.to_vec();
        full_args.push(path.as_str());
        self.run(&full_args).await
    }

    /// Run a lookup command, mapping a not-found error to `None`
    async fn run_lookup(&self, args: &[&str]) -> Result<Option<String>, HypervisorError> {
        match self.run(args).await {
            Ok(output) => Ok(Some(output)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn check_output(operation: &str, output: &Output) -> Result<(), HypervisorError> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        Err(HypervisorError::with_code(
            ErrorCode::Other,
            format!("virsh {} failed: {}", operation, output.status),
        ))
    } else {
        Err(HypervisorError::libvirt(stderr))
    }
}

/// Parse `pool-info` output
pub(crate) fn parse_pool_info(name: &str, output: &str) -> PoolInfo {
    let mut info = PoolInfo {
        name: name.to_string(),
        active: false,
        autostart: false,
    };
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "State" => info.active = matches!(value.trim(), "running" | "building"),
            "Autostart" => info.autostart = value.trim() == "yes",
            _ => {}
        }
    }
    info
}

#[async_trait::async_trait]
impl Hypervisor for VirshClient {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn capabilities(&self) -> Result<HostCapabilities, HypervisorError> {
        let xml = self.run(&["capabilities"]).await?;
        HostCapabilities::from_xml(&xml)
    }

    async fn lookup_pool(&self, name: &str) -> Result<Option<PoolInfo>, HypervisorError> {
        Ok(self
            .run_lookup(&["pool-info", name])
            .await?
            .map(|output| parse_pool_info(name, &output)))
    }

    async fn define_pool(&self, pool: &StoragePoolDefinition) -> Result<(), HypervisorError> {
        self.run_with_document(&["pool-define"], &pool.to_xml()).await?;
        Ok(())
    }

    async fn build_pool(&self, name: &str) -> Result<(), HypervisorError> {
        self.run(&["pool-build", name]).await?;
        Ok(())
    }

    async fn set_pool_autostart(&self, name: &str, autostart: bool) -> Result<(), HypervisorError> {
        if autostart {
            self.run(&["pool-autostart", name]).await?;
        } else {
            self.run(&["pool-autostart", name, "--disable"]).await?;
        }
        Ok(())
    }

    async fn start_pool(&self, name: &str) -> Result<(), HypervisorError> {
        self.run(&["pool-start", name]).await?;
        Ok(())
    }

    async fn refresh_pool(&self, name: &str) -> Result<(), HypervisorError> {
        self.run(&["pool-refresh", name]).await?;
        Ok(())
    }

    async fn destroy_pool(&self, name: &str) -> Result<(), HypervisorError> {
        self.run(&["pool-destroy", name]).await?;
        Ok(())
    }

    async fn delete_pool(&self, name: &str) -> Result<(), HypervisorError> {
        self.run(&["pool-delete", name]).await?;
        Ok(())
    }

    async fn undefine_pool(&self, name: &str) -> Result<(), HypervisorError> {
        self.run(&["pool-undefine", name]).await?;
        Ok(())
    }

    async fn lookup_volume(&self, pool: &str, name: &str) -> Result<Option<VolumeDescription>, HypervisorError> {
        match self.run_lookup(&["vol-dumpxml", "--pool", pool, name]).await? {
            Some(xml) => Ok(Some(VolumeDescription::from_xml(&xml)?)),
            None => Ok(None),
        }
    }

    async fn create_volume(&self, pool: &str, volume: &StorageVolumeDefinition) -> Result<(), HypervisorError> {
        self.run_with_document(&["vol-create", "--pool", pool], &volume.to_xml()).await?;
        Ok(())
    }

    async fn volume_path(&self, pool: &str, name: &str) -> Result<String, HypervisorError> {
        let path = self.run(&["vol-path", "--pool", pool, name]).await?;
        Ok(path.trim().to_string())
    }

    async fn volume_xml(&self, pool: &str, name: &str) -> Result<String, HypervisorError> {
        self.run(&["vol-dumpxml", "--pool", pool, name]).await
    }

    async fn upload_volume(&self, pool: &str, name: &str) -> Result<Box<dyn VolumeWriter>, HypervisorError> {
        debug!("virsh -c {} vol-upload --pool {} {} /dev/stdin", self.uri, pool, name);
        let mut child = self
            .command(&["vol-upload", "--pool", pool, name, "/dev/stdin"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdin = child.stdin.take();
        Ok(Box::new(VirshUpload {
            child: Some(child),
            stdin,
            written: 0,
            call_timeout: self.call_timeout,
        }))
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> Result<(), HypervisorError> {
        self.run(&["vol-delete", "--pool", pool, name]).await?;
        Ok(())
    }

    async fn lookup_domain(&self, name: &str) -> Result<Option<DomainState>, HypervisorError> {
        Ok(self
            .run_lookup(&["domstate", name])
            .await?
            .map(|state| DomainState::parse(&state)))
    }

    async fn define_domain(&self, domain: &DomainDefinition) -> Result<(), HypervisorError> {
        self.run_with_document(&["define"], &domain.to_xml()).await?;
        Ok(())
    }

    async fn start_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.run(&["start", name]).await?;
        Ok(())
    }

    async fn destroy_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.run(&["destroy", name]).await?;
        Ok(())
    }

    async fn undefine_domain(&self, name: &str, flags: UndefineFlags) -> Result<(), HypervisorError> {
        let mut args = vec!["undefine", name];
        args.extend(flags.as_args());
        self.run(&args).await?;
        Ok(())
    }
}

/// In-flight `vol-upload`
struct VirshUpload {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    written: u64,
    call_timeout: Option<Duration>,
}

impl VirshUpload {
    async fn bounded<F, T>(timeout: Option<Duration>, future: F) -> Result<T, HypervisorError>
    where
        F: Future<Output = Result<T, HypervisorError>>,
    {
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, future)
                .await
                .map_err(|_elapsed| HypervisorError::Timeout {
                    operation: "vol-upload".to_string(),
                    timeout,
                })?,
            None => future.await,
        }
    }

    /// Close stdin and collect the exit status and stderr of virsh
    async fn wait(&mut self) -> Result<Output, HypervisorError> {
        drop(self.stdin.take());
        let Some(child) = self.child.take() else {
            return Err(closed());
        };
        Self::bounded(self.call_timeout, async {
            child.wait_with_output().await.map_err(HypervisorError::Io)
        })
        .await
    }
}

fn closed() -> HypervisorError {
    HypervisorError::with_code(ErrorCode::OperationInvalid, "vol-upload already finished")
}

#[async_trait::async_trait]
impl VolumeWriter for VirshUpload {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), HypervisorError> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(closed());
        };
        let result = Self::bounded(self.call_timeout, async {
            stdin.write_all(chunk).await.map_err(HypervisorError::Io)
        })
        .await;

        match result {
            Ok(()) => {
                self.written += chunk.len() as u64;
                Ok(())
            }
            // virsh quit early (broken pipe); its stderr names the libvirt error
            Err(HypervisorError::Io(io_error)) => {
                let output = self.wait().await?;
                check_output("vol-upload", &output)?;
                Err(HypervisorError::Io(io_error))
            }
            Err(e) => Err(e),
        }
    }

    async fn finish(self: Box<Self>) -> Result<u64, HypervisorError> {
        let mut upload = *self;
        let output = upload.wait().await?;
        check_output("vol-upload", &output)?;
        Ok(upload.written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pool_info() {
        let output = "Name:           abc123-bootstrap\n\
                      UUID:           3e0ab5b6-4f0e-4e45-8d6d-2f6f0d1c1f2b\n\
                      State:          running\n\
                      Persistent:     yes\n\
                      Autostart:      yes\n\
                      Capacity:       49.98 GiB\n";
        let info = parse_pool_info("abc123-bootstrap", output);
        assert!(info.active);
        assert!(info.autostart);

        let info = parse_pool_info("p", "State:          inactive\nAutostart:      no\n");
        assert!(!info.active);
        assert!(!info.autostart);
    }

    #[cfg(unix)]
    fn fake_virsh(dir: &tempfile::TempDir, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("virsh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lookup_domain_not_found_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_virsh(
            &dir,
            "echo \"error: failed to get domain 'x'\" >&2\n\
             echo \"error: Domain not found: no domain with matching name 'x'\" >&2\n\
             exit 1",
        );
        let client = VirshClient::new("qemu:///system").with_program(program);
        assert_eq!(client.lookup_domain("x").await.unwrap(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_undefine_error_is_classified() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_virsh(
            &dir,
            "echo \"error: invalid argument: unsupported flags (0x4) in function qemuDomainUndefineFlags\" >&2\nexit 1",
        );
        let client = VirshClient::new("qemu:///system").with_program(program);
        let err = client
            .undefine_domain("x", UndefineFlags::ALL)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidArg));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_call_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_virsh(&dir, "sleep 5");
        let client = VirshClient::new("qemu:///system")
            .with_program(program)
            .with_call_timeout(Duration::from_millis(100));
        let err = client.start_domain("x").await.unwrap_err();
        assert!(matches!(err, HypervisorError::Timeout { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_upload_reports_virsh_error_when_it_exits_early() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_virsh(
            &dir,
            "echo \"error: Storage volume not found: no storage vol with matching name 'v'\" >&2\nexit 1",
        );
        let client = VirshClient::new("qemu:///system").with_program(program);

        // Larger than a pipe buffer, so the write sees virsh go away
        let mut writer = client.upload_volume("p", "v").await.unwrap();
        let err = writer.write(&vec![0u8; 1 << 20]).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::NoStorageVol));
        assert!(err.is_not_found());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_upload_finish_reports_virsh_error() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_virsh(
            &dir,
            "cat > /dev/null\necho \"error: operation failed: No space left on device\" >&2\nexit 1",
        );
        let client = VirshClient::new("qemu:///system").with_program(program);

        let mut writer = client.upload_volume("p", "v").await.unwrap();
        writer.write(b"qcow2 data").await.unwrap();
        let err = writer.finish().await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::OperationFailed));
    }
}
