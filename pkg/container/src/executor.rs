use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};

pub type InputStream = Box<dyn AsyncRead + Send + Unpin>;
pub type OutputStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Host directory or file made visible inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub host_path: String,
    pub read_only: bool,
}

/// Everything a backend needs to create one container.
pub struct ContainerSpec {
    pub image: String,
    pub vcpus: u32,
    pub ram: u64,
    pub working_dir: String,
    pub env: BTreeMap<String, String>,
    /// container path → host side
    pub bind_mounts: BTreeMap<String, BindMount>,
    pub command: Vec<String>,
    pub enable_network: bool,
    pub cuda_device_count: u32,
    /// daemon network mode used when networking is enabled
    pub network_mode: String,
    pub cgroup_parent: String,
    pub stdin: Option<InputStream>,
    pub stdout: OutputStream,
    pub stderr: OutputStream,
}

impl ContainerSpec {
    /// A spec with no limits, no mounts and output discarded.
    pub fn new(image: &str, command: Vec<String>) -> Self {
        Self {
            image: image.to_string(),
            vcpus: 0,
            ram: 0,
            working_dir: String::new(),
            env: BTreeMap::new(),
            bind_mounts: BTreeMap::new(),
            command,
            enable_network: false,
            cuda_device_count: 0,
            network_mode: String::new(),
            cgroup_parent: String::new(),
            stdin: None,
            stdout: Box::new(tokio::io::sink()),
            stderr: Box::new(tokio::io::sink()),
        }
    }
}

/// One container's lifecycle on some runtime.
///
/// Call order is `load_image`, `create`, `start`, `wait`; `stop` may be called
/// at any point (and more than once), `close` exactly once at the end.
/// `wait` returns only after everything the container wrote to stdout and
/// stderr has been copied to the spec's writers.
#[async_trait]
pub trait ContainerExecutor: Send + Sync {
    /// Runtime name and version for the log.
    async fn runtime(&self) -> String;

    /// Make `image_id` available, loading it from `tarball` if needed.
    async fn load_image(&self, image_id: &str, tarball: &Path) -> Result<()>;

    async fn create(&self, spec: ContainerSpec) -> Result<()>;

    async fn start(&self) -> Result<()>;

    /// Name of the container's cgroup, empty if unknown.
    fn cgroup_id(&self) -> String;

    /// Exit status of the container process.
    async fn wait(&self) -> Result<i32>;

    /// Kill the container and remove it. Idempotent.
    async fn stop(&self) -> Result<()>;

    /// Release supervisor-side resources.
    async fn close(&self);

    /// Command that runs `command` inside the running container with
    /// stdio attached.
    async fn inject_command(
        &self,
        detach_keys: &str,
        username: &str,
        tty: bool,
        command: &[String],
    ) -> Result<tokio::process::Command> {
        let _ = (detach_keys, username, tty, command);
        Err(anyhow::anyhow!("inject_command not supported by this backend"))
    }

    /// Address of the container on the host's network.
    async fn ip_address(&self) -> Result<String> {
        Err(anyhow::anyhow!("ip_address not supported by this backend"))
    }
}

/// Copy `reader` to `writer` until EOF, then shut the writer down.
pub(crate) async fn pump<R, W>(mut reader: R, mut writer: W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;
    let n = tokio::io::copy(&mut reader, &mut writer).await?;
    writer.shutdown().await?;
    Ok(n)
}

/// Combine per-stream copy results, first error wins.
pub(crate) fn io_result(results: &[std::io::Result<u64>]) -> Result<()> {
    for r in results {
        if let Err(e) = r {
            anyhow::bail!("error copying container output: {}", e);
        }
    }
    Ok(())
}
