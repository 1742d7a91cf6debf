//! Scripted executor for supervisor tests.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::executor::{BindMount, ContainerExecutor, ContainerSpec, InputStream, OutputStream};

/// What the fake container does.
#[derive(Debug, Clone, Default)]
pub struct StubBehavior {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Files written at start, by container path, through the bind mounts.
    pub files: Vec<(String, Vec<u8>)>,
    /// Symlinks created at start: (container path, target).
    pub symlinks: Vec<(String, String)>,
    pub load_image_error: Option<String>,
    pub create_error: Option<String>,
    pub start_error: Option<String>,
    pub wait_error: Option<String>,
    /// Keep running until `stop` is called.
    pub run_until_stopped: bool,
}

/// The parts of the last `create` call tests look at.
#[derive(Debug, Clone, Default)]
pub struct CreatedSpec {
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: String,
    pub env: BTreeMap<String, String>,
    pub bind_mounts: BTreeMap<String, BindMount>,
    pub enable_network: bool,
    pub network_mode: String,
    pub ram: u64,
    pub vcpus: u32,
    pub cuda_device_count: u32,
    pub cgroup_parent: String,
    pub has_stdin: bool,
}

type Streams = (Option<InputStream>, OutputStream, OutputStream);

pub struct StubExecutor {
    behavior: StubBehavior,
    created: Mutex<Option<CreatedSpec>>,
    streams: Mutex<Option<Streams>>,
    stdin_data: Arc<Mutex<Vec<u8>>>,
    calls: Mutex<Vec<String>>,
    stops: AtomicUsize,
    stopped: AtomicBool,
    stop_signal: Notify,
    io: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StubExecutor {
    pub fn new(behavior: StubBehavior) -> Self {
        Self {
            behavior,
            created: Mutex::new(None),
            streams: Mutex::new(None),
            stdin_data: Arc::new(Mutex::new(Vec::new())),
            calls: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            stop_signal: Notify::new(),
            io: tokio::sync::Mutex::new(None),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn created(&self) -> Option<CreatedSpec> {
        self.created.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn stdin_data(&self) -> Vec<u8> {
        self.stdin_data.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    fn record(&self, call: &str) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call.to_string());
    }

    fn fail(msg: &Option<String>) -> Result<()> {
        match msg {
            Some(m) => Err(anyhow::anyhow!("{}", m)),
            None => Ok(()),
        }
    }

    fn write_files(&self, mounts: &BTreeMap<String, BindMount>) -> Result<()> {
        for (ctr_path, data) in &self.behavior.files {
            let host = host_path(mounts, ctr_path)?;
            std::fs::write(&host, data)?;
        }
        for (ctr_path, target) in &self.behavior.symlinks {
            let host = host_path(mounts, ctr_path)?;
            std::os::unix::fs::symlink(target, &host)?;
        }
        Ok(())
    }
}

/// Host location of `ctr_path` through the innermost covering bind mount,
/// with parent directories created.
fn host_path(mounts: &BTreeMap<String, BindMount>, ctr_path: &str) -> Result<std::path::PathBuf> {
    let (mount_path, mount) = mounts
        .iter()
        .filter(|(p, _)| ctr_path == *p || ctr_path.starts_with(&format!("{}/", p)))
        .max_by_key(|(p, _)| p.len())
        .ok_or_else(|| anyhow::anyhow!("no bind mount covers {}", ctr_path))?;
    let rest = ctr_path[mount_path.len()..].trim_start_matches('/');
    let host = Path::new(&mount.host_path).join(rest);
    if let Some(parent) = host.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(host)
}

#[async_trait]
impl ContainerExecutor for StubExecutor {
    async fn runtime(&self) -> String {
        "stub 1.0".to_string()
    }

    async fn load_image(&self, image_id: &str, _tarball: &Path) -> Result<()> {
        self.record(&format!("load_image {}", image_id));
        Self::fail(&self.behavior.load_image_error)
    }

    async fn create(&self, spec: ContainerSpec) -> Result<()> {
        self.record("create");
        Self::fail(&self.behavior.create_error)?;
        *self.created.lock().unwrap_or_else(|e| e.into_inner()) = Some(CreatedSpec {
            image: spec.image.clone(),
            command: spec.command.clone(),
            working_dir: spec.working_dir.clone(),
            env: spec.env.clone(),
            bind_mounts: spec.bind_mounts.clone(),
            enable_network: spec.enable_network,
            network_mode: spec.network_mode.clone(),
            ram: spec.ram,
            vcpus: spec.vcpus,
            cuda_device_count: spec.cuda_device_count,
            cgroup_parent: spec.cgroup_parent.clone(),
            has_stdin: spec.stdin.is_some(),
        });
        *self.streams.lock().unwrap_or_else(|e| e.into_inner()) = Some((spec.stdin, spec.stdout, spec.stderr));
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.record("start");
        Self::fail(&self.behavior.start_error)?;
        let mounts = self.created().map(|c| c.bind_mounts).unwrap_or_default();
        self.write_files(&mounts)?;
        let (stdin, mut stdout, mut stderr) = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| anyhow::anyhow!("container has not been created"))?;
        let out = self.behavior.stdout.clone();
        let err = self.behavior.stderr.clone();
        let sink = self.stdin_data.clone();
        let handle = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                let mut buf = Vec::new();
                if stdin.read_to_end(&mut buf).await.is_ok() {
                    sink.lock().unwrap_or_else(|e| e.into_inner()).extend(buf);
                }
            }
            let _ = stdout.write_all(&out).await;
            let _ = stdout.shutdown().await;
            let _ = stderr.write_all(&err).await;
            let _ = stderr.shutdown().await;
        });
        *self.io.lock().await = Some(handle);
        Ok(())
    }

    fn cgroup_id(&self) -> String {
        "stub-cgroup".to_string()
    }

    async fn wait(&self) -> Result<i32> {
        self.record("wait");
        Self::fail(&self.behavior.wait_error)?;
        let mut code = self.behavior.exit_code;
        if self.behavior.run_until_stopped {
            while !self.stopped.load(Ordering::SeqCst) {
                self.stop_signal.notified().await;
            }
            code = 137;
        }
        if let Some(handle) = self.io.lock().await.take() {
            handle.await?;
        }
        Ok(code)
    }

    async fn stop(&self) -> Result<()> {
        self.record("stop");
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_signal.notify_one();
        Ok(())
    }

    async fn close(&self) {
        self.record("close");
    }

    async fn inject_command(
        &self,
        _detach_keys: &str,
        _username: &str,
        _tty: bool,
        command: &[String],
    ) -> Result<tokio::process::Command> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(shell_join(command));
        Ok(cmd)
    }
}

fn shell_join(command: &[String]) -> String {
    command
        .iter()
        .map(|a| format!("'{}'", a.replace('\'', r"'\''")))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stub_writes_through_bind_mounts() {
        let dir = tempfile::TempDir::new().unwrap();
        let e = StubExecutor::new(StubBehavior {
            exit_code: 2,
            stdout: b"hello\n".to_vec(),
            files: vec![("/out/sub/a.txt".into(), b"A".to_vec())],
            ..Default::default()
        });
        let (w, mut r) = tokio::io::duplex(64);
        let mut spec = ContainerSpec::new("img", vec![]);
        spec.stdout = Box::new(w);
        spec.bind_mounts.insert(
            "/out".into(),
            BindMount {
                host_path: dir.path().display().to_string(),
                read_only: false,
            },
        );
        e.create(spec).await.unwrap();
        e.start().await.unwrap();
        assert_eq!(e.wait().await.unwrap(), 2);
        let mut got = String::new();
        r.read_to_string(&mut got).await.unwrap();
        assert_eq!(got, "hello\n");
        assert_eq!(std::fs::read(dir.path().join("sub/a.txt")).unwrap(), b"A");
        assert_eq!(e.calls(), vec!["create", "start", "wait"]);
    }

    #[tokio::test]
    async fn test_stub_runs_until_stopped() {
        let e = Arc::new(StubExecutor::new(StubBehavior {
            run_until_stopped: true,
            ..Default::default()
        }));
        e.create(ContainerSpec::new("img", vec![])).await.unwrap();
        e.start().await.unwrap();
        let waiter = {
            let e = e.clone();
            tokio::spawn(async move { e.wait().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        e.stop().await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), 137);
        assert_eq!(e.stop_count(), 1);
    }
}
