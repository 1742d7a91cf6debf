//! Single-binary backend: every container is one `singularity exec` child.

use anyhow::Result;
use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use tokio::task::JoinHandle;

use crate::executor::{ContainerExecutor, ContainerSpec, io_result, pump};

pub struct SingularityBackend {
    singularity: String,
    tmpdir: Mutex<Option<tempfile::TempDir>>,
    tmpdir_path: PathBuf,
    image: Mutex<Option<PathBuf>>,
    spec: Mutex<Option<ContainerSpec>>,
    child: tokio::sync::Mutex<Option<tokio::process::Child>>,
    pid: AtomicI32,
    exited: AtomicBool,
    io: tokio::sync::Mutex<Option<JoinHandle<Result<()>>>>,
}

impl SingularityBackend {
    pub fn new() -> Result<Self> {
        Self::with_binary("singularity")
    }

    pub fn with_binary(singularity: &str) -> Result<Self> {
        let tmpdir = tempfile::Builder::new()
            .prefix("crunch-run-singularity-")
            .tempdir()?;
        Ok(Self {
            singularity: singularity.to_string(),
            tmpdir_path: tmpdir.path().to_path_buf(),
            tmpdir: Mutex::new(Some(tmpdir)),
            image: Mutex::new(None),
            spec: Mutex::new(None),
            child: tokio::sync::Mutex::new(None),
            pid: AtomicI32::new(0),
            exited: AtomicBool::new(false),
            io: tokio::sync::Mutex::new(None),
        })
    }

    /// `singularity exec` arguments for `spec` running `image`.
    fn exec_args(spec: &ContainerSpec, image: &Path, as_root: bool) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "exec".into(),
            "--containall".into(),
            "--cleanenv".into(),
            format!("--pwd={}", spec.working_dir),
        ];
        if !spec.enable_network {
            args.push("--net".into());
            args.push("--network=none".into());
        } else if as_root {
            // bridge networking needs root; otherwise share the host's
            args.push("--net".into());
            args.push("--network=bridge".into());
        }
        if spec.cuda_device_count > 0 {
            args.push("--nv".into());
        }
        let home = spec.env.get("HOME");
        for (path, mount) in &spec.bind_mounts {
            if Some(path) == home {
                args.push("--home".into());
                args.push(format!("{}:{}", mount.host_path, path));
            } else {
                let mode = if mount.read_only { "ro" } else { "rw" };
                args.push("--bind".into());
                args.push(format!("{}:{}:{}", mount.host_path, path, mode));
            }
        }
        args.push(image.display().to_string());
        args.extend(spec.command.iter().cloned());
        args
    }

    /// Complete environment of the `singularity` process. Container
    /// variables are passed as `SINGULARITYENV_*` and taken literally.
    fn exec_env(spec: &ContainerSpec, host: &dyn Fn(&str) -> Option<String>) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = spec
            .env
            .iter()
            .filter(|(k, _)| k.as_str() != "HOME")
            .map(|(k, v)| (format!("SINGULARITYENV_{}", k), v.clone()))
            .collect();
        if let Some(devices) = host("CUDA_VISIBLE_DEVICES").filter(|d| !d.is_empty()) {
            env.push(("SINGULARITYENV_CUDA_VISIBLE_DEVICES".into(), devices));
        }
        env.push(("SINGULARITY_NO_EVAL".into(), "1".into()));
        // needed for rootless cgroup management
        for key in ["XDG_RUNTIME_DIR", "DBUS_SESSION_BUS_ADDRESS"] {
            env.push((key.into(), host(key).unwrap_or_default()));
        }
        env
    }

    /// Pid of some process inside the container: a pid namespace owner
    /// whose ancestry leads back to our child.
    async fn contained_process(&self) -> Result<i32> {
        let child = self.pid.load(Ordering::SeqCst);
        if child == 0 {
            anyhow::bail!("container has not started yet");
        }
        let output = tokio::process::Command::new("lsns").output().await?;
        if !output.status.success() {
            anyhow::bail!("lsns: {}", String::from_utf8_lossy(&output.stderr).trim());
        }
        let listing = String::from_utf8_lossy(&output.stdout);
        for line in listing.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 || fields[1] != "pid" {
                continue;
            }
            let pid: i32 = fields[3]
                .parse()
                .map_err(|_| anyhow::anyhow!("error parsing PID field in lsns output: {:?}", fields[3]))?;
            let mut parent = pid;
            while let Some(ppid) = parent_pid(parent) {
                if ppid == child {
                    return Ok(pid);
                }
                if ppid <= 1 {
                    break;
                }
                parent = ppid;
            }
        }
        anyhow::bail!("failed to find any process inside the container")
    }
}

fn parent_pid(pid: i32) -> Option<i32> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    status
        .lines()
        .find_map(|l| l.strip_prefix("PPid:"))
        .and_then(|v| v.trim().parse().ok())
}

/// Local IPv4 addresses visible to `pid`, from its routing table.
fn process_ips(pid: i32) -> Result<HashSet<String>> {
    let fib = std::fs::read_to_string(format!("/proc/{}/net/fib_trie", pid))?;
    Ok(local_addresses(&fib))
}

fn local_addresses(fib_trie: &str) -> HashSet<String> {
    // "|-- 10.1.2.3" followed by "/32 host LOCAL"
    let lines: Vec<&str> = fib_trie.lines().collect();
    let mut addrs = HashSet::new();
    for (i, line) in lines.iter().enumerate() {
        if i == 0 || !line.ends_with("/32 host LOCAL") {
            continue;
        }
        if let Some(addr) = lines[i - 1].rsplit(' ').next()
            && addr.parse::<std::net::Ipv4Addr>().is_ok()
        {
            addrs.insert(addr.to_string());
        }
    }
    addrs
}

#[async_trait]
impl ContainerExecutor for SingularityBackend {
    async fn runtime(&self) -> String {
        match tokio::process::Command::new(&self.singularity)
            .arg("--version")
            .output()
            .await
        {
            Ok(o) if o.status.success() => String::from_utf8_lossy(&o.stdout).trim_end().to_string(),
            _ => "singularity (unknown version)".to_string(),
        }
    }

    async fn load_image(&self, _image_id: &str, tarball: &Path) -> Result<()> {
        if self.image.lock().unwrap_or_else(|e| e.into_inner()).is_some() {
            return Ok(());
        }
        tokio::fs::metadata(tarball).await?;
        tracing::info!("[singularity] building singularity image");
        // docker-archive:// paths must not contain ':'
        let link = self.tmpdir_path.join("image.tar");
        tokio::fs::symlink(tarball, &link).await?;
        let cache = self.tmpdir_path.join("cache");
        let tmp = self.tmpdir_path.join("tmp");
        tokio::fs::create_dir(&cache).await?;
        tokio::fs::create_dir(&tmp).await?;
        let sif = self.tmpdir_path.join("image.sif");

        let output = tokio::process::Command::new(&self.singularity)
            .arg("build")
            .arg(&sif)
            .arg(format!("docker-archive://{}", link.display()))
            .env("SINGULARITY_CACHEDIR", &cache)
            .env("SINGULARITY_TMPDIR", &tmp)
            .output()
            .await;
        let _ = tokio::fs::remove_dir_all(&cache).await;
        let _ = tokio::fs::remove_dir_all(&tmp).await;
        let output = output?;
        tracing::info!(
            "[singularity] {}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if !output.status.success() {
            anyhow::bail!("singularity build failed: {}", output.status);
        }
        *self.image.lock().unwrap_or_else(|e| e.into_inner()) = Some(sif);
        Ok(())
    }

    async fn create(&self, spec: ContainerSpec) -> Result<()> {
        *self.spec.lock().unwrap_or_else(|e| e.into_inner()) = Some(spec);
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let spec = self
            .spec
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| anyhow::anyhow!("container has not been created"))?;
        let image = self
            .image
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| anyhow::anyhow!("image has not been loaded"))?;

        let as_root = nix::unistd::geteuid().is_root();
        let args = Self::exec_args(&spec, &image, as_root);
        let env = Self::exec_env(&spec, &|k| std::env::var(k).ok());
        let ContainerSpec {
            stdin,
            stdout,
            stderr,
            ..
        } = spec;

        let mut cmd = tokio::process::Command::new(&self.singularity);
        cmd.args(&args)
            .env_clear()
            .envs(env)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn()?;
        self.pid
            .store(child.id().map(|p| p as i32).unwrap_or_default(), Ordering::SeqCst);

        if let (Some(src), Some(dst)) = (stdin, child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = pump(src, dst).await {
                    tracing::warn!("[singularity] writing container stdin: {}", e);
                }
            });
        }
        let out_r = child.stdout.take();
        let err_r = child.stderr.take();
        let handle = tokio::spawn(async move {
            let (out, err) = tokio::join!(
                async move {
                    match out_r {
                        Some(r) => pump(r, stdout).await,
                        None => Ok(0),
                    }
                },
                async move {
                    match err_r {
                        Some(r) => pump(r, stderr).await,
                        None => Ok(0),
                    }
                }
            );
            io_result(&[out, err])
        });
        *self.io.lock().await = Some(handle);
        *self.child.lock().await = Some(child);
        Ok(())
    }

    fn cgroup_id(&self) -> String {
        String::new()
    }

    async fn wait(&self) -> Result<i32> {
        let mut child = self
            .child
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("container has not started"))?;
        let status = child.wait().await;
        self.exited.store(true, Ordering::SeqCst);
        let status = status?;
        if let Some(handle) = self.io.lock().await.take() {
            handle.await??;
        }
        Ok(status
            .code()
            .or_else(|| status.signal().map(|s| 128 + s))
            .unwrap_or(-1))
    }

    async fn stop(&self) -> Result<()> {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid == 0 || self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }
        let pid = Pid::from_raw(pid);
        if kill(pid, None).is_err() {
            return Ok(());
        }
        kill(pid, Signal::SIGKILL).map_err(|e| anyhow::anyhow!("kill singularity: {}", e))
    }

    async fn close(&self) {
        let dir = self.tmpdir.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(dir) = dir
            && let Err(e) = dir.close()
        {
            tracing::warn!("[singularity] error removing temp dir: {}", e);
        }
    }

    async fn inject_command(
        &self,
        _detach_keys: &str,
        _username: &str,
        _tty: bool,
        command: &[String],
    ) -> Result<tokio::process::Command> {
        let target = self.contained_process().await?;
        let mut cmd = tokio::process::Command::new("nsenter");
        cmd.arg(format!("--target={}", target)).arg("--all").args(command);
        Ok(cmd)
    }

    async fn ip_address(&self) -> Result<String> {
        let target = self.contained_process().await?;
        let theirs = process_ips(target)?;
        let ours = process_ips(std::process::id() as i32)?;
        theirs
            .into_iter()
            .find(|ip| !ours.contains(ip))
            .ok_or_else(|| anyhow::anyhow!("container has no IP address distinct from host"))
    }
}
