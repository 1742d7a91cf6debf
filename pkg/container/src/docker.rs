//! Container daemon backend, driven through the `docker` CLI.
//!
//! `create` registers the container, `start` runs `docker start --attach`
//! whose stdout/stderr carry the container's streams, and `wait` races
//! `docker wait` against an `inspect` watchdog.

use anyhow::Result;
use async_trait::async_trait;
use pkg_constants::runtime::{DOCKER_MIN_RAM, WATCHDOG_MAX_ERRORS};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::executor::{ContainerExecutor, ContainerSpec, InputStream, OutputStream, io_result, pump};

struct Streams {
    stdin: Option<InputStream>,
    stdout: OutputStream,
    stderr: OutputStream,
}

pub struct DockerBackend {
    container_uuid: String,
    docker: String,
    watchdog_interval: Duration,
    container_id: OnceLock<String>,
    streams: Mutex<Option<Streams>>,
    io: tokio::sync::Mutex<Option<JoinHandle<Result<()>>>>,
    ip: OnceLock<String>,
}

impl DockerBackend {
    pub fn new(container_uuid: &str, watchdog_interval: Duration) -> Self {
        Self::with_binary("docker", container_uuid, watchdog_interval)
    }

    /// Use a specific client binary instead of `docker` from `$PATH`.
    pub fn with_binary(docker: &str, container_uuid: &str, watchdog_interval: Duration) -> Self {
        let watchdog_interval = if watchdog_interval.is_zero() {
            Duration::from_secs(pkg_constants::runtime::WATCHDOG_INTERVAL_SECS)
        } else {
            watchdog_interval
        };
        Self {
            container_uuid: container_uuid.to_string(),
            docker: docker.to_string(),
            watchdog_interval,
            container_id: OnceLock::new(),
            streams: Mutex::new(None),
            io: tokio::sync::Mutex::new(None),
            ip: OnceLock::new(),
        }
    }

    fn cmd(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.docker);
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    fn id(&self) -> Result<&str> {
        self.container_id
            .get()
            .map(String::as_str)
            .ok_or_else(|| anyhow::anyhow!("container has not been created"))
    }

    /// Run a docker subcommand, returning trimmed stdout.
    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.cmd().args(args).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("docker {} failed: {}", args[0], stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// `docker create` arguments for `spec`.
    fn create_args(&self, spec: &ContainerSpec, cuda_visible_devices: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            self.container_uuid.clone(),
            "--log-driver".into(),
            "none".into(),
        ];
        if spec.stdin.is_some() {
            args.push("--interactive".into());
        }
        if !spec.working_dir.is_empty() && spec.working_dir != "." {
            args.push("--workdir".into());
            args.push(spec.working_dir.clone());
        }
        for (k, v) in &spec.env {
            args.push("--env".into());
            args.push(format!("{}={}", k, v));
        }
        if spec.ram > 0 {
            let ram = spec.ram.max(DOCKER_MIN_RAM);
            args.push(format!("--memory={}", ram));
            args.push(format!("--memory-swap={}", ram));
        }
        if spec.vcpus > 0 {
            args.push(format!("--cpus={}", spec.vcpus));
        }
        if !spec.cgroup_parent.is_empty() {
            args.push(format!("--cgroup-parent={}", spec.cgroup_parent));
        }
        if spec.cuda_device_count > 0 {
            // explicit device ids from a resource manager win over a count
            let gpus = match cuda_visible_devices.filter(|d| !d.is_empty()) {
                Some(ids) => format!("\"device={}\"", ids),
                None => spec.cuda_device_count.to_string(),
            };
            args.push("--gpus".into());
            args.push(gpus);
        }
        if !spec.enable_network {
            args.push("--network=none".into());
        } else if !spec.network_mode.is_empty() {
            args.push(format!("--network={}", spec.network_mode));
        }
        for (path, mount) in &spec.bind_mounts {
            let mut bind = format!("{}:{}", mount.host_path, path);
            if mount.read_only {
                bind.push_str(":ro");
            }
            args.push("--volume".into());
            args.push(bind);
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }

    async fn watchdog(&self, id: &str) -> anyhow::Error {
        let start = tokio::time::Instant::now() + self.watchdog_interval;
        let mut tick = tokio::time::interval_at(start, self.watchdog_interval);
        let mut errors = 0;
        loop {
            tick.tick().await;
            let probe = tokio::time::timeout(
                self.watchdog_interval,
                self.run(&["inspect", "--format", "{{.State.Status}}", id]),
            )
            .await;
            let err = match probe {
                Err(_) => anyhow::anyhow!("error inspecting container: timed out"),
                Ok(Err(e)) => anyhow::anyhow!("error inspecting container: {}", e),
                Ok(Ok(status)) if status == "running" || status == "created" => {
                    errors = 0;
                    continue;
                }
                Ok(Ok(status)) => anyhow::anyhow!("container is not running: State={}", status),
            };
            tracing::warn!("[docker] watchdog: {}", err);
            errors += 1;
            if errors >= WATCHDOG_MAX_ERRORS {
                tracing::warn!("[docker] watchdog: giving up");
                return err;
            }
        }
    }
}

#[async_trait]
impl ContainerExecutor for DockerBackend {
    async fn runtime(&self) -> String {
        match self
            .run(&["version", "--format", "{{range .Server.Components}}{{.Name}} {{.Version}}, {{end}}"])
            .await
        {
            Ok(v) if !v.trim_end_matches([',', ' ']).is_empty() => {
                format!("docker {}", v.trim_end_matches([',', ' ']))
            }
            _ => "docker (unknown version)".to_string(),
        }
    }

    async fn load_image(&self, image_id: &str, tarball: &Path) -> Result<()> {
        if self.run(&["image", "inspect", image_id]).await.is_ok() {
            return Ok(());
        }
        let tar = tarball.to_string_lossy();
        let out = self
            .run(&["load", "--input", &*tar])
            .await
            .map_err(|e| anyhow::anyhow!("While loading container image into Docker: {}", e))?;
        tracing::info!("[docker] loaded image: response {}", out);
        Ok(())
    }

    async fn create(&self, spec: ContainerSpec) -> Result<()> {
        tracing::info!("[docker] Creating Docker container");
        let cuda = std::env::var("CUDA_VISIBLE_DEVICES").ok();
        let args = self.create_args(&spec, cuda.as_deref());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self
            .run(&arg_refs)
            .await
            .map_err(|e| anyhow::anyhow!("While creating container: {}", e))?;
        let _ = self.container_id.set(id);
        *self.streams.lock().unwrap_or_else(|e| e.into_inner()) = Some(Streams {
            stdin: spec.stdin,
            stdout: spec.stdout,
            stderr: spec.stderr,
        });
        Ok(())
    }

    fn cgroup_id(&self) -> String {
        self.container_id.get().cloned().unwrap_or_default()
    }

    async fn start(&self) -> Result<()> {
        let id = self.id()?.to_string();
        let streams = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| anyhow::anyhow!("container already started"))?;

        let mut cmd = self.cmd();
        cmd.arg("start").arg("--attach");
        if streams.stdin.is_some() {
            cmd.arg("--interactive").stdin(Stdio::piped());
        }
        let mut attach = cmd
            .arg(&id)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| anyhow::anyhow!("error attaching container stdin/stdout/stderr streams: {}", e))?;

        let Streams {
            stdin,
            stdout: out_w,
            stderr: err_w,
        } = streams;
        let stdin_task = match (stdin, attach.stdin.take()) {
            (Some(src), Some(dst)) => Some(tokio::spawn(pump(src, dst))),
            _ => None,
        };
        let out_r = attach.stdout.take();
        let err_r = attach.stderr.take();
        let handle = tokio::spawn(async move {
            let (out, err) = tokio::join!(
                async move {
                    match out_r {
                        Some(r) => pump(r, out_w).await,
                        None => Ok(0),
                    }
                },
                async move {
                    match err_r {
                        Some(r) => pump(r, err_w).await,
                        None => Ok(0),
                    }
                }
            );
            let status = attach.wait().await?;
            if let Some(t) = stdin_task
                && let Ok(Err(e)) = t.await
            {
                tracing::warn!("[docker] While writing to docker container on stdin: {}", e);
            }
            io_result(&[out, err])?;
            if !status.success() {
                tracing::debug!("[docker] attach exited with {}", status);
            }
            Ok::<(), anyhow::Error>(())
        });
        *self.io.lock().await = Some(handle);
        Ok(())
    }

    async fn wait(&self) -> Result<i32> {
        let id = self.id()?.to_string();
        let wait_args = ["wait", id.as_str()];
        let code = tokio::select! {
            r = self.run(&wait_args) => {
                let out = r.map_err(|e| anyhow::anyhow!("container wait: {}", e))?;
                out.lines()
                    .last()
                    .unwrap_or_default()
                    .trim()
                    .parse::<i32>()
                    .map_err(|e| anyhow::anyhow!("container wait: unexpected output {:?}: {}", out, e))?
            }
            err = self.watchdog(&id) => return Err(err),
        };
        // all output copied before reporting the exit
        if let Some(handle) = self.io.lock().await.take() {
            handle.await??;
        }
        Ok(code)
    }

    async fn stop(&self) -> Result<()> {
        let Some(id) = self.container_id.get() else {
            return Ok(());
        };
        match self.run(&["rm", "--force", id.as_str()]).await {
            Err(e) if e.to_string().contains("No such container") => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn close(&self) {
        if let Err(e) = self.stop().await {
            tracing::warn!("[docker] remove container: {}", e);
        }
    }

    async fn inject_command(
        &self,
        detach_keys: &str,
        username: &str,
        tty: bool,
        command: &[String],
    ) -> Result<tokio::process::Command> {
        let id = self.id()?;
        let mut cmd = tokio::process::Command::new(&self.docker);
        cmd.arg("exec")
            .arg("-i")
            .arg(format!("--detach-keys={}", detach_keys))
            .arg(format!("--user={}", username));
        if tty {
            cmd.arg("-t");
        }
        cmd.arg(id).args(command);
        Ok(cmd)
    }

    async fn ip_address(&self) -> Result<String> {
        if let Some(ip) = self.ip.get() {
            return Ok(ip.clone());
        }
        let id = self.id()?;
        let ip = tokio::time::timeout(
            Duration::from_secs(60),
            self.run(&["inspect", "--format", "{{.NetworkSettings.IPAddress}}", id]),
        )
        .await
        .map_err(|_| anyhow::anyhow!("cannot get docker container info: timed out"))?
        .map_err(|e| anyhow::anyhow!("cannot get docker container info: {}", e))?;
        if ip.is_empty() {
            anyhow::bail!("container has no IP address");
        }
        Ok(self.ip.get_or_init(|| ip).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::BindMount;
    use std::os::unix::fs::PermissionsExt;

    fn spec() -> ContainerSpec {
        let mut spec = ContainerSpec::new("sha256:abcd", vec!["echo".into(), "hi".into()]);
        spec.working_dir = "/tmp".into();
        spec.env.insert("HOME".into(), "/home/me".into());
        spec.ram = 1024;
        spec.vcpus = 2;
        spec.bind_mounts.insert(
            "/keep/x".into(),
            BindMount {
                host_path: "/mnt/by_id/x".into(),
                read_only: true,
            },
        );
        spec
    }

    #[test]
    fn test_create_args() {
        let d = DockerBackend::new("zzzzz-dz642-000000000000000", Duration::ZERO);
        let args = d.create_args(&spec(), None);
        assert_eq!(&args[..5], &["create", "--name", "zzzzz-dz642-000000000000000", "--log-driver", "none"]);
        assert!(args.contains(&"--workdir".to_string()));
        assert!(args.contains(&"HOME=/home/me".to_string()));
        // raised to the daemon's floor
        assert!(args.contains(&format!("--memory={}", DOCKER_MIN_RAM)));
        assert!(args.contains(&"--cpus=2".to_string()));
        assert!(args.contains(&"--network=none".to_string()));
        assert!(args.contains(&"/mnt/by_id/x:/keep/x:ro".to_string()));
        assert!(!args.contains(&"--interactive".to_string()));
        assert_eq!(&args[args.len() - 3..], &["sha256:abcd", "echo", "hi"]);
        assert_eq!(d.watchdog_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_create_args_network_and_gpus() {
        let d = DockerBackend::new("zzzzz-dz642-000000000000000", Duration::from_secs(5));
        let mut s = spec();
        s.working_dir = ".".into();
        s.enable_network = true;
        s.network_mode = "host".into();
        s.cuda_device_count = 2;
        s.stdin = Some(Box::new(tokio::io::empty()));
        let args = d.create_args(&s, Some("1,3"));
        assert!(!args.contains(&"--workdir".to_string()));
        assert!(args.contains(&"--network=host".to_string()));
        assert!(args.contains(&"\"device=1,3\"".to_string()));
        assert!(args.contains(&"--interactive".to_string()));

        let args = d.create_args(&s, None);
        let i = args.iter().position(|a| a == "--gpus").unwrap();
        assert_eq!(args[i + 1], "2");
    }

    /// Fake client: `create` prints an id, `start --attach` prints to both
    /// streams, `wait` prints 3, `inspect` reports running.
    fn fake_docker(dir: &Path) -> String {
        let path = dir.join("docker");
        std::fs::write(
            &path,
            "#!/bin/sh\ncase \"$1\" in\n\
             create) echo 0123abcd ;;\n\
             start) echo out; echo err >&2 ;;\n\
             wait) echo 3 ;;\n\
             inspect) echo running ;;\n\
             rm) echo \"Error: No such container: $3\" >&2; exit 1 ;;\n\
             esac\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn test_lifecycle_with_fake_client() {
        let dir = tempfile::TempDir::new().unwrap();
        let bin = fake_docker(dir.path());
        let d = DockerBackend::with_binary(&bin, "zzzzz-dz642-000000000000000", Duration::from_secs(60));
        let (out_w, mut out_r) = tokio::io::duplex(1024);
        let (err_w, mut err_r) = tokio::io::duplex(1024);
        let mut s = ContainerSpec::new("img", vec!["true".into()]);
        s.stdout = Box::new(out_w);
        s.stderr = Box::new(err_w);

        d.create(s).await.unwrap();
        assert_eq!(d.cgroup_id(), "0123abcd");
        d.start().await.unwrap();
        assert_eq!(d.wait().await.unwrap(), 3);

        use tokio::io::AsyncReadExt;
        let mut out = String::new();
        out_r.read_to_string(&mut out).await.unwrap();
        let mut err = String::new();
        err_r.read_to_string(&mut err).await.unwrap();
        assert_eq!(out, "out\n");
        assert_eq!(err, "err\n");

        // already gone counts as stopped
        d.stop().await.unwrap();
        d.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_before_create() {
        let d = DockerBackend::new("zzzzz-dz642-000000000000000", Duration::ZERO);
        d.stop().await.unwrap();
        assert_eq!(d.cgroup_id(), "");
        assert!(d.start().await.is_err());
    }
}
