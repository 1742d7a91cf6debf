//! The FUSE mount helper process that exposes collections to the host.

use anyhow::{Result, bail};
use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use pkg_constants::paths::{MOUNT_HELPER, MOUNT_READY_MARKER};
use pkg_constants::runtime::UNMOUNT_TIMEOUT_SECS;
use pkg_logging::{LogScanner, ThrottledLogger, copy_lines};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;

/// Lines in the helper's stderr worth surfacing on the container record.
pub const WARNING_PATTERNS: &[&str] = &[
    "Keep write error",
    "Block not found error",
    "Unhandled exception during FUSE operation",
];

/// Called with `(pattern, line)` the first time a warning pattern shows up.
pub type WarningHook = Arc<dyn Fn(&str, &str) + Send + Sync>;

pub struct MountRequest {
    /// Program and arguments.
    pub argv: Vec<String>,
    pub mountpoint: PathBuf,
    /// Container-scoped API token for the helper.
    pub token: String,
    pub env: BTreeMap<String, String>,
    /// Paths that must be readable once the mount is up.
    pub collection_paths: Vec<PathBuf>,
    /// The helper's own log stream.
    pub log: Arc<ThrottledLogger>,
    pub crunch_log: Arc<ThrottledLogger>,
    pub on_warning: WarningHook,
}

/// A running helper. `exited` flips to true when the process is gone.
pub struct MountedHelper {
    pub pid: Option<u32>,
    pub exited: watch::Receiver<bool>,
}

impl MountedHelper {
    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Resolves when the helper process exits.
    pub async fn wait_exit(&self) {
        let mut rx = self.exited.clone();
        let _ = rx.wait_for(|gone| *gone).await;
    }
}

#[async_trait]
pub trait MountHelper: Send + Sync {
    /// Start the helper and return once the mount is ready.
    async fn mount(&self, req: MountRequest) -> Result<MountedHelper>;

    /// Ask the helper to unmount, killing it if that takes too long.
    async fn unmount(&self, mounted: &MountedHelper, mountpoint: &Path, log: &ThrottledLogger);
}

// ─── arv-mount ─────────────────────────────────────────────────

pub struct ArvMount {
    program: String,
    unmount_timeout: Duration,
}

impl Default for ArvMount {
    fn default() -> Self {
        Self {
            program: MOUNT_HELPER.to_string(),
            unmount_timeout: Duration::from_secs(UNMOUNT_TIMEOUT_SECS),
        }
    }
}

impl ArvMount {
    pub fn new() -> Self {
        Self::default()
    }
}

async fn scan_stderr<R: AsyncRead + Unpin>(stderr: R, log: Arc<ThrottledLogger>, on_warning: WarningHook) {
    let mut scanner = LogScanner::new(WARNING_PATTERNS, move |pattern, line| on_warning(pattern, line));
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => return,
            Ok(_) => {
                tracing::info!("[arv-mount] {}", String::from_utf8_lossy(&line).trim_end());
                log.write(&line);
                scanner.scan(&line);
            }
            Err(e) => {
                log.println(format!("error reading arv-mount stderr: {}", e));
                return;
            }
        }
    }
}

#[async_trait]
impl MountHelper for ArvMount {
    async fn mount(&self, req: MountRequest) -> Result<MountedHelper> {
        let Some((program, args)) = req.argv.split_first() else {
            bail!("empty mount helper command line");
        };
        req.crunch_log.println(format!("Running {:?}", req.argv));
        let mut child = Command::new(program)
            .args(args)
            .env_clear()
            .envs(req.env.iter().filter(|(k, _)| k.as_str() != "ARVADOS_API_TOKEN"))
            .env("ARVADOS_API_TOKEN", &req.token)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| anyhow::anyhow!("starting {}: {}", program, e))?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            let log = req.log.clone();
            tokio::spawn(async move {
                let _ = copy_lines(stdout, &log).await;
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(scan_stderr(stderr, req.log.clone(), req.on_warning.clone()));
        }

        let (exit_tx, exited) = watch::channel(false);
        let crunch_log = req.crunch_log.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if !status.success() => {
                    crunch_log.println(format!("Arv-mount exit error: {}", status));
                }
                Err(e) => crunch_log.println(format!("Arv-mount exit error: {}", e)),
                Ok(_) => {}
            }
            let _ = exit_tx.send(true);
        });

        let mut exit_rx = exited.clone();
        let ready = req.mountpoint.join(MOUNT_READY_MARKER);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(100)) => {
                    if tokio::fs::metadata(&ready).await.is_ok() {
                        return Ok(MountedHelper { pid, exited });
                    }
                }
                _ = async { let _ = exit_rx.wait_for(|gone| *gone).await; } => {
                    bail!("{} exited before the mount was ready", program);
                }
            }
        }
    }

    async fn unmount(&self, mounted: &MountedHelper, mountpoint: &Path, log: &ThrottledLogger) {
        if mounted.has_exited() {
            return;
        }
        let argv = vec![
            self.program.clone(),
            format!("--unmount-timeout={}", self.unmount_timeout.as_secs()),
            "--unmount".to_string(),
            mountpoint.display().to_string(),
        ];
        log.println(format!("Running {:?}", argv));
        let umount = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut umount = match umount {
            Ok(c) => c,
            Err(e) => {
                log.println(format!("Error unmounting: {}", e));
                kill_helper(mounted);
                return;
            }
        };
        let bound = self.unmount_timeout + Duration::from_secs(1);
        let finished = tokio::time::timeout(bound, async {
            match wait_collecting_stderr(&mut umount).await {
                Ok((status, _)) if status.success() => {}
                Ok((status, stderr)) => log.println(format!("Error unmounting: {}: {}", status, stderr.trim())),
                Err(e) => log.println(format!("Error unmounting: {}", e)),
            }
            mounted.wait_exit().await;
        })
        .await;
        if finished.is_err() {
            log.println("Timed out waiting for unmount");
            kill_helper(mounted);
        }
    }
}

fn kill_helper(mounted: &MountedHelper) {
    if let Some(pid) = mounted.pid
        && let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
    {
        tracing::warn!("[arv-mount] kill {}: {}", pid, e);
    }
}

async fn wait_collecting_stderr(child: &mut Child) -> std::io::Result<(std::process::ExitStatus, String)> {
    let mut text = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        stderr.read_to_string(&mut text).await?;
    }
    let status = child.wait().await?;
    Ok((status, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::MemorySink;
    use pkg_logging::ThrottleParams;
    use std::sync::Mutex;

    fn helper(program: &str) -> ArvMount {
        ArvMount {
            program: program.to_string(),
            unmount_timeout: Duration::from_secs(1),
        }
    }

    fn request(mountpoint: &Path, script: &str) -> (MountRequest, Arc<MemorySink>, Arc<Mutex<Vec<String>>>) {
        let sink = Arc::new(MemorySink::default());
        let log = ThrottledLogger::new(sink.clone(), &ThrottleParams::default());
        let warnings = Arc::new(Mutex::new(Vec::new()));
        let seen = warnings.clone();
        let req = MountRequest {
            argv: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            mountpoint: mountpoint.to_path_buf(),
            token: "v2/zzzzz-gj3su-000000000000000/secret".to_string(),
            env: [("MNT".to_string(), mountpoint.display().to_string())].into_iter().collect(),
            collection_paths: Vec::new(),
            log: log.clone(),
            crunch_log: log,
            on_warning: Arc::new(move |pattern, line| {
                seen.lock().unwrap().push(format!("{}|{}", pattern, line.trim_end()));
            }),
        };
        (req, sink, warnings)
    }

    #[tokio::test]
    async fn test_mount_waits_for_ready_marker() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = "echo \"token=$ARVADOS_API_TOKEN\"; \
                      echo 'Keep write error: 503' >&2; \
                      sleep 0.3; mkdir -p \"$MNT/by_id\"; touch \"$MNT/by_id/README\"; \
                      sleep 30";
        let (req, sink, warnings) = request(dir.path(), script);
        let log = req.log.clone();
        let mounted = helper("sh").mount(req).await.unwrap();
        assert!(dir.path().join("by_id/README").exists());
        assert!(!mounted.has_exited());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            warnings.lock().unwrap().clone(),
            vec!["Keep write error|Keep write error: 503".to_string()]
        );

        // "no-such-helper" cannot be started, so unmount falls back to SIGKILL.
        let unmounter = helper("no-such-helper-binary");
        unmounter.unmount(&mounted, dir.path(), &log).await;
        tokio::time::timeout(Duration::from_secs(5), mounted.wait_exit())
            .await
            .unwrap();
        log.close().await.unwrap();
        let text = sink.text();
        assert!(text.contains("token=v2/zzzzz-gj3su-000000000000000/secret"), "{}", text);
        assert!(text.contains("Error unmounting"), "{}", text);
    }

    #[tokio::test]
    async fn test_mount_fails_when_helper_exits() {
        let dir = tempfile::TempDir::new().unwrap();
        let (req, sink, _) = request(dir.path(), "echo broken >&2; exit 3");
        let log = req.log.clone();
        let err = helper("sh").mount(req).await.err().unwrap();
        assert_eq!(err.to_string(), "sh exited before the mount was ready");
        log.close().await.unwrap();
        let text = sink.text();
        assert!(text.contains("broken"), "{}", text);
        assert!(text.contains("Arv-mount exit error"), "{}", text);
    }
}
