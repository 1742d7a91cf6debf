//! On-disk directory of the supervisors running on this host.
//!
//! Every detached supervisor holds an exclusive `flock` on
//! `<dir>/crunch-run-<uuid>.lock`, which also records its pid. Lock
//! ownership, not file presence, is what makes an entry live: `list_live`
//! garbage-collects files nobody holds. A directory-wide lock
//! (`crunch-run-all.lock`) is held around open+lock and around
//! try-lock+delete so a listing never removes a file a new supervisor has
//! opened but not yet locked.

mod lock;

use anyhow::Result;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use pkg_constants::paths::{
    BROKEN_NODE_NAME, DEFAULT_LOCK_DIR, DIR_LOCK_NAME, JOURNAL_IDENTIFIER, LOCK_PREFIX, LOCK_SUFFIX,
    PRICES_FILE_NAME,
};
use pkg_types::procinfo::ProcInfo;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::lock::{LockMode, flock, try_flock};

/// Argument telling a re-executed supervisor it is already detached.
pub const NO_DETACH_FLAG: &str = "-no-detach";

/// The child's copy of its lockfile.
const INHERITED_LOCK_FD: i32 = 3;

pub struct Registry {
    dir: PathBuf,
    journal: bool,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_DIR)
    }
}

impl Registry {
    /// Registry rooted at `dir`. Detached children are wrapped with
    /// `systemd-cat` when it is installed.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let journal = std::process::Command::new("which")
            .arg("systemd-cat")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        Self {
            dir: dir.as_ref().to_path_buf(),
            journal,
        }
    }

    /// Send detached children's output nowhere instead of to the journal.
    pub fn without_journal(mut self) -> Self {
        self.journal = false;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn lockfile_path(&self, uuid: &str) -> PathBuf {
        self.dir.join(format!("{}{}{}", LOCK_PREFIX, uuid, LOCK_SUFFIX))
    }

    pub fn prices_path(&self) -> PathBuf {
        self.dir.join(format!("{}{}", LOCK_PREFIX, PRICES_FILE_NAME))
    }

    pub fn broken_path(&self) -> PathBuf {
        self.dir.join(format!("{}{}", LOCK_PREFIX, BROKEN_NODE_NAME))
    }

    /// Flag this node as unable to run containers; `list_live` reports it
    /// until an operator removes the file.
    pub fn mark_broken(&self) -> Result<()> {
        let path = self.broken_path();
        File::create(&path).map_err(|e| anyhow::anyhow!("create {}: {}", path.display(), e))?;
        Ok(())
    }

    fn lock_all(&self) -> Result<File> {
        let path = self
            .dir
            .join(format!("{}{}{}", LOCK_PREFIX, DIR_LOCK_NAME, LOCK_SUFFIX));
        let f = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .mode(0o700)
            .open(&path)
            .map_err(|e| anyhow::anyhow!("open {}: {}", path.display(), e))?;
        flock(&f, LockMode::Exclusive).map_err(|e| anyhow::anyhow!("lock {}: {}", path.display(), e))?;
        Ok(f)
    }

    // ─── Detach ─────────────────────────────────────────────────

    /// Lock `uuid`'s lockfile and re-run `prog` in the background with
    /// `-no-detach` prepended to `args`. The child inherits the lockfile as
    /// fd 3 and runs in its own process group. `stdin` is copied to the
    /// child in full before returning. The returned record has already been
    /// written to the lockfile.
    pub async fn detach<R>(&self, uuid: &str, prog: &str, args: &[String], stdin: R) -> Result<ProcInfo>
    where
        R: AsyncRead + Unpin,
    {
        let (info, _child) = self.spawn_detached(uuid, prog, args, stdin).await?;
        Ok(info)
    }

    async fn spawn_detached<R>(
        &self,
        uuid: &str,
        prog: &str,
        args: &[String],
        mut stdin: R,
    ) -> Result<(ProcInfo, tokio::process::Child)>
    where
        R: AsyncRead + Unpin,
    {
        let mut lockfile = {
            let _dirlock = self.lock_all()?;
            let path = self.lockfile_path(uuid);
            let f = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .mode(0o700)
                .open(&path)
                .map_err(|e| anyhow::anyhow!("open {}: {}", path.display(), e))?;
            try_flock(&f, LockMode::Exclusive)
                .map_err(|e| anyhow::anyhow!("lock {}: {}", path.display(), e))?;
            f
        };
        lockfile.set_len(0)?;

        let argv = self.child_argv(prog, args);
        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);
        let fd = lockfile.as_raw_fd();
        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                if fd == INHERITED_LOCK_FD {
                    let flags = libc::fcntl(fd, libc::F_GETFD);
                    if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                } else if libc::dup2(fd, INHERITED_LOCK_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("exec {}: {}", argv[0], e))?;

        if let Some(mut pipe) = child.stdin.take() {
            tokio::io::copy(&mut stdin, &mut pipe).await?;
            pipe.shutdown().await?;
        }

        let info = ProcInfo {
            uuid: uuid.to_string(),
            pid: child.id().map(|p| p as i32).unwrap_or_default(),
        };
        let mut record = serde_json::to_vec(&info)?;
        record.push(b'\n');
        lockfile.write_all(&record)?;
        tracing::info!("[{}] detached supervisor pid {}", uuid, info.pid);
        Ok((info, child))
    }

    fn child_argv(&self, prog: &str, args: &[String]) -> Vec<String> {
        let mut argv = Vec::with_capacity(args.len() + 7);
        if self.journal {
            // An exec failure in the inner wrapper is reported on stderr,
            // which the outer one sends to the journal.
            for _ in 0..2 {
                argv.push("systemd-cat".to_string());
                argv.push(format!("--identifier={}", JOURNAL_IDENTIFIER));
            }
        }
        match prog.strip_suffix(" crunch-run") {
            // multi-command binary: "<path> crunch-run"
            Some(multi) => {
                argv.push(multi.to_string());
                argv.push("crunch-run".to_string());
            }
            None => argv.push(prog.to_string()),
        }
        argv.push(NO_DETACH_FLAG.to_string());
        argv.extend(args.iter().cloned());
        argv
    }

    // ─── List ───────────────────────────────────────────────────

    /// UUIDs of live supervisors, one per line (`<uuid> stale` when the lock
    /// is held but the recorded pid is gone, `broken` when the node is
    /// flagged). Non-empty `prices` replaces the saved price history first.
    pub fn list_live(&self, prices: &[u8]) -> Result<Vec<String>> {
        if !prices.is_empty() {
            self.save_prices(prices);
        }

        let mut out = Vec::new();
        let broken = format!("{}{}", LOCK_PREFIX, BROKEN_NODE_NAME);
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| anyhow::anyhow!("read {}: {}", self.dir.display(), e))?;
        for entry in entries {
            let entry = entry?;
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == broken {
                out.push("broken".to_string());
                continue;
            }
            if !name.starts_with(LOCK_PREFIX) || !name.ends_with(LOCK_SUFFIX) {
                continue;
            }
            if meta.len() == 0 {
                // opened and locked, record not written yet
                continue;
            }
            if let Some(line) = self.check_lockfile(&entry.path())? {
                out.push(line);
            }
        }
        Ok(out)
    }

    fn check_lockfile(&self, path: &Path) -> Result<Option<String>> {
        let Ok(mut f) = File::open(path) else {
            return Ok(None);
        };
        {
            let _dirlock = self.lock_all()?;
            if try_flock(&f, LockMode::Shared).is_ok() {
                if let Err(e) = std::fs::remove_file(path) {
                    tracing::warn!("unlink {}: {}", path.display(), e);
                }
                return Ok(None);
            }
        }

        let mut buf = Vec::new();
        if let Err(e) = f.read_to_end(&mut buf) {
            tracing::warn!("{}: {}", path.display(), e);
            return Ok(None);
        }
        let info: ProcInfo = match serde_json::from_slice(&buf) {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!("{}: {}", path.display(), e);
                return Ok(None);
            }
        };
        if info.uuid.is_empty() || info.pid == 0 {
            tracing::warn!("{}: bogus procinfo: {:?}", path.display(), info);
            return Ok(None);
        }
        // A held lock with a dead pid is most likely a mount helper that
        // inherited the lockfile and outlived its supervisor.
        match kill(Pid::from_raw(info.pid), Signal::SIGUSR2) {
            Ok(()) => Ok(Some(info.uuid)),
            Err(_) => Ok(Some(format!("{} stale", info.uuid))),
        }
    }

    fn save_prices(&self, data: &[u8]) {
        let path = self.prices_path();
        let tmp = PathBuf::from(format!("{}~{}", path.display(), std::process::id()));
        if let Err(e) = std::fs::write(&tmp, data) {
            tracing::warn!("error writing price data to {}: {}", tmp.display(), e);
            return;
        }
        if let Err(e) = std::fs::rename(&tmp, &path) {
            tracing::warn!("error renaming {} to {}: {}", tmp.display(), path.display(), e);
            if let Err(e) = std::fs::remove_file(&tmp) {
                tracing::debug!("removing {}: {}", tmp.display(), e);
            }
        }
    }

    // ─── Kill ───────────────────────────────────────────────────

    /// Send `signal` to `uuid`'s supervisor and wait up to a second for it to
    /// exit. A missing lockfile counts as success.
    pub async fn kill(&self, uuid: &str, signal: i32) -> Result<()> {
        let path = self.lockfile_path(uuid);
        let mut f = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => anyhow::bail!("open {}: {}", path.display(), e),
        };
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        let info: ProcInfo = serde_json::from_slice(&buf)
            .map_err(|e| anyhow::anyhow!("decode {}: {}", path.display(), e))?;
        if info.uuid != uuid || info.pid == 0 {
            anyhow::bail!("{}: bogus procinfo: {:?}", path.display(), info);
        }

        let sig = Signal::try_from(signal).map_err(|e| anyhow::anyhow!("signal {}: {}", signal, e))?;
        let pid = Pid::from_raw(info.pid);
        let mut result = kill(pid, sig);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while result.is_ok() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
            result = kill(pid, None);
        }
        match result {
            Ok(()) => anyhow::bail!(
                "{}: pid {}: sent signal {} ({}) but process is still alive",
                uuid,
                info.pid,
                signal,
                sig
            ),
            Err(e) => {
                tracing::info!("{}: pid {}: {}", uuid, info.pid, e);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    const UUID: &str = "zzzzz-dz642-aaaaaaaaaaaaaaa";

    /// A stand-in supervisor: ignores SIGUSR2 and sleeps, keeping fd 3.
    fn fake_supervisor(dir: &Path) -> String {
        let path = dir.join("fake-crunch-run");
        std::fs::write(&path, "#!/bin/sh\ntrap '' USR2\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    fn registry() -> (TempDir, TempDir, Registry) {
        let lockdir = TempDir::new().unwrap();
        let bindir = TempDir::new().unwrap();
        let reg = Registry::new(lockdir.path()).without_journal();
        (lockdir, bindir, reg)
    }

    #[test]
    fn test_child_argv() {
        let reg = Registry::new("/tmp").without_journal();
        let args = vec![UUID.to_string()];
        assert_eq!(
            reg.child_argv("/usr/bin/crunch-run", &args),
            vec!["/usr/bin/crunch-run", "-no-detach", UUID]
        );
        assert_eq!(
            reg.child_argv("/usr/bin/arvados-server crunch-run", &args),
            vec!["/usr/bin/arvados-server", "crunch-run", "-no-detach", UUID]
        );
        let reg = Registry {
            dir: PathBuf::from("/tmp"),
            journal: true,
        };
        let argv = reg.child_argv("crunch-run", &args);
        assert_eq!(&argv[..4], &[
            "systemd-cat",
            "--identifier=crunch-run",
            "systemd-cat",
            "--identifier=crunch-run"
        ]);
        assert_eq!(&argv[4..], &["crunch-run", "-no-detach", UUID]);
    }

    #[tokio::test]
    async fn test_detach_list_kill() {
        let (lockdir, bindir, reg) = registry();
        let prog = fake_supervisor(bindir.path());
        let (info, mut child) = reg
            .spawn_detached(UUID, &prog, &[UUID.to_string()], tokio::io::empty())
            .await
            .unwrap();
        assert_eq!(info.uuid, UUID);
        assert!(info.pid > 0);

        // record is on disk before detach returns
        let record: ProcInfo =
            serde_json::from_slice(&std::fs::read(reg.lockfile_path(UUID)).unwrap()).unwrap();
        assert_eq!(record, info);

        // a second supervisor for the same container is refused
        let err = reg
            .spawn_detached(UUID, &prog, &[UUID.to_string()], tokio::io::empty())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("lock "), "{}", err);

        // let the child install its signal handling
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(reg.list_live(b"").unwrap(), vec![UUID.to_string()]);
        assert_eq!(reg.list_live(b"").unwrap(), vec![UUID.to_string()]);

        let reaper = tokio::spawn(async move { child.wait().await });
        reg.kill(UUID, libc::SIGTERM).await.unwrap();
        reaper.await.unwrap().unwrap();

        // lock died with the child, so the next listing removes the file
        assert!(reg.list_live(b"").unwrap().is_empty());
        assert!(!reg.lockfile_path(UUID).exists());
        drop(lockdir);
    }

    #[test]
    fn test_list_removes_unlocked_files() {
        let (_lockdir, _bindir, reg) = registry();
        let path = reg.lockfile_path(UUID);
        std::fs::write(&path, format!("{{\"UUID\":\"{}\",\"PID\":1}}\n", UUID)).unwrap();
        assert!(reg.list_live(b"").unwrap().is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn test_list_reports_stale_holder() {
        let (_lockdir, _bindir, reg) = registry();
        let mut gone = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = gone.id() as i32;
        gone.wait().unwrap();

        let path = reg.lockfile_path(UUID);
        let mut held = File::create(&path).unwrap();
        try_flock(&held, LockMode::Exclusive).unwrap();
        writeln!(held, "{{\"UUID\":\"{}\",\"PID\":{}}}", UUID, dead_pid).unwrap();

        assert_eq!(reg.list_live(b"").unwrap(), vec![format!("{} stale", UUID)]);
        assert!(path.exists());
    }

    #[test]
    fn test_list_skips_empty_and_unrelated_files() {
        let (lockdir, _bindir, reg) = registry();
        File::create(reg.lockfile_path(UUID)).unwrap();
        std::fs::write(lockdir.path().join("other.lock"), "x").unwrap();
        std::fs::create_dir(lockdir.path().join("crunch-run-subdir.lock")).unwrap();
        assert!(reg.list_live(b"").unwrap().is_empty());
        assert!(reg.lockfile_path(UUID).exists());
    }

    #[test]
    fn test_list_reports_broken_node() {
        let (_lockdir, _bindir, reg) = registry();
        reg.mark_broken().unwrap();
        assert_eq!(reg.list_live(b"").unwrap(), vec!["broken".to_string()]);
    }

    #[test]
    fn test_list_saves_prices() {
        let (lockdir, _bindir, reg) = registry();
        let prices = br#"[{"StartTime":"2024-01-01T00:00:00Z","Price":0.5}]"#;
        reg.list_live(prices).unwrap();
        assert_eq!(std::fs::read(reg.prices_path()).unwrap(), prices);
        let leftovers: Vec<_> = std::fs::read_dir(lockdir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains('~'))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_failed_price_rename_cleans_up() {
        let (lockdir, _bindir, reg) = registry();
        // A directory in the way makes the rename fail.
        std::fs::create_dir(reg.prices_path()).unwrap();
        let out = reg.list_live(br#"[{"StartTime":"2024-01-01T00:00:00Z","Price":0.5}]"#).unwrap();
        assert!(out.is_empty());
        assert!(reg.prices_path().is_dir());
        let leftovers: Vec<_> = std::fs::read_dir(lockdir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains('~'))
            .collect();
        assert!(leftovers.is_empty(), "{:?}", leftovers);
    }

    #[tokio::test]
    async fn test_kill_missing_is_ok() {
        let (_lockdir, _bindir, reg) = registry();
        reg.kill(UUID, libc::SIGTERM).await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_rejects_mismatched_record() {
        let (_lockdir, _bindir, reg) = registry();
        std::fs::write(
            reg.lockfile_path(UUID),
            "{\"UUID\":\"zzzzz-dz642-bbbbbbbbbbbbbbb\",\"PID\":12345}\n",
        )
        .unwrap();
        let err = reg.kill(UUID, libc::SIGTERM).await.unwrap_err();
        assert!(err.to_string().contains("bogus procinfo"));
    }
}
