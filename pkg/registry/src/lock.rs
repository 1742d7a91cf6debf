//! Advisory `flock(2)` wrappers.
//!
//! Locks are released when the last descriptor for the open file closes, so
//! a lockfile passed to a child keeps the lock alive after the parent drops
//! its copy. Nothing here unlocks explicitly.

use std::fs::File;
use std::os::unix::io::AsRawFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    fn op(self) -> libc::c_int {
        match self {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        }
    }
}

/// Block until the lock is granted.
pub fn flock(file: &File, mode: LockMode) -> std::io::Result<()> {
    loop {
        match call(file, mode.op()) {
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Fail with `WouldBlock` if another open file holds a conflicting lock.
pub fn try_flock(file: &File, mode: LockMode) -> std::io::Result<()> {
    call(file, mode.op() | libc::LOCK_NB)
}

fn call(file: &File, op: libc::c_int) -> std::io::Result<()> {
    // SAFETY: the descriptor stays open for the duration of the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_excludes_shared() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("x.lock");
        let a = File::create(&path).unwrap();
        let b = File::open(&path).unwrap();
        try_flock(&a, LockMode::Exclusive).unwrap();
        let err = try_flock(&b, LockMode::Shared).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
        drop(a);
        try_flock(&b, LockMode::Shared).unwrap();
    }

    #[test]
    fn test_shared_locks_coexist() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("x.lock");
        let a = File::create(&path).unwrap();
        let b = File::open(&path).unwrap();
        flock(&a, LockMode::Shared).unwrap();
        try_flock(&b, LockMode::Shared).unwrap();
    }
}
