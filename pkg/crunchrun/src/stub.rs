//! In-process stand-ins for the mount helper and log sinks, for tests.

use anyhow::Result;
use async_trait::async_trait;
use pkg_constants::paths::MOUNT_READY_MARKER;
use pkg_logging::{LogSink, ThrottledLogger};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

use crate::helper::{MountHelper, MountRequest, MountedHelper};

/// Collects everything written to it.
#[derive(Default)]
pub struct MemorySink {
    data: Mutex<Vec<u8>>,
}

impl MemorySink {
    pub fn text(&self) -> String {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&data).into_owned()
    }
}

#[async_trait]
impl LogSink for MemorySink {
    async fn write(&self, data: &[u8]) -> Result<()> {
        self.data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(data);
        Ok(())
    }
}

/// What a [`StubMountHelper`] saw.
#[derive(Debug, Clone, Default)]
pub struct MountRecord {
    pub argv: Vec<String>,
    pub token: String,
    pub unmounted: bool,
}

/// Creates the ready marker and every expected collection path as plain
/// directories instead of running a FUSE helper.
#[derive(Default)]
pub struct StubMountHelper {
    /// Pretend the helper dies this long after mounting.
    pub exit_after: Option<Duration>,
    /// Fail to mount with this message.
    pub fail: Option<String>,
    record: Mutex<Option<MountRecord>>,
}

impl StubMountHelper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self) -> Option<MountRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl MountHelper for StubMountHelper {
    async fn mount(&self, req: MountRequest) -> Result<MountedHelper> {
        *self.record.lock().unwrap_or_else(|e| e.into_inner()) = Some(MountRecord {
            argv: req.argv.clone(),
            token: req.token.clone(),
            unmounted: false,
        });
        req.crunch_log.println(format!("Running {:?}", req.argv));
        if let Some(msg) = &self.fail {
            anyhow::bail!("{}", msg);
        }
        for p in &req.collection_paths {
            std::fs::create_dir_all(p)?;
        }
        let marker = req.mountpoint.join(MOUNT_READY_MARKER);
        if let Some(parent) = marker.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&marker, b"stub\n")?;

        let (tx, exited) = watch::channel(false);
        match self.exit_after {
            Some(after) => {
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = tx.send(true);
                });
            }
            // Keep the sender alive so the receiver never sees a close.
            None => {
                tokio::spawn(async move { tx.closed().await });
            }
        }
        Ok(MountedHelper { pid: None, exited })
    }

    async fn unmount(&self, _mounted: &MountedHelper, _mountpoint: &Path, log: &ThrottledLogger) {
        log.println("stub unmount");
        if let Some(rec) = self.record.lock().unwrap_or_else(|e| e.into_inner()).as_mut() {
            rec.unmounted = true;
        }
    }
}
