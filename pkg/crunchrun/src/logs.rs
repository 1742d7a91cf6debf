//! The run's log collection: one `<name>.txt` file per log stream,
//! checkpointed while the container runs and handed over at the end.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use pkg_client::{ApiClient, CollectionFs, KeepClient, SharedCollectionFs};
use pkg_constants::logging::LOG_COLLECTION_TTL_DAYS;
use pkg_logging::{CollectionFile, EventLogWriter, LogSink, ThrottleParams, ThrottledLogger};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};

/// A saved log collection record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedLog {
    pub uuid: String,
    pub portable_data_hash: String,
}

#[derive(Default)]
struct Record {
    uuid: Option<String>,
    /// Set by the final save; nothing is saved after that.
    committed: Option<String>,
}

pub struct LogCollection {
    api: Arc<dyn ApiClient>,
    fs: SharedCollectionFs,
    container_uuid: String,
    params: ThrottleParams,
    loggers: Mutex<Vec<Arc<ThrottledLogger>>>,
    record: tokio::sync::Mutex<Record>,
}

impl LogCollection {
    pub fn new(
        api: Arc<dyn ApiClient>,
        keep: Arc<dyn KeepClient>,
        container_uuid: &str,
        params: ThrottleParams,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            fs: CollectionFs::new(keep).shared(),
            container_uuid: container_uuid.to_string(),
            params,
            loggers: Mutex::new(Vec::new()),
            record: tokio::sync::Mutex::new(Record::default()),
        })
    }

    pub fn fs(&self) -> &SharedCollectionFs {
        &self.fs
    }

    async fn event_writer(&self, name: &str) -> Result<Arc<dyn LogSink>> {
        let file = CollectionFile::create(self.fs.clone(), &format!("{}.txt", name))
            .await
            .with_context(|| format!("error creating {}.txt in log collection", name))?;
        Ok(Arc::new(EventLogWriter::new(
            self.api.clone(),
            &self.container_uuid,
            name,
            Some(Arc::new(file)),
            self.params.clone(),
        )))
    }

    /// Logger for stream `name`. It is closed by [`LogCollection::commit`].
    pub async fn open(&self, name: &str) -> Result<Arc<ThrottledLogger>> {
        let logger = ThrottledLogger::new(self.event_writer(name).await?, &self.params);
        self.loggers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(logger.clone());
        Ok(logger)
    }

    /// Logger for the supervisor's own stream, echoed to the process log.
    /// The caller owns it and redirects it before the final save.
    pub async fn open_supervisor_log(&self, name: &str) -> Result<Arc<ThrottledLogger>> {
        let prefix = self.container_uuid.clone();
        Ok(ThrottledLogger::with_mirror(
            self.event_writer(name).await?,
            &self.params,
            &prefix,
        ))
    }

    /// Sink that only feeds the control plane's event log.
    pub fn event_only(&self, name: &str) -> Arc<dyn LogSink> {
        Arc::new(EventLogWriter::new(
            self.api.clone(),
            &self.container_uuid,
            name,
            None,
            self.params.clone(),
        ))
    }

    pub async fn size(&self) -> u64 {
        self.fs.lock().await.size()
    }

    pub async fn committed(&self) -> Option<String> {
        self.record.lock().await.committed.clone()
    }

    /// Create or update the log collection record with the current
    /// content. A final save marks it trashed so the control plane takes
    /// ownership; checkpoints expire on their own.
    pub async fn save(&self, is_final: bool) -> Result<SavedLog> {
        let mut record = self.record.lock().await;
        self.save_locked(&mut record, is_final).await
    }

    async fn save_locked(&self, record: &mut Record, is_final: bool) -> Result<SavedLog> {
        let loggers = self.loggers.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for logger in loggers {
            if let Err(e) = logger.flush().await {
                tracing::warn!("[logs] flush before save: {}", e);
            }
        }
        let manifest_text = self.fs.lock().await.marshal_manifest().await?;
        let mut updates = json!({
            "name": format!("logs for {}", self.container_uuid),
            "manifest_text": manifest_text,
        });
        if is_final {
            updates["is_trashed"] = json!(true);
        } else {
            let exp = (Utc::now() + chrono::Duration::days(LOG_COLLECTION_TTL_DAYS))
                .to_rfc3339_opts(SecondsFormat::Secs, true);
            updates["trash_at"] = json!(exp);
            updates["delete_at"] = json!(exp);
        }
        let mut body = json!({
            "select": ["uuid", "portable_data_hash"],
            "collection": updates,
        });
        let resp = match &record.uuid {
            None => {
                body["ensure_unique_name"] = json!(true);
                self.api.create("collections", body).await
            }
            Some(uuid) => self.api.update("collections", uuid, body).await,
        }
        .map_err(|e| anyhow::anyhow!("error recording logs: {:#}", e))?;

        let field = |k: &str| resp.get(k).and_then(Value::as_str).unwrap_or_default().to_string();
        let saved = SavedLog {
            uuid: field("uuid"),
            portable_data_hash: field("portable_data_hash"),
        };
        record.uuid = Some(saved.uuid.clone());
        Ok(saved)
    }

    /// Close every stream logger and do the final save, once.
    pub async fn commit(&self) -> Result<String> {
        let loggers = std::mem::take(&mut *self.loggers.lock().unwrap_or_else(|e| e.into_inner()));
        for logger in loggers {
            if let Err(e) = logger.close().await {
                tracing::warn!("[logs] closing log stream: {}", e);
            }
        }
        let mut record = self.record.lock().await;
        if let Some(pdh) = &record.committed {
            return Ok(pdh.clone());
        }
        let saved = self
            .save_locked(&mut record, true)
            .await
            .map_err(|e| anyhow::anyhow!("error saving log collection: {}", e))?;
        record.committed = Some(saved.portable_data_hash.clone());
        Ok(saved.portable_data_hash)
    }

    /// Checkpoint the collection while the container runs: every
    /// `update_period / 360`, save if it grew and either `update_period`
    /// passed or it grew by `update_size`. `force` saves at the next
    /// opportunity. Returns once the final save happened.
    pub async fn run_updater(
        self: Arc<Self>,
        container_api: Arc<dyn ApiClient>,
        crunch_log: Arc<ThrottledLogger>,
        force: Arc<Notify>,
    ) {
        let period = self.params.update_period;
        let mut ticker = tokio::time::interval((period / 360).max(std::time::Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut save_at_time = Instant::now() + period;
        let mut save_at_size = self.params.update_size;
        let mut saved_size = 0u64;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = force.notified() => save_at_time = Instant::now(),
            }
            if self.committed().await.is_some() {
                return;
            }
            let size = self.size().await;
            if size == saved_size || (Instant::now() < save_at_time && size < save_at_size) {
                continue;
            }
            save_at_time = Instant::now() + period;
            save_at_size = size + self.params.update_size;

            let saved = {
                let mut record = self.record.lock().await;
                if record.committed.is_some() {
                    return;
                }
                self.save_locked(&mut record, false).await
            };
            let saved = match saved {
                Ok(s) => s,
                Err(e) => {
                    crunch_log.println(format!("error updating log collection: {}", e));
                    continue;
                }
            };
            let update = container_api
                .update(
                    "containers",
                    &self.container_uuid,
                    json!({"select": ["uuid"], "container": {"log": saved.portable_data_hash}}),
                )
                .await;
            if let Err(e) = update {
                crunch_log.println(format!(
                    "error updating container log to {}: {}",
                    saved.portable_data_hash, e
                ));
                continue;
            }
            saved_size = size;
        }
    }
}
