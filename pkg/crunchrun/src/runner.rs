//! The lifecycle supervisor: takes one `Locked` container through mount
//! staging, image load, execution and output capture, and always finishes
//! with a terminal state update.

use anyhow::{Context, Result};
use chrono::Utc;
use pkg_client::{ApiClient, KeepClient, is_not_found};
use pkg_constants::paths::MOUNT_HELPER;
use pkg_constants::runtime::MEMORY_WARNING_PERCENTAGES;
use pkg_container::{ContainerExecutor, ContainerSpec, InputStream, OutputStream};
use pkg_gateway::{Gateway, GatewayHandle, SessionHandler};
use pkg_logging::{ThrottledLogger, copy_lines};
use pkg_manifest::{Manifest, clean_path};
use pkg_registry::Registry;
use pkg_stats::{Reporter, ReporterHandle, StatFiles};
use pkg_types::container::{ApiClientAuthorization, Container, ContainerState};
use pkg_types::mount::Mount;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::clients::ClientFactory;
use crate::config::RunnerConfig;
use crate::copier::Copier;
use crate::cost::PriceHistory;
use crate::errors::{CrunchError, is_broken_node, start_advice};
use crate::helper::{MountHelper, MountRequest, MountedHelper, WarningHook};
use crate::hostinfo::{host_info_commands, log_container_record, log_host_info, log_node_record};
use crate::logs::LogCollection;
use crate::mounts::{StageRequest, StagedMounts, stage};

/// Everything the supervisor talks to.
pub struct RunnerDeps {
    /// Control-plane client with the dispatcher's credentials.
    pub api: Arc<dyn ApiClient>,
    pub keep: Arc<dyn KeepClient>,
    /// Builds clients that act as the container.
    pub clients: Arc<dyn ClientFactory>,
    pub executor: Arc<dyn ContainerExecutor>,
    pub mount_helper: Arc<dyn MountHelper>,
    /// Interactive sessions served by the gateway, if any.
    pub sessions: Option<Arc<dyn SessionHandler>>,
}

pub struct ContainerRunner {
    uuid: String,
    config: RunnerConfig,
    api: Arc<dyn ApiClient>,
    keep: Arc<dyn KeepClient>,
    clients: Arc<dyn ClientFactory>,
    executor: Arc<dyn ContainerExecutor>,
    mount_helper: Arc<dyn MountHelper>,
    sessions: Option<Arc<dyn SessionHandler>>,
    registry: Registry,
    logs: Arc<LogCollection>,
    crunch_log: Arc<ThrottledLogger>,
    cancel: CancelToken,
    stop_lock: tokio::sync::Mutex<()>,
    prices: Mutex<PriceHistory>,
    force_log_save: Arc<Notify>,
}

/// State of one pass through `run`.
struct Run {
    container: Container,
    container_api: Arc<dyn ApiClient>,
    container_keep: Arc<dyn KeepClient>,
    token: String,
    secret_mounts: BTreeMap<String, Mount>,
    final_state: ContainerState,
    first_err: Option<anyhow::Error>,
    exit_code: Option<i32>,
    output_pdh: Option<String>,

    parent_temp: Option<PathBuf>,
    mountpoint: Option<PathBuf>,
    helper: Option<MountedHelper>,
    staged: Option<StagedMounts>,

    gateway: Option<GatewayHandle>,
    hoststat: Option<(ReporterHandle, Arc<ThrottledLogger>)>,
    crunchstat: Option<(ReporterHandle, Arc<ThrottledLogger>)>,
    stream_loggers: Vec<(&'static str, Arc<ThrottledLogger>)>,
    forwarders: Vec<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Run {
    fn new(api: Arc<dyn ApiClient>, keep: Arc<dyn KeepClient>) -> Self {
        Self {
            container: Container::default(),
            container_api: api,
            container_keep: keep,
            token: String::new(),
            secret_mounts: BTreeMap::new(),
            final_state: ContainerState::Queued,
            first_err: None,
            exit_code: None,
            output_pdh: None,
            parent_temp: None,
            mountpoint: None,
            helper: None,
            staged: None,
            gateway: None,
            hoststat: None,
            crunchstat: None,
            stream_loggers: Vec::new(),
            forwarders: Vec::new(),
            tasks: Vec::new(),
        }
    }

    /// Record a finalization step's failure: log it, keep the first one,
    /// and never report `Complete` after a failure.
    fn check(&mut self, log: &ThrottledLogger, label: &str, result: Result<()>) {
        let Err(e) = result else {
            return;
        };
        log.println(format!("error in {}: {:#}", label, e));
        if self.first_err.is_none() {
            self.first_err = Some(e);
        }
        if self.final_state == ContainerState::Complete {
            self.final_state = ContainerState::Cancelled;
        }
    }
}

impl ContainerRunner {
    pub async fn new(uuid: &str, mut config: RunnerConfig, deps: RunnerDeps) -> Result<Arc<Self>> {
        config.throttle.apply_discovery(&*deps.api).await;
        let logs = LogCollection::new(deps.api.clone(), deps.keep.clone(), uuid, config.throttle.clone());
        let crunch_log = logs
            .open_supervisor_log("crunch-run")
            .await
            .context("error creating crunch-run log")?;
        let prices = PriceHistory::new(config.instance_type.as_deref(), Utc::now());
        let registry = Registry::new(&config.lock_dir);
        Ok(Arc::new(Self {
            uuid: uuid.to_string(),
            config,
            api: deps.api,
            keep: deps.keep,
            clients: deps.clients,
            executor: deps.executor,
            mount_helper: deps.mount_helper,
            sessions: deps.sessions,
            registry,
            logs,
            crunch_log,
            cancel: CancelToken::new(),
            stop_lock: tokio::sync::Mutex::new(()),
            prices: Mutex::new(prices),
            force_log_save: Arc::new(Notify::new()),
        }))
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn crunch_log(&self) -> &Arc<ThrottledLogger> {
        &self.crunch_log
    }

    fn prices(&self) -> MutexGuard<'_, PriceHistory> {
        self.prices.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run the container to completion. The record ends up `Complete` or
    /// `Cancelled`, or back in `Queued` if it never got going.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        self.log_startup().await;
        self.prices().load(&self.registry.prices_path(), &self.crunch_log);

        let mut run = Run::new(self.api.clone(), self.keep.clone());
        match self.spawn_signal_handler() {
            Ok(task) => run.tasks.push(task),
            Err(e) => warn!("[crunch-run] signal handlers not installed: {}", e),
        }

        let result = self.run_locked(&mut run).await;

        self.cleanup_dirs(&mut run).await;
        self.executor.close().await;
        for task in run.tasks.drain(..) {
            task.abort();
        }
        run.gateway = None;
        self.crunch_log.println("crunch-run finished");
        if let Err(e) = self.crunch_log.close().await {
            warn!("[crunch-run] closing crunch-run log: {}", e);
        }
        result.map_err(CrunchError::surface_transient)
    }

    async fn run_locked(self: &Arc<Self>, run: &mut Run) -> Result<()> {
        self.fetch_container_record(run).await?;
        if run.container.state != ContainerState::Locked {
            return Err(CrunchError::BadContainerState {
                uuid: self.uuid.clone(),
                state: run.container.state.to_string(),
            }
            .into());
        }
        run.tasks.push(tokio::spawn(self.logs.clone().run_updater(
            run.container_api.clone(),
            self.crunch_log.clone(),
            self.force_log_save.clone(),
        )));

        let result = self.run_container(run).await;
        run.check(&self.crunch_log, "Run", result);

        if run.final_state == ContainerState::Queued {
            let result = self.stop_hoststat(run).await;
            run.check(&self.crunch_log, "stopHoststat", result);
            if let Err(e) = self.update_container_final(run).await {
                self.crunch_log.println(format!("error updating container state: {:#}", e));
            }
            return run.first_err.take().map_or(Ok(()), Err);
        }
        if self.cancel.is_cancelled() {
            run.final_state = ContainerState::Cancelled;
        }
        if run.staged.is_some() {
            let result = self.capture_output(run).await;
            run.check(&self.crunch_log, "CaptureOutput", result);
        }
        let result = self.stop_hoststat(run).await;
        run.check(&self.crunch_log, "stopHoststat", result);
        let result = self.commit_logs(run).await;
        run.check(&self.crunch_log, "CommitLogs", result);
        self.cleanup_dirs(run).await;
        let result = self.update_container_final(run).await;
        run.check(&self.crunch_log, "UpdateContainerFinal", result);

        run.first_err.take().map_or(Ok(()), Err)
    }

    /// The main sequence. Sets `final_state` to what the record should
    /// become if nothing later goes wrong.
    async fn run_container(self: &Arc<Self>, run: &mut Run) -> Result<()> {
        self.start_gateway(run).await?;
        self.start_hoststat(run).await?;

        if let Err(e) = self.setup_mounts(run).await {
            run.final_state = ContainerState::Cancelled;
            return Err(e.context("While setting up mounts"));
        }

        let image_id = match self.load_image(run).await {
            Ok(id) => id,
            Err(e) => {
                let msg = format!("While loading container image: {:#}", e);
                if self.check_broken_node(&e).await {
                    return Err(CrunchError::BrokenNode(msg).into());
                }
                run.final_state = ContainerState::Cancelled;
                return Err(e.context("While loading container image"));
            }
        };

        self.create_container(run, &image_id).await?;
        self.log_records(run).await;
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        let log_pdh = match self.logs.save(false).await {
            Ok(saved) => Some(saved.portable_data_hash),
            Err(e) => {
                self.crunch_log
                    .println(format!("Error committing initial log collection: {:#}", e));
                None
            }
        };
        self.update_container_running(run, log_pdh).await?;
        run.final_state = ContainerState::Cancelled;

        self.start_container(run).await?;
        self.start_crunchstat(run).await?;

        self.wait_finish(run).await?;
        if !self.cancel.is_cancelled() {
            run.final_state = ContainerState::Complete;
        }
        Ok(())
    }

    // ─── Startup ────────────────────────────────────────────────

    async fn log_startup(&self) {
        let log = &self.crunch_log;
        log.println(format!("crunch-run {} started", env!("CARGO_PKG_VERSION")));
        log.println(current_user_and_groups());

        let helper_version = tokio::process::Command::new(MOUNT_HELPER)
            .arg("--version")
            .output()
            .await
            .map(|o| {
                let mut text = String::from_utf8_lossy(&o.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&o.stderr));
                text.trim().to_string()
            })
            .unwrap_or_default();
        log.println(format!("Using FUSE mount: {}", helper_version));
        log.println(format!("Using container runtime: {}", self.executor.runtime().await));
        log.println(format!("Executing container: {}", self.uuid));
        match sysinfo::System::host_name() {
            Some(host) => log.println(format!("Executing on host '{}'", host)),
            None => log.println("Error getting hostname 'unknown'"),
        }
    }

    /// Stop on SIGTERM/SIGINT/SIGQUIT, checkpoint logs on SIGUSR1, and
    /// reload prices and report cost on SIGUSR2.
    fn spawn_signal_handler(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        let mut quit = signal(SignalKind::quit())?;
        let mut usr1 = signal(SignalKind::user_defined1())?;
        let mut usr2 = signal(SignalKind::user_defined2())?;
        let runner = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(_) = term.recv() => runner.stop(Some("terminated")).await,
                    Some(_) = int.recv() => runner.stop(Some("interrupt")).await,
                    Some(_) = quit.recv() => runner.stop(Some("quit")).await,
                    Some(_) = usr1.recv() => runner.force_log_save.notify_one(),
                    Some(_) = usr2.recv() => runner.report_cost().await,
                    else => break,
                }
            }
        }))
    }

    async fn report_cost(&self) {
        let cost = {
            let mut prices = self.prices();
            prices.load(&self.registry.prices_path(), &self.crunch_log);
            prices.cost(Utc::now())
        };
        let update = json!({"select": ["uuid"], "container": {"cost": cost}});
        if let Err(e) = self.api.update("containers", &self.uuid, update).await {
            self.crunch_log.println(format!("error updating container cost: {:#}", e));
        }
    }

    async fn fetch_container_record(&self, run: &mut Run) -> Result<()> {
        let raw = self
            .api
            .call_raw("GET", "containers", &self.uuid, "", json!({}))
            .await
            .map_err(|e| anyhow::anyhow!("error fetching container record: {:#}", e))?;
        run.container = serde_json::from_slice(&raw)
            .map_err(|e| anyhow::anyhow!("error decoding container record: {}", e))?;

        let auth = self
            .api
            .call("GET", "containers", &self.uuid, "auth", json!({}))
            .await
            .map_err(|e| anyhow::anyhow!("error getting container token: {:#}", e))?;
        let auth: ApiClientAuthorization =
            serde_json::from_value(auth).map_err(|e| anyhow::anyhow!("error getting container token: {}", e))?;
        run.token = auth.container_token(&self.uuid);

        let (api, keep) = self
            .clients
            .clients(&run.token)
            .await
            .context("error creating container API client")?;
        let classes = run.container.output_storage_classes.clone();
        keep.set_storage_classes(classes.clone());
        self.keep.set_storage_classes(classes);
        run.container_api = api;
        run.container_keep = keep;

        match run
            .container_api
            .call("GET", "containers", &self.uuid, "secret_mounts", json!({}))
            .await
        {
            Ok(resp) => {
                if let Some(sm) = resp.get("secret_mounts").filter(|v| !v.is_null()) {
                    run.secret_mounts = serde_json::from_value(sm.clone())
                        .map_err(|e| anyhow::anyhow!("error decoding secret_mounts: {}", e))?;
                }
            }
            Err(e) if is_not_found(&e) => {}
            Err(e) => anyhow::bail!("error fetching secret_mounts: {:#}", e),
        }
        Ok(())
    }

    async fn start_gateway(&self, run: &mut Run) -> Result<()> {
        let Some(secret) = self.config.gateway_auth_secret.clone() else {
            self.crunch_log
                .println("Not starting a gateway server (GatewayAuthSecret was not provided by dispatcher)");
            return Ok(());
        };
        let handle = Gateway {
            container_uuid: self.uuid.clone(),
            address: self.config.gateway_address.clone(),
            auth_secret: secret,
            target: self.executor.clone(),
            sessions: self.sessions.clone(),
        }
        .start()
        .await
        .context("error starting gateway server")?;
        self.crunch_log
            .println(format!("Gateway server listening at {}", handle.address()));
        run.gateway = Some(handle);
        Ok(())
    }

    async fn start_hoststat(&self, run: &mut Run) -> Result<()> {
        let logger = self.logs.open("hoststat").await?;
        let handle = Reporter::host(self.config.stat_interval).start(logger.clone());
        handle.report_pid("crunch-run", std::process::id());
        run.hoststat = Some((handle, logger));
        Ok(())
    }

    async fn stop_hoststat(&self, run: &mut Run) -> Result<()> {
        let Some((handle, logger)) = run.hoststat.take() else {
            return Ok(());
        };
        let summary = handle.stop().await;
        summary.log_process_mem_max(&self.crunch_log);
        logger
            .close()
            .await
            .map_err(|e| anyhow::anyhow!("error closing hoststat logs: {}", e))
    }

    // ─── Mounts and image ───────────────────────────────────────

    async fn setup_mounts(self: &Arc<Self>, run: &mut Run) -> Result<()> {
        let parent = tempfile::Builder::new()
            .prefix(&format!("crunch-run.{}.", self.uuid))
            .tempdir_in(&self.config.temp_root)
            .with_context(|| format!("error creating temp dir in {}", self.config.temp_root.display()))?
            .keep();
        run.parent_temp = Some(parent.clone());

        let staged = stage(&StageRequest {
            container: &run.container,
            secret_mounts: &run.secret_mounts,
            parent_temp: &parent,
            stat_interval: self.config.stat_interval,
            allow_other: self.config.runtime_engine == "docker",
            cert_candidates: &self.config.ca_cert_candidates,
        })?;

        let by_id = staged.mountpoint.join("by_id");
        let mut collection_paths = staged.collection_paths.clone();
        if !run.container.container_image.is_empty() {
            collection_paths.push(by_id.join(&run.container.container_image));
        }
        if let Some(Mount::Collection(c)) = run.container.mounts.get("stdin") {
            let (id, _) = collection_source(c);
            collection_paths.push(by_id.join(id));
        }

        let warn_api = run.container_api.clone();
        let warn_log = self.crunch_log.clone();
        let uuid = self.uuid.clone();
        let on_warning: WarningHook = Arc::new(move |pattern: &str, line: &str| {
            let api = warn_api.clone();
            let log = warn_log.clone();
            let uuid = uuid.clone();
            let update = json!({
                "select": ["uuid"],
                "container": {"runtime_status": {
                    "warning": format!("arv-mount: {}", pattern),
                    "warningDetail": line,
                }},
            });
            tokio::spawn(async move {
                if let Err(e) = api.update("containers", &uuid, update).await {
                    log.println(format!("error updating container runtime_status: {:#}", e));
                }
            });
        });

        run.mountpoint = Some(staged.mountpoint.clone());
        let helper = self
            .mount_helper
            .mount(MountRequest {
                argv: staged.helper_argv.clone(),
                mountpoint: staged.mountpoint.clone(),
                token: run.token.clone(),
                env: self.config.env.clone(),
                collection_paths,
                log: self.logs.open("arv-mount").await?,
                crunch_log: self.crunch_log.clone(),
                on_warning,
            })
            .await?;
        if let (Some(pid), Some((hoststat, _))) = (helper.pid, &run.hoststat) {
            hoststat.report_pid("arv-mount", pid);
        }
        run.helper = Some(helper);

        staged.populate_output()?;
        run.staged = Some(staged);
        Ok(())
    }

    /// Find the image tarball in the image collection and hand it to the
    /// runtime. Returns the image id.
    async fn load_image(&self, run: &Run) -> Result<String> {
        let pdh = &run.container.container_image;
        self.crunch_log
            .println(format!("Fetching Docker image from collection '{}'", pdh));
        let record = run
            .container_api
            .get("collections", pdh, json!({"select": ["manifest_text"]}))
            .await
            .map_err(|e| anyhow::anyhow!("error fetching image collection record: {:#}", e))?;
        let manifest = Manifest::new(
            record
                .get("manifest_text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        );
        let tars: Vec<String> = manifest
            .files()?
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| !name.contains('/') && name.ends_with(".tar"))
            .collect();
        let tar = match tars.as_slice() {
            [] => {
                return Err(CrunchError::ImageMissing(
                    "image collection does not include a .tar image file".to_string(),
                )
                .into());
            }
            [one] => one.clone(),
            many => {
                return Err(CrunchError::ImageMissing(format!(
                    "cannot choose from multiple tar files in image collection: {:?}",
                    many
                ))
                .into());
            }
        };
        let image_id = tar.trim_end_matches(".tar").to_string();
        self.crunch_log.println(format!("Using Docker image id {:?}", image_id));
        self.crunch_log.println("Loading Docker image from keep");

        let mountpoint = run.mountpoint.as_deref().unwrap_or(Path::new(""));
        let tarball = mountpoint.join("by_id").join(pdh).join(&tar);
        self.executor.load_image(&image_id, &tarball).await?;
        Ok(image_id)
    }

    // ─── Container ──────────────────────────────────────────────

    async fn create_container(&self, run: &mut Run, image_id: &str) -> Result<()> {
        let staged = run
            .staged
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("mounts have not been set up"))?;
        let c = &run.container;

        let mut spec = ContainerSpec::new(image_id, c.command.clone());
        spec.working_dir = if c.cwd == "." { String::new() } else { c.cwd.clone() };
        spec.env = c.environment.clone();
        spec.vcpus = c.runtime_constraints.vcpus;
        spec.ram = if self.config.enable_memory_limit {
            c.runtime_constraints.ram
        } else {
            0
        };
        spec.cuda_device_count = c.runtime_constraints.cuda.device_count;
        spec.bind_mounts = staged.bind_mounts.clone();
        spec.enable_network = self.config.network_enabled(c.runtime_constraints.api);
        spec.network_mode = self.config.network_mode.clone();
        spec.cgroup_parent = self.config.cgroup_parent.clone();
        if c.runtime_constraints.api {
            spec.env.insert("ARVADOS_API_TOKEN".to_string(), run.token.clone());
            for key in ["ARVADOS_API_HOST", "ARVADOS_API_HOST_INSECURE", "ARVADOS_KEEP_SERVICES"] {
                if let Some(v) = self.config.env.get(key) {
                    spec.env.insert(key.to_string(), v.clone());
                }
            }
        }

        spec.stdin = match c.mounts.get("stdin") {
            None => None,
            Some(Mount::Collection(cm)) => {
                let (id, sub) = collection_source(cm);
                let mut path = staged.mountpoint.join("by_id").join(id);
                let rel = clean_path(&format!("{}/{}", sub, cm.path));
                if !rel.is_empty() {
                    path = path.join(rel);
                }
                let file = tokio::fs::File::open(&path)
                    .await
                    .with_context(|| format!("While opening stdin file {}", path.display()))?;
                Some(Box::new(file) as InputStream)
            }
            Some(Mount::Json { content }) => {
                let data = serde_json::to_vec(content)?;
                Some(Box::new(std::io::Cursor::new(data)) as InputStream)
            }
            Some(other) => anyhow::bail!("stdin mount has unsupported kind {:?}", other.kind()),
        };

        let host_output_dir = staged.host_output_dir.clone();
        let output_path = c.output_path.clone();
        let stdout_mount = c.mounts.get("stdout").cloned();
        let stderr_mount = c.mounts.get("stderr").cloned();
        spec.stdout = self
            .output_stream(run, "stdout", stdout_mount, &host_output_dir, &output_path)
            .await?;
        spec.stderr = self
            .output_stream(run, "stderr", stderr_mount, &host_output_dir, &output_path)
            .await?;

        self.executor
            .create(spec)
            .await
            .map_err(|e| CrunchError::ContainerFailed(format!("while creating container: {:#}", e)))?;
        Ok(())
    }

    /// A file under the output directory if `name` is mounted as one,
    /// otherwise a pipe into the `<name>.txt` log.
    async fn output_stream(
        &self,
        run: &mut Run,
        name: &'static str,
        mount: Option<Mount>,
        host_output_dir: &Path,
        output_path: &str,
    ) -> Result<OutputStream> {
        if let Some(Mount::File { path }) = mount {
            let rel = path
                .strip_prefix(output_path)
                .unwrap_or(&path)
                .trim_start_matches('/')
                .to_string();
            let host = host_output_dir.join(&rel);
            if let Some(dir) = host.parent() {
                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o2777)
                    .create(dir)
                    .with_context(|| format!("error creating {}", dir.display()))?;
            }
            let file = tokio::fs::File::create(&host)
                .await
                .with_context(|| format!("error creating {} file {}", name, host.display()))?;
            return Ok(Box::new(file));
        }

        let logger = self.logs.open(name).await?;
        let (writer, reader) = tokio::io::duplex(64 * 1024);
        let forward = logger.clone();
        run.forwarders.push(tokio::spawn(async move {
            if let Err(e) = copy_lines(reader, &forward).await {
                warn!("[crunch-run] copying container output: {}", e);
            }
        }));
        run.stream_loggers.push((name, logger));
        Ok(Box::new(writer))
    }

    /// Host facts, the instance type and the container record go into
    /// the log collection. Failures are only logged.
    async fn log_records(&self, run: &Run) {
        let temp = run.parent_temp.clone().unwrap_or_else(|| self.config.temp_root.clone());
        if let Err(e) = log_host_info(self.logs.fs(), &host_info_commands(&temp), &self.config.env).await {
            self.crunch_log.println(format!("error logging host info: {:#}", e));
        }
        if let Err(e) = log_node_record(self.logs.fs(), self.config.instance_type.as_deref()).await {
            self.crunch_log.println(format!("error logging node record: {:#}", e));
        }
        if let Err(e) = log_container_record(&*run.container_api, self.logs.fs(), &self.uuid).await {
            self.crunch_log.println(format!("error logging container record: {:#}", e));
        }
    }

    async fn update_container_running(&self, run: &Run, log_pdh: Option<String>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CrunchError::Cancelled.into());
        }
        let mut container = json!({
            "state": ContainerState::Running.to_string(),
            "gateway_address": run.gateway.as_ref().map(|g| g.address().to_string()).unwrap_or_default(),
        });
        if let Some(pdh) = log_pdh {
            container["log"] = json!(pdh);
        }
        self.api
            .update("containers", &self.uuid, json!({"select": ["uuid"], "container": container}))
            .await
            .map_err(|e| anyhow::anyhow!("error updating container state to Running: {:#}", e))?;
        Ok(())
    }

    async fn start_container(&self, run: &Run) -> Result<()> {
        self.crunch_log.println("Starting container");
        let Err(e) = self.executor.start().await else {
            return Ok(());
        };
        let msg = format!("{:#}", e);
        if let Some(advice) = start_advice(&msg, &run.container.command) {
            self.crunch_log.println(advice);
        }
        let msg = format!("could not start container: {}", msg);
        if self.check_broken_node(&e).await {
            return Err(CrunchError::BrokenNode(msg).into());
        }
        Err(CrunchError::ContainerFailed(msg).into())
    }

    /// Sample the container's cgroup if the runtime put it somewhere we
    /// can find.
    async fn start_crunchstat(&self, run: &mut Run) -> Result<()> {
        let logger = self.logs.open("crunchstat").await?;
        let cgroup_id = self.executor.cgroup_id();
        let Some(files) = StatFiles::discover(&self.config.cgroup_root, &cgroup_id) else {
            logger.println(format!(
                "cgroup stats files not found for {:?} under {}",
                cgroup_id,
                self.config.cgroup_root.display()
            ));
            return Ok(());
        };
        let mut reporter = Reporter::cgroup(self.config.stat_interval, files).with_memory_thresholds(
            "rss",
            run.container.runtime_constraints.ram,
            MEMORY_WARNING_PERCENTAGES,
            self.crunch_log.clone(),
        );
        if let Some(temp) = &run.parent_temp {
            reporter = reporter.with_temp_dir(temp);
        }
        run.crunchstat = Some((reporter.start(logger.clone()), logger));
        Ok(())
    }

    async fn wait_finish(self: &Arc<Self>, run: &mut Run) -> Result<()> {
        self.crunch_log.println("Waiting for container to finish");
        let watcher = {
            let runner = self.clone();
            let max_run_time = run.container.scheduling_parameters.max_run_time;
            let helper_exited = run.helper.as_ref().map(|h| h.exited.clone());
            tokio::spawn(async move { runner.stop_when_due(max_run_time, helper_exited).await })
        };
        let waited = self.executor.wait().await;
        watcher.abort();

        let code = match waited {
            Ok(code) => code,
            Err(e) => {
                let msg = format!("error waiting for container: {:#}", e);
                if self.check_broken_node(&e).await {
                    return Err(CrunchError::BrokenNode(msg).into());
                }
                return Err(CrunchError::ContainerFailed(msg).into());
            }
        };
        run.exit_code = Some(code);
        self.crunch_log.println(format!(
            "Container exited with status code {}{}",
            code,
            signal_suffix(code)
        ));
        let update = json!({"select": ["uuid"], "container": {"exit_code": code}});
        if let Err(e) = self.api.update("containers", &self.uuid, update).await {
            self.crunch_log
                .println(format!("ignoring error updating exit_code: {:#}", e));
        }

        for task in run.forwarders.drain(..) {
            if let Err(e) = task.await {
                warn!("[crunch-run] output forwarder: {}", e);
            }
        }
        for (name, logger) in run.stream_loggers.drain(..) {
            if let Err(e) = logger.close().await {
                self.crunch_log
                    .println(format!("error closing container {}: {}", name, e));
            }
        }

        if let Some((handle, logger)) = run.crunchstat.take() {
            let summary = handle.stop().await;
            let limits: BTreeMap<String, u64> =
                [("rss".to_string(), run.container.runtime_constraints.ram)].into_iter().collect();
            summary.log_maxima(&self.crunch_log, &limits);
            if let Err(e) = logger.close().await {
                self.crunch_log.println(format!("error closing crunchstat logs: {}", e));
            }
        }
        Ok(())
    }

    /// Resolves after stopping the container for the first of: the run
    /// time limit, the mount helper dying, or the record being cancelled.
    async fn stop_when_due(&self, max_run_time: u64, helper_exited: Option<tokio::sync::watch::Receiver<bool>>) {
        let deadline = async {
            match max_run_time {
                0 => std::future::pending::<()>().await,
                secs => tokio::time::sleep(Duration::from_secs(secs)).await,
            }
        };
        let helper = async {
            match helper_exited {
                Some(mut rx) => {
                    let _ = rx.wait_for(|exited| *exited).await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        let msg = tokio::select! {
            _ = deadline => "maximum run time exceeded. Stopping container.",
            _ = helper => "arv-mount exited while container is still running. Stopping container.",
            _ = self.poll_priority() => "Container priority is zero or the container was cancelled. Stopping container.",
            _ = self.cancel.cancelled() => return,
        };
        self.crunch_log.println(msg);
        self.stop(None).await;
    }

    /// Resolves once the record's priority drops to zero or it is cancelled.
    async fn poll_priority(&self) {
        let period = self.config.priority_poll_interval.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let params = json!({"select": ["priority", "state"]});
            match self.api.get("containers", &self.uuid, params).await {
                Ok(rec) => {
                    let priority = rec.get("priority").and_then(Value::as_i64).unwrap_or(1);
                    let cancelled = rec.get("state").and_then(Value::as_str) == Some("Cancelled");
                    if priority == 0 || cancelled {
                        return;
                    }
                }
                Err(e) => warn!("[crunch-run] polling container priority: {:#}", e),
            }
        }
    }

    /// Cancel the run and stop the container. Only the first call stops
    /// anything.
    pub async fn stop(&self, signal: Option<&str>) {
        let _guard = self.stop_lock.lock().await;
        if let Some(sig) = signal {
            self.crunch_log.println(format!("caught signal: {}", sig));
        }
        if !self.cancel.cancel() {
            return;
        }
        self.crunch_log.println("stopping container");
        if let Err(e) = self.executor.stop().await {
            self.crunch_log.println(format!("error stopping container: {:#}", e));
        }
    }

    /// If `err` says the node can't run containers, flag the node for the
    /// dispatcher. Returns whether it did.
    async fn check_broken_node(&self, err: &anyhow::Error) -> bool {
        let msg = format!("{:#}", err);
        if !is_broken_node(&msg) {
            return false;
        }
        self.crunch_log
            .println(format!("Error suggests node is unable to run containers: {}", msg));
        match &self.config.broken_node_hook {
            None => {
                let path = self.registry.broken_path();
                self.crunch_log
                    .println(format!("Writing {} to mark node as broken", path.display()));
                if let Err(e) = self.registry.mark_broken() {
                    self.crunch_log
                        .println(format!("Error writing {}: {:#}", path.display(), e));
                }
            }
            Some(hook) => {
                self.crunch_log.println(format!("Running broken node hook {:?}", hook));
                let output = tokio::process::Command::new(hook).output().await;
                let failure = match output {
                    Ok(o) => {
                        self.crunch_log.write(&o.stdout);
                        self.crunch_log.write(&o.stderr);
                        (!o.status.success()).then(|| o.status.to_string())
                    }
                    Err(e) => Some(e.to_string()),
                };
                if let Some(e) = failure {
                    self.crunch_log.println(format!("Error running broken node hook: {}", e));
                }
            }
        }
        true
    }

    // ─── Finalization ───────────────────────────────────────────

    async fn capture_output(&self, run: &mut Run) -> Result<()> {
        if run.container.runtime_constraints.api {
            // The container may have set its output itself.
            let rec = self
                .api
                .get("containers", &self.uuid, json!({"select": ["output"]}))
                .await
                .map_err(|e| anyhow::anyhow!("error fetching container record: {:#}", e))?;
            if let Some(out) = rec.get("output").and_then(Value::as_str).filter(|o| !o.is_empty()) {
                run.output_pdh = Some(out.to_string());
                return Ok(());
            }
        }
        let Some(staged) = &run.staged else {
            return Ok(());
        };
        let manifest_text = Copier::new(
            &*run.container_api,
            run.container_keep.clone(),
            staged.host_output_dir.clone(),
            &run.container.output_path,
            &staged.bind_mounts,
            &staged.mounts,
            &run.secret_mounts,
            &self.crunch_log,
        )
        .copy()
        .await?;

        let resp = run
            .container_api
            .create(
                "collections",
                json!({
                    "ensure_unique_name": true,
                    "select": ["uuid", "portable_data_hash"],
                    "collection": {
                        "is_trashed": true,
                        "name": format!("output for {}", self.uuid),
                        "manifest_text": manifest_text,
                    },
                }),
            )
            .await
            .map_err(|e| anyhow::anyhow!("error creating output collection: {:#}", e))?;
        run.output_pdh = resp
            .get("portable_data_hash")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(())
    }

    async fn commit_logs(&self, run: &Run) -> Result<()> {
        self.crunch_log.println(run.final_state);
        // Later supervisor messages go only to the event log; the
        // collection is final after this.
        if let Err(e) = self.crunch_log.redirect(self.logs.event_only("crunch-run")).await {
            warn!("[crunch-run] redirecting crunch-run log: {}", e);
        }
        self.logs.commit().await?;
        Ok(())
    }

    async fn update_container_final(&self, run: &Run) -> Result<()> {
        let mut container = json!({
            "state": run.final_state.to_string(),
            "exit_code": run.exit_code,
            "cost": self.prices().cost(Utc::now()),
        });
        if let Some(pdh) = self.logs.committed().await {
            container["log"] = json!(pdh);
        }
        if run.final_state == ContainerState::Complete
            && let Some(out) = &run.output_pdh
        {
            container["output"] = json!(out);
        }
        info!("[crunch-run] {} final state {}", self.uuid, run.final_state);
        self.api
            .update("containers", &self.uuid, json!({"container": container}))
            .await
            .map_err(|e| anyhow::anyhow!("error updating container record: {:#}", e))?;
        Ok(())
    }

    /// Unmount and remove the run's scratch space. Safe to call twice.
    async fn cleanup_dirs(&self, run: &mut Run) {
        if let (Some(helper), Some(mountpoint)) = (run.helper.take(), run.mountpoint.as_ref()) {
            self.mount_helper
                .unmount(&helper, mountpoint, &self.crunch_log)
                .await;
        }
        if let Some(mountpoint) = run.mountpoint.take()
            && let Err(e) = tokio::fs::remove_dir(&mountpoint).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            self.crunch_log.println(format!(
                "While cleaning up arv-mount directory {}: {}",
                mountpoint.display(),
                e
            ));
        }
        if let Some(parent) = run.parent_temp.take()
            && let Err(e) = tokio::fs::remove_dir_all(&parent).await
        {
            self.crunch_log.println(format!(
                "While cleaning up temporary directory {}: {}",
                parent.display(),
                e
            ));
        }
    }
}

/// Collection id (uuid or bare content hash) and sub-path of a mount source.
fn collection_source(c: &pkg_types::mount::CollectionMount) -> (String, String) {
    let src = c
        .uuid
        .clone()
        .filter(|u| !u.is_empty())
        .or_else(|| c.portable_data_hash.clone())
        .unwrap_or_default();
    match src.split_once('/') {
        Some((id, sub)) => (id.to_string(), sub.to_string()),
        None => (src, String::new()),
    }
}

/// ` (signal N, NAME)` when `code` reports death by signal.
fn signal_suffix(code: i32) -> String {
    if code & 0x80 == 0 {
        return String::new();
    }
    let signo = code & 0x7f;
    match nix::sys::signal::Signal::try_from(signo) {
        Ok(sig) => format!(" (signal {}, {})", signo, sig.as_str()),
        Err(_) => format!(" (signal {})", signo),
    }
}

fn current_user_and_groups() -> String {
    use nix::unistd::{Group, User, getgid, getgroups, getuid};
    let uid = getuid();
    let gid = getgid();
    let user = User::from_uid(uid).ok().flatten().map(|u| u.name).unwrap_or_default();
    let mut s = format!("crunch-run process has uid={}({}) gid={}", uid, user, gid);
    if let Ok(Some(g)) = Group::from_gid(gid) {
        s.push_str(&format!("({})", g.name));
    }
    s.push_str(" groups=");
    let groups = getgroups().unwrap_or_default();
    let names: Vec<String> = groups
        .into_iter()
        .map(|g| match Group::from_gid(g) {
            Ok(Some(group)) => format!("{}({})", g, group.name),
            _ => g.to_string(),
        })
        .collect();
    s.push_str(&names.join(","));
    s
}
