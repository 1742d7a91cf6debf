use anyhow::Context;
use clap::{ArgAction, Parser};
use pkg_client::{ClientConfig, HttpApiClient, HttpKeepClient};
use pkg_constants::paths::{DEFAULT_CLUSTER_CONFIG, DEFAULT_LOCK_DIR};
use pkg_constants::runtime::{DEFAULT_RUNTIME, UUID_LEN};
use pkg_container::new_executor;
use pkg_crunchrun::{ArvMount, ContainerRunner, HttpClients, NetworkPolicy, RunnerConfig, RunnerDeps};
use pkg_logging::ThrottleParams;
use pkg_registry::Registry;
use pkg_types::config::{ClusterConfig, ClusterConfigFile, load_config_file};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "crunch-run", about = "Run one container and record its outcome", version)]
struct Cli {
    /// Detach from parent process and run in the background
    #[arg(long)]
    detach: bool,

    /// Send signal N to an existing crunch-run process for the given UUID
    #[arg(long, value_name = "N")]
    kill: Option<i32>,

    /// List UUIDs of existing crunch-run processes (price data may be passed on stdin)
    #[arg(long)]
    list: bool,

    /// Set by -detach on the background child
    #[arg(long, hide = true)]
    no_detach: bool,

    /// Load config and environment variables from a JSON message on stdin
    #[arg(long, alias = "stdin-env")]
    stdin_config: bool,

    /// Cluster config file to try loading if -stdin-config is not given
    /// (default $ARVADOS_CONFIG or /etc/arvados/config.yml)
    #[arg(long, value_name = "PATH")]
    config: Option<String>,

    /// Sampling period for periodic resource usage reporting
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    crunchstat_interval: Duration,

    /// Path to the sysfs cgroup tree
    #[arg(long, default_value = "/sys/fs/cgroup")]
    cgroup_root: PathBuf,

    /// Name of the container's parent cgroup
    #[arg(long, default_value = "")]
    cgroup_parent: String,

    /// Use this process's cgroup for the given subsystem as the container's parent cgroup
    #[arg(long)]
    cgroup_parent_subsystem: Option<String>,

    /// Path to TLS root certificates
    #[arg(long)]
    ca_certs: Option<PathBuf>,

    /// Enable networking "always" (for all containers) or "default" (for containers that request it)
    #[arg(long, default_value = "default")]
    container_enable_networking: NetworkPolicy,

    /// Network mode for the container (any argument valid for docker --net)
    #[arg(long, default_value = "default")]
    container_network_mode: String,

    /// Write memory usage figures to this file after running the container
    #[arg(long, value_name = "FILE")]
    memprofile: Option<PathBuf>,

    /// Delay before starting (testing use only)
    #[arg(long, value_parser = humantime::parse_duration)]
    sleep: Option<Duration>,

    /// Container runtime: docker or singularity
    #[arg(long, default_value = DEFAULT_RUNTIME)]
    runtime_engine: String,

    /// Tell the container runtime to limit the container's memory usage
    #[arg(
        long,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = true,
        default_missing_value = "true"
    )]
    enable_memory_limit: bool,

    /// Script to run if the node is detected to be broken
    #[arg(long, value_name = "PATH")]
    broken_node_hook: Option<String>,

    /// Directory holding the per-container lockfiles
    #[arg(long, hide = true, default_value = DEFAULT_LOCK_DIR)]
    lock_dir: PathBuf,

    /// Container UUID
    uuid: Option<String>,
}

/// `-stdin-config` message.
#[derive(Debug, Default, Deserialize)]
struct StdinConfig {
    #[serde(rename = "Env", default)]
    env: BTreeMap<String, String>,
    #[serde(rename = "Cluster", default)]
    cluster: Option<ClusterConfig>,
}

/// Accept single-dash long flags (`-detach`, `-kill 15`,
/// `-crunchstat-interval=10s`) as well as `--flag`.
fn normalize_args(args: impl IntoIterator<Item = String>) -> Vec<String> {
    args.into_iter()
        .enumerate()
        .map(|(i, arg)| {
            let single_dash_long = i > 0
                && arg.len() > 2
                && arg.starts_with('-')
                && !arg.starts_with("--")
                && !arg[1..].starts_with(|c: char| c.is_ascii_digit());
            if single_dash_long { format!("-{}", arg) } else { arg }
        })
        .collect()
}

/// Path of this process's cgroup for `subsystem`, from the contents of
/// `/proc/self/cgroup`. In unified (v2) mode any subsystem matches.
fn find_cgroup(proc_self_cgroup: &str, subsystem: &str) -> anyhow::Result<String> {
    for line in proc_self_cgroup.lines() {
        let toks: Vec<&str> = line.splitn(3, ':').collect();
        let [id, controllers, path] = toks[..] else {
            continue;
        };
        if controllers.is_empty() && id == "0" {
            return Ok(path.to_string());
        }
        if controllers.split(',').any(|c| c == subsystem) {
            return Ok(path.to_string());
        }
    }
    anyhow::bail!("subsystem {:?} not found in /proc/self/cgroup", subsystem)
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().collect();
    let prog = argv.first().cloned().unwrap_or_else(|| "crunch-run".to_string());
    let args: Vec<String> = argv.iter().skip(1).cloned().collect();
    let cli = Cli::parse_from(normalize_args(argv));
    init_tracing();

    let detaching = cli.detach && !cli.no_detach;
    let supervising = !detaching && !cli.list && cli.kill.is_none();

    // The environment is only modified here, before the runtime starts
    // any threads.
    let stdin_config = if supervising && cli.stdin_config {
        let mut buf = Vec::new();
        let decoded = std::io::stdin()
            .read_to_end(&mut buf)
            .map_err(anyhow::Error::from)
            .and_then(|_| serde_json::from_slice::<StdinConfig>(&buf).map_err(anyhow::Error::from));
        match decoded {
            Ok(conf) => Some(conf),
            Err(e) => {
                error!("decode stdin: {:#}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        None
    };
    if let Some(conf) = &stdin_config {
        for (k, v) in &conf.env {
            // SAFETY: single-threaded; no other code reads the environment yet.
            unsafe { std::env::set_var(k, v) };
        }
    }
    if supervising && let Some(ca) = &cli.ca_certs {
        // SAFETY: as above.
        unsafe { std::env::set_var("SSL_CERT_FILE", ca) };
    }

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("starting runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    rt.block_on(dispatch(cli, prog, args, stdin_config))
}

async fn dispatch(cli: Cli, prog: String, args: Vec<String>, stdin_config: Option<StdinConfig>) -> ExitCode {
    let registry = Registry::new(&cli.lock_dir);

    if cli.list {
        let mut prices = Vec::new();
        if let Err(e) = tokio::io::stdin().read_to_end(&mut prices).await {
            error!("reading stdin: {}", e);
            return ExitCode::FAILURE;
        }
        return match registry.list_live(&prices) {
            Ok(lines) => {
                for line in lines {
                    println!("{}", line);
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{:#}", e);
                ExitCode::FAILURE
            }
        };
    }

    let Some(uuid) = cli.uuid.clone() else {
        eprintln!("missing required argument: container-uuid (try -help)");
        return ExitCode::from(2);
    };

    if cli.detach && !cli.no_detach {
        return match registry.detach(&uuid, &prog, &args, tokio::io::stdin()).await {
            Ok(info) => match serde_json::to_string(&info) {
                Ok(line) => {
                    println!("{}", line);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("{}: {}", uuid, e);
                    ExitCode::FAILURE
                }
            },
            Err(e) => {
                eprintln!("{}: {:#}", uuid, e);
                ExitCode::FAILURE
            }
        };
    }

    if let Some(signal) = cli.kill {
        return match registry.kill(&uuid, signal).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{}: {:#}", uuid, e);
                ExitCode::FAILURE
            }
        };
    }

    if uuid.len() != UUID_LEN {
        eprintln!("usage: {} [options] UUID", prog);
        return ExitCode::FAILURE;
    }

    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("ARVADOS_CONFIG").ok().filter(|p| !p.is_empty()))
        .unwrap_or_else(|| DEFAULT_CLUSTER_CONFIG.to_string());
    let cluster = match stdin_config {
        Some(conf) => conf.cluster,
        None => match load_config_file::<ClusterConfigFile>(&config_path) {
            Ok(file) => file.single().cloned(),
            Err(e) => {
                warn!("loading cluster config {}: {:#}", config_path, e);
                None
            }
        },
    };

    info!("crunch-run {} started", env!("CARGO_PKG_VERSION"));
    if let Some(delay) = cli.sleep {
        tokio::time::sleep(delay).await;
    }

    match supervise(&cli, &uuid, cluster).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {:#}", uuid, e);
            ExitCode::FAILURE
        }
    }
}

async fn supervise(cli: &Cli, uuid: &str, cluster: Option<ClusterConfig>) -> anyhow::Result<()> {
    let env: BTreeMap<String, String> = std::env::vars().collect();

    let mut throttle = ThrottleParams::default();
    if let Some(cluster) = &cluster {
        throttle
            .apply_config(&cluster.containers.logging)
            .context("invalid Containers.Logging config")?;
    }

    let mut config = RunnerConfig {
        lock_dir: cli.lock_dir.clone(),
        stat_interval: cli.crunchstat_interval,
        cgroup_root: cli.cgroup_root.clone(),
        cgroup_parent: cli.cgroup_parent.clone(),
        enable_memory_limit: cli.enable_memory_limit,
        enable_network: cli.container_enable_networking,
        network_mode: cli.container_network_mode.clone(),
        runtime_engine: cli.runtime_engine.clone(),
        broken_node_hook: cli.broken_node_hook.clone().filter(|h| !h.is_empty()),
        throttle,
        ..RunnerConfig::default()
    };
    if let Some(subsystem) = cli.cgroup_parent_subsystem.as_deref().filter(|s| !s.is_empty()) {
        let cgroups = std::fs::read_to_string("/proc/self/cgroup").context("fatal: cgroup parent subsystem")?;
        config.cgroup_parent = find_cgroup(&cgroups, subsystem).context("fatal: cgroup parent subsystem")?;
    }
    config.apply_env(env.clone());

    let mut client_config = ClientConfig::from_vars(|k| env.get(k).cloned());
    client_config.ca_certs = env.get("SSL_CERT_FILE").filter(|f| !f.is_empty()).map(PathBuf::from);
    let api = Arc::new(HttpApiClient::new(client_config.clone())?);
    let keep = Arc::new(HttpKeepClient::new(client_config.clone(), &*api).await?);
    let executor = new_executor(&config.runtime_engine, uuid, config.watchdog_interval)?;

    let runner = ContainerRunner::new(
        uuid,
        config,
        RunnerDeps {
            api,
            keep,
            clients: Arc::new(HttpClients::new(client_config)),
            executor,
            mount_helper: Arc::new(ArvMount::new()),
            sessions: None,
        },
    )
    .await?;

    let result = runner.run().await;
    if let Some(path) = &cli.memprofile {
        write_memory_profile(path);
    }
    result
}

/// Peak and current memory figures of this process.
fn write_memory_profile(path: &Path) {
    let mut sys = sysinfo::System::new();
    let pid = sysinfo::Pid::from_u32(std::process::id());
    sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
    let status = std::fs::read_to_string("/proc/self/status").unwrap_or_default();
    let mut text: String = status
        .lines()
        .filter(|l| l.starts_with("Vm"))
        .map(|l| format!("{}\n", l))
        .collect();
    if let Some(p) = sys.process(pid) {
        text.push_str(&format!("rss_bytes {}\nvirtual_bytes {}\n", p.memory(), p.virtual_memory()));
    }
    if let Err(e) = std::fs::write(path, text) {
        error!("could not write memory profile: {}", e);
    }
}
