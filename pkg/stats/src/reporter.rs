use pkg_logging::ThrottledLogger;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::cgroup::{self, StatFiles};

/// Memory stats reported, in this order, when the cgroup provides them.
const MEMORY_STATS: &[&str] = &["cache", "swap", "pgmajfault", "rss"];

/// What a reporter samples.
#[derive(Debug, Clone)]
enum Source {
    /// Node-wide memory, load and CPU.
    Host,
    /// One container's cgroup.
    Cgroup(StatFiles),
}

/// A memory level that triggers one warning when first crossed.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Threshold {
    percentage: u64,
    threshold: u64,
    total: u64,
}

/// Periodic telemetry sampler. Configure, then [`Reporter::start`].
pub struct Reporter {
    interval: Duration,
    source: Source,
    temp_dir: Option<PathBuf>,
    thresholds: BTreeMap<String, Vec<Threshold>>,
    threshold_logger: Option<Arc<ThrottledLogger>>,
}

impl Reporter {
    /// Sample the node as a whole (`hoststat.txt`).
    pub fn host(interval: Duration) -> Self {
        Self::with_source(interval, Source::Host)
    }

    /// Sample one container's cgroup (`crunchstat.txt`).
    pub fn cgroup(interval: Duration, files: StatFiles) -> Self {
        Self::with_source(interval, Source::Cgroup(files))
    }

    fn with_source(interval: Duration, source: Source) -> Self {
        Self {
            interval,
            source,
            temp_dir: None,
            thresholds: BTreeMap::new(),
            threshold_logger: None,
        }
    }

    /// Also report free space on the filesystem holding `dir`.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Warn on `logger` the first time `stat` crosses each of
    /// `percentages` of `total`.
    pub fn with_memory_thresholds(
        mut self,
        stat: &str,
        total: u64,
        percentages: &[u64],
        logger: Arc<ThrottledLogger>,
    ) -> Self {
        if total == 0 {
            return self;
        }
        let mut levels: Vec<Threshold> = percentages
            .iter()
            .map(|&percentage| Threshold {
                percentage,
                threshold: total * percentage / 100,
                total,
            })
            .collect();
        levels.sort_by_key(|t| t.threshold);
        self.thresholds.insert(stat.to_string(), levels);
        self.threshold_logger = Some(logger);
        self
    }

    /// Take a sample now and then every interval, writing report lines to
    /// `logger`, until the handle is stopped.
    pub fn start(self, logger: Arc<ThrottledLogger>) -> ReporterHandle {
        let pids = Arc::new(Mutex::new(BTreeMap::new()));
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let interval = if self.interval.is_zero() {
            Duration::from_secs(pkg_constants::runtime::CRUNCHSTAT_INTERVAL_SECS)
        } else {
            self.interval
        };
        let threshold_logger = self.threshold_logger.clone();
        let mut sampler = Sampler::new(self, pids.clone());

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        let report = sampler.sample();
                        for line in report.lines {
                            logger.println(line);
                        }
                        if let Some(tl) = &threshold_logger {
                            for warning in report.warnings {
                                tl.println(warning);
                            }
                        }
                    }
                }
            }
            sampler.summary
        });

        ReporterHandle { pids, stop_tx, task }
    }
}

/// A running reporter.
pub struct ReporterHandle {
    pids: Arc<Mutex<BTreeMap<String, u32>>>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<Summary>,
}

impl ReporterHandle {
    /// Include the resident memory of `pid` in each sample, as `name`.
    pub fn report_pid(&self, name: &str, pid: u32) {
        self.pids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), pid);
    }

    /// Stop sampling and return what was observed.
    pub async fn stop(self) -> Summary {
        let _ = self.stop_tx.send(true);
        match self.task.await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::warn!("[stats] reporter task failed: {}", e);
                Summary::default()
            }
        }
    }
}

// ─── Summary ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct CpuSample {
    at: Instant,
    user: f64,
    sys: f64,
    cpus: u32,
}

#[derive(Debug, Clone, Copy)]
struct IoSample {
    at: Instant,
    written: u64,
    read: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct DiskSample {
    used: u64,
    total: u64,
}

/// Totals and maxima collected by a reporter.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    cpu: Option<CpuSample>,
    disk_io: BTreeMap<String, IoSample>,
    max_disk: DiskSample,
    /// Keyed by (process name, stat); the container's own stats have an
    /// empty process name.
    max_mem: BTreeMap<(String, String), u64>,
}

impl Summary {
    /// Highest resident memory seen for a reported process.
    pub fn max_process_rss(&self, name: &str) -> Option<u64> {
        self.max_mem
            .get(&(name.to_string(), "rss".to_string()))
            .copied()
    }

    /// Highest value seen for one of the container's memory stats.
    pub fn max_memory(&self, stat: &str) -> Option<u64> {
        self.max_mem
            .get(&(String::new(), format!("total_{}", stat)))
            .or_else(|| self.max_mem.get(&(String::new(), stat.to_string())))
            .copied()
    }

    /// Log CPU, IO, disk and container memory totals. `mem_limits` gives
    /// the limit for a memory stat so usage is also shown as a percentage.
    pub fn log_maxima(&self, logger: &ThrottledLogger, mem_limits: &BTreeMap<String, u64>) {
        if let Some(cpu) = &self.cpu {
            logger.println(format!(
                "Total CPU usage was {:.6} user and {:.6} sys on {} CPUs",
                cpu.user, cpu.sys, cpu.cpus
            ));
        }
        for (dev, io) in &self.disk_io {
            logger.println(format!(
                "Total disk I/O on {} was {} bytes written and {} bytes read",
                dev, io.written, io.read
            ));
        }
        if self.max_disk.total > 0 {
            logger.println(format!(
                "Maximum disk usage was {}%, {}/{} bytes",
                100 * self.max_disk.used / self.max_disk.total,
                self.max_disk.used,
                self.max_disk.total
            ));
        }
        for stat in MEMORY_STATS {
            if let Some(value) = self.max_memory(stat) {
                let limit = mem_limits.get(*stat).copied().unwrap_or(0);
                logger.println(memory_max_line("container", stat, value, limit));
            }
        }
    }

    /// Log the peak memory of each reported process.
    pub fn log_process_mem_max(&self, logger: &ThrottledLogger) {
        for ((name, stat), value) in &self.max_mem {
            if name.is_empty() {
                continue;
            }
            logger.println(memory_max_line(name, stat, *value, 0));
        }
    }
}

fn memory_max_line(source: &str, stat: &str, value: u64, limit: u64) -> String {
    let units = if stat == "pgmajfault" { "faults" } else { "bytes" };
    if limit > 0 {
        format!(
            "Maximum {} memory {} usage was {}%, {}/{} {}",
            source,
            stat,
            100 * value / limit,
            value,
            limit,
            units
        )
    } else {
        format!("Maximum {} memory {} usage was {} {}", source, stat, value, units)
    }
}

// ─── Sampler ────────────────────────────────────────────────────

/// Lines produced by one sample.
#[derive(Debug, Default)]
pub(crate) struct Report {
    pub lines: Vec<String>,
    pub warnings: Vec<String>,
}

pub(crate) struct Sampler {
    source: Source,
    temp_dir: Option<PathBuf>,
    thresholds: BTreeMap<String, Vec<Threshold>>,
    pids: Arc<Mutex<BTreeMap<String, u32>>>,
    sys: System,
    summary: Summary,
}

impl Sampler {
    fn new(reporter: Reporter, pids: Arc<Mutex<BTreeMap<String, u32>>>) -> Self {
        Self {
            source: reporter.source,
            temp_dir: reporter.temp_dir,
            thresholds: reporter.thresholds,
            pids,
            sys: System::new(),
            summary: Summary::default(),
        }
    }

    pub(crate) fn sample(&mut self) -> Report {
        let mut report = Report::default();
        match self.source.clone() {
            Source::Host => self.host_stats(&mut report),
            Source::Cgroup(files) => {
                self.memory_stats(&files, &mut report);
                self.cpu_stats(&files, &mut report);
                self.io_stats(&files, &mut report);
            }
        }
        self.process_stats(&mut report);
        self.disk_space(&mut report);
        report
    }

    fn host_stats(&mut self, report: &mut Report) {
        self.sys.refresh_memory();
        self.sys.refresh_cpu_usage();
        report.lines.push(format!(
            "mem {} used {} available {} total {} swap",
            self.sys.used_memory(),
            self.sys.available_memory(),
            self.sys.total_memory(),
            self.sys.used_swap()
        ));
        let load = System::load_average();
        report.lines.push(format!(
            "load {:.2} {:.2} {:.2}",
            load.one, load.five, load.fifteen
        ));
        report.lines.push(format!(
            "cpu {:.2} percent {} cpus",
            self.sys.global_cpu_usage(),
            self.sys.cpus().len()
        ));
    }

    fn memory_stats(&mut self, files: &StatFiles, report: &mut Report) {
        let mut stats = files
            .memory_stat
            .as_deref()
            .and_then(read)
            .map(|t| cgroup::parse_key_values(&t))
            .unwrap_or_default();
        // v2 has no separate rss/cache; current usage stands in for rss.
        for (stat, path) in [
            ("rss", &files.memory_current),
            ("swap", &files.memory_swap_current),
        ] {
            if let Some(v) = path.as_deref().and_then(read).and_then(|t| cgroup::parse_single(&t)) {
                stats.insert(stat.to_string(), v);
            }
        }
        if stats.is_empty() {
            return;
        }
        for (stat, value) in &stats {
            let max = self
                .summary
                .max_mem
                .entry((String::new(), stat.clone()))
                .or_default();
            *max = (*max).max(*value);
        }

        let mut line = String::from("mem");
        for stat in MEMORY_STATS {
            if let Some(v) = stats
                .get(&format!("total_{}", stat))
                .or_else(|| stats.get(*stat))
            {
                line.push_str(&format!(" {} {}", v, stat));
            }
        }
        report.lines.push(line);

        for (stat, levels) in self.thresholds.iter_mut() {
            let Some(value) = stats
                .get(&format!("total_{}", stat))
                .or_else(|| stats.get(stat))
                .copied()
            else {
                continue;
            };
            let crossed = levels.iter().take_while(|t| value >= t.threshold).count();
            for t in levels.drain(..crossed) {
                report.warnings.push(format!(
                    "Container using over {}% of memory ({} {}/{} bytes)",
                    t.percentage, stat, value, t.total
                ));
            }
        }
    }

    fn cpu_stats(&mut self, files: &StatFiles, report: &mut Report) {
        let (user, sys) = if let Some(text) = files.cpu_stat.as_deref().and_then(read) {
            cgroup::parse_cpu_stat(&text)
        } else if let Some(text) = files.cpuacct_stat.as_deref().and_then(read) {
            cgroup::parse_cpuacct(&text)
        } else {
            return;
        };
        let cpus = files
            .cpu_max
            .as_deref()
            .and_then(read)
            .and_then(|t| cgroup::parse_cpu_max(&t))
            .unwrap_or_else(host_cpus);
        let next = CpuSample {
            at: Instant::now(),
            user,
            sys,
            cpus,
        };
        let delta = match &self.summary.cpu {
            Some(last) => format!(
                " -- interval {:.4} seconds {:.4} user {:.4} sys",
                next.at.duration_since(last.at).as_secs_f64(),
                next.user - last.user,
                next.sys - last.sys
            ),
            None => String::new(),
        };
        report.lines.push(format!(
            "cpu {:.4} user {:.4} sys {} cpus{}",
            next.user, next.sys, next.cpus, delta
        ));
        self.summary.cpu = Some(next);
    }

    fn io_stats(&mut self, files: &StatFiles, report: &mut Report) {
        let devices = if let Some(text) = files.io_stat.as_deref().and_then(read) {
            cgroup::parse_io_stat(&text)
        } else if let Some(text) = files.blkio_bytes.as_deref().and_then(read) {
            cgroup::parse_blkio_bytes(&text)
        } else {
            return;
        };
        let now = Instant::now();
        for (dev, (written, read)) in devices {
            let delta = match self.summary.disk_io.get(&dev) {
                Some(last) => format!(
                    " -- interval {:.4} seconds {} write {} read",
                    now.duration_since(last.at).as_secs_f64(),
                    written.saturating_sub(last.written),
                    read.saturating_sub(last.read)
                ),
                None => String::new(),
            };
            report
                .lines
                .push(format!("blkio:{} {} write {} read{}", dev, written, read, delta));
            self.summary.disk_io.insert(
                dev,
                IoSample {
                    at: now,
                    written,
                    read,
                },
            );
        }
    }

    fn process_stats(&mut self, report: &mut Report) {
        let pids: Vec<(String, u32)> = self
            .pids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, pid)| (name.clone(), *pid))
            .collect();
        if pids.is_empty() {
            return;
        }
        let wanted: Vec<Pid> = pids.iter().map(|(_, pid)| Pid::from_u32(*pid)).collect();
        self.sys
            .refresh_processes(ProcessesToUpdate::Some(&wanted), true);

        let mut line = String::new();
        for (name, pid) in pids {
            let Some(process) = self.sys.process(Pid::from_u32(pid)) else {
                continue;
            };
            let rss = process.memory();
            line.push_str(&format!(" {} {}", rss, name));
            let max = self
                .summary
                .max_mem
                .entry((name, "rss".to_string()))
                .or_default();
            *max = (*max).max(rss);
        }
        if !line.is_empty() {
            report.lines.push(format!("procmem{}", line));
        }
    }

    fn disk_space(&mut self, report: &mut Report) {
        let Some(dir) = &self.temp_dir else { return };
        let st = match nix::sys::statvfs::statvfs(dir.as_path()) {
            Ok(st) => st,
            Err(e) => {
                tracing::debug!("[stats] statfs {}: {}", dir.display(), e);
                return;
            }
        };
        let frsize = st.fragment_size() as u64;
        let total = st.blocks() as u64 * frsize;
        let used = (st.blocks() as u64).saturating_sub(st.blocks_free() as u64) * frsize;
        let available = st.blocks_available() as u64 * frsize;
        report.lines.push(format!(
            "statfs {} available {} used {} total",
            available, used, total
        ));
        if used > self.summary.max_disk.used {
            self.summary.max_disk = DiskSample { used, total };
        }
    }
}

fn read(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok()
}

fn host_cpus() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}
