//! Locating and parsing the cgroup files of one container.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

/// How deep below a hierarchy root a container's cgroup may sit.
const MAX_SEARCH_DEPTH: usize = 6;

/// The stat files found for one cgroup. Entries are `None` when the
/// hierarchy doesn't provide them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatFiles {
    pub memory_stat: Option<PathBuf>,
    pub memory_current: Option<PathBuf>,
    pub memory_swap_current: Option<PathBuf>,
    pub cpu_stat: Option<PathBuf>,
    pub cpu_max: Option<PathBuf>,
    pub cpuacct_stat: Option<PathBuf>,
    pub io_stat: Option<PathBuf>,
    pub blkio_bytes: Option<PathBuf>,
}

impl StatFiles {
    /// Find the cgroup whose directory name contains `cgroup_id` under
    /// `root`, which is either a unified (v2) mount or a directory of v1
    /// subsystem mounts.
    pub fn discover(root: &Path, cgroup_id: &str) -> Option<Self> {
        if cgroup_id.is_empty() {
            return None;
        }
        let files = if root.join("cgroup.controllers").exists() {
            let dir = find_dir(root, cgroup_id)?;
            Self {
                memory_stat: existing(&dir, "memory.stat"),
                memory_current: existing(&dir, "memory.current"),
                memory_swap_current: existing(&dir, "memory.swap.current"),
                cpu_stat: existing(&dir, "cpu.stat"),
                cpu_max: existing(&dir, "cpu.max"),
                io_stat: existing(&dir, "io.stat"),
                ..Default::default()
            }
        } else {
            let subsystem = |names: &[&str]| {
                names
                    .iter()
                    .find_map(|name| find_dir(&root.join(name), cgroup_id))
            };
            let memory = subsystem(&["memory"]);
            let cpuacct = subsystem(&["cpuacct", "cpu,cpuacct"]);
            let blkio = subsystem(&["blkio"]);
            Self {
                memory_stat: memory.as_deref().and_then(|d| existing(d, "memory.stat")),
                cpuacct_stat: cpuacct.as_deref().and_then(|d| existing(d, "cpuacct.stat")),
                blkio_bytes: blkio
                    .as_deref()
                    .and_then(|d| existing(d, "blkio.throttle.io_service_bytes")),
                ..Default::default()
            }
        };
        if files == Self::default() {
            None
        } else {
            Some(files)
        }
    }
}

fn existing(dir: &Path, name: &str) -> Option<PathBuf> {
    let path = dir.join(name);
    path.is_file().then_some(path)
}

/// Breadth-first search for a directory whose name contains `id`.
fn find_dir(root: &Path, id: &str) -> Option<PathBuf> {
    let mut queue = VecDeque::from([(root.to_path_buf(), 0usize)]);
    while let Some((dir, depth)) = queue.pop_front() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(ft) = entry.file_type() else { continue };
            if !ft.is_dir() {
                continue;
            }
            let path = entry.path();
            if entry.file_name().to_string_lossy().contains(id) {
                return Some(path);
            }
            if depth + 1 < MAX_SEARCH_DEPTH {
                queue.push_back((path, depth + 1));
            }
        }
    }
    None
}

// ─── Parsers ────────────────────────────────────────────────────

/// `name value` lines, as in `memory.stat` and `cpu.stat`.
pub(crate) fn parse_key_values(text: &str) -> BTreeMap<String, u64> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let key = fields.next()?;
            let value = fields.next()?.parse().ok()?;
            Some((key.to_string(), value))
        })
        .collect()
}

/// A single integer, as in `memory.current`.
pub(crate) fn parse_single(text: &str) -> Option<u64> {
    text.trim().parse().ok()
}

/// Device totals from v2 `io.stat`: `8:0 rbytes=1 wbytes=2 rios=...`.
/// Returns `(written, read)` per device.
pub(crate) fn parse_io_stat(text: &str) -> BTreeMap<String, (u64, u64)> {
    let mut out = BTreeMap::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let Some(dev) = fields.next() else { continue };
        let (mut written, mut read) = (0, 0);
        for field in fields {
            if let Some(v) = field.strip_prefix("wbytes=") {
                written = v.parse().unwrap_or(0);
            } else if let Some(v) = field.strip_prefix("rbytes=") {
                read = v.parse().unwrap_or(0);
            }
        }
        out.insert(dev.to_string(), (written, read));
    }
    out
}

/// Device totals from v1 `blkio.throttle.io_service_bytes`:
/// `8:0 Read 123`, `8:0 Write 456`.
pub(crate) fn parse_blkio_bytes(text: &str) -> BTreeMap<String, (u64, u64)> {
    let mut out: BTreeMap<String, (u64, u64)> = BTreeMap::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [dev, op, value] = fields[..] else {
            continue;
        };
        let Ok(value) = value.parse::<u64>() else {
            continue;
        };
        let entry = out.entry(dev.to_string()).or_default();
        match op {
            "Write" => entry.0 = value,
            "Read" => entry.1 = value,
            _ => {}
        }
    }
    out
}

/// v1 `cpuacct.stat` in USER_HZ ticks, converted to seconds.
pub(crate) fn parse_cpuacct(text: &str) -> (f64, f64) {
    let kv = parse_key_values(text);
    let ticks = |k: &str| kv.get(k).copied().unwrap_or(0) as f64 / 100.0;
    (ticks("user"), ticks("system"))
}

/// v2 `cpu.stat` in microseconds, converted to seconds.
pub(crate) fn parse_cpu_stat(text: &str) -> (f64, f64) {
    let kv = parse_key_values(text);
    let usec = |k: &str| kv.get(k).copied().unwrap_or(0) as f64 / 1_000_000.0;
    (usec("user_usec"), usec("system_usec"))
}

/// CPUs allowed by v2 `cpu.max` (`<quota> <period>`), rounded up.
/// `None` when unlimited.
pub(crate) fn parse_cpu_max(text: &str) -> Option<u32> {
    let mut fields = text.split_whitespace();
    let quota: u64 = fields.next()?.parse().ok()?;
    let period: u64 = fields.next()?.parse().ok()?;
    if period == 0 {
        return None;
    }
    Some(quota.div_ceil(period) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ID: &str = "3f1c2d0a9b8e";

    #[test]
    fn test_discover_v2() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("cgroup.controllers"), "cpu memory io").unwrap();
        let dir = root
            .path()
            .join("system.slice")
            .join(format!("docker-{}.scope", ID));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("memory.stat"), "pgmajfault 3\n").unwrap();
        fs::write(dir.join("memory.current"), "1024\n").unwrap();
        fs::write(dir.join("cpu.stat"), "user_usec 1\n").unwrap();

        let files = StatFiles::discover(root.path(), ID).unwrap();
        assert_eq!(files.memory_stat, Some(dir.join("memory.stat")));
        assert_eq!(files.memory_current, Some(dir.join("memory.current")));
        assert_eq!(files.cpu_stat, Some(dir.join("cpu.stat")));
        assert!(files.memory_swap_current.is_none());
        assert!(files.cpuacct_stat.is_none());
    }

    #[test]
    fn test_discover_v1() {
        let root = TempDir::new().unwrap();
        let mem = root.path().join("memory/docker").join(ID);
        let cpu = root.path().join("cpu,cpuacct/docker").join(ID);
        fs::create_dir_all(&mem).unwrap();
        fs::create_dir_all(&cpu).unwrap();
        fs::write(mem.join("memory.stat"), "rss 10\n").unwrap();
        fs::write(cpu.join("cpuacct.stat"), "user 1\nsystem 2\n").unwrap();

        let files = StatFiles::discover(root.path(), ID).unwrap();
        assert_eq!(files.memory_stat, Some(mem.join("memory.stat")));
        assert_eq!(files.cpuacct_stat, Some(cpu.join("cpuacct.stat")));
        assert!(files.blkio_bytes.is_none());
    }

    #[test]
    fn test_discover_missing() {
        let root = TempDir::new().unwrap();
        assert!(StatFiles::discover(root.path(), ID).is_none());
        assert!(StatFiles::discover(root.path(), "").is_none());
    }

    #[test]
    fn test_parsers() {
        let kv = parse_key_values("cache 5\nrss 7\nbogus\nswap x\n");
        assert_eq!(kv.len(), 2);
        assert_eq!(kv["rss"], 7);

        let io = parse_io_stat("8:0 rbytes=100 wbytes=200 rios=1 wios=2\n");
        assert_eq!(io["8:0"], (200, 100));

        let blkio = parse_blkio_bytes("8:0 Read 100\n8:0 Write 200\n8:0 Sync 1\nTotal 301\n");
        assert_eq!(blkio.len(), 1);
        assert_eq!(blkio["8:0"], (200, 100));

        assert_eq!(parse_cpuacct("user 150\nsystem 50\n"), (1.5, 0.5));
        assert_eq!(parse_cpu_stat("usage_usec 3\nuser_usec 2000000\nsystem_usec 500000\n"), (2.0, 0.5));
        assert_eq!(parse_cpu_max("150000 100000\n"), Some(2));
        assert_eq!(parse_cpu_max("max 100000\n"), None);
        assert_eq!(parse_single(" 42\n"), Some(42));
    }
}
