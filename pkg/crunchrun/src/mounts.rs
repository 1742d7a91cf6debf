//! Turning a container's mount declarations into host directories, bind
//! mounts and a mount-helper command line.

use anyhow::Result;
use pkg_constants::paths::{CONTAINER_CA_CERT_PATH, MOUNT_HELPER};
use pkg_container::BindMount;
use pkg_types::container::Container;
use pkg_types::mount::{CollectionMount, Mount};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::CrunchError;

const SETGID: u32 = 0o2000;

/// Container paths that name a stream rather than a location.
const STREAM_MOUNTS: &[&str] = &["stdin", "stdout", "stderr"];

fn bad_mount(msg: impl Into<String>) -> anyhow::Error {
    CrunchError::BadMount(msg.into()).into()
}

/// Inputs to [`stage`].
pub struct StageRequest<'a> {
    pub container: &'a Container,
    pub secret_mounts: &'a BTreeMap<String, Mount>,
    /// The run's private temp tree.
    pub parent_temp: &'a Path,
    pub stat_interval: Duration,
    /// Let other users (the docker daemon) see the helper's tree.
    pub allow_other: bool,
    pub cert_candidates: &'a [PathBuf],
}

/// Result of staging: what to start, what to bind, where output lands.
#[derive(Debug, Clone)]
pub struct StagedMounts {
    /// Full mount helper command line, program first.
    pub helper_argv: Vec<String>,
    pub mountpoint: PathBuf,
    /// container path → host side
    pub bind_mounts: BTreeMap<String, BindMount>,
    pub host_output_dir: PathBuf,
    /// Paths inside the helper's tree the container depends on.
    pub collection_paths: Vec<PathBuf>,
    /// Declared mounts with content-hash sub-paths split off.
    pub mounts: BTreeMap<String, Mount>,
    copy_files: Vec<(PathBuf, PathBuf)>,
}

fn mkdtemp(parent: &Path, prefix: &str) -> Result<PathBuf> {
    let dir = tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(parent)
        .map_err(|e| anyhow::anyhow!("while creating {} temp dir: {}", prefix, e))?;
    Ok(dir.keep())
}

fn below(path: &str, dir: &str) -> bool {
    path.strip_prefix(dir)
        .is_some_and(|rest| rest.len() > 1 && rest.starts_with('/'))
}

/// Validate mounts, create scratch directories and literal files, and
/// build the helper command line. Nothing is mounted yet.
pub fn stage(req: &StageRequest<'_>) -> Result<StagedMounts> {
    let container = req.container;
    let output_path = container.output_path.as_str();
    let mountpoint = mkdtemp(req.parent_temp, "keep")?;

    let mut argv: Vec<String> = vec![
        MOUNT_HELPER.to_string(),
        "--foreground".to_string(),
        "--read-write".to_string(),
        "--storage-classes".to_string(),
        container.output_storage_classes.join(","),
        format!("--crunchstat-interval={}", req.stat_interval.as_secs_f64()),
    ];
    if req.allow_other {
        argv.push("--allow-other".to_string());
    }
    let rc = &container.runtime_constraints;
    if rc.keep_cache_disk > 0 {
        let cache = mkdtemp(req.parent_temp, "keepcache")?;
        argv.extend([
            "--disk-cache".to_string(),
            "--disk-cache-dir".to_string(),
            cache.display().to_string(),
            "--file-cache".to_string(),
            rc.keep_cache_disk.to_string(),
        ]);
    } else if rc.keep_cache_ram > 0 {
        argv.extend([
            "--ram-cache".to_string(),
            "--file-cache".to_string(),
            rc.keep_cache_ram.to_string(),
        ]);
    }

    for (path, mnt) in req.secret_mounts {
        if container.mounts.contains_key(path) {
            return Err(bad_mount(format!("secret mount {:?} conflicts with regular mount", path)));
        }
        if !matches!(mnt, Mount::Text { .. } | Mount::Json { .. }) {
            return Err(bad_mount(format!(
                "secret mount {:?} type is {:?} but only 'json' and 'text' are permitted",
                path,
                mnt.kind()
            )));
        }
    }
    let mut all: Vec<(&String, &Mount, bool)> = container
        .mounts
        .iter()
        .map(|(p, m)| (p, m, false))
        .chain(req.secret_mounts.iter().map(|(p, m)| (p, m, true)))
        .collect();
    all.sort_by(|a, b| a.0.cmp(b.0));

    let output_is_collection = matches!(container.output_mount(), Some(Mount::Collection(_)));
    let mut mounts = container.mounts.clone();
    let mut bind_mounts = BTreeMap::new();
    let mut host_output_dir: Option<PathBuf> = None;
    let mut collection_paths = Vec::new();
    let mut copy_files: Vec<(PathBuf, String)> = Vec::new();
    let mut pdh_only = true;
    let mut tmp_count = 0;
    let mut need_cert = true;

    for (path, mnt, secret) in all {
        let path = path.as_str();
        if path == "stdout" || path == "stderr" {
            let Mount::File { path: file } = mnt else {
                return Err(bad_mount(format!(
                    "unsupported mount kind '{}' for {}: only 'file' is supported",
                    mnt.kind(),
                    path
                )));
            };
            if !below(file, output_path.trim_end_matches('/')) {
                return Err(bad_mount(format!(
                    "{} path does not start with OutputPath: {}, {}/",
                    capitalize(path),
                    file,
                    output_path.trim_end_matches('/')
                )));
            }
            continue;
        }
        if path == "stdin" {
            if !matches!(mnt, Mount::Collection(_) | Mount::Json { .. }) {
                return Err(bad_mount(format!(
                    "unsupported mount kind '{}' for stdin: only 'collection' and 'json' are supported",
                    mnt.kind()
                )));
            }
            if let Mount::Collection(c) = mnt {
                validate_source(c)?;
            }
            continue;
        }
        if path == CONTAINER_CA_CERT_PATH {
            need_cert = false;
        }
        let under_output = below(path, output_path);
        if under_output && !matches!(mnt, Mount::Collection(_) | Mount::Text { .. } | Mount::Json { .. }) {
            return Err(bad_mount(format!(
                "only mount points of kind 'collection', 'text' or 'json' are supported underneath the output_path for {:?}, was {:?}",
                path,
                mnt.kind()
            )));
        }

        match mnt {
            Mount::Collection(c) => {
                validate_source(c)?;
                let mut c = c.clone();
                let src = if let Some(uuid) = c.uuid.as_deref().filter(|u| !u.is_empty()) {
                    if c.writable {
                        return Err(bad_mount("writing to existing collections currently not permitted"));
                    }
                    pdh_only = false;
                    mountpoint.join("by_id").join(uuid)
                } else if let Some(pdh) = c.portable_data_hash.clone().filter(|p| !p.is_empty()) {
                    if c.writable && !under_output {
                        return Err(bad_mount("can never write to a collection specified by portable data hash"));
                    }
                    if let Some((hash, sub)) = pdh.split_once('/') {
                        c.portable_data_hash = Some(hash.to_string());
                        c.path = pkg_manifest::clean_path(sub);
                        mounts.insert(path.to_string(), Mount::Collection(c.clone()));
                    }
                    let hash = c.portable_data_hash.clone().unwrap_or_default();
                    let sub = pkg_manifest::clean_path(&c.path);
                    let root = mountpoint.join("by_id").join(hash);
                    if sub.is_empty() { root } else { root.join(sub) }
                } else {
                    let name = format!("tmp{}", tmp_count);
                    tmp_count += 1;
                    argv.extend(["--mount-tmp".to_string(), name.clone()]);
                    mountpoint.join(name)
                };
                if c.writable {
                    if path == output_path {
                        host_output_dir = Some(src.clone());
                        bind_mounts.insert(path.to_string(), bind(&src, false));
                    } else if under_output {
                        copy_files.push((src.clone(), path.to_string()));
                    } else {
                        bind_mounts.insert(path.to_string(), bind(&src, false));
                    }
                } else {
                    bind_mounts.insert(path.to_string(), bind(&src, true));
                }
                collection_paths.push(src);
            }
            Mount::Tmp { .. } => {
                let dir = mkdtemp(req.parent_temp, "tmp")?;
                let mode = fs::metadata(&dir)?.permissions().mode();
                fs::set_permissions(&dir, fs::Permissions::from_mode(mode | SETGID | 0o777))?;
                if path == output_path {
                    host_output_dir = Some(dir.clone());
                }
                bind_mounts.insert(path.to_string(), bind(&dir, false));
            }
            Mount::Text { .. } | Mount::Json { .. } => {
                let data = mnt
                    .literal_content()
                    .ok_or_else(|| anyhow::anyhow!("encoding content for mount {:?}", path))?;
                let dir = mkdtemp(req.parent_temp, mnt.kind())?;
                let file = dir.join(format!("mountdata.{}", mnt.kind()));
                fs::write(&file, &data).map_err(|e| anyhow::anyhow!("writing temp file: {}", e))?;
                fs::set_permissions(&file, fs::Permissions::from_mode(0o444))?;
                if under_output && (!secret || !output_is_collection) {
                    copy_files.push((file, path.to_string()));
                } else {
                    bind_mounts.insert(path.to_string(), bind(&file, true));
                }
            }
            other => {
                return Err(bad_mount(format!(
                    "unsupported mount kind '{}' for {:?}",
                    other.kind(),
                    path
                )));
            }
        }
    }

    let Some(host_output_dir) = host_output_dir else {
        return Err(bad_mount("output path does not correspond to a writable mount point"));
    };

    if need_cert
        && container.runtime_constraints.api
        && let Some(cert) = req.cert_candidates.iter().find(|p| p.is_file())
    {
        bind_mounts.insert(CONTAINER_CA_CERT_PATH.to_string(), bind(cert, true));
    }

    if pdh_only {
        argv.extend(["--mount-by-pdh", "by_id", "--disable-event-listening"].map(String::from));
    } else {
        argv.extend(["--mount-by-id", "by_id"].map(String::from));
    }
    argv.extend(["--mount-by-id", "by_uuid"].map(String::from));
    argv.push(mountpoint.display().to_string());

    let copy_files = copy_files
        .into_iter()
        .map(|(src, ctr)| {
            let rel = ctr[output_path.len()..].trim_start_matches('/');
            (src, host_output_dir.join(rel))
        })
        .collect();

    Ok(StagedMounts {
        helper_argv: argv,
        mountpoint,
        bind_mounts,
        host_output_dir,
        collection_paths,
        mounts,
        copy_files,
    })
}

fn validate_source(c: &CollectionMount) -> Result<()> {
    let has = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
    if has(&c.uuid) && has(&c.portable_data_hash) {
        return Err(bad_mount(
            "cannot specify both 'uuid' and 'portable_data_hash' for a collection mount",
        ));
    }
    Ok(())
}

fn bind(path: &Path, read_only: bool) -> BindMount {
    BindMount {
        host_path: path.display().to_string(),
        read_only,
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl StagedMounts {
    /// Once the helper is up: check the input paths exist, then seed the
    /// output directory with literal files and writable collection content.
    pub fn populate_output(&self) -> Result<()> {
        for p in &self.collection_paths {
            fs::metadata(p)
                .map_err(|e| anyhow::anyhow!("while checking that input files exist: {}: {}", p.display(), e))?;
        }
        for (src, dst) in &self.copy_files {
            copy_tree(src, dst).map_err(|e| {
                anyhow::anyhow!(
                    "while staging writable file from {:?} to {:?}: {}",
                    src.display().to_string(),
                    dst.display().to_string(),
                    e
                )
            })?;
        }
        Ok(())
    }
}

/// Copy a file or directory tree, making everything writable by the
/// container user.
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::metadata(src)?;
    let mode = meta.permissions().mode();
    if meta.is_dir() {
        fs::create_dir_all(dst)?;
        fs::set_permissions(dst, fs::Permissions::from_mode(mode | SETGID | 0o777))?;
        let mut names: Vec<_> = fs::read_dir(src)?
            .map(|e| e.map(|e| e.file_name()))
            .collect::<std::io::Result<_>>()?;
        names.sort();
        for name in names {
            copy_tree(&src.join(&name), &dst.join(&name))?;
        }
        Ok(())
    } else if meta.is_file() {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dst)?;
        fs::set_permissions(dst, fs::Permissions::from_mode((mode & 0o7777) | 0o777))?;
        Ok(())
    } else {
        anyhow::bail!("source {:?} is not a regular file or directory", src.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const PDH: &str = "59389a8f9ee9d399be35462a0f92541c+53";

    fn container(mounts: serde_json::Value, output_path: &str) -> Container {
        serde_json::from_value(json!({
            "uuid": "zzzzz-dz642-000000000000000",
            "mounts": mounts,
            "output_path": output_path,
            "output_storage_classes": ["default", "archive"],
        }))
        .unwrap()
    }

    fn stage_with(c: &Container, secrets: &BTreeMap<String, Mount>, tmp: &TempDir) -> Result<StagedMounts> {
        stage(&StageRequest {
            container: c,
            secret_mounts: secrets,
            parent_temp: tmp.path(),
            stat_interval: Duration::from_secs(10),
            allow_other: true,
            cert_candidates: &[],
        })
    }

    fn bad_mount_msg(r: Result<StagedMounts>) -> String {
        let err = r.unwrap_err();
        match CrunchError::of(&err) {
            Some(CrunchError::BadMount(msg)) => msg.clone(),
            other => panic!("expected BadMount, got {:?} ({})", other, err),
        }
    }

    #[test]
    fn test_tmp_output_and_readonly_collection() {
        let tmp = TempDir::new().unwrap();
        let c = container(
            json!({
                "/tmp": {"kind": "tmp"},
                "/keep/in": {"kind": "collection", "portable_data_hash": format!("{}/sub/dir", PDH)},
            }),
            "/tmp",
        );
        let staged = stage_with(&c, &BTreeMap::new(), &tmp).unwrap();

        let out = &staged.bind_mounts["/tmp"];
        assert!(!out.read_only);
        assert_eq!(Path::new(&out.host_path), staged.host_output_dir);
        let mode = fs::metadata(&staged.host_output_dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o2777, 0o2777);

        let input = &staged.bind_mounts["/keep/in"];
        assert!(input.read_only);
        assert_eq!(
            Path::new(&input.host_path),
            staged.mountpoint.join("by_id").join(PDH).join("sub/dir")
        );
        let Mount::Collection(m) = &staged.mounts["/keep/in"] else { panic!() };
        assert_eq!(m.portable_data_hash.as_deref(), Some(PDH));
        assert_eq!(m.path, "sub/dir");

        let argv = staged.helper_argv.join(" ");
        assert!(argv.starts_with(
            "arv-mount --foreground --read-write --storage-classes default,archive --crunchstat-interval=10 --allow-other"
        ));
        assert!(argv.ends_with(&format!(
            "--mount-by-pdh by_id --disable-event-listening --mount-by-id by_uuid {}",
            staged.mountpoint.display()
        )));
    }

    #[test]
    fn test_uuid_mount_uses_mount_by_id() {
        let tmp = TempDir::new().unwrap();
        let c = container(
            json!({
                "/tmp": {"kind": "tmp"},
                "/in": {"kind": "collection", "uuid": "zzzzz-4zz18-000000000000000"},
            }),
            "/tmp",
        );
        let staged = stage_with(&c, &BTreeMap::new(), &tmp).unwrap();
        assert!(staged.helper_argv.windows(2).any(|w| w == ["--mount-by-id", "by_id"]));
        assert!(!staged.helper_argv.iter().any(|a| a == "--mount-by-pdh"));
        assert!(staged.bind_mounts["/in"].host_path.ends_with("by_id/zzzzz-4zz18-000000000000000"));
    }

    #[test]
    fn test_writable_collection_output() {
        let tmp = TempDir::new().unwrap();
        let c = container(
            json!({
                "/out": {"kind": "collection", "writable": true},
                "/out/seed": {"kind": "collection", "portable_data_hash": PDH, "writable": true},
            }),
            "/out",
        );
        let staged = stage_with(&c, &BTreeMap::new(), &tmp).unwrap();
        assert_eq!(staged.host_output_dir, staged.mountpoint.join("tmp0"));
        assert!(staged.helper_argv.windows(2).any(|w| w == ["--mount-tmp", "tmp0"]));
        assert!(!staged.bind_mounts.contains_key("/out/seed"));
        assert_eq!(staged.copy_files.len(), 1);
        assert_eq!(staged.copy_files[0].1, staged.mountpoint.join("tmp0").join("seed"));
    }

    #[test]
    fn test_literal_mounts() {
        let tmp = TempDir::new().unwrap();
        let c = container(
            json!({
                "/tmp": {"kind": "tmp"},
                "/tmp/params.json": {"kind": "json", "content": {"a": 1}},
                "/etc/motd": {"kind": "text", "content": "hi"},
            }),
            "/tmp",
        );
        let staged = stage_with(&c, &BTreeMap::new(), &tmp).unwrap();

        let motd = &staged.bind_mounts["/etc/motd"];
        assert!(motd.read_only);
        assert!(motd.host_path.ends_with("mountdata.text"));
        assert_eq!(fs::read_to_string(&motd.host_path).unwrap(), "hi");
        let mode = fs::metadata(&motd.host_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o444);

        assert!(!staged.bind_mounts.contains_key("/tmp/params.json"));
        staged.populate_output().unwrap();
        let copied = staged.host_output_dir.join("params.json");
        assert_eq!(fs::read_to_string(&copied).unwrap(), r#"{"a":1}"#);
        let mode = fs::metadata(&copied).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);
    }

    #[test]
    fn test_secret_below_collection_output_is_bound() {
        let tmp = TempDir::new().unwrap();
        let c = container(json!({"/out": {"kind": "collection", "writable": true}}), "/out");
        let secrets: BTreeMap<String, Mount> =
            serde_json::from_value(json!({"/out/secret.txt": {"kind": "text", "content": "pw"}})).unwrap();
        let staged = stage_with(&c, &secrets, &tmp).unwrap();
        assert!(staged.bind_mounts["/out/secret.txt"].read_only);
        assert!(staged.copy_files.is_empty());
    }

    #[test]
    fn test_stream_mounts() {
        let tmp = TempDir::new().unwrap();
        let c = container(
            json!({
                "/tmp": {"kind": "tmp"},
                "stdout": {"kind": "tmp", "path": "/tmp/a.out"},
            }),
            "/tmp",
        );
        assert_eq!(
            bad_mount_msg(stage_with(&c, &BTreeMap::new(), &tmp)),
            "unsupported mount kind 'tmp' for stdout: only 'file' is supported"
        );

        let c = container(
            json!({
                "/tmp": {"kind": "tmp"},
                "stderr": {"kind": "file", "path": "/var/a.err"},
            }),
            "/tmp",
        );
        assert_eq!(
            bad_mount_msg(stage_with(&c, &BTreeMap::new(), &tmp)),
            "Stderr path does not start with OutputPath: /var/a.err, /tmp/"
        );

        let c = container(
            json!({
                "/tmp": {"kind": "tmp"},
                "stdin": {"kind": "text", "content": "x"},
            }),
            "/tmp",
        );
        assert!(bad_mount_msg(stage_with(&c, &BTreeMap::new(), &tmp)).contains("for stdin"));

        let c = container(
            json!({
                "/tmp": {"kind": "tmp"},
                "stdin": {"kind": "json", "content": [1]},
                "stdout": {"kind": "file", "path": "/tmp/out/a.txt"},
            }),
            "/tmp",
        );
        let staged = stage_with(&c, &BTreeMap::new(), &tmp).unwrap();
        assert_eq!(staged.bind_mounts.keys().collect::<Vec<_>>(), vec!["/tmp"]);
    }

    #[test]
    fn test_invalid_collection_mounts() {
        let tmp = TempDir::new().unwrap();
        let cases = [
            (
                json!({"/tmp": {"kind": "tmp"}, "/in": {"kind": "collection", "uuid": "zzzzz-4zz18-000000000000000", "portable_data_hash": PDH}}),
                "cannot specify both",
            ),
            (
                json!({"/tmp": {"kind": "tmp"}, "/in": {"kind": "collection", "uuid": "zzzzz-4zz18-000000000000000", "writable": true}}),
                "writing to existing collections",
            ),
            (
                json!({"/tmp": {"kind": "tmp"}, "/in": {"kind": "collection", "portable_data_hash": PDH, "writable": true}}),
                "can never write to a collection specified by portable data hash",
            ),
            (
                json!({"/tmp": {"kind": "tmp"}, "/tmp/x": {"kind": "tmp"}}),
                "underneath the output_path",
            ),
            (
                json!({"/tmp": {"kind": "tmp"}, "/src": {"kind": "git_tree"}}),
                "unsupported mount kind 'git_tree'",
            ),
            (
                json!({"/in": {"kind": "collection", "portable_data_hash": PDH}}),
                "output path does not correspond to a writable mount point",
            ),
        ];
        for (mounts, want) in cases {
            let c = container(mounts, "/tmp");
            let msg = bad_mount_msg(stage_with(&c, &BTreeMap::new(), &tmp));
            assert!(msg.contains(want), "{:?} does not contain {:?}", msg, want);
        }
    }

    #[test]
    fn test_secret_validation() {
        let tmp = TempDir::new().unwrap();
        let c = container(json!({"/tmp": {"kind": "tmp"}, "/etc/pw": {"kind": "text", "content": "a"}}), "/tmp");
        let conflict: BTreeMap<String, Mount> =
            serde_json::from_value(json!({"/etc/pw": {"kind": "text", "content": "b"}})).unwrap();
        assert_eq!(
            bad_mount_msg(stage_with(&c, &conflict, &tmp)),
            "secret mount \"/etc/pw\" conflicts with regular mount"
        );
        let wrong_kind: BTreeMap<String, Mount> =
            serde_json::from_value(json!({"/secret": {"kind": "tmp"}})).unwrap();
        assert!(bad_mount_msg(stage_with(&c, &wrong_kind, &tmp)).contains("only 'json' and 'text' are permitted"));
    }

    #[test]
    fn test_cert_and_cache_options() {
        let tmp = TempDir::new().unwrap();
        let cert = tmp.path().join("ca.pem");
        fs::write(&cert, "PEM").unwrap();
        let mut c = container(json!({"/tmp": {"kind": "tmp"}}), "/tmp");
        c.runtime_constraints.api = true;
        c.runtime_constraints.keep_cache_ram = 1 << 20;
        let candidates = vec![tmp.path().join("missing.pem"), cert.clone()];
        let staged = stage(&StageRequest {
            container: &c,
            secret_mounts: &BTreeMap::new(),
            parent_temp: tmp.path(),
            stat_interval: Duration::from_millis(1500),
            allow_other: false,
            cert_candidates: &candidates,
        })
        .unwrap();
        assert_eq!(
            staged.bind_mounts[CONTAINER_CA_CERT_PATH],
            BindMount {
                host_path: cert.display().to_string(),
                read_only: true
            }
        );
        let argv = staged.helper_argv.join(" ");
        assert!(argv.contains("--crunchstat-interval=1.5"));
        assert!(argv.contains("--ram-cache --file-cache 1048576"));
        assert!(!argv.contains("--allow-other"));
    }

    #[test]
    fn test_populate_output_checks_inputs() {
        let tmp = TempDir::new().unwrap();
        let c = container(
            json!({"/tmp": {"kind": "tmp"}, "/in": {"kind": "collection", "portable_data_hash": PDH}}),
            "/tmp",
        );
        let staged = stage_with(&c, &BTreeMap::new(), &tmp).unwrap();
        let err = staged.populate_output().unwrap_err();
        assert!(err.to_string().contains("while checking that input files exist"));

        fs::create_dir_all(staged.mountpoint.join("by_id").join(PDH)).unwrap();
        staged.populate_output().unwrap();
    }
}
