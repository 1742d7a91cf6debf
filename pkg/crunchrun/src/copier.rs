//! Building the output collection from a finished container's output
//! directory.
//!
//! Regular files (and symlinks to them) are read from the host. Symlinks
//! into mounted collections, and collections mounted below the output path,
//! are copied by splicing the relevant part of their manifests, so no data
//! is moved. Symlinks anywhere else are errors.

use anyhow::{Context, Result};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use pkg_client::{ApiClient, CollectionFs, KeepClient};
use pkg_constants::keep::BLOCK_SIZE;
use pkg_constants::paths::COLLECTION_MARKER;
use pkg_constants::runtime::MAX_SYMLINKS;
use pkg_container::BindMount;
use pkg_logging::ThrottledLogger;
use pkg_manifest::{Manifest, clean_path, has_remote_blocks};
use pkg_types::collection::Collection;
use pkg_types::mount::Mount;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use crate::errors::CrunchError;

struct FileTodo {
    src: PathBuf,
    dst: String,
    size: u64,
}

pub struct Copier<'a> {
    pub api: &'a dyn ApiClient,
    pub keep: Arc<dyn KeepClient>,
    pub host_output_dir: PathBuf,
    pub ctr_output_dir: String,
    pub bind_mounts: &'a BTreeMap<String, BindMount>,
    pub mounts: &'a BTreeMap<String, Mount>,
    pub secret_mounts: &'a BTreeMap<String, Mount>,
    pub log: &'a ThrottledLogger,
    dirs: Vec<String>,
    files: Vec<FileTodo>,
    manifest: String,
    manifest_cache: HashMap<String, Manifest>,
}

/// Parent directory of a path in the output collection.
fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(d, _)| d).unwrap_or("")
}

impl<'a> Copier<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: &'a dyn ApiClient,
        keep: Arc<dyn KeepClient>,
        host_output_dir: PathBuf,
        ctr_output_dir: &str,
        bind_mounts: &'a BTreeMap<String, BindMount>,
        mounts: &'a BTreeMap<String, Mount>,
        secret_mounts: &'a BTreeMap<String, Mount>,
        log: &'a ThrottledLogger,
    ) -> Self {
        Self {
            api,
            keep,
            host_output_dir,
            ctr_output_dir: ctr_output_dir.trim_end_matches('/').to_string(),
            bind_mounts,
            mounts,
            secret_mounts,
            log,
            dirs: Vec::new(),
            files: Vec::new(),
            manifest: String::new(),
            manifest_cache: HashMap::new(),
        }
    }

    /// Copy everything and return the output manifest text.
    pub async fn copy(mut self) -> Result<String> {
        let root = self.ctr_output_dir.clone();
        self.walk_mount(String::new(), root, MAX_SYMLINKS, true)
            .await
            .context("error scanning files to copy to output")?;

        let spliced = Manifest::new(std::mem::take(&mut self.manifest));
        let mut fs = CollectionFs::from_manifest(self.keep.clone(), &spliced)
            .context("error creating output collection filesystem")?;
        for d in &self.dirs {
            fs.mkdir_all(d)
                .with_context(|| format!("error making directory {:?} in output collection", d))?;
        }

        let mut unflushed = 0usize;
        let mut last_dir: Option<String> = None;
        for f in &self.files {
            let dir = parent_dir(&f.dst);
            let changed = last_dir.as_deref() != Some(dir);
            if (changed && last_dir.is_some()) || unflushed > BLOCK_SIZE {
                fs.flush(!changed)
                    .await
                    .context("error flushing output collection file data")?;
                unflushed = 0;
            }
            last_dir = Some(dir.to_string());
            unflushed += self
                .copy_file(&mut fs, f)
                .await
                .with_context(|| format!("error copying file {:?} into output collection", f.dst))?;
        }

        if has_remote_blocks(spliced.text()) {
            self.log.println("Copying data blocks from remote input collections...");
            let n = fs
                .localize_remote_blocks()
                .await
                .context("error copying remote data blocks")?;
            self.log.println(format!("Copied {} data blocks from remote input collections", n));
        }
        fs.marshal_manifest().await
    }

    async fn copy_file(&self, fs: &mut CollectionFs, f: &FileTodo) -> Result<usize> {
        let dst = f.dst.trim_start_matches('/');
        self.log.println(format!("copying {:?} ({} bytes)", dst, f.size));
        fs.create(dst)?;
        let mut src = tokio::fs::File::open(&f.src).await?;
        let mut buf = vec![0u8; 1 << 20];
        let mut total = 0;
        loop {
            let n = src.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            fs.append(dst, &buf[..n])?;
            total += n;
            if fs.unflushed() >= BLOCK_SIZE {
                fs.flush(true).await?;
            }
        }
    }

    /// Queue `src` (an absolute container path) for copying to `dest` (a
    /// path in the output collection, empty for the root).
    fn walk_mount(&mut self, dest: String, src: String, max_symlinks: i32, mounts_below: bool) -> BoxFuture<'_, Result<()>> {
        async move {
            let probe = format!("{}/", src);
            let Some((root, mnt)) = self
                .mounts
                .iter()
                .filter(|(root, _)| probe.starts_with(&format!("{}/", root)))
                .max_by_key(|(root, _)| root.len())
                .map(|(r, m)| (r.clone(), m.clone()))
            else {
                if self.is_secret_path(&probe) {
                    return Ok(());
                }
                return Err(CrunchError::UnmappedPath(src).into());
            };
            if self.secret_mounts.keys().any(|s| s.len() > root.len() && probe.starts_with(&format!("{}/", s))) {
                return Ok(());
            }

            let rest = &src[root.len()..];
            let output_rel = match src.strip_prefix(&self.ctr_output_dir) {
                Some(r) if !r.trim_start_matches('/').is_empty() => r.trim_start_matches('/').to_string(),
                _ => "*".to_string(),
            };

            match &mnt {
                Mount::Collection(c) if c.exclude_from_output => {}
                Mount::Tmp { .. } => {
                    let host = self.host_path(&root, rest)?;
                    return self.walk_host_fs(dest, src, host, max_symlinks, mounts_below).await;
                }
                Mount::Collection(c) if !c.writable => {
                    let src_rel = clean_path(&format!("{}/{}", c.path, rest));
                    let pdh = c.portable_data_hash.clone().unwrap_or_default();
                    self.log.println(format!("copying {:?} from {}/{}", output_rel, pdh, src_rel));
                    let extracted = self.manifest_for(&pdh).await?.extract(&src_rel, &dest)?;
                    self.manifest.push_str(extracted.text());
                }
                Mount::Collection(c) => {
                    let src_rel = clean_path(&format!("{}/{}", c.path, rest));
                    self.log.println(format!("copying {:?}", output_rel));
                    let marker = self.host_root(&root)?.join(COLLECTION_MARKER);
                    let raw = tokio::fs::read(&marker)
                        .await
                        .with_context(|| format!("reading {}", marker.display()))?;
                    let coll: Collection = serde_json::from_slice(&raw)
                        .with_context(|| format!("decoding {}", marker.display()))?;
                    let extracted = Manifest::new(coll.manifest_text).extract(&src_rel, &dest)?;
                    self.manifest.push_str(extracted.text());
                }
                other => {
                    anyhow::bail!(
                        "{:?}: unsupported mount {:?} in output (kind is {:?})",
                        src,
                        root,
                        other.kind()
                    );
                }
            }
            if mounts_below {
                self.walk_mounts_below(&dest, &src).await?;
            }
            Ok(())
        }
        .boxed()
    }

    fn is_secret_path(&self, probe: &str) -> bool {
        self.secret_mounts
            .keys()
            .any(|s| probe.starts_with(&format!("{}/", s)))
    }

    /// Mounts nested below `src`, except the ones staged as plain files
    /// (those are picked up from the host directory).
    async fn walk_mounts_below(&mut self, dest: &str, src: &str) -> Result<()> {
        let prefix = format!("{}/", src);
        let nested: Vec<String> = self
            .mounts
            .iter()
            .filter(|(path, m)| path.starts_with(&prefix) && !m.is_copied_into_output())
            .map(|(path, _)| path.clone())
            .collect();
        for mnt in nested {
            let sub_dest = format!("{}{}", dest, &mnt[src.len()..]);
            self.walk_mount(sub_dest, mnt, 0, false).await?;
        }
        Ok(())
    }

    fn walk_host_fs(
        &mut self,
        dest: String,
        src: String,
        host: PathBuf,
        max_symlinks: i32,
        include_mounts: bool,
    ) -> BoxFuture<'_, Result<()>> {
        async move {
            if include_mounts {
                self.walk_mounts_below(&dest, &src).await?;
            }
            let meta = tokio::fs::symlink_metadata(&host)
                .await
                .with_context(|| format!("lstat {:?}", src))?;
            let ft = meta.file_type();

            if ft.is_symlink() {
                if max_symlinks < 0 {
                    return Err(CrunchError::TooManySymlinks.into());
                }
                let target = tokio::fs::read_link(&host)
                    .await
                    .with_context(|| format!("readlink {:?}", src))?;
                let target = target.to_string_lossy();
                let target = if target.starts_with('/') {
                    format!("/{}", clean_path(&target))
                } else {
                    format!("/{}", clean_path(&format!("{}/{}", parent_dir(&src), target)))
                };
                return self.walk_mount(dest, target, max_symlinks - 1, true).await;
            }

            if ft.is_dir() {
                if !dest.is_empty() {
                    self.dirs.push(dest.clone());
                }
                let mut names = Vec::new();
                let mut entries = tokio::fs::read_dir(&host)
                    .await
                    .with_context(|| format!("open {:?}", src))?;
                while let Some(entry) = entries.next_entry().await? {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
                if names.is_empty() {
                    if !dest.is_empty() {
                        self.files.push(FileTodo {
                            src: PathBuf::from("/dev/null"),
                            dst: format!("{}/.keep", dest),
                            size: 0,
                        });
                    }
                    return Ok(());
                }
                names.sort();
                for name in names {
                    let child_src = format!("{}/{}", src, name);
                    if self.secret_mounts.contains_key(&child_src) {
                        continue;
                    }
                    if let Some(m) = self.mounts.get(&child_src)
                        && !m.is_copied_into_output()
                    {
                        continue;
                    }
                    let child_dest = format!("{}/{}", dest, name);
                    self.walk_host_fs(child_dest, child_src, host.join(&name), max_symlinks, false)
                        .await?;
                }
                return Ok(());
            }

            if ft.is_file() {
                self.files.push(FileTodo {
                    src: host,
                    dst: dest,
                    size: meta.len(),
                });
                return Ok(());
            }
            self.log.println(format!(
                "Skipping unsupported file type (mode {:o}) in output dir: {:?}",
                meta.mode(),
                src
            ));
            Ok(())
        }
        .boxed()
    }

    /// Host path corresponding to `rest` below the mount at `root`.
    fn host_path(&self, root: &str, rest: &str) -> Result<PathBuf> {
        let base = self.host_root(root)?;
        let rest = clean_path(rest);
        Ok(if rest.is_empty() { base } else { base.join(rest) })
    }

    fn host_root(&self, root: &str) -> Result<PathBuf> {
        if root == self.ctr_output_dir {
            return Ok(self.host_output_dir.clone());
        }
        match self.bind_mounts.get(root) {
            Some(b) => Ok(PathBuf::from(&b.host_path)),
            None => anyhow::bail!("not bind-mounted: {:?}", root),
        }
    }

    async fn manifest_for(&mut self, pdh: &str) -> Result<&Manifest> {
        if !self.manifest_cache.contains_key(pdh) {
            let raw = self
                .api
                .get("collections", pdh, json!({"select": ["manifest_text"]}))
                .await
                .with_context(|| format!("error retrieving collection record for {:?}", pdh))?;
            let text = raw["manifest_text"].as_str().unwrap_or_default().to_string();
            self.manifest_cache.insert(pdh.to_string(), Manifest::new(text));
        }
        self.manifest_cache
            .get(pdh)
            .ok_or_else(|| anyhow::anyhow!("manifest cache lost {}", pdh))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::MemorySink;
    use pkg_client::stub::{StubApi, StubKeep};
    use pkg_logging::ThrottleParams;
    use serde_json::json;
    use std::fs;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    const IN_PDH: &str = "0123456789abcdef0123456789abcdef+1";

    struct Fixture {
        api: StubApi,
        keep: Arc<StubKeep>,
        out: TempDir,
        mounts: BTreeMap<String, Mount>,
        secrets: BTreeMap<String, Mount>,
        binds: BTreeMap<String, BindMount>,
        sink: Arc<MemorySink>,
        log: Arc<ThrottledLogger>,
    }

    impl Fixture {
        fn new(mounts: serde_json::Value) -> Self {
            let out = TempDir::new().unwrap();
            let mut binds = BTreeMap::new();
            binds.insert(
                "/tmp".to_string(),
                BindMount {
                    host_path: out.path().display().to_string(),
                    read_only: false,
                },
            );
            let sink = Arc::new(MemorySink::default());
            Self {
                api: StubApi::new(),
                keep: Arc::new(StubKeep::new()),
                out,
                mounts: serde_json::from_value(mounts).unwrap(),
                secrets: BTreeMap::new(),
                binds,
                log: ThrottledLogger::new(sink.clone(), &ThrottleParams::default()),
                sink,
            }
        }

        /// Store files in the stub block store and register the collection.
        fn input_collection(&self, files: &[(&str, &[u8])]) -> Manifest {
            let m = self.keep.store_files(files);
            self.api.insert(
                "collections",
                IN_PDH,
                json!({"portable_data_hash": IN_PDH, "manifest_text": m.text()}),
            );
            m
        }

        fn write(&self, rel: &str, data: &[u8]) {
            let p = self.out.path().join(rel);
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, data).unwrap();
        }

        async fn copy(&self) -> Result<Manifest> {
            let copier = Copier::new(
                &self.api,
                self.keep.clone(),
                self.out.path().to_path_buf(),
                "/tmp",
                &self.binds,
                &self.mounts,
                &self.secrets,
                &self.log,
            );
            copier.copy().await.map(Manifest::new)
        }

        async fn log_text(&self) -> String {
            self.log.flush().await.unwrap();
            self.sink.text()
        }
    }

    fn files(m: &Manifest) -> Vec<(String, u64)> {
        m.files().unwrap()
    }

    #[tokio::test]
    async fn test_copies_host_files() {
        let fx = Fixture::new(json!({"/tmp": {"kind": "tmp"}}));
        fx.write("a.txt", b"hello\n");
        fx.write("sub/b.txt", b"world");
        fs::create_dir_all(fx.out.path().join("empty")).unwrap();

        let m = fx.copy().await.unwrap();
        assert_eq!(
            files(&m),
            vec![
                ("a.txt".to_string(), 6),
                ("empty/.keep".to_string(), 0),
                ("sub/b.txt".to_string(), 5),
            ]
        );
        assert_eq!(fx.keep.read_file(&m, "sub/b.txt").await.unwrap(), b"world");
        let log = fx.log_text().await;
        assert!(log.contains("copying \"a.txt\" (6 bytes)"), "{}", log);
    }

    #[tokio::test]
    async fn test_symlink_into_collection_splices_manifest() {
        let fx = Fixture::new(json!({
            "/tmp": {"kind": "tmp"},
            "/keep/in": {"kind": "collection", "portable_data_hash": IN_PDH},
        }));
        fx.input_collection(&[("foo.txt", b"foo data"), ("dir/bar.txt", b"bar")]);
        let blocks_before = fx.keep.block_count();
        symlink("/keep/in/foo.txt", fx.out.path().join("link.txt")).unwrap();
        symlink("../keep/in/dir", fx.out.path().join("linkdir")).unwrap();

        let m = fx.copy().await.unwrap();
        assert_eq!(
            files(&m),
            vec![("link.txt".to_string(), 8), ("linkdir/bar.txt".to_string(), 3)]
        );
        assert_eq!(fx.keep.read_file(&m, "link.txt").await.unwrap(), b"foo data");
        assert_eq!(fx.keep.block_count(), blocks_before);
    }

    #[tokio::test]
    async fn test_collection_mounted_below_output() {
        let fx = Fixture::new(json!({
            "/tmp": {"kind": "tmp"},
            "/tmp/in": {"kind": "collection", "portable_data_hash": IN_PDH, "path": "dir"},
            "/tmp/skip": {"kind": "collection", "portable_data_hash": IN_PDH, "exclude_from_output": true},
        }));
        fx.input_collection(&[("foo.txt", b"foo"), ("dir/bar.txt", b"bar")]);
        fx.write("own.txt", b"x");
        // Whatever the runtime left at a mount point is ignored.
        fs::create_dir_all(fx.out.path().join("in")).unwrap();

        let m = fx.copy().await.unwrap();
        assert_eq!(
            files(&m),
            vec![("in/bar.txt".to_string(), 3), ("own.txt".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn test_symlink_cycle() {
        let fx = Fixture::new(json!({"/tmp": {"kind": "tmp"}}));
        symlink("b", fx.out.path().join("a")).unwrap();
        symlink("a", fx.out.path().join("b")).unwrap();
        let err = fx.copy().await.unwrap_err();
        assert_eq!(CrunchError::of(&err), Some(&CrunchError::TooManySymlinks));
        assert!(err.to_string().starts_with("error scanning files to copy to output"));
    }

    #[tokio::test]
    async fn test_symlink_outside_mounts() {
        let fx = Fixture::new(json!({"/tmp": {"kind": "tmp"}}));
        symlink("/etc/passwd", fx.out.path().join("pw")).unwrap();
        let err = fx.copy().await.unwrap_err();
        assert_eq!(
            CrunchError::of(&err),
            Some(&CrunchError::UnmappedPath("/etc/passwd".to_string()))
        );
    }

    #[tokio::test]
    async fn test_symlink_to_literal_mount_rejected() {
        let fx = Fixture::new(json!({
            "/tmp": {"kind": "tmp"},
            "/etc/motd": {"kind": "text", "content": "hi"},
        }));
        symlink("/etc/motd", fx.out.path().join("motd")).unwrap();
        let err = fx.copy().await.unwrap_err();
        assert!(
            format!("{:#}", err).contains("unsupported mount \"/etc/motd\" in output (kind is \"text\")"),
            "{:#}",
            err
        );
    }

    #[tokio::test]
    async fn test_secrets_and_literals() {
        let mut fx = Fixture::new(json!({
            "/tmp": {"kind": "tmp"},
            "/tmp/params.json": {"kind": "json", "content": {"a": 1}},
        }));
        fx.secrets = serde_json::from_value(json!({"/tmp/secret.txt": {"kind": "text", "content": "pw"}})).unwrap();
        fx.write("params.json", br#"{"a":1}"#);
        fx.write("secret.txt", b"pw");
        symlink("/tmp/secret.txt", fx.out.path().join("to-secret")).unwrap();

        let m = fx.copy().await.unwrap();
        assert_eq!(files(&m), vec![("params.json".to_string(), 7)]);
    }

    #[tokio::test]
    async fn test_writable_collection_output() {
        let mut fx = Fixture::new(json!({"/out": {"kind": "collection", "writable": true}}));
        fx.binds.clear();
        let existing = fx.keep.store_files(&[("kept.txt", b"kept")]);
        fs::write(
            fx.out.path().join(COLLECTION_MARKER),
            serde_json::to_vec(&json!({"manifest_text": existing.text()})).unwrap(),
        )
        .unwrap();
        let copier = Copier::new(
            &fx.api,
            fx.keep.clone(),
            fx.out.path().to_path_buf(),
            "/out",
            &fx.binds,
            &fx.mounts,
            &fx.secrets,
            &fx.log,
        );
        let m = Manifest::new(copier.copy().await.unwrap());
        assert_eq!(files(&m), vec![("kept.txt".to_string(), 4)]);
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("/a/b/c.txt"), "/a/b");
        assert_eq!(parent_dir("/c.txt"), "");
    }
}
