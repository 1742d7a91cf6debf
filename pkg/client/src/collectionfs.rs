use anyhow::Result;
use pkg_constants::keep::BLOCK_SIZE;
use pkg_manifest::{FileSegment, Manifest, clean_path};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::keep::KeepClient;

pub type SharedCollectionFs = Arc<tokio::sync::Mutex<CollectionFs>>;

#[derive(Debug, Clone)]
enum SegRef {
    /// Already in the block store
    Stored(FileSegment),
    /// In a block buffered by this file system
    Local { block: u64, offset: u64, len: u64 },
}

/// Write-as-you-go collection: files are appended into shared in-memory
/// blocks which are uploaded as they fill (partial flush) or on demand (full
/// flush), and the result is marshalled as manifest text.
pub struct CollectionFs {
    keep: Arc<dyn KeepClient>,
    files: BTreeMap<String, Vec<SegRef>>,
    dirs: BTreeSet<String>,
    open_id: u64,
    open: Vec<u8>,
    sealed: BTreeMap<u64, Vec<u8>>,
    stored: HashMap<u64, String>,
    next_id: u64,
    size: u64,
}

impl CollectionFs {
    pub fn new(keep: Arc<dyn KeepClient>) -> Self {
        Self {
            keep,
            files: BTreeMap::new(),
            dirs: BTreeSet::new(),
            open_id: 0,
            open: Vec::new(),
            sealed: BTreeMap::new(),
            stored: HashMap::new(),
            next_id: 1,
            size: 0,
        }
    }

    /// Load existing content; data blocks are referenced, not copied.
    pub fn from_manifest(keep: Arc<dyn KeepClient>, manifest: &Manifest) -> Result<Self> {
        let mut fs = Self::new(keep);
        for (path, segs) in manifest.file_entries()? {
            if let Some(dir) = path.strip_suffix("/.") {
                fs.mkdir_all(dir)?;
                continue;
            }
            if path == "." {
                continue;
            }
            fs.size += segs.iter().map(|s| s.len).sum::<u64>();
            let file = fs.ensure_file(&path)?;
            file.extend(segs.into_iter().map(SegRef::Stored));
        }
        Ok(fs)
    }

    pub fn shared(self) -> SharedCollectionFs {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    /// Create a directory and its parents.
    pub fn mkdir_all(&mut self, path: &str) -> Result<()> {
        let path = clean_path(path);
        let mut cur = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if !cur.is_empty() {
                cur.push('/');
            }
            cur.push_str(part);
            if self.files.contains_key(&cur) {
                anyhow::bail!("mkdir {}: {} is a file", path, cur);
            }
            self.dirs.insert(cur.clone());
        }
        Ok(())
    }

    /// Create an empty file if it does not exist yet.
    pub fn create(&mut self, path: &str) -> Result<()> {
        self.ensure_file(path).map(|_| ())
    }

    pub fn exists(&self, path: &str) -> bool {
        let path = clean_path(path);
        self.files.contains_key(&path) || self.dirs.contains(&path)
    }

    /// Append bytes to a file, creating it (and its parents) if needed.
    pub fn append(&mut self, path: &str, mut data: &[u8]) -> Result<()> {
        let path = clean_path(path);
        self.ensure_file(&path)?;
        self.size += data.len() as u64;
        while !data.is_empty() {
            let room = BLOCK_SIZE - self.open.len();
            let n = room.min(data.len());
            let offset = self.open.len() as u64;
            self.open.extend_from_slice(&data[..n]);
            let block = self.open_id;
            let segs = self.files.entry(path.clone()).or_default();
            match segs.last_mut() {
                Some(SegRef::Local {
                    block: b,
                    offset: o,
                    len,
                }) if *b == block && *o + *len == offset => *len += n as u64,
                _ => segs.push(SegRef::Local {
                    block,
                    offset,
                    len: n as u64,
                }),
            }
            data = &data[n..];
            if self.open.len() >= BLOCK_SIZE {
                self.seal_open();
            }
        }
        Ok(())
    }

    /// Bytes written but not yet uploaded.
    pub fn unflushed(&self) -> usize {
        self.open.len() + self.sealed.values().map(Vec::len).sum::<usize>()
    }

    /// Total size of all files.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Upload full blocks; with `partial == false` also upload the short
    /// block currently being filled.
    pub async fn flush(&mut self, partial: bool) -> Result<()> {
        if !partial && !self.open.is_empty() {
            self.seal_open();
        }
        while let Some(id) = self.sealed.keys().next().copied() {
            let Some(buf) = self.sealed.remove(&id) else {
                break;
            };
            match self.keep.put_block(&buf).await {
                Ok(locator) => {
                    self.stored.insert(id, locator);
                }
                Err(e) => {
                    self.sealed.insert(id, buf);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Flush everything and return normalized manifest text.
    pub async fn marshal_manifest(&mut self) -> Result<String> {
        self.flush(false).await?;
        let mut entries: Vec<(String, Vec<FileSegment>)> = Vec::new();
        for (path, segs) in &self.files {
            let mut resolved = Vec::with_capacity(segs.len());
            for s in segs {
                resolved.push(match s {
                    SegRef::Stored(seg) => seg.clone(),
                    SegRef::Local { block, offset, len } => FileSegment {
                        locator: self
                            .stored
                            .get(block)
                            .cloned()
                            .ok_or_else(|| anyhow::anyhow!("block {} of {} not flushed", block, path))?,
                        offset: *offset,
                        len: *len,
                    },
                });
            }
            entries.push((path.clone(), resolved));
        }
        for dir in &self.dirs {
            let prefix = format!("{}/", dir);
            let has_children = self.files.keys().any(|f| f.starts_with(&prefix))
                || self.dirs.iter().any(|d| d.starts_with(&prefix));
            if !has_children {
                entries.push((format!("{}/.", dir), Vec::new()));
            }
        }
        Ok(Manifest::from_files(entries).into_text())
    }

    /// Rewrite remote-cluster locators into local ones. Returns how many
    /// distinct blocks were localized.
    pub async fn localize_remote_blocks(&mut self) -> Result<usize> {
        let mut remote: BTreeSet<String> = BTreeSet::new();
        for segs in self.files.values() {
            for s in segs {
                if let SegRef::Stored(seg) = s
                    && pkg_manifest::BlockLocator::parse(&seg.locator)
                        .map(|l| l.remote_hint().is_some())
                        .unwrap_or(false)
                {
                    remote.insert(seg.locator.clone());
                }
            }
        }
        let mut mapped = HashMap::new();
        for loc in &remote {
            mapped.insert(loc.clone(), self.keep.local_locator(loc).await?);
        }
        for segs in self.files.values_mut() {
            for s in segs.iter_mut() {
                if let SegRef::Stored(seg) = s
                    && let Some(local) = mapped.get(&seg.locator)
                {
                    seg.locator = local.clone();
                }
            }
        }
        Ok(remote.len())
    }

    fn ensure_file(&mut self, path: &str) -> Result<&mut Vec<SegRef>> {
        let path = clean_path(path);
        if path.is_empty() || self.dirs.contains(&path) {
            anyhow::bail!("{:?} is a directory", path);
        }
        if let Some((dir, _)) = path.rsplit_once('/') {
            self.mkdir_all(dir)?;
        }
        Ok(self.files.entry(path).or_default())
    }

    fn seal_open(&mut self) {
        let buf = std::mem::take(&mut self.open);
        self.sealed.insert(self.open_id, buf);
        self.open_id = self.next_id;
        self.next_id += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubKeep;

    #[tokio::test]
    async fn test_small_files_share_a_block() {
        let keep = Arc::new(StubKeep::new());
        let mut fs = CollectionFs::new(keep.clone());
        fs.append("a.txt", b"foo").unwrap();
        fs.append("dir/b.txt", b"bar").unwrap();
        fs.create("dir/empty").unwrap();
        assert_eq!(fs.unflushed(), 6);
        let text = fs.marshal_manifest().await.unwrap();
        assert_eq!(
            text,
            ". 3858f62230ac3c915f300c664312c63f+6 0:3:a.txt\n./dir 3858f62230ac3c915f300c664312c63f+6 3:3:b.txt 0:0:empty\n"
        );
        assert_eq!(fs.unflushed(), 0);
        assert_eq!(fs.size(), 6);
        assert_eq!(keep.block_count(), 1);
    }

    #[tokio::test]
    async fn test_partial_flush_keeps_short_block() {
        let keep = Arc::new(StubKeep::new());
        let mut fs = CollectionFs::new(keep.clone());
        fs.append("x", b"hello").unwrap();
        fs.flush(true).await.unwrap();
        assert_eq!(keep.block_count(), 0);
        assert_eq!(fs.unflushed(), 5);
        fs.flush(false).await.unwrap();
        assert_eq!(keep.block_count(), 1);
    }

    #[tokio::test]
    async fn test_from_manifest_then_append() {
        let keep = Arc::new(StubKeep::new());
        let loc = keep.put_block(b"foo").await.unwrap();
        let m = Manifest::new(format!("./in {} 0:3:foo\n", loc));
        let mut fs = CollectionFs::from_manifest(keep.clone(), &m).unwrap();
        fs.mkdir_all("out/empty").unwrap();
        fs.append("out/new", b"bar").unwrap();
        let text = fs.marshal_manifest().await.unwrap();
        assert_eq!(
            text,
            format!(
                "./in {} 0:3:foo\n./out 37b51d194a7513e45b56f6524f2d51f2+3 0:3:new\n./out/empty d41d8cd98f00b204e9800998ecf8427e+0 0:0:\\056\n",
                loc
            )
        );
    }

    #[tokio::test]
    async fn test_file_and_directory_conflict() {
        let keep = Arc::new(StubKeep::new());
        let mut fs = CollectionFs::new(keep);
        fs.append("a", b"x").unwrap();
        assert!(fs.mkdir_all("a/b").is_err());
        fs.mkdir_all("d").unwrap();
        assert!(fs.append("d", b"x").is_err());
        assert!(fs.exists("d"));
        assert!(fs.exists("./a"));
    }

    #[tokio::test]
    async fn test_localize_remote_blocks() {
        let keep = Arc::new(StubKeep::new());
        let loc = keep.put_block(b"foo").await.unwrap();
        let m = Manifest::new(format!(". {}+Rzzzzz-0123abcd@53bed294 0:3:foo\n", loc));
        let mut fs = CollectionFs::from_manifest(keep.clone(), &m).unwrap();
        assert_eq!(fs.localize_remote_blocks().await.unwrap(), 1);
        assert_eq!(
            fs.marshal_manifest().await.unwrap(),
            format!(". {} 0:3:foo\n", loc)
        );
    }
}
