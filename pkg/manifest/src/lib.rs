//! Collection manifest codec.
//!
//! A manifest is a newline-terminated list of streams, each stream being a
//! name, one or more block locators and one or more `pos:len:name` file
//! tokens. Parsing is lazy over the retained text; normalization and
//! extraction rebuild a per-file view and re-emit canonical text without
//! touching block data.

pub mod escape;
pub mod locator;
pub mod stream;

use md5::{Digest, Md5};
use pkg_constants::keep::EMPTY_BLOCK_LOCATOR;
use std::collections::{BTreeMap, HashMap};

pub use escape::{escape_name, unescape_name};
pub use locator::{BlockLocator, has_remote_blocks, is_locator};
pub use stream::{FileSegment, Stream, StreamSegment, Streams};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("Invalid stream name: {0}")]
    InvalidStreamName(String),
    #[error("No block locators found")]
    NoBlockLocators,
    #[error("No file tokens found")]
    NoFileTokens,
    #[error("Invalid file token: {0}")]
    InvalidFileToken(String),
    #[error("File segment {pos}:{len}:{name} extends past end of stream {size}")]
    SegmentPastEnd {
        pos: u64,
        len: u64,
        name: String,
        size: u64,
    },
    #[error("Invalid block locator: {0}")]
    InvalidLocator(String),
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// dir -> file name -> block segments, in manifest order.
type FileTree = BTreeMap<String, BTreeMap<String, Vec<FileSegment>>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    text: String,
}

impl Manifest {
    /// Wrap text without validating it; errors surface when streams are read.
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Wrap text, validating every stream.
    pub fn parse(text: impl Into<String>) -> Result<Self> {
        let m = Self::new(text);
        for s in m.streams() {
            s?;
        }
        Ok(m)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    pub fn streams(&self) -> Streams<'_> {
        Streams::new(&self.text)
    }

    /// Canonical form: one stream per directory, sorted; each block listed once
    /// per stream; adjacent segments coalesced.
    pub fn normalize(&self) -> Result<Manifest> {
        Ok(Manifest::new(render(&self.file_tree()?)))
    }

    /// New normalized manifest holding only what is at or below `src`, renamed
    /// to `dst`. A file keeps its name when `dst` ends in `/` or is the root.
    pub fn extract(&self, src: &str, dst: &str) -> Result<Manifest> {
        let src = clean_path(src);
        let dst_is_dir = dst.ends_with('/') || clean_path(dst).is_empty();
        let dst = clean_path(dst);

        let mut out = FileTree::new();
        for (dir, files) in self.file_tree()? {
            for (base, segs) in files {
                let full = join_path(&dir, &base);
                let target = if src.is_empty() {
                    Some(join_path(&dst, &full))
                } else if let Some(rest) = full.strip_prefix(&src).and_then(|r| r.strip_prefix('/')) {
                    Some(join_path(&dst, rest))
                } else if full == src {
                    Some(if dst_is_dir {
                        join_path(&dst, &base)
                    } else {
                        dst.clone()
                    })
                } else {
                    None
                };
                if let Some(target) = target {
                    let (d, b) = split_path(&target);
                    out.entry(d).or_default().entry(b).or_default().extend(segs);
                }
            }
        }
        Ok(Manifest::new(render(&out)))
    }

    /// Block segments holding the bytes of the file at `path`.
    pub fn file_segments(&self, path: &str) -> Result<Vec<FileSegment>> {
        let want = clean_path(path);
        let mut segs = Vec::new();
        for stream in self.streams() {
            let stream = stream?;
            let dir = clean_path(&stream.name);
            for file in &stream.files {
                let (d, b) = split_file_token(&dir, &file.name);
                if join_path(&d, &b) == want {
                    segs.extend(stream.block_segments(file));
                }
            }
        }
        Ok(segs)
    }

    /// Build a normalized manifest from per-file block segments. Paths are
    /// relative (`dir/name`); a base name of `.` marks an empty directory.
    pub fn from_files<I>(files: I) -> Manifest
    where
        I: IntoIterator<Item = (String, Vec<FileSegment>)>,
    {
        let mut tree = FileTree::new();
        for (path, segs) in files {
            let (d, b) = split_path(&clean_keep_dot(&path));
            tree.entry(d).or_default().entry(b).or_default().extend(segs);
        }
        Manifest::new(render(&tree))
    }

    /// Every file with its block segments, in path order.
    pub fn file_entries(&self) -> Result<Vec<(String, Vec<FileSegment>)>> {
        let mut out = Vec::new();
        for (dir, files) in self.file_tree()? {
            for (base, segs) in files {
                out.push((join_path(&dir, &base), segs));
            }
        }
        Ok(out)
    }

    /// Paths and sizes of every file, sorted by path.
    pub fn files(&self) -> Result<Vec<(String, u64)>> {
        let mut out = Vec::new();
        for (dir, files) in self.file_tree()? {
            for (base, segs) in files {
                out.push((join_path(&dir, &base), segs.iter().map(|s| s.len).sum()));
            }
        }
        out.sort();
        Ok(out)
    }

    /// Distinct locators in order of first appearance.
    pub fn locators(&self) -> Result<Vec<String>> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for stream in self.streams() {
            for b in stream?.blocks {
                if seen.insert(b.clone()) {
                    out.push(b);
                }
            }
        }
        Ok(out)
    }

    /// Replace every locator token using `f`; everything else is kept verbatim.
    pub fn map_locators<F>(&self, mut f: F) -> Manifest
    where
        F: FnMut(&str) -> String,
    {
        let mut out = String::with_capacity(self.text.len());
        for line in self.text.split('\n').filter(|l| !l.is_empty()) {
            let mapped: Vec<String> = line
                .split(' ')
                .enumerate()
                .map(|(i, tok)| {
                    if i > 0 && is_locator(tok) {
                        f(tok)
                    } else {
                        tok.to_string()
                    }
                })
                .collect();
            out.push_str(&mapped.join(" "));
            out.push('\n');
        }
        Manifest::new(out)
    }

    /// Text with every hint except the size removed from every locator.
    pub fn stripped_text(&self) -> String {
        self.map_locators(|tok| tok.split('+').take(2).collect::<Vec<_>>().join("+"))
            .into_text()
    }

    /// Content address of this manifest: `md5(stripped text)+len`.
    pub fn portable_data_hash(&self) -> String {
        let stripped = self.stripped_text();
        let digest = Md5::digest(stripped.as_bytes());
        format!("{}+{}", hex::encode(digest), stripped.len())
    }

    fn file_tree(&self) -> Result<FileTree> {
        let mut tree = FileTree::new();
        for stream in self.streams() {
            let stream = stream?;
            let dir = clean_path(&stream.name);
            for file in &stream.files {
                let (d, b) = split_file_token(&dir, &file.name);
                tree.entry(d)
                    .or_default()
                    .entry(b)
                    .or_default()
                    .extend(stream.block_segments(file));
            }
        }
        Ok(tree)
    }
}

impl std::fmt::Display for Manifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

fn render(tree: &FileTree) -> String {
    let mut out = String::new();
    for (dir, files) in tree {
        let mut blocks: Vec<&str> = Vec::new();
        let mut block_start: HashMap<&str, u64> = HashMap::new();
        let mut offset = 0u64;
        for segs in files.values() {
            for s in segs {
                if !block_start.contains_key(s.locator.as_str()) {
                    block_start.insert(s.locator.as_str(), offset);
                    offset = offset.saturating_add(locator::locator_size(&s.locator).unwrap_or(0));
                    blocks.push(s.locator.as_str());
                }
            }
        }
        if blocks.is_empty() {
            blocks.push(EMPTY_BLOCK_LOCATOR);
        }

        out.push_str(&stream_name(dir));
        for b in &blocks {
            out.push(' ');
            out.push_str(b);
        }
        for (name, segs) in files {
            let mut ranges: Vec<(u64, u64)> = Vec::new();
            for s in segs {
                let pos = block_start
                    .get(s.locator.as_str())
                    .copied()
                    .unwrap_or(0)
                    .saturating_add(s.offset);
                if let Some(last) = ranges.last_mut()
                    && last.0.checked_add(last.1) == Some(pos)
                {
                    last.1 = last.1.saturating_add(s.len);
                } else {
                    ranges.push((pos, s.len));
                }
            }
            if ranges.is_empty() {
                ranges.push((0, 0));
            }
            let escaped = escape_name(name);
            for (pos, len) in ranges {
                out.push_str(&format!(" {}:{}:{}", pos, len, escaped));
            }
        }
        out.push('\n');
    }
    out
}

fn stream_name(dir: &str) -> String {
    if dir.is_empty() {
        ".".to_string()
    } else {
        let escaped: Vec<String> = dir.split('/').map(escape_name).collect();
        format!("./{}", escaped.join("/"))
    }
}

/// Normalize a path to `a/b/c` form: no leading `./` or `/`, `.` and empty
/// components dropped, `..` applied. The root is the empty string.
pub fn clean_path(p: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for c in p.split('/') {
        match c {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            c => parts.push(c),
        }
    }
    parts.join("/")
}

fn clean_keep_dot(p: &str) -> String {
    match p.rsplit_once('/') {
        Some((d, ".")) => join_path(&clean_path(d), "."),
        _ => clean_path(p),
    }
}

fn join_path(dir: &str, name: &str) -> String {
    match (dir.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (_, true) => dir.to_string(),
        _ => format!("{}/{}", dir, name),
    }
}

fn split_path(p: &str) -> (String, String) {
    match p.rsplit_once('/') {
        Some((d, b)) => (d.to_string(), b.to_string()),
        None => (String::new(), p.to_string()),
    }
}

/// Directory and base name of a file token that may itself contain `/`.
/// A base name of `.` is an empty-directory placeholder and is kept.
fn split_file_token(stream_dir: &str, name: &str) -> (String, String) {
    let (sub, base) = match name.rsplit_once('/') {
        Some((d, b)) => (d, b),
        None => ("", name),
    };
    (clean_path(&join_path(stream_dir, sub)), base.to_string())
}
