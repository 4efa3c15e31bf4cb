//! Directory tree indexing and copying.
//!
//! A [`TreeIndex`] is a content manifest of a directory: every entry keyed by
//! its relative path, files carrying a SHA-256 digest. Snapshots, copy-out
//! trees and the host workspace are all compared through this one view.

use crate::error::{ShadowError, ShadowResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// File-name patterns excluded from snapshots, copies and diffs.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    patterns: Vec<glob::Pattern>,
}

impl IgnoreRules {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> ShadowResult<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p.as_ref()).map_err(|e| {
                    ShadowError::Config(format!("bad ignore pattern '{}': {}", p.as_ref(), e))
                })
            })
            .collect::<ShadowResult<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Rules that ignore nothing.
    pub fn none() -> Self {
        Self::default()
    }

    /// True if the file name matches any pattern.
    pub fn matches_name(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }

    /// True if any component of the relative path is ignored.
    pub fn matches_path(&self, relative: &Path) -> bool {
        relative
            .components()
            .any(|c| self.matches_name(&c.as_os_str().to_string_lossy()))
    }

    fn skips(&self, entry: &DirEntry) -> bool {
        entry.depth() > 0 && self.matches_name(&entry.file_name().to_string_lossy())
    }
}

/// What kind of filesystem object an entry is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum EntryKind {
    File,
    Dir,
    Symlink { target: PathBuf },
    Special { kind: String },
}

impl EntryKind {
    pub fn label(&self) -> &str {
        match self {
            EntryKind::File => "file",
            EntryKind::Dir => "dir",
            EntryKind::Symlink { .. } => "symlink",
            EntryKind::Special { kind } => kind,
        }
    }
}

/// One indexed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    /// SHA-256 hex digest, files only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl TreeEntry {
    /// Content equality: type, link target and file digest. Mode and
    /// timestamps are not content.
    pub fn same_content(&self, other: &TreeEntry) -> bool {
        match (&self.kind, &other.kind) {
            (EntryKind::File, EntryKind::File) => {
                self.size == other.size && self.hash == other.hash
            }
            (a, b) => a == b,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}

/// Content manifest of a directory tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeIndex {
    entries: BTreeMap<PathBuf, TreeEntry>,
}

impl TreeIndex {
    /// Walk `root` without following symlinks and index every entry not
    /// excluded by `ignore`.
    pub fn scan(root: &Path, ignore: &IgnoreRules) -> ShadowResult<Self> {
        if !root.is_dir() {
            return Err(ShadowError::snapshot(root, "not a readable directory"));
        }

        let mut entries = BTreeMap::new();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !ignore.skips(e));

        for entry in walker {
            let entry = entry?;
            let relative = relative_path(root, entry.path())?;
            let indexed = index_entry(&entry)?;
            entries.insert(relative, indexed);
        }

        Ok(Self { entries })
    }

    pub fn get(&self, path: &Path) -> Option<&TreeEntry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in component-wise lexicographic order; parents precede children.
    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &TreeEntry)> {
        self.entries.iter()
    }
}

/// Counts from [`copy_tree`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files: usize,
    pub dirs: usize,
    pub symlinks: usize,
    pub skipped: usize,
    pub bytes: u64,
}

/// Recursively copy `src` into `dst` (created if absent). Symlinks are
/// recreated as links; special files are skipped.
pub fn copy_tree(src: &Path, dst: &Path, ignore: &IgnoreRules) -> ShadowResult<CopyStats> {
    if !src.is_dir() {
        return Err(ShadowError::snapshot(src, "source is not a readable directory"));
    }
    fs::create_dir_all(dst)?;

    let mut stats = CopyStats::default();
    let walker = WalkDir::new(src)
        .follow_links(false)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !ignore.skips(e));

    for entry in walker {
        let entry = entry?;
        let relative = relative_path(src, entry.path())?;
        let target = dst.join(&relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            stats.dirs += 1;
        } else if file_type.is_file() {
            stats.bytes += fs::copy(entry.path(), &target)?;
            stats.files += 1;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            make_symlink(&link, &target)?;
            stats.symlinks += 1;
        } else {
            tracing::warn!(path = ?relative, "skipping special file");
            stats.skipped += 1;
        }
    }

    Ok(stats)
}

/// Remove everything inside `dir`, leaving `dir` itself in place.
pub fn clear_dir(dir: &Path) -> ShadowResult<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let meta = fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// SHA-256 hex digest of a file, streamed.
pub fn hash_file(path: &Path) -> ShadowResult<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn relative_path(root: &Path, path: &Path) -> ShadowResult<PathBuf> {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .map_err(|_| ShadowError::snapshot(path, "entry escaped its root"))
}

fn index_entry(entry: &DirEntry) -> ShadowResult<TreeEntry> {
    let meta = fs::symlink_metadata(entry.path())?;
    let file_type = meta.file_type();
    let mode = file_mode(&meta);

    let indexed = if file_type.is_symlink() {
        TreeEntry {
            kind: EntryKind::Symlink {
                target: fs::read_link(entry.path())?,
            },
            size: 0,
            mode,
            hash: None,
        }
    } else if file_type.is_dir() {
        TreeEntry {
            kind: EntryKind::Dir,
            size: 0,
            mode,
            hash: None,
        }
    } else if file_type.is_file() {
        TreeEntry {
            kind: EntryKind::File,
            size: meta.len(),
            mode,
            hash: Some(hash_file(entry.path())?),
        }
    } else {
        TreeEntry {
            kind: EntryKind::Special {
                kind: special_kind(&file_type).to_string(),
            },
            size: 0,
            mode,
            hash: None,
        }
    };
    Ok(indexed)
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
fn special_kind(file_type: &fs::FileType) -> &'static str {
    use std::os::unix::fs::FileTypeExt;
    if file_type.is_fifo() {
        "fifo"
    } else if file_type.is_socket() {
        "socket"
    } else if file_type.is_block_device() {
        "block-device"
    } else if file_type.is_char_device() {
        "char-device"
    } else {
        "unknown"
    }
}

#[cfg(not(unix))]
fn special_kind(_file_type: &fs::FileType) -> &'static str {
    "unknown"
}

#[cfg(unix)]
pub(crate) fn make_symlink(link: &Path, at: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(link, at)
}

#[cfg(windows)]
pub(crate) fn make_symlink(link: &Path, at: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(link, at)
}
