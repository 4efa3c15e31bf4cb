use crate::error::ShadowResult;
use crate::tree_index::{EntryKind, IgnoreRules, TreeEntry, TreeIndex};
use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};
use std::fmt;
use std::path::{Path, PathBuf};

/// How a path differs between snapshot and current tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl ChangeKind {
    pub fn marker(&self) -> char {
        match self {
            ChangeKind::Added => 'A',
            ChangeKind::Modified => 'M',
            ChangeKind::Deleted => 'D',
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        };
        f.write_str(label)
    }
}

/// One path that differs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub path: PathBuf,
    pub kind: ChangeKind,
    /// Entry in the snapshot, absent for additions
    pub before: Option<TreeEntry>,
    /// Entry in the current tree, absent for deletions
    pub after: Option<TreeEntry>,
}

impl ChangeRecord {
    pub fn added(path: impl Into<PathBuf>, after: TreeEntry) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Added,
            before: None,
            after: Some(after),
        }
    }

    pub fn modified(path: impl Into<PathBuf>, before: TreeEntry, after: TreeEntry) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Modified,
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn deleted(path: impl Into<PathBuf>, before: TreeEntry) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Deleted,
            before: Some(before),
            after: None,
        }
    }

    /// Format the record as a single listing line
    pub fn format(&self) -> String {
        let suffix = match (&self.before, &self.after) {
            (Some(b), Some(a)) if b.kind != a.kind => {
                format!(" ({} -> {})", b.kind.label(), a.kind.label())
            }
            (_, Some(e)) | (Some(e), None) if e.is_dir() => "/".to_string(),
            _ => String::new(),
        };
        format!("{}  {}{}", self.kind.marker(), self.path.display(), suffix)
    }
}

/// Ordered set of changes between two trees
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    pub records: Vec<ChangeRecord>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.records.iter()
    }

    pub fn summary(&self) -> DiffSummary {
        let mut summary = DiffSummary::default();
        for record in &self.records {
            match record.kind {
                ChangeKind::Added => summary.added += 1,
                ChangeKind::Modified => summary.modified += 1,
                ChangeKind::Deleted => summary.deleted += 1,
            }
        }
        summary
    }

    /// Stable listing, one line per record
    pub fn render(&self) -> String {
        if self.records.is_empty() {
            return "No changes detected.".to_string();
        }
        let mut output = String::new();
        for record in &self.records {
            output.push_str(&record.format());
            output.push('\n');
        }
        output
    }
}

/// Summary of diff statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
}

impl DiffSummary {
    pub fn has_changes(&self) -> bool {
        self.added > 0 || self.modified > 0 || self.deleted > 0
    }

    pub fn total(&self) -> usize {
        self.added + self.modified + self.deleted
    }

    pub fn format(&self) -> String {
        format!(
            "{} added, {} modified, {} deleted",
            self.added, self.modified, self.deleted
        )
    }
}

/// Represents a line in a content diff
#[derive(Debug, Clone)]
pub struct DiffChange {
    pub line_number: usize,
    pub content: String,
    pub change_type: DiffChangeType,
}

/// Type of diff change
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DiffChangeType {
    Equal,
    Insert,
    Delete,
}

/// A unified diff representation
#[derive(Debug, Clone)]
pub struct UnifiedDiff {
    pub old_path: PathBuf,
    pub new_path: PathBuf,
    pub hunks: Vec<DiffHunk>,
}

/// A diff hunk (group of changes)
#[derive(Debug, Clone)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_lines: usize,
    pub new_start: usize,
    pub new_lines: usize,
    pub changes: Vec<DiffChange>,
}

/// Diff engine comparing a snapshot tree with a current tree
#[derive(Debug, Clone, Default)]
pub struct DiffEngine {
    ignore: IgnoreRules,
}

impl DiffEngine {
    pub fn new(ignore: IgnoreRules) -> Self {
        Self { ignore }
    }

    /// Compare two directory trees on disk. Neither tree is modified.
    pub fn compare(&self, snapshot_root: &Path, current_root: &Path) -> ShadowResult<DiffResult> {
        let before = TreeIndex::scan(snapshot_root, &self.ignore)?;
        let after = TreeIndex::scan(current_root, &self.ignore)?;
        let diff = Self::compare_indexes(&before, &after);
        tracing::debug!(
            changes = diff.len(),
            snapshot = ?snapshot_root,
            current = ?current_root,
            "compared trees"
        );
        Ok(diff)
    }

    /// Lock-step merge of two indexes. Output follows index order.
    pub fn compare_indexes(before: &TreeIndex, after: &TreeIndex) -> DiffResult {
        let mut records = Vec::new();
        let mut old = before.iter().peekable();
        let mut new = after.iter().peekable();

        loop {
            match (old.peek().copied(), new.peek().copied()) {
                (Some((op, oe)), Some((np, ne))) => {
                    if op < np {
                        records.push(ChangeRecord::deleted(op, oe.clone()));
                        old.next();
                    } else if np < op {
                        records.push(ChangeRecord::added(np, ne.clone()));
                        new.next();
                    } else {
                        if !oe.same_content(ne) {
                            records.push(ChangeRecord::modified(op, oe.clone(), ne.clone()));
                        }
                        old.next();
                        new.next();
                    }
                }
                (Some((op, oe)), None) => {
                    records.push(ChangeRecord::deleted(op, oe.clone()));
                    old.next();
                }
                (None, Some((np, ne))) => {
                    records.push(ChangeRecord::added(np, ne.clone()));
                    new.next();
                }
                (None, None) => break,
            }
        }

        DiffResult { records }
    }

    /// Render a unified content diff for one record. Non-file entries and
    /// binary content get a one-line description instead.
    pub fn content_diff(
        record: &ChangeRecord,
        snapshot_root: &Path,
        current_root: &Path,
    ) -> ShadowResult<String> {
        let is_file = |e: &Option<TreeEntry>| matches!(e, Some(t) if t.kind == EntryKind::File);
        let old_is_file = is_file(&record.before);
        let new_is_file = is_file(&record.after);
        if !old_is_file && !new_is_file {
            return Ok(format!("{}\n", record.format()));
        }

        let old_bytes = if old_is_file {
            std::fs::read(snapshot_root.join(&record.path))?
        } else {
            Vec::new()
        };
        let new_bytes = if new_is_file {
            std::fs::read(current_root.join(&record.path))?
        } else {
            Vec::new()
        };

        match (std::str::from_utf8(&old_bytes), std::str::from_utf8(&new_bytes)) {
            (Ok(old), Ok(new)) => {
                let diff = Self::unified_diff(old, new, &record.path, &record.path);
                Ok(Self::format_unified_diff(&diff))
            }
            _ => Ok(format!("Binary files a/{0} and b/{0} differ\n", record.path.display())),
        }
    }

    /// Compute a unified diff between two strings
    pub fn unified_diff(old: &str, new: &str, old_path: &Path, new_path: &Path) -> UnifiedDiff {
        let diff = TextDiff::from_lines(old, new);
        let mut hunks = Vec::new();
        let mut current_hunk: Option<DiffHunk> = None;
        let mut old_line = 0;
        let mut new_line = 0;

        for change in diff.iter_all_changes() {
            match change.tag() {
                ChangeTag::Delete => {
                    let hunk = current_hunk.get_or_insert_with(|| DiffHunk {
                        old_start: old_line + 1,
                        old_lines: 0,
                        new_start: new_line + 1,
                        new_lines: 0,
                        changes: Vec::new(),
                    });
                    hunk.old_lines += 1;
                    hunk.changes.push(DiffChange {
                        line_number: old_line,
                        content: change.to_string(),
                        change_type: DiffChangeType::Delete,
                    });
                    old_line += 1;
                }
                ChangeTag::Insert => {
                    let hunk = current_hunk.get_or_insert_with(|| DiffHunk {
                        old_start: old_line + 1,
                        old_lines: 0,
                        new_start: new_line + 1,
                        new_lines: 0,
                        changes: Vec::new(),
                    });
                    hunk.new_lines += 1;
                    hunk.changes.push(DiffChange {
                        line_number: new_line,
                        content: change.to_string(),
                        change_type: DiffChangeType::Insert,
                    });
                    new_line += 1;
                }
                ChangeTag::Equal => {
                    if let Some(hunk) = current_hunk.take() {
                        hunks.push(hunk);
                    }
                    old_line += 1;
                    new_line += 1;
                }
            }
        }

        if let Some(hunk) = current_hunk {
            hunks.push(hunk);
        }

        UnifiedDiff {
            old_path: old_path.to_path_buf(),
            new_path: new_path.to_path_buf(),
            hunks,
        }
    }

    /// Format a unified diff for display
    pub fn format_unified_diff(diff: &UnifiedDiff) -> String {
        let mut output = String::new();

        output.push_str(&format!(
            "--- a/{}\n+++ b/{}\n",
            diff.old_path.display(),
            diff.new_path.display()
        ));

        for hunk in &diff.hunks {
            output.push_str(&format!(
                "@@ -{},{} +{},{} @@\n",
                hunk.old_start, hunk.old_lines, hunk.new_start, hunk.new_lines
            ));

            for change in &hunk.changes {
                let prefix = match change.change_type {
                    DiffChangeType::Equal => " ",
                    DiffChangeType::Insert => "+",
                    DiffChangeType::Delete => "-",
                };
                output.push_str(prefix);
                output.push_str(&change.content);
                if !change.content.ends_with('\n') {
                    output.push_str("\n\\ No newline at end of file\n");
                }
            }
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn tree(files: &[(&str, &str)]) -> TempDir {
        let tmp = TempDir::new().unwrap();
        for (rel, content) in files {
            let path = tmp.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        tmp
    }

    fn paths(diff: &DiffResult) -> Vec<(ChangeKind, String)> {
        diff.iter()
            .map(|r| (r.kind, r.path.display().to_string()))
            .collect()
    }

    #[test]
    fn identical_trees_produce_no_changes() {
        let t = tree(&[("a.txt", "1"), ("src/lib.rs", "x"), ("src/deep/y", "y")]);
        let engine = DiffEngine::default();

        let diff = engine.compare(t.path(), t.path()).unwrap();
        assert!(diff.is_empty());
        assert_eq!(diff.render(), "No changes detected.");
    }

    #[test]
    fn single_added_file_yields_one_added_record() {
        let before = tree(&[("a.txt", "1"), ("dir/b.txt", "b")]);
        let after = tree(&[("a.txt", "1"), ("dir/b.txt", "b"), ("dir/c.txt", "c")]);

        let diff = DiffEngine::default().compare(before.path(), after.path()).unwrap();
        assert_eq!(paths(&diff), vec![(ChangeKind::Added, "dir/c.txt".to_string())]);
    }

    #[test]
    fn modified_added_in_lexicographic_order() {
        let before = tree(&[("a.txt", "1")]);
        let after = tree(&[("a.txt", "2"), ("b.txt", "new")]);

        let diff = DiffEngine::default().compare(before.path(), after.path()).unwrap();
        assert_eq!(
            paths(&diff),
            vec![
                (ChangeKind::Modified, "a.txt".to_string()),
                (ChangeKind::Added, "b.txt".to_string()),
            ]
        );
        assert_eq!(diff.render(), "M  a.txt\nA  b.txt\n");
        assert_eq!(
            diff.summary(),
            DiffSummary {
                added: 1,
                modified: 1,
                deleted: 0
            }
        );
    }

    #[test]
    fn deleted_directory_lists_directory_and_children() {
        let before = tree(&[("keep.txt", "k"), ("old/x.txt", "x")]);
        let after = tree(&[("keep.txt", "k")]);

        let diff = DiffEngine::default().compare(before.path(), after.path()).unwrap();
        assert_eq!(
            paths(&diff),
            vec![
                (ChangeKind::Deleted, "old".to_string()),
                (ChangeKind::Deleted, "old/x.txt".to_string()),
            ]
        );
        assert_eq!(diff.records[0].format(), "D  old/");
    }

    #[test]
    fn timestamps_alone_are_not_changes() {
        let before = tree(&[("a.txt", "same")]);
        let after = tree(&[("a.txt", "same")]);
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(after.path().join("a.txt"), "same").unwrap();

        let diff = DiffEngine::default().compare(before.path(), after.path()).unwrap();
        assert!(diff.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn mode_alone_is_not_a_change() {
        use std::os::unix::fs::PermissionsExt;
        let before = tree(&[("run.sh", "echo hi")]);
        let after = tree(&[("run.sh", "echo hi")]);
        let script = after.path().join("run.sh");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        fs::set_permissions(before.path().join("run.sh"), fs::Permissions::from_mode(0o644)).unwrap();

        let diff = DiffEngine::default().compare(before.path(), after.path()).unwrap();
        assert!(diff.is_empty(), "{}", diff.render());

        fs::write(&script, "echo bye").unwrap();
        let diff = DiffEngine::default().compare(before.path(), after.path()).unwrap();
        assert_eq!(paths(&diff), vec![(ChangeKind::Modified, "run.sh".to_string())]);
    }

    #[test]
    fn file_replaced_by_directory_is_a_modification() {
        let before = tree(&[("x", "file")]);
        let after = tree(&[("x/inner.txt", "i")]);

        let diff = DiffEngine::default().compare(before.path(), after.path()).unwrap();
        assert_eq!(diff.records[0].kind, ChangeKind::Modified);
        assert_eq!(diff.records[0].format(), "M  x (file -> dir)");
        assert_eq!(diff.records[1].kind, ChangeKind::Added);
    }

    #[test]
    fn compare_is_deterministic() {
        let before = tree(&[("z.txt", "z"), ("a/b.txt", "b"), ("m.txt", "m")]);
        let after = tree(&[("z.txt", "zz"), ("a/c.txt", "c"), ("n.txt", "n")]);
        let engine = DiffEngine::default();

        let first = engine.compare(before.path(), after.path()).unwrap();
        let second = engine.compare(before.path(), after.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn ignored_paths_never_appear() {
        let before = tree(&[("a.txt", "1")]);
        let after = tree(&[("a.txt", "1"), (".git/HEAD", "ref"), ("x/__pycache__/m.pyc", "c")]);
        let engine = DiffEngine::new(IgnoreRules::new(&[".git", "__pycache__"]).unwrap());

        assert!(engine.compare(before.path(), after.path()).unwrap().is_empty());
    }

    #[test]
    fn content_diff_renders_unified_hunks() {
        let before = tree(&[("a.txt", "one\ntwo\n")]);
        let after = tree(&[("a.txt", "one\nTWO\n")]);
        let diff = DiffEngine::default().compare(before.path(), after.path()).unwrap();

        let patch = DiffEngine::content_diff(&diff.records[0], before.path(), after.path()).unwrap();
        assert_eq!(patch, "--- a/a.txt\n+++ b/a.txt\n@@ -2,1 +2,1 @@\n-two\n+TWO\n");
    }

    #[test]
    fn content_diff_reports_binary_files() {
        let before = tree(&[("b.bin", "\u{0}")]);
        let after = tree(&[]);
        fs::write(after.path().join("b.bin"), [0xff, 0xfe, 0x00]).unwrap();
        let diff = DiffEngine::default().compare(before.path(), after.path()).unwrap();

        let patch = DiffEngine::content_diff(&diff.records[0], before.path(), after.path()).unwrap();
        assert_eq!(patch, "Binary files a/b.bin and b/b.bin differ\n");
    }
}
