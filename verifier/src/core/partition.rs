//! Split a commit diff into source / test / non-code partitions.
//!
//! Each file-diff is assigned by, in order: a test-directory keyword in its
//! path, a language-specific test file-name pattern, then an extension fallback
//! (source extensions of the repository language, everything else non-code).

use std::collections::BTreeSet;
use std::path::Path;

use crate::core::types::{ChangeType, Language};

/// Extensions considered source when the repository language is unknown.
const GENERIC_SOURCE_EXTENSIONS: &[&str] = &[
    "java", "kt", "scala", "py", "js", "jsx", "ts", "tsx", "go", "rs", "rb", "cs", "c", "h", "cc",
    "cpp", "hpp", "swift", "php",
];

/// Non-code files that never influence a build; dropped when normalizing.
const DOC_EXTENSIONS: &[&str] = &[
    "md", "markdown", "txt", "rst", "adoc", "png", "jpg", "jpeg", "gif", "svg",
];
const DOC_PREFIXES: &[&str] = &["license", "changelog", "changes", "authors", "contributors"];

/// Partition a file-diff belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Source,
    Test,
    NonCode,
}

/// The diff of a single file, as a self-contained unified-diff chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    /// Post-change path (pre-change path for deletions).
    pub path: String,
    /// Full chunk text, starting at its `diff --git` header.
    pub text: String,
    pub deleted_file: bool,
    pub added_lines: usize,
    pub removed_lines: usize,
}

impl FileDiff {
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.path)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
    }

    /// The chunk only takes lines away (or deletes the file).
    pub fn is_removal_only(&self) -> bool {
        self.deleted_file || (self.added_lines == 0 && self.removed_lines > 0)
    }
}

/// A commit diff split into three disjoint, ordered partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchPartition {
    pub source: Vec<FileDiff>,
    pub test: Vec<FileDiff>,
    pub non_code: Vec<FileDiff>,
}

impl PatchPartition {
    /// Partition raw `git diff` output.
    pub fn from_diff(diff: &str, language: Language, normalize_non_code: bool) -> Self {
        let mut partition = Self::default();
        for file in split_diff(diff) {
            match classify_path(&file.path, language) {
                FileKind::Source => partition.source.push(file),
                FileKind::Test => partition.test.push(file),
                FileKind::NonCode => {
                    if normalize_non_code && is_documentation(&file.path) {
                        continue;
                    }
                    partition.non_code.push(file);
                }
            }
        }
        partition
    }

    pub fn change_type(&self) -> ChangeType {
        ChangeType::derive(!self.source.is_empty(), !self.non_code.is_empty())
    }

    /// Only tests changed: nothing observable was fixed.
    pub fn is_test_only(&self) -> bool {
        self.source.is_empty() && self.non_code.is_empty()
    }

    /// Test partition is non-empty and every chunk in it only removes lines.
    pub fn test_is_deletion_only(&self) -> bool {
        !self.test.is_empty() && self.test.iter().all(FileDiff::is_removal_only)
    }
}

/// Concatenate file-diffs back into unified-diff text.
pub fn render(files: &[FileDiff]) -> String {
    files.iter().map(|file| file.text.as_str()).collect()
}

/// Sorted, de-duplicated extensions (without dot) of the given file-diffs.
pub fn extensions(files: &[FileDiff]) -> BTreeSet<String> {
    files.iter().filter_map(FileDiff::extension).collect()
}

/// Remove `index <old>..<new>` header lines so identical changes from
/// different commits compare equal.
pub fn strip_index_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_hunk = false;
    for line in text.split_inclusive('\n') {
        if line.starts_with("diff --git ") {
            in_hunk = false;
        } else if line.starts_with("@@") {
            in_hunk = true;
        }
        if !in_hunk && line.starts_with("index ") {
            continue;
        }
        out.push_str(line);
    }
    out
}

/// Split unified-diff text into one chunk per file.
pub fn split_diff(diff: &str) -> Vec<FileDiff> {
    let mut files = Vec::new();
    let mut current: Option<ChunkBuilder> = None;

    for line in diff.split_inclusive('\n') {
        if line.starts_with("diff --git ") {
            if let Some(chunk) = current.take() {
                files.push(chunk.finish());
            }
            current = Some(ChunkBuilder::new(line));
            continue;
        }
        if let Some(chunk) = current.as_mut() {
            chunk.push(line);
        }
    }
    if let Some(chunk) = current.take() {
        files.push(chunk.finish());
    }
    files
}

struct ChunkBuilder {
    text: String,
    header_path: Option<String>,
    old_path: Option<String>,
    new_path: Option<String>,
    deleted_file: bool,
    in_hunk: bool,
    added: usize,
    removed: usize,
}

impl ChunkBuilder {
    fn new(header: &str) -> Self {
        Self {
            text: header.to_string(),
            header_path: header_new_path(header),
            old_path: None,
            new_path: None,
            deleted_file: false,
            in_hunk: false,
            added: 0,
            removed: 0,
        }
    }

    fn push(&mut self, line: &str) {
        self.text.push_str(line);
        if line.starts_with("@@") {
            self.in_hunk = true;
            return;
        }
        if !self.in_hunk {
            if line.starts_with("deleted file mode") {
                self.deleted_file = true;
            } else if let Some(path) = line.strip_prefix("--- ") {
                self.old_path = diff_side_path(path, "a/");
            } else if let Some(path) = line.strip_prefix("+++ ") {
                self.new_path = diff_side_path(path, "b/");
            }
            return;
        }
        if line.starts_with('+') {
            self.added += 1;
        } else if line.starts_with('-') {
            self.removed += 1;
        }
    }

    fn finish(self) -> FileDiff {
        let path = self
            .new_path
            .or(self.old_path)
            .or(self.header_path)
            .unwrap_or_default();
        FileDiff {
            path,
            text: self.text,
            deleted_file: self.deleted_file,
            added_lines: self.added,
            removed_lines: self.removed,
        }
    }
}

fn diff_side_path(raw: &str, prefix: &str) -> Option<String> {
    let raw = raw.trim_end_matches(['\n', '\r']);
    let raw = raw.split('\t').next().unwrap_or(raw);
    if raw == "/dev/null" {
        return None;
    }
    Some(raw.strip_prefix(prefix).unwrap_or(raw).to_string())
}

fn header_new_path(header: &str) -> Option<String> {
    let rest = header.trim_end().strip_prefix("diff --git ")?;
    let idx = rest.rfind(" b/")?;
    Some(rest[idx + 3..].to_string())
}

/// Decide which partition a path belongs to.
pub fn classify_path(path: &str, language: Language) -> FileKind {
    let path_ref = Path::new(path);
    let mut segments: Vec<&str> = path_ref
        .components()
        .filter_map(|component| component.as_os_str().to_str())
        .collect();
    let file_name = segments.pop().unwrap_or_default();

    if segments.iter().any(|segment| is_test_dir(segment)) {
        return FileKind::Test;
    }
    if is_test_file_name(file_name, language) {
        return FileKind::Test;
    }

    let ext = path_ref
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let source_exts = match language {
        Language::Unknown => GENERIC_SOURCE_EXTENSIONS,
        other => other.source_extensions(),
    };
    if source_exts.contains(&ext.as_str()) {
        FileKind::Source
    } else {
        FileKind::NonCode
    }
}

/// Whole directory names that hold tests; `src/test` is covered by `test`.
const TEST_DIRS: &[&str] = &[
    "test", "tests", "testing", "__tests__", "spec", "specs", "testdata",
];

fn is_test_dir(segment: &str) -> bool {
    let lower = segment.to_ascii_lowercase();
    TEST_DIRS.contains(&lower.as_str())
}

fn is_test_file_name(name: &str, language: Language) -> bool {
    let stem = name.split('.').next().unwrap_or(name);
    match language {
        Language::Java | Language::Kotlin | Language::CSharp => is_jvm_test_class(stem),
        Language::Python => {
            name.starts_with("test_") || name.ends_with("_test.py") || name == "conftest.py"
        }
        Language::Go => name.ends_with("_test.go"),
        Language::JavaScript | Language::TypeScript => {
            name.contains(".test.") || name.contains(".spec.")
        }
        Language::Ruby => name.ends_with("_spec.rb") || name.ends_with("_test.rb"),
        Language::Rust => false,
        Language::C | Language::Cpp => {
            stem.starts_with("test_") || stem.ends_with("_test") || stem.ends_with("_unittest")
        }
        Language::Unknown => {
            let words: Vec<String> = stem
                .split(['_', '-'])
                .filter(|word| !word.is_empty())
                .map(str::to_ascii_lowercase)
                .collect();
            let is_marker = |word: &String| matches!(word.as_str(), "test" | "tests" | "spec");
            words.first().is_some_and(is_marker) || words.last().is_some_and(is_marker)
        }
    }
}

/// `FooTest`, `FooTests`, `FooTestCase`, `FooIT` or `TestFoo`.
fn is_jvm_test_class(stem: &str) -> bool {
    if stem.ends_with("Test") || stem.ends_with("Tests") || stem.ends_with("TestCase") {
        return true;
    }
    if let Some(head) = stem.strip_suffix("IT")
        && head.chars().last().is_some_and(char::is_lowercase)
    {
        return true;
    }
    stem.strip_prefix("Test")
        .and_then(|rest| rest.chars().next())
        .is_some_and(char::is_uppercase)
}

fn is_documentation(path: &str) -> bool {
    let name = Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if DOC_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
        return true;
    }
    Path::new(&name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| DOC_EXTENSIONS.contains(&ext))
}
