//! Registration of anchored paths in the version-control exclusion file.
//!
//! Each anchored path is listed once as a `/`-rooted pattern so the
//! surrounding repository never picks up the large file itself, only the
//! index that names it.

use crate::error::Result;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// An exclusion file such as `.git/info/exclude`.
#[derive(Debug, Clone)]
pub struct ExcludeFile {
    path: PathBuf,
}

impl ExcludeFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The exclusion line for a repository-relative path.
    pub fn pattern(rel_path: &str) -> String {
        format!("/{}", rel_path.trim_start_matches('/'))
    }

    /// Append the pattern for `rel_path` unless it is already listed.
    ///
    /// Returns whether a line was written. When the directory holding the
    /// exclusion file does not exist (no version-control metadata), nothing
    /// is written.
    pub fn ensure(&self, rel_path: &str) -> Result<bool> {
        let line = Self::pattern(rel_path);

        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => {
                tracing::debug!(file = %self.path.display(), "no exclusion directory, skipping");
                return Ok(false);
            }
            _ => {}
        }

        let existing = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        if existing.lines().any(|l| l.trim_end() == line) {
            return Ok(false);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        if !existing.is_empty() && !existing.ends_with('\n') {
            writeln!(file)?;
        }
        writeln!(file, "{}", line)?;
        file.flush()?;

        tracing::debug!(file = %self.path.display(), %line, "registered exclusion");
        Ok(true)
    }

    /// Drop every line listing `rel_path`, keeping all other lines.
    ///
    /// The file is rewritten through a temporary sibling. Returns whether
    /// anything was removed.
    pub fn remove(&self, rel_path: &str) -> Result<bool> {
        let line = Self::pattern(rel_path);
        let existing = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let kept: Vec<&str> = existing.lines().filter(|l| l.trim_end() != line).collect();
        if kept.len() == existing.lines().count() {
            return Ok(false);
        }

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut temp_file = tempfile::NamedTempFile::new_in(dir)?;
        for l in &kept {
            writeln!(temp_file, "{}", l)?;
        }
        temp_file.flush()?;
        temp_file.persist(&self.path)?;

        tracing::debug!(file = %self.path.display(), %line, "removed exclusion");
        Ok(true)
    }

    /// Whether `rel_path` is already listed.
    pub fn contains(&self, rel_path: &str) -> Result<bool> {
        let line = Self::pattern(rel_path);
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content.lines().any(|l| l.trim_end() == line)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ensure_appends_once() {
        let temp_dir = TempDir::new().unwrap();
        let info = temp_dir.path().join(".git/info");
        fs::create_dir_all(&info).unwrap();
        let exclude = ExcludeFile::new(info.join("exclude"));

        assert!(exclude.ensure("data/big.bin").unwrap());
        assert!(!exclude.ensure("data/big.bin").unwrap());
        assert!(exclude.ensure("other.bin").unwrap());

        let content = fs::read_to_string(exclude.path()).unwrap();
        assert_eq!(content, "/data/big.bin\n/other.bin\n");
        assert!(exclude.contains("other.bin").unwrap());
    }

    #[test]
    fn test_ensure_preserves_existing_lines() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("exclude");
        fs::write(&path, "# comment\n*.tmp").unwrap();

        let exclude = ExcludeFile::new(&path);
        exclude.ensure("foo").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "# comment\n*.tmp\n/foo\n");
    }

    #[test]
    fn test_remove_keeps_other_lines() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("exclude");
        fs::write(&path, "# comment\n/a.bin\n*.tmp\n/b.bin\n").unwrap();
        let exclude = ExcludeFile::new(&path);

        assert!(exclude.remove("a.bin").unwrap());
        assert!(!exclude.remove("a.bin").unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "# comment\n*.tmp\n/b.bin\n");
        assert!(!exclude.contains("a.bin").unwrap());
    }

    #[test]
    fn test_remove_without_file() {
        let temp_dir = TempDir::new().unwrap();
        let exclude = ExcludeFile::new(temp_dir.path().join("exclude"));
        assert!(!exclude.remove("a.bin").unwrap());
        assert!(!exclude.path().exists());
    }

    #[test]
    fn test_missing_directory_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let exclude = ExcludeFile::new(temp_dir.path().join(".git/info/exclude"));

        assert!(!exclude.ensure("foo").unwrap());
        assert!(!temp_dir.path().join(".git").exists());
    }
}
