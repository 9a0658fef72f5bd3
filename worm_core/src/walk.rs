//! Expansion of directory arguments into the files beneath them.

use crate::config::CONFIG_FILE;
use crate::error::Result;
use crate::index::INDEX_FILE;
use std::path::{Path, PathBuf};

/// Every file under `dir`, sorted.
///
/// Version-control metadata directories and worm's own files are skipped.
/// Ignore files are not consulted: anchored paths are listed in the
/// exclusion file, and re-adding them must still find them. Symbolic links
/// are skipped.
pub fn files_under(dir: &Path) -> Result<Vec<PathBuf>> {
    let walker = ignore::WalkBuilder::new(dir)
        .standard_filters(false) // Include hidden and ignored files
        .follow_links(false)
        .filter_entry(|entry| {
            let name = entry.file_name();
            !(entry.file_type().is_some_and(|t| t.is_dir()) && (name == ".git" || name == ".hg"))
        })
        .build();

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry?;
        let Some(file_type) = entry.file_type() else {
            continue;
        };

        let name = entry.file_name();
        if name == INDEX_FILE || name == CONFIG_FILE {
            continue;
        }

        if file_type.is_symlink() {
            tracing::debug!(path = %entry.path().display(), "skipping symbolic link");
            continue;
        }
        if file_type.is_file() {
            files.push(entry.into_path());
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_files_under_recurses() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("data/nested")).unwrap();
        fs::write(root.join("data/a.bin"), b"a").unwrap();
        fs::write(root.join("data/nested/b.bin"), b"b").unwrap();
        fs::write(root.join("data/.hidden"), b"h").unwrap();

        let files = files_under(&root.join("data")).unwrap();
        assert_eq!(
            files,
            vec![
                root.join("data/.hidden"),
                root.join("data/a.bin"),
                root.join("data/nested/b.bin"),
            ]
        );
    }

    #[test]
    fn test_files_under_skips_metadata() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join(".git/info")).unwrap();
        fs::write(root.join(".git/info/exclude"), b"/big.bin\n").unwrap();
        fs::write(root.join(INDEX_FILE), b"{}").unwrap();
        fs::write(root.join(".gitignore"), b"big.bin\n").unwrap();
        fs::write(root.join("big.bin"), b"big").unwrap();

        let files = files_under(root).unwrap();
        assert_eq!(files, vec![root.join(".gitignore"), root.join("big.bin")]);
    }

    #[test]
    #[cfg(unix)]
    fn test_files_under_skips_symlinks() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("dir")).unwrap();
        fs::write(root.join("target"), b"t").unwrap();
        std::os::unix::fs::symlink(root.join("target"), root.join("dir/link")).unwrap();
        std::os::unix::fs::symlink(root.join("nowhere"), root.join("dir/dangling")).unwrap();

        fs::write(root.join("dir/plain"), b"p").unwrap();

        let files = files_under(&root.join("dir")).unwrap();
        assert_eq!(files, vec![root.join("dir/plain")]);
    }
}
