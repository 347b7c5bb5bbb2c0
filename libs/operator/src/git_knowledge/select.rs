use crate::error::{Error, Result};

use std::fs;
use std::path::Path;

/// Normalize to forward slashes so patterns behave the same everywhere.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}

fn match_options() -> glob::MatchOptions {
    glob::MatchOptions {
        case_sensitive: true,
        // `*` and `?` stay within one path segment; `**` crosses them
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

/// Compiled include/exclude globs for repository files.
#[derive(Debug)]
pub struct FileFilter {
    includes: Vec<glob::Pattern>,
    excludes: Vec<glob::Pattern>,
}

impl FileFilter {
    pub fn new(includes: &[String], excludes: &[String]) -> Result<FileFilter> {
        let compile = |patterns: &[String]| -> Result<Vec<glob::Pattern>> {
            patterns
                .iter()
                .map(|p| {
                    glob::Pattern::new(p)
                        .map_err(|e| Error::ConfigError(format!("invalid glob pattern {p:?}: {e}")))
                })
                .collect()
        };
        Ok(FileFilter {
            includes: compile(includes)?,
            excludes: compile(excludes)?,
        })
    }

    /// A file is selected iff it matches at least one include (an empty
    /// include list selects everything) and no exclude.
    pub fn matches(&self, path: &str) -> bool {
        let path = normalize_path(path);
        let options = match_options();
        if self.excludes.iter().any(|p| p.matches_with(&path, options)) {
            return false;
        }
        self.includes.is_empty() || self.includes.iter().any(|p| p.matches_with(&path, options))
    }
}

/// Walk a checkout and return `(relative path, size)` for every regular
/// file, skipping the `.git` directory.
pub fn list_files(root: &Path) -> std::io::Result<Vec<(String, u64)>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if path.file_name().map(|n| n == ".git").unwrap_or(false) {
                    continue;
                }
                stack.push(path);
            } else if file_type.is_file() {
                let relative = path
                    .strip_prefix(root)
                    .expect("walked path is under root")
                    .to_string_lossy()
                    .to_string();
                files.push((normalize_path(&relative), entry.metadata()?.len()));
            }
        }
    }
    files.sort();
    Ok(files)
}
