use crate::error::{Error, GitErrorKind, Result};

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use url::Url;

/// Clone target: `<base>/<ns>-<name>-<uid[:8]>`.
pub fn clone_dir(base: &Path, namespace: &str, name: &str, uid: &str) -> PathBuf {
    let uid_prefix: String = uid.chars().take(8).collect();
    base.join(format!("{namespace}-{name}-{uid_prefix}"))
}

/// Removes the clone directory on every exit path, success or not.
pub struct CloneDirGuard {
    path: PathBuf,
}

impl CloneDirGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CloneDirGuard {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!(msg = "failed to remove clone dir", path = %self.path.display(), %e);
            }
        }
    }
}

/// Inject an access token into an HTTPS clone URL, basic-auth style.
pub fn inject_token(repo_url: &str, token: &str) -> Result<String> {
    let mut url = Url::parse(repo_url)
        .map_err(|e| Error::ConfigError(format!("invalid repository URL {repo_url:?}: {e}")))?;
    url.set_username(token).map_err(|_| {
        Error::ConfigError(format!("cannot embed credentials into {repo_url:?}"))
    })?;
    Ok(url.to_string())
}

pub struct ClonedRepo {
    pub head_commit: String,
}

fn classify(error: &git2::Error) -> GitErrorKind {
    let message = error.message().to_lowercase();
    if error.code() == git2::ErrorCode::Auth
        || message.contains("401")
        || message.contains("403")
        || message.contains("authentication")
        || message.contains("authorization")
    {
        GitErrorKind::Auth
    } else if message.contains("404") || message.contains("not found") {
        GitErrorKind::RepositoryNotFound
    } else {
        GitErrorKind::Other
    }
}

/// Shallow-clone `branch` into `dest`. libgit2 is synchronous, so the work
/// runs on the blocking pool.
pub async fn clone_repository(
    repo_url: &str,
    branch: &str,
    depth: Option<u32>,
    token: Option<String>,
    dest: &Path,
) -> Result<ClonedRepo> {
    let url = match &token {
        Some(token) => inject_token(repo_url, token)?,
        None => repo_url.to_string(),
    };
    let branch = branch.to_string();
    let dest = dest.to_path_buf();

    let head_commit = tokio::task::spawn_blocking(move || -> Result<String> {
        let mut fetch_options = git2::FetchOptions::new();
        if let Some(depth) = depth {
            fetch_options.depth(depth as i32);
        }
        let mut builder = git2::build::RepoBuilder::new();
        builder.fetch_options(fetch_options);
        builder.branch(&branch);

        let repo = builder.clone(&url, &dest).map_err(|e| Error::GitError {
            kind: classify(&e),
            message: format!("clone of {branch} failed: {}", e.message()),
        })?;
        let head = repo
            .head()
            .and_then(|head| head.peel_to_commit())
            .map_err(|e| Error::GitError {
                kind: GitErrorKind::Other,
                message: format!("cannot resolve HEAD: {}", e.message()),
            })?;
        Ok(head.id().to_string())
    })
    .await
    .map_err(|e| Error::GitError {
        kind: GitErrorKind::Other,
        message: format!("clone task panicked: {e}"),
    })??;

    debug!(msg = "repository cloned", commit = %head_commit);
    Ok(ClonedRepo { head_commit })
}
