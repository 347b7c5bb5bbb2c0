use crate::crd::git_knowledge::{GitKnowledgeSourceSpec, SkippedFile};
use crate::error::Result;
use crate::git_knowledge::repo::{clone_repository, CloneDirGuard};
use crate::git_knowledge::select::{list_files, FileFilter};
use crate::mcp::knowledge::KnowledgeClient;

use std::collections::BTreeMap;
use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Metadata key that ties every chunk back to its GitKnowledgeSource so
/// bulk deletion can find them.
pub const SOURCE_METADATA_KEY: &str = "source";

/// Document URI: `<repoRoot>/blob/<branch>/<relPath>`, `.git` suffix
/// stripped, `main` standing in for an empty branch.
pub fn build_document_uri(repo_url: &str, branch: &str, rel_path: &str) -> String {
    let base = repo_url.trim_end_matches('/');
    let base = base.strip_suffix(".git").unwrap_or(base);
    let branch = if branch.is_empty() { "main" } else { branch };
    format!("{base}/blob/{branch}/{rel_path}")
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub documents: i64,
    pub skipped: Vec<SkippedFile>,
    pub errors: i64,
    pub last_error: Option<String>,
    pub head_commit: String,
}

/// Full sync at HEAD: clone, select, ingest every matching file. Per-file
/// failures are counted and the loop continues.
pub async fn sync_repository(
    spec: &GitKnowledgeSourceSpec,
    git_token: Option<String>,
    knowledge: &KnowledgeClient,
    source_id: &str,
    clone_target: CloneDirGuard,
    cancel: &CancellationToken,
) -> Result<SyncReport> {
    let repository = &spec.repository;
    let cloned = clone_repository(
        &repository.url,
        &repository.branch,
        repository.depth,
        git_token,
        clone_target.path(),
    )
    .await?;

    let filter = FileFilter::new(&spec.include, &spec.exclude)?;
    let files = list_files(clone_target.path()).map_err(|e| crate::error::Error::GitError {
        kind: crate::error::GitErrorKind::Other,
        message: format!("failed to walk checkout: {e}"),
    })?;

    let mut metadata: BTreeMap<String, String> = spec.metadata.clone();
    metadata.insert(SOURCE_METADATA_KEY.to_string(), source_id.to_string());

    let mut report = SyncReport {
        head_commit: cloned.head_commit,
        ..SyncReport::default()
    };

    for (rel_path, size) in files {
        if !filter.matches(&rel_path) {
            continue;
        }
        if let Some(max) = spec.max_file_size_bytes {
            if size > max {
                debug!(msg = "skipping oversize file", path = %rel_path, size);
                report.skipped.push(SkippedFile {
                    path: rel_path,
                    reason: "too large".to_string(),
                    size_bytes: Some(size),
                });
                continue;
            }
        }

        let content = match read_utf8(clone_target.path(), &rel_path).await {
            Some(content) => content,
            None => {
                report.skipped.push(SkippedFile {
                    path: rel_path,
                    reason: "binary".to_string(),
                    size_bytes: Some(size),
                });
                continue;
            }
        };

        let uri = build_document_uri(&repository.url, &repository.branch, &rel_path);
        match knowledge.ingest(&uri, &content, &metadata, cancel).await {
            Ok(_) => report.documents += 1,
            Err(e) => {
                warn!(msg = "failed to ingest document", %uri, %e);
                report.errors += 1;
                report.last_error = Some(e.to_string());
            }
        }
    }

    info!(
        msg = "repository sync complete",
        source = source_id,
        documents = report.documents,
        skipped = report.skipped.len(),
        errors = report.errors
    );
    Ok(report)
}

async fn read_utf8(root: &Path, rel_path: &str) -> Option<String> {
    let bytes = tokio::fs::read(root.join(rel_path)).await.ok()?;
    String::from_utf8(bytes).ok()
}
