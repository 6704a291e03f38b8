//! The read capabilities the collector needs from a code-hosting service.

use crate::config::RepoId;
use crate::types::{Comment, Commit, PullRequest, Tag};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    /// Connection failures and timeouts.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("API request failed with status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    /// The listing had more pages than the configured maximum.
    #[error("Listing exceeded {limit} pages")]
    PageLimit { limit: u32 },
}

/// Read access to pull requests, comments, commits and tags of a repository.
///
/// Only `list_pull_requests` reports failure. The other operations are best-effort and
/// return an empty list when the upstream call fails.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Pull requests updated after `since` in state OPEN or MERGED, across all pages.
    async fn list_pull_requests(
        &self,
        repo: &RepoId,
        since: DateTime<Utc>,
    ) -> Result<Vec<PullRequest>, SourceError>;

    async fn list_comments(&self, repo: &RepoId, pr_id: u64) -> Vec<Comment>;

    async fn list_commits(&self, repo: &RepoId, pr_id: u64) -> Vec<Commit>;

    /// All tags, most recent target first.
    async fn list_tags(&self, repo: &RepoId) -> Vec<Tag>;

    /// Tags whose resolved target is exactly `commit_hash`.
    async fn find_tags_for_commit(&self, repo: &RepoId, commit_hash: &str) -> Vec<Tag>;
}
