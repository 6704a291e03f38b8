//! Bitbucket Cloud REST adapter.
//!
//! `BitbucketClient` exposes fallible `fetch_*` methods that report every upstream failure,
//! and implements [`MetricsSource`] on top of them with the degrade-to-empty policy the
//! collector expects. Tag listings and tag targets are cached read-through so that
//! correlating many pull requests in one repository does not re-list every tag each time.

use crate::config::{AppConfig, RepoId};
use crate::source::{MetricsSource, SourceError};
use crate::types::{Comment, Commit, PrState, PullRequest, Tag};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use futures::stream::{self, StreamExt};
use moka::future::Cache;
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::{ParseError, Url};

const PAGE_LEN: &str = "50";

#[derive(Clone)]
pub struct BitbucketClient {
    http: reqwest::Client,
    base_url: String,
    user_email: String,
    api_key: String,
    max_pages: u32,
    tag_concurrency: usize,
    tags: Cache<RepoId, Vec<Tag>>,
    tag_targets: Cache<(RepoId, String), String>,
}

impl BitbucketClient {
    pub fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("pr-metrics/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let tags = Cache::builder()
            .max_capacity(config.tag_cache_max_capacity)
            .time_to_live(config.tag_cache_ttl())
            .build();
        let tag_targets = Cache::builder()
            .max_capacity(config.tag_cache_max_capacity)
            .time_to_live(config.tag_cache_ttl())
            .build();

        Ok(Self {
            http,
            base_url: config.bitbucket_base_url.clone(),
            user_email: config.bitbucket_user_email.clone(),
            api_key: config.bitbucket_api_key.clone(),
            max_pages: config.max_api_pages,
            tag_concurrency: config.tag_resolution_concurrency.max(1),
            tags,
            tag_targets,
        })
    }

    pub async fn fetch_pull_requests(
        &self,
        repo: &RepoId,
        since: DateTime<Utc>,
    ) -> Result<Vec<PullRequest>, SourceError> {
        let mut url = self.repo_url(repo, &["pullrequests"])?;
        url.query_pairs_mut()
            .append_pair("state", "MERGED")
            .append_pair("state", "OPEN")
            .append_pair(
                "q",
                &format!(
                    "updated_on > {}",
                    since.to_rfc3339_opts(SecondsFormat::Secs, true)
                ),
            )
            .append_pair("pagelen", PAGE_LEN);

        let raw: Vec<ApiPullRequest> = self.get_paginated(repo, url).await?;
        Ok(raw
            .into_iter()
            .filter_map(|pr| {
                let id = pr.id;
                let converted = pr.into_domain();
                if converted.is_none() {
                    tracing::warn!(repo = %repo, pr_id = ?id, "Skipping malformed pull request");
                }
                converted
            })
            .collect())
    }

    pub async fn fetch_comments(
        &self,
        repo: &RepoId,
        pr_id: u64,
    ) -> Result<Vec<Comment>, SourceError> {
        let url = self.repo_url(repo, &["pullrequests", &pr_id.to_string(), "comments"])?;
        let raw: Vec<ApiComment> = self.get_paginated(repo, url).await?;
        Ok(raw
            .into_iter()
            .filter_map(|comment| {
                let converted = comment.into_domain();
                if converted.is_none() {
                    tracing::warn!(repo = %repo, pr_id, "Skipping malformed comment");
                }
                converted
            })
            .collect())
    }

    pub async fn fetch_commits(
        &self,
        repo: &RepoId,
        pr_id: u64,
    ) -> Result<Vec<Commit>, SourceError> {
        let url = self.repo_url(repo, &["pullrequests", &pr_id.to_string(), "commits"])?;
        let raw: Vec<ApiCommit> = self.get_paginated(repo, url).await?;
        Ok(raw
            .into_iter()
            .filter_map(|commit| {
                let converted = commit.into_domain();
                if converted.is_none() {
                    tracing::warn!(repo = %repo, pr_id, "Skipping malformed commit");
                }
                converted
            })
            .collect())
    }

    pub async fn fetch_tags(&self, repo: &RepoId) -> Result<Vec<Tag>, SourceError> {
        let mut url = self.repo_url(repo, &["refs", "tags"])?;
        url.query_pairs_mut()
            .append_pair("sort", "-target.date")
            .append_pair("pagelen", PAGE_LEN);

        let raw: Vec<ApiTag> = self.get_paginated(repo, url).await?;
        Ok(raw
            .into_iter()
            .filter_map(|tag| {
                let converted = tag.into_domain();
                if converted.is_none() {
                    tracing::warn!(repo = %repo, "Skipping tag without name, target or date");
                }
                converted
            })
            .collect())
    }

    /// Resolves the commit hash a tag points to. Empty when the tag has no target.
    pub async fn fetch_tag_target(
        &self,
        repo: &RepoId,
        tag_name: &str,
    ) -> Result<String, SourceError> {
        let url = self.repo_url(repo, &["refs", "tags", tag_name])?;
        let tag: ApiTag = self.get_json(url).await?;
        Ok(tag.target.and_then(|t| t.hash).unwrap_or_default())
    }

    /// Tag listing, read-through cached. Failures are not cached.
    pub async fn cached_tags(&self, repo: &RepoId) -> Result<Vec<Tag>, SourceError> {
        if let Some(tags) = self.tags.get(repo).await {
            tracing::debug!(repo = %repo, count = tags.len(), "Tag list served from cache");
            return Ok(tags);
        }

        let tags = self.fetch_tags(repo).await?;
        self.tags.insert(repo.clone(), tags.clone()).await;
        Ok(tags)
    }

    async fn resolve_tag_target(
        &self,
        repo: &RepoId,
        tag_name: &str,
    ) -> Result<String, SourceError> {
        let key = (repo.clone(), tag_name.to_string());
        if let Some(hash) = self.tag_targets.get(&key).await {
            return Ok(hash);
        }

        let hash = self.fetch_tag_target(repo, tag_name).await?;
        self.tag_targets.insert(key, hash.clone()).await;
        Ok(hash)
    }

    fn repo_url(&self, repo: &RepoId, segments: &[&str]) -> Result<Url, SourceError> {
        let mut url = Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(["repositories", repo.workspace.as_str(), repo.slug.as_str()])
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, SourceError> {
        let response = self
            .http
            .get(url)
            .basic_auth(&self.user_email, Some(&self.api_key))
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SourceError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json().await?)
    }

    /// Follows `next` links until exhausted, accumulating every page in request order.
    ///
    /// A listing longer than `max_pages` is an error rather than a truncated result.
    async fn get_paginated<T: DeserializeOwned>(
        &self,
        repo: &RepoId,
        first: Url,
    ) -> Result<Vec<T>, SourceError> {
        let mut items = Vec::new();
        let mut next = Some(first);
        let mut page_count = 0;

        while let Some(url) = next.take() {
            if page_count >= self.max_pages {
                tracing::warn!(
                    "Hit max_api_pages ({}) for repo {} before the listing was exhausted. Discarding partial listing.",
                    self.max_pages,
                    repo
                );
                return Err(SourceError::PageLimit {
                    limit: self.max_pages,
                });
            }

            tracing::debug!(repo = %repo, url = %url, "Fetching page");
            let page: Page<T> = self.get_json(url).await?;
            page_count += 1;

            items.extend(page.values);
            next = page.next.as_deref().map(Url::parse).transpose()?;
        }

        Ok(items)
    }
}

#[async_trait]
impl MetricsSource for BitbucketClient {
    async fn list_pull_requests(
        &self,
        repo: &RepoId,
        since: DateTime<Utc>,
    ) -> Result<Vec<PullRequest>, SourceError> {
        self.fetch_pull_requests(repo, since).await
    }

    async fn list_comments(&self, repo: &RepoId, pr_id: u64) -> Vec<Comment> {
        // Comments are best-effort: the metric is still worth emitting without them.
        self.fetch_comments(repo, pr_id).await.unwrap_or_else(|e| {
            tracing::warn!(repo = %repo, pr_id, "Failed to fetch comments: {}", e);
            Vec::new()
        })
    }

    async fn list_commits(&self, repo: &RepoId, pr_id: u64) -> Vec<Commit> {
        // An empty list makes the collector skip the pull request.
        self.fetch_commits(repo, pr_id).await.unwrap_or_else(|e| {
            tracing::warn!(repo = %repo, pr_id, "Failed to fetch commits: {}", e);
            Vec::new()
        })
    }

    async fn list_tags(&self, repo: &RepoId) -> Vec<Tag> {
        // No tags means every pull request reads as not deployed.
        self.cached_tags(repo).await.unwrap_or_else(|e| {
            tracing::warn!(repo = %repo, "Failed to fetch tags: {}", e);
            Vec::new()
        })
    }

    async fn find_tags_for_commit(&self, repo: &RepoId, commit_hash: &str) -> Vec<Tag> {
        let tags = self.list_tags(repo).await;

        // A tag that fails to resolve is dropped; the rest of the scan continues.
        stream::iter(tags)
            .map(move |tag| async move {
                match self.resolve_tag_target(repo, &tag.name).await {
                    Ok(target) => (target == commit_hash).then_some(tag),
                    Err(e) => {
                        tracing::warn!(repo = %repo, tag = %tag.name, "Failed to resolve tag: {}", e);
                        None
                    }
                }
            })
            .buffered(self.tag_concurrency)
            .filter_map(|matched| async move { matched })
            .collect()
            .await
    }
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct Page<T> {
    #[serde(default)]
    values: Vec<T>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiBranch {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiEndpoint {
    branch: Option<ApiBranch>,
}

impl ApiEndpoint {
    fn branch_name(endpoint: Option<Self>) -> String {
        endpoint
            .and_then(|e| e.branch)
            .and_then(|b| b.name)
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct ApiPullRequest {
    id: Option<u64>,
    title: Option<String>,
    author: Option<ApiUser>,
    state: Option<PrState>,
    created_on: Option<String>,
    closed_on: Option<String>,
    source: Option<ApiEndpoint>,
    destination: Option<ApiEndpoint>,
}

impl ApiPullRequest {
    fn into_domain(self) -> Option<PullRequest> {
        Some(PullRequest {
            id: self.id?,
            title: self.title.unwrap_or_default(),
            author: self
                .author
                .and_then(|a| a.display_name)
                .unwrap_or_default(),
            state: self.state.unwrap_or(PrState::Unknown),
            created_on: parse_timestamp(self.created_on.as_deref()?)?,
            merged_on: self.closed_on.as_deref().and_then(parse_timestamp),
            source_branch: ApiEndpoint::branch_name(self.source),
            destination_branch: ApiEndpoint::branch_name(self.destination),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiContent {
    raw: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiParent {
    id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiComment {
    id: Option<u64>,
    content: Option<ApiContent>,
    user: Option<ApiUser>,
    created_on: Option<String>,
    parent: Option<ApiParent>,
}

impl ApiComment {
    fn into_domain(self) -> Option<Comment> {
        Some(Comment {
            id: self.id?,
            author: self.user.and_then(|u| u.display_name).unwrap_or_default(),
            content: self.content.and_then(|c| c.raw).unwrap_or_default(),
            created_on: parse_timestamp(self.created_on.as_deref()?)?,
            parent: self.parent.and_then(|p| p.id),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiCommitAuthor {
    raw: Option<String>,
    user: Option<ApiUser>,
}

#[derive(Debug, Deserialize)]
struct ApiHashRef {
    hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiCommit {
    hash: Option<String>,
    message: Option<String>,
    author: Option<ApiCommitAuthor>,
    date: Option<String>,
    #[serde(default)]
    parents: Vec<ApiHashRef>,
}

impl ApiCommit {
    fn into_domain(self) -> Option<Commit> {
        let hash = self.hash.filter(|h| !h.is_empty())?;
        let author = self
            .author
            .and_then(|a| a.user.and_then(|u| u.display_name).or(a.raw))
            .unwrap_or_default();

        Some(Commit {
            hash,
            author,
            message: self.message.unwrap_or_default(),
            created_on: parse_timestamp(self.date.as_deref()?)?,
            parents: self.parents.into_iter().filter_map(|p| p.hash).collect(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiTarget {
    hash: Option<String>,
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiTag {
    name: Option<String>,
    target: Option<ApiTarget>,
}

impl ApiTag {
    fn into_domain(self) -> Option<Tag> {
        let target = self.target?;
        Some(Tag {
            name: self.name.filter(|n| !n.is_empty())?,
            created_at: parse_timestamp(target.date.as_deref()?)?,
            commit_hash: target.hash.unwrap_or_default(),
        })
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(raw).ok()
}
