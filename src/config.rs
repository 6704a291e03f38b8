//! Run settings for a metrics collection pass, read once at startup.
//!
//! `AppConfig` is filled from process variables (a `.env` file is loaded first by the
//! binary). It names the Bitbucket workspace and repositories to scan, the lookback window,
//! the API limits and where the metrics table lives.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration as StdDuration;

/// A unique identifier for a Bitbucket repository.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoId {
    /// The workspace that owns the repository (e.g., "acme").
    pub workspace: String,
    /// The repository slug (e.g., "payments-api").
    pub slug: String,
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workspace, self.slug)
    }
}

/// Application configuration loaded from environment variables.
#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    /// Bitbucket workspace that owns every configured repository.
    pub bitbucket_workspace: String,

    /// Account email used as the Basic auth identity.
    pub bitbucket_user_email: String,

    /// API token used as the Basic auth secret.
    pub bitbucket_api_key: String,

    /// Base URL of the REST API.
    #[serde(default = "default_base_url")]
    pub bitbucket_base_url: String,

    /// Base URL of the web UI, used to build pull request and repository links.
    #[serde(default = "default_web_url")]
    pub bitbucket_web_url: String,

    /// Repositories to scan.
    /// Expected format: comma-separated string of repository slugs.
    /// Example: "payments-api,web-frontend"
    #[serde(deserialize_with = "deserialize_repositories")]
    pub repositories: Vec<String>,

    /// Destination table for the collected metrics.
    pub metrics_file_path: PathBuf,

    /// Base URL for JIRA issue links. Derived from the workspace when unset.
    pub jira_browse_url: Option<String>,

    /// Lookback window: pull requests updated within this many days are collected.
    #[serde(default = "default_time_range_days")]
    pub time_range_days: i64,

    /// Maximum number of concurrent tag resolution requests.
    #[serde(default = "default_tag_resolution_concurrency")]
    pub tag_resolution_concurrency: usize,

    /// Timeout applied to every upstream request.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,

    /// Hard limit on the number of pages followed for a single listing.
    #[serde(default = "default_max_api_pages")]
    pub max_api_pages: u32,

    /// Time to live for cached tag listings and tag targets in seconds.
    #[serde(default = "default_tag_cache_ttl_seconds")]
    pub tag_cache_ttl_seconds: u64,

    /// Maximum number of entries to keep in each tag cache.
    #[serde(default = "default_tag_cache_max_capacity")]
    pub tag_cache_max_capacity: u64,

    /// How many times the final table write is attempted before giving up.
    #[serde(default = "default_store_write_attempts")]
    pub store_write_attempts: u32,
}

fn default_base_url() -> String {
    "https://api.bitbucket.org/2.0".to_string()
}

fn default_web_url() -> String {
    "https://bitbucket.org".to_string()
}

fn default_time_range_days() -> i64 {
    7
}

fn default_tag_resolution_concurrency() -> usize {
    4
}

fn default_request_timeout_seconds() -> u64 {
    30
}

fn default_max_api_pages() -> u32 {
    100
}

fn default_tag_cache_ttl_seconds() -> u64 {
    3600
}

fn default_tag_cache_max_capacity() -> u64 {
    10_000
}

fn default_store_write_attempts() -> u32 {
    3
}

impl AppConfig {
    /// Loads and validates the configuration. Any error here is fatal to the run.
    pub fn from_env() -> anyhow::Result<Self> {
        let config: Self = envy::from_env().context("invalid or missing configuration")?;
        config.normalized()
    }

    fn normalized(mut self) -> anyhow::Result<Self> {
        self.bitbucket_workspace = self.bitbucket_workspace.trim().to_string();
        self.bitbucket_user_email = self.bitbucket_user_email.trim().to_string();
        self.bitbucket_api_key = self.bitbucket_api_key.trim().to_string();

        if self.bitbucket_workspace.is_empty() {
            bail!("BITBUCKET_WORKSPACE must not be empty");
        }
        if self.bitbucket_user_email.is_empty() || self.bitbucket_api_key.is_empty() {
            bail!("BITBUCKET_USER_EMAIL and BITBUCKET_API_KEY must not be empty");
        }
        if self.repositories.is_empty() {
            bail!("REPOSITORIES must name at least one repository");
        }
        if let Some(slug) = self.repositories.iter().find(|slug| slug.contains('/')) {
            bail!(
                "REPOSITORIES entry '{}' must be a bare slug; the workspace comes from BITBUCKET_WORKSPACE",
                slug
            );
        }
        self.tag_resolution_concurrency = self.tag_resolution_concurrency.max(1);
        self.store_write_attempts = self.store_write_attempts.max(1);

        Ok(self)
    }

    /// Every configured repository, qualified with the workspace.
    pub fn repo_ids(&self) -> Vec<RepoId> {
        self.repositories
            .iter()
            .map(|slug| RepoId {
                workspace: self.bitbucket_workspace.clone(),
                slug: slug.clone(),
            })
            .collect()
    }

    pub fn request_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.request_timeout_seconds)
    }

    pub fn tag_cache_ttl(&self) -> StdDuration {
        StdDuration::from_secs(self.tag_cache_ttl_seconds)
    }

    pub fn links(&self) -> LinkBuilder {
        let jira = match &self.jira_browse_url {
            Some(url) => url.clone(),
            None => format!("https://{}.atlassian.net/browse", self.bitbucket_workspace),
        };
        LinkBuilder {
            web_base: self.bitbucket_web_url.trim_end_matches('/').to_string(),
            jira_base: jira.trim_end_matches('/').to_string(),
        }
    }
}

/// Builds the human-facing URLs stored alongside each metric.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkBuilder {
    web_base: String,
    jira_base: String,
}

impl LinkBuilder {
    pub fn new(web_base: impl Into<String>, jira_base: impl Into<String>) -> Self {
        Self {
            web_base: web_base.into(),
            jira_base: jira_base.into(),
        }
    }

    pub fn repository_url(&self, repo: &RepoId) -> String {
        format!("{}/{}/{}", self.web_base, repo.workspace, repo.slug)
    }

    pub fn pull_request_url(&self, repo: &RepoId, pr_id: u64) -> String {
        format!("{}/pull-requests/{}", self.repository_url(repo), pr_id)
    }

    pub fn jira_url(&self, key: &str) -> String {
        format!("{}/{}", self.jira_base, key)
    }
}

fn deserialize_repositories<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Ok(parse_repositories(&s))
}

fn parse_repositories(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|slug| !slug.is_empty())
        .map(str::to_string)
        .collect()
}
