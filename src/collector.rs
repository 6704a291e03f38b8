//! Service layer that turns one repository's recent pull requests into metric records.
//!
//! `MetricsCollector` is the main entry point of a collection pass. For every repository it:
//! 1. Lists the pull requests updated inside the lookback window.
//! 2. Keeps the merged ones and fetches their comments and commits concurrently.
//! 3. Correlates the oldest commit with the tags that point at it.
//! 4. Assembles a `PullRequestMetric` from the aggregates.

use crate::config::{AppConfig, LinkBuilder, RepoId};
use crate::lead_time;
use crate::metrics::{self, PullRequestMetric};
use crate::source::MetricsSource;
use crate::types::{PrState, PullRequest};
use anyhow::{bail, Context};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

#[derive(Clone)]
pub struct MetricsCollector {
    source: Arc<dyn MetricsSource>,
    links: LinkBuilder,
    time_range: Duration,
}

impl MetricsCollector {
    pub fn new(source: Arc<dyn MetricsSource>, config: &AppConfig) -> Self {
        Self::with_links(
            source,
            config.links(),
            Duration::days(config.time_range_days),
        )
    }

    pub fn with_links(
        source: Arc<dyn MetricsSource>,
        links: LinkBuilder,
        time_range: Duration,
    ) -> Self {
        Self {
            source,
            links,
            time_range,
        }
    }

    /// Collects metrics for pull requests updated within the lookback window.
    pub async fn collect(&self, repo: &RepoId) -> anyhow::Result<Vec<PullRequestMetric>> {
        self.collect_at(repo, Utc::now()).await
    }

    /// Same as [`collect`](Self::collect) with an explicit reference time.
    ///
    /// Fails only when the pull request listing fails.
    pub async fn collect_at(
        &self,
        repo: &RepoId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<PullRequestMetric>> {
        let since = now - self.time_range;

        let prs = self
            .source
            .list_pull_requests(repo, since)
            .await
            .with_context(|| format!("failed to list pull requests for {}", repo))?;

        tracing::debug!(repo = %repo, count = prs.len(), "Listed pull requests");

        let mut metrics = Vec::new();
        for pr in prs.iter().filter(|pr| pr.state == PrState::Merged) {
            match self.process_pull_request(repo, pr).await {
                Ok(Some(metric)) => metrics.push(metric),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(repo = %repo, pr_id = pr.id, "Skipping pull request: {:#}", e);
                }
            }
        }

        Ok(metrics)
    }

    /// Builds the metric for one merged pull request. `None` when it has no commits.
    async fn process_pull_request(
        &self,
        repo: &RepoId,
        pr: &PullRequest,
    ) -> anyhow::Result<Option<PullRequestMetric>> {
        let (comments, commits) = tokio::join!(
            self.source.list_comments(repo, pr.id),
            self.source.list_commits(repo, pr.id),
        );

        let Some(first_commit) = metrics::first_commit(&commits) else {
            tracing::debug!(repo = %repo, pr_id = pr.id, "No commits, skipping");
            return Ok(None);
        };
        if first_commit.hash.trim().is_empty() {
            bail!("first commit of pull request {} has no hash", pr.id);
        }

        // The description is not part of the listing payload.
        let jira_keys = metrics::extract_jira_keys(&pr.title, "");
        let (jira_ref, jira_url) =
            metrics::jira_fields(&jira_keys, |key| self.links.jira_url(key));
        let comment_summary = metrics::summarize_comments(&comments);
        let approvals = metrics::summarize_approvals(&comments);

        let candidate_tags = self
            .source
            .find_tags_for_commit(repo, &first_commit.hash)
            .await;
        let deployment = lead_time::calculate_lead_time(first_commit, &candidate_tags);

        Ok(Some(PullRequestMetric {
            pull_request_url: self.links.pull_request_url(repo, pr.id),
            author: pr.author.clone(),
            jira_ref,
            jira_url,
            repository_name: repo.slug.clone(),
            repository_url: self.links.repository_url(repo),
            comment_count: comments.len(),
            commenters: comment_summary.commenters,
            comments: comment_summary.transcript,
            approvers: approvals.approvers,
            approval_count: approvals.approval_count,
            approved_on: approvals.approved_on,
            lead_time: deployment.lead_time,
            created_on: pr.created_on.to_rfc3339(),
            deployed_on: deployment.deployed_on,
            tag_version: deployment.tag_version,
        }))
    }
}
