pub mod bitbucket;
pub mod collector;
pub mod config;
pub mod lead_time;
pub mod metrics;
pub mod source;
pub mod store;
pub mod types;

use anyhow::Context;
use bitbucket::BitbucketClient;
use collector::MetricsCollector;
use config::AppConfig;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use store::{CsvMetricsStore, MetricsStore};

const STORE_RETRY_BACKOFF: StdDuration = StdDuration::from_millis(500);

/// Outcome of a collection run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Repositories processed, failed or not.
    pub repositories: usize,
    /// Repositories whose pull request listing failed, as `workspace/slug`.
    pub failed_repositories: Vec<String>,
    /// Metric records collected in this run.
    pub collected: usize,
    /// Records in the table after the upsert.
    pub stored: usize,
}

/// Runs one collection pass against Bitbucket and persists the result to the CSV table.
pub async fn run(config: &AppConfig) -> anyhow::Result<RunSummary> {
    let client = BitbucketClient::new(config).context("failed to build Bitbucket client")?;
    let collector = MetricsCollector::new(Arc::new(client), config);
    let store = CsvMetricsStore::new(&config.metrics_file_path);

    run_with(config, &collector, &store).await
}

/// Collects every configured repository sequentially, then upserts all records in one write.
///
/// A repository that fails is logged and recorded in the summary; only a failed table
/// write fails the run.
pub async fn run_with(
    config: &AppConfig,
    collector: &MetricsCollector,
    store: &dyn MetricsStore,
) -> anyhow::Result<RunSummary> {
    let repos = config.repo_ids();
    tracing::info!(
        repositories = repos.len(),
        time_range_days = config.time_range_days,
        "Starting metrics collection"
    );

    let mut summary = RunSummary {
        repositories: repos.len(),
        ..Default::default()
    };
    let mut all_metrics = Vec::new();

    for repo_id in &repos {
        tracing::info!(repo = %repo_id, "Fetching metrics");
        match collector.collect(repo_id).await {
            Ok(metrics) => {
                tracing::info!(repo = %repo_id, "Found {} PRs", metrics.len());
                all_metrics.extend(metrics);
            }
            Err(e) => {
                tracing::error!(repo = %repo_id, "Error processing repository: {:#}", e);
                summary.failed_repositories.push(repo_id.to_string());
            }
        }
    }

    summary.collected = all_metrics.len();
    tracing::info!("Total PRs collected: {}", summary.collected);

    summary.stored = upsert_with_retry(store, all_metrics, config.store_write_attempts).await?;

    tracing::info!(
        path = %config.metrics_file_path.display(),
        stored = summary.stored,
        "Metrics collection completed"
    );

    Ok(summary)
}

async fn upsert_with_retry(
    store: &dyn MetricsStore,
    metrics: Vec<metrics::PullRequestMetric>,
    attempts: u32,
) -> anyhow::Result<usize> {
    let attempts = attempts.max(1);
    let mut attempt = 1;

    loop {
        match store.upsert_metrics(metrics.clone()).await {
            Ok(stored) => return Ok(stored),
            Err(e) if attempt < attempts => {
                tracing::warn!(attempt, attempts, "Failed to write metrics, retrying: {:#}", e);
                tokio::time::sleep(STORE_RETRY_BACKOFF * attempt).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(e.context(format!(
                    "failed to write metrics after {} attempts",
                    attempts
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::PullRequestMetric;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FlakyStore {
        failures_left: Mutex<u32>,
        written: Mutex<Vec<PullRequestMetric>>,
        readable: bool,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                failures_left: Mutex::new(failures),
                written: Mutex::new(vec![]),
                readable: true,
            }
        }
    }

    #[async_trait]
    impl MetricsStore for FlakyStore {
        async fn load_existing(&self) -> anyhow::Result<Vec<PullRequestMetric>> {
            if !self.readable {
                anyhow::bail!("table locked");
            }
            Ok(self.written.lock().unwrap().clone())
        }

        async fn upsert_metrics(&self, metrics: Vec<PullRequestMetric>) -> anyhow::Result<usize> {
            let mut failures = self.failures_left.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                anyhow::bail!("disk full");
            }
            let total = metrics.len();
            *self.written.lock().unwrap() = metrics;
            Ok(total)
        }
    }

    fn empty_config() -> AppConfig {
        AppConfig {
            bitbucket_workspace: "acme".to_string(),
            bitbucket_user_email: "dev@acme.test".to_string(),
            bitbucket_api_key: "token".to_string(),
            bitbucket_base_url: "http://127.0.0.1:9".to_string(),
            bitbucket_web_url: "https://bitbucket.org".to_string(),
            repositories: vec![],
            metrics_file_path: "unused.csv".into(),
            jira_browse_url: None,
            time_range_days: 7,
            tag_resolution_concurrency: 1,
            request_timeout_seconds: 1,
            max_api_pages: 1,
            tag_cache_ttl_seconds: 60,
            tag_cache_max_capacity: 10,
            store_write_attempts: 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_upsert_retries_until_success() {
        let store = FlakyStore::new(2);

        upsert_with_retry(&store, vec![], 3).await.unwrap();
        assert_eq!(*store.failures_left.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_successful_write_does_not_read_the_table_back() {
        let config = empty_config();
        let client = BitbucketClient::new(&config).unwrap();
        let collector = MetricsCollector::new(Arc::new(client), &config);
        let store = FlakyStore {
            readable: false,
            ..FlakyStore::new(0)
        };

        let summary = run_with(&config, &collector, &store).await.unwrap();
        assert_eq!(summary.repositories, 0);
        assert_eq!(summary.stored, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upsert_gives_up_after_attempts() {
        let store = FlakyStore::new(5);

        let err = upsert_with_retry(&store, vec![], 2).await.unwrap_err();
        assert!(format!("{:#}", err).contains("disk full"));
        assert_eq!(*store.failures_left.lock().unwrap(), 3);
    }
}
