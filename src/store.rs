//! Persistent metrics table.
//!
//! The table is the only state that outlives a run. It is read whole, merged in memory
//! and written back whole; a run assumes it is the only writer.

use crate::metrics::{PullRequestMetric, COLUMNS};
use anyhow::Context;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Every persisted record, in table order. Empty when nothing has been written yet.
    async fn load_existing(&self) -> anyhow::Result<Vec<PullRequestMetric>>;

    /// Inserts or replaces records by pull request URL and persists the full set.
    ///
    /// Returns the number of records in the table after the write.
    async fn upsert_metrics(&self, metrics: Vec<PullRequestMetric>) -> anyhow::Result<usize>;
}

/// Upserts `incoming` into `existing`, keyed by pull request URL.
///
/// Untouched records keep their position, replaced records take the position of the
/// record they replace and new records are appended in arrival order.
pub fn merge_metrics(
    existing: Vec<PullRequestMetric>,
    incoming: Vec<PullRequestMetric>,
) -> Vec<PullRequestMetric> {
    let mut merged: Vec<PullRequestMetric> = Vec::with_capacity(existing.len() + incoming.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for metric in existing.into_iter().chain(incoming) {
        match index.get(&metric.pull_request_url) {
            Some(&pos) => merged[pos] = metric,
            None => {
                index.insert(metric.pull_request_url.clone(), merged.len());
                merged.push(metric);
            }
        }
    }

    merged
}

/// CSV-backed store with the fixed 16-column header.
#[derive(Clone, Debug)]
pub struct CsvMetricsStore {
    path: PathBuf,
}

impl CsvMetricsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MetricsStore for CsvMetricsStore {
    async fn load_existing(&self) -> anyhow::Result<Vec<PullRequestMetric>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_table(&path)).await?
    }

    async fn upsert_metrics(&self, metrics: Vec<PullRequestMetric>) -> anyhow::Result<usize> {
        let existing = self.load_existing().await?;
        let existing_count = existing.len();
        let merged = merge_metrics(existing, metrics);

        tracing::debug!(
            path = %self.path.display(),
            existing = existing_count,
            total = merged.len(),
            "Writing metrics table"
        );

        let total = merged.len();
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_table(&path, &merged)).await??;
        Ok(total)
    }
}

fn read_table(path: &Path) -> anyhow::Result<Vec<PullRequestMetric>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut metrics = Vec::new();
    for record in reader.records() {
        let record = record.with_context(|| format!("failed to read {}", path.display()))?;
        if let Some(metric) = PullRequestMetric::from_record(&record) {
            metrics.push(metric);
        }
    }

    Ok(metrics)
}

/// Writes to a sibling temporary file and renames it over the destination.
fn write_table(path: &Path, metrics: &[PullRequestMetric]) -> anyhow::Result<()> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        writer.write_record(COLUMNS)?;
        for metric in metrics {
            writer.serialize(metric)?;
        }
        writer.flush()?;
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn metric(url: &str, lead_time: &str) -> PullRequestMetric {
        PullRequestMetric {
            pull_request_url: url.to_string(),
            author: "Ana".to_string(),
            jira_ref: "PAY-1".to_string(),
            jira_url: "https://acme.atlassian.net/browse/PAY-1".to_string(),
            repository_name: "payments-api".to_string(),
            repository_url: "https://bitbucket.org/acme/payments-api".to_string(),
            comment_count: 2,
            commenters: "Ben, Cy".to_string(),
            comments: "Ben: why? | Cy: LGTM, approve".to_string(),
            approvers: "Cy".to_string(),
            approval_count: 1,
            approved_on: "2024-06-02T10:00:00+00:00".to_string(),
            lead_time: lead_time.to_string(),
            created_on: "2024-06-01T09:00:00+00:00".to_string(),
            deployed_on: String::new(),
            tag_version: String::new(),
        }
    }

    #[test]
    fn test_merge_preserves_positions() {
        let existing = vec![metric("a", "1h"), metric("b", "2h"), metric("c", "3h")];
        let incoming = vec![metric("d", "4h"), metric("b", "5h")];

        let merged = merge_metrics(existing, incoming);
        let keys: Vec<_> = merged.iter().map(|m| m.pull_request_url.as_str()).collect();

        assert_eq!(keys, vec!["a", "b", "c", "d"]);
        assert_eq!(merged[1].lead_time, "5h");
    }

    #[test]
    fn test_merge_last_write_wins_within_batch() {
        let merged = merge_metrics(vec![], vec![metric("a", "1h"), metric("a", "9h")]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].lead_time, "9h");
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let store = CsvMetricsStore::new(dir.path().join("metrics.csv"));

        assert!(store.load_existing().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_creates_directories_and_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reports").join("2024").join("metrics.csv");
        let store = CsvMetricsStore::new(&path);

        store
            .upsert_metrics(vec![metric("url1", "Not Deployed")])
            .await
            .unwrap();

        let loaded = store.load_existing().await.unwrap();
        assert_eq!(loaded, vec![metric("url1", "Not Deployed")]);

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.starts_with("Pull Request,Author,JIRA Ref,JIRA URL,Repository Name"));
        assert!(!path.with_extension("csv.tmp").exists());
    }

    #[tokio::test]
    async fn test_upsert_overwrites_existing_key() {
        let dir = tempdir().unwrap();
        let store = CsvMetricsStore::new(dir.path().join("metrics.csv"));

        store
            .upsert_metrics(vec![metric("url1", "Not Deployed"), metric("url2", "3h")])
            .await
            .unwrap();
        let total = store
            .upsert_metrics(vec![metric("url1", "2d 3h")])
            .await
            .unwrap();
        assert_eq!(total, 2);

        let loaded = store.load_existing().await.unwrap();
        assert_eq!(loaded.len(), 2);
        let url1: Vec<_> = loaded
            .iter()
            .filter(|m| m.pull_request_url == "url1")
            .collect();
        assert_eq!(url1.len(), 1);
        assert_eq!(url1[0].lead_time, "2d 3h");
        assert_eq!(loaded[1].pull_request_url, "url2");
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = CsvMetricsStore::new(dir.path().join("metrics.csv"));
        let batch = vec![metric("url1", "1d 0h"), metric("url2", "5h")];

        store.upsert_metrics(batch.clone()).await.unwrap();
        let once = store.load_existing().await.unwrap();
        store.upsert_metrics(batch).await.unwrap();
        let twice = store.load_existing().await.unwrap();

        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_empty_upsert_writes_header_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        let store = CsvMetricsStore::new(&path);

        store.upsert_metrics(vec![]).await.unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 1);
        assert!(raw.trim_end().ends_with("Tag Version"));
    }

    #[tokio::test]
    async fn test_load_skips_blank_first_cell_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        fs::write(
            &path,
            format!(
                "{}\n,orphan,row\nurl9,Dee,N/A,,payments-api,,many,,,,x\n",
                COLUMNS.join(",")
            ),
        )
        .unwrap();

        let loaded = CsvMetricsStore::new(&path).load_existing().await.unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].pull_request_url, "url9");
        assert_eq!(loaded[0].author, "Dee");
        assert_eq!(loaded[0].comment_count, 0);
        assert_eq!(loaded[0].approval_count, 0);
        assert_eq!(loaded[0].lead_time, "");
    }
}
