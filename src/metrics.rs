//! The per-pull-request metric record and the pure aggregations that feed it.

use crate::types::{Comment, Commit};
use chrono::{DateTime, FixedOffset};
use csv::StringRecord;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const NO_JIRA_REF: &str = "N/A";

/// Column headers of the persisted table, in field order.
pub const COLUMNS: [&str; 16] = [
    "Pull Request",
    "Author",
    "JIRA Ref",
    "JIRA URL",
    "Repository Name",
    "Repository URL",
    "# Comments",
    "Commenters",
    "Comments",
    "Approvers",
    "# Approvals",
    "Approved on",
    "Lead Time",
    "Created on",
    "Deployed on",
    "Tag Version",
];

lazy_static! {
    static ref JIRA_KEY: Regex = Regex::new(r"[A-Z]+-\d+").unwrap();
}

/// One row of the metrics table. Keyed by `pull_request_url`.
///
/// Field order matches [`COLUMNS`]; the table writer relies on it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestMetric {
    pub pull_request_url: String,
    pub author: String,
    pub jira_ref: String,
    pub jira_url: String,
    pub repository_name: String,
    pub repository_url: String,
    pub comment_count: usize,
    pub commenters: String,
    pub comments: String,
    pub approvers: String,
    pub approval_count: usize,
    pub approved_on: String,
    pub lead_time: String,
    pub created_on: String,
    pub deployed_on: String,
    pub tag_version: String,
}

impl PullRequestMetric {
    /// Reads a table row. Returns `None` for rows with an empty first cell.
    ///
    /// Missing trailing cells read as empty and unparseable counts as zero.
    pub fn from_record(record: &StringRecord) -> Option<Self> {
        let cell = |i: usize| record.get(i).unwrap_or("").to_string();
        let count = |i: usize| record.get(i).and_then(|v| v.trim().parse().ok()).unwrap_or(0);

        let pull_request_url = cell(0);
        if pull_request_url.trim().is_empty() {
            return None;
        }

        Some(Self {
            pull_request_url,
            author: cell(1),
            jira_ref: cell(2),
            jira_url: cell(3),
            repository_name: cell(4),
            repository_url: cell(5),
            comment_count: count(6),
            commenters: cell(7),
            comments: cell(8),
            approvers: cell(9),
            approval_count: count(10),
            approved_on: cell(11),
            lead_time: cell(12),
            created_on: cell(13),
            deployed_on: cell(14),
            tag_version: cell(15),
        })
    }
}

/// JIRA-style keys (`ABC-123`) found in the inputs, deduplicated in first-seen order.
pub fn extract_jira_keys(title: &str, description: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    [title, description]
        .into_iter()
        .flat_map(|text| JIRA_KEY.find_iter(text))
        .map(|m| m.as_str())
        .filter(|key| seen.insert(*key))
        .map(str::to_string)
        .collect()
}

/// `(jira_ref, jira_url)` cells for a set of keys.
pub fn jira_fields(keys: &[String], url_for: impl Fn(&str) -> String) -> (String, String) {
    if keys.is_empty() {
        return (NO_JIRA_REF.to_string(), String::new());
    }
    let urls: Vec<String> = keys.iter().map(|key| url_for(key)).collect();
    (keys.join(", "), urls.join(", "))
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommentSummary {
    pub commenters: String,
    pub transcript: String,
}

pub fn summarize_comments(comments: &[Comment]) -> CommentSummary {
    let commenters = distinct(comments.iter().map(|c| c.author.as_str()));
    let transcript = comments
        .iter()
        .map(|c| format!("{}: {}", c.author, c.content))
        .collect::<Vec<_>>()
        .join(" | ");

    CommentSummary {
        commenters: commenters.join(", "),
        transcript,
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApprovalSummary {
    pub approvers: String,
    pub approval_count: usize,
    pub approved_on: String,
}

pub fn is_approval(content: &str) -> bool {
    let content = content.to_lowercase();
    content.contains("approve") || content.contains("lgtm")
}

/// Approvers are the distinct authors of approval comments. The approval date is the
/// earliest comment written by any approver, approval or not.
pub fn summarize_approvals(comments: &[Comment]) -> ApprovalSummary {
    let approvers = distinct(
        comments
            .iter()
            .filter(|c| is_approval(&c.content))
            .map(|c| c.author.as_str()),
    );

    let approved_on: Option<DateTime<FixedOffset>> = comments
        .iter()
        .filter(|c| approvers.contains(&c.author.as_str()))
        .map(|c| c.created_on)
        .min();

    ApprovalSummary {
        approval_count: approvers.len(),
        approvers: approvers.join(", "),
        approved_on: approved_on.map(|ts| ts.to_rfc3339()).unwrap_or_default(),
    }
}

/// The oldest commit of a pull request.
///
/// Ties go to the commit listed last, since the upstream lists newest first.
pub fn first_commit(commits: &[Commit]) -> Option<&Commit> {
    commits.iter().rev().min_by_key(|c| c.created_on)
}

fn distinct<'a>(names: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    let mut seen = HashSet::new();
    names
        .filter(|name| !name.is_empty())
        .filter(|name| seen.insert(*name))
        .collect()
}
