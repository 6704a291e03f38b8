//! Transient data fetched from the code-hosting service for a single collection pass.
//!
//! Timestamps keep the offset they were reported with, so rendered values match upstream.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a pull request as reported upstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PrState {
    Open,
    Merged,
    Declined,
    Superseded,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PullRequest {
    pub id: u64,
    pub title: String,
    pub author: String,
    pub state: PrState,
    pub created_on: DateTime<FixedOffset>,
    pub merged_on: Option<DateTime<FixedOffset>>,
    pub source_branch: String,
    pub destination_branch: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Comment {
    pub id: u64,
    pub author: String,
    pub content: String,
    pub created_on: DateTime<FixedOffset>,
    /// Parent comment id for threaded replies.
    pub parent: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    pub hash: String,
    pub author: String,
    pub message: String,
    pub created_on: DateTime<FixedOffset>,
    pub parents: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    pub created_at: DateTime<FixedOffset>,
    /// Hash of the commit the tag points to.
    pub commit_hash: String,
}
