use crate::types::{Commit, Tag};
use chrono::Duration;

pub const NOT_DEPLOYED: &str = "Not Deployed";

const HOURS_PER_DAY: i64 = 24;

/// Deployment fields of a metric record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deployment {
    pub lead_time: String,
    pub deployed_on: String,
    pub tag_version: String,
}

impl Deployment {
    pub fn not_deployed() -> Self {
        Self {
            lead_time: NOT_DEPLOYED.to_string(),
            deployed_on: String::new(),
            tag_version: String::new(),
        }
    }
}

/// Computes the lead time from a change's first commit to the earliest tag that shipped it.
///
/// `candidate_tags` are the tags whose target is the first commit. An empty set is the
/// undeployed state, not an error.
pub fn calculate_lead_time(first_commit: &Commit, candidate_tags: &[Tag]) -> Deployment {
    // min_by_key keeps the first of equal elements.
    let Some(earliest) = candidate_tags.iter().min_by_key(|tag| tag.created_at) else {
        return Deployment::not_deployed();
    };

    let diff = earliest.created_at - first_commit.created_on;

    Deployment {
        lead_time: format_lead_time(diff),
        deployed_on: earliest.created_at.to_rfc3339(),
        tag_version: earliest.name.clone(),
    }
}

/// Formats a duration as `"{days}d {hours}h"`, or `"{hours}h"` under one day.
///
/// Negative durations (clock skew between the commit and the tag) format as `"0h"`.
pub fn format_lead_time(diff: Duration) -> String {
    let total_hours = diff.num_hours().max(0);
    let days = total_hours / HOURS_PER_DAY;
    let hours = total_hours % HOURS_PER_DAY;

    if days >= 1 {
        format!("{}d {}h", days, hours)
    } else {
        format!("{}h", hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone, Utc};

    fn commit_at(hour: u32) -> Commit {
        Commit {
            hash: "abc123".to_string(),
            author: "dev".to_string(),
            message: "initial".to_string(),
            created_on: Utc
                .with_ymd_and_hms(2024, 1, 1, hour, 0, 0)
                .unwrap()
                .fixed_offset(),
            parents: vec![],
        }
    }

    fn tag(name: &str, day: u32, hour: u32) -> Tag {
        Tag {
            name: name.to_string(),
            created_at: Utc
                .with_ymd_and_hms(2024, 1, day, hour, 0, 0)
                .unwrap()
                .fixed_offset(),
            commit_hash: "abc123".to_string(),
        }
    }

    #[test]
    fn test_no_tags_is_not_deployed() {
        let result = calculate_lead_time(&commit_at(0), &[]);

        assert_eq!(result.lead_time, "Not Deployed");
        assert_eq!(result.deployed_on, "");
        assert_eq!(result.tag_version, "");
    }

    #[test]
    fn test_earliest_tag_wins_regardless_of_order() {
        let commit = commit_at(0);
        let tags = vec![tag("v1.2.0", 5, 0), tag("v1.1.0", 2, 2), tag("v1.3.0", 9, 0)];
        let mut reversed = tags.clone();
        reversed.reverse();

        let forward = calculate_lead_time(&commit, &tags);
        let backward = calculate_lead_time(&commit, &reversed);

        assert_eq!(forward, backward);
        assert_eq!(forward.tag_version, "v1.1.0");
        assert_eq!(forward.lead_time, "1d 2h");
        assert_eq!(forward.deployed_on, "2024-01-02T02:00:00+00:00");
    }

    #[test]
    fn test_equal_timestamps_keep_first_encountered() {
        let tags = vec![tag("release-a", 3, 0), tag("release-b", 3, 0)];
        let result = calculate_lead_time(&commit_at(0), &tags);
        assert_eq!(result.tag_version, "release-a");
    }

    #[test]
    fn test_format_lead_time() {
        assert_eq!(format_lead_time(Duration::hours(26)), "1d 2h");
        assert_eq!(format_lead_time(Duration::hours(3)), "3h");
        assert_eq!(format_lead_time(Duration::zero()), "0h");
        assert_eq!(format_lead_time(Duration::hours(48)), "2d 0h");
    }

    #[test]
    fn test_format_lead_time_truncates() {
        assert_eq!(format_lead_time(Duration::minutes(59)), "0h");
        assert_eq!(format_lead_time(Duration::minutes(26 * 60 + 59)), "1d 2h");
    }

    #[test]
    fn test_deployed_on_keeps_upstream_offset() {
        let mut release = tag("v2.0.0", 1, 0);
        release.created_at = FixedOffset::east_opt(2 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 1, 2, 4, 0, 0)
            .unwrap();

        let result = calculate_lead_time(&commit_at(0), &[release]);
        assert_eq!(result.deployed_on, "2024-01-02T04:00:00+02:00");
        assert_eq!(result.lead_time, "1d 2h");
    }

    #[test]
    fn test_tag_before_commit_does_not_panic() {
        let result = calculate_lead_time(&commit_at(12), &[tag("v0.9.0", 1, 3)]);
        assert_eq!(result.lead_time, "0h");
        assert_eq!(result.tag_version, "v0.9.0");
    }
}
