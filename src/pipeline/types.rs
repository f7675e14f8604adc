//! Core data structures for the metrics pipeline
//!
//! Rows keep unset metrics as `None` all the way to the row store so
//! "no data" never reads as "zero engagement".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// One platform identity whose posts are tracked
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    pub token: String,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("account_id", &self.account_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// A post discovered while enumerating an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRef {
    pub account_id: String,
    pub post_id: String,
    pub permalink: Option<String>,
    /// `after` cursor of the page this post came from
    pub cursor: Option<String>,
}

/// Canonical engagement metrics written to the destination store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricField {
    Views,
    Likes,
    Replies,
    Reposts,
    Quotes,
}

impl MetricField {
    pub const ALL: [MetricField; 5] = [
        MetricField::Views,
        MetricField::Likes,
        MetricField::Replies,
        MetricField::Reposts,
        MetricField::Quotes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricField::Views => "views",
            MetricField::Likes => "likes",
            MetricField::Replies => "replies",
            MetricField::Reposts => "reposts",
            MetricField::Quotes => "quotes",
        }
    }

    /// Map a platform metric name onto a canonical field
    ///
    /// Listing counters (`like_count`, ...) map onto the same fields as
    /// their insights counterparts.
    pub fn from_api_name(name: &str) -> Option<Self> {
        match name {
            "views" => Some(MetricField::Views),
            "likes" | "like_count" => Some(MetricField::Likes),
            "replies" | "reply_count" => Some(MetricField::Replies),
            "reposts" | "repost_count" => Some(MetricField::Reposts),
            "quotes" | "quote_count" => Some(MetricField::Quotes),
            _ => None,
        }
    }
}

impl fmt::Display for MetricField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a sample was read from, weakest first
///
/// Listing counters are a coarse snapshot; an insights read of the same
/// post at the same instant overrides them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleSource {
    Listing,
    #[default]
    Insights,
}

/// One reading of a post's metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSample {
    pub post_id: String,
    pub account_id: String,
    pub values: BTreeMap<MetricField, u64>,
    pub permalink: Option<String>,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub source: SampleSource,
}

/// Nullable canonical metric fields
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementMetrics {
    pub views: Option<u64>,
    pub likes: Option<u64>,
    pub replies: Option<u64>,
    pub reposts: Option<u64>,
    pub quotes: Option<u64>,
}

impl EngagementMetrics {
    pub fn get(&self, field: MetricField) -> Option<u64> {
        match field {
            MetricField::Views => self.views,
            MetricField::Likes => self.likes,
            MetricField::Replies => self.replies,
            MetricField::Reposts => self.reposts,
            MetricField::Quotes => self.quotes,
        }
    }

    pub fn set(&mut self, field: MetricField, value: Option<u64>) {
        let slot = match field {
            MetricField::Views => &mut self.views,
            MetricField::Likes => &mut self.likes,
            MetricField::Replies => &mut self.replies,
            MetricField::Reposts => &mut self.reposts,
            MetricField::Quotes => &mut self.quotes,
        };
        *slot = value;
    }
}

/// Destination row for one post
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedRow {
    pub post_id: String,
    pub account_id: String,
    pub permalink: Option<String>,
    pub metrics: EngagementMetrics,
    pub updated_at: DateTime<Utc>,
}

impl AggregatedRow {
    /// SHA-256 of the row's JSON form, hex encoded
    pub fn checksum(&self) -> Result<String, serde_json::Error> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

/// Durable per-post progress kept by the state store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub last_fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub row: AggregatedRow,
    pub checksum: String,
    /// Whether the row store accepted this row
    #[serde(default)]
    pub synced: bool,
}

impl ProgressRecord {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Pipeline stage, in run order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Init,
    Enumerating,
    Fetching,
    Aggregating,
    Committing,
    Reporting,
    Done,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Aborted { reason: String },
}

/// Counters shared between the heartbeat and the final summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub accounts_total: u64,
    pub accounts_skipped: u64,
    pub posts_seen: u64,
    pub posts_skipped: u64,
    pub posts_fetched: u64,
    pub posts_committed: u64,
    pub posts_failed: u64,
    pub post_fetch_retried: u64,
}

/// Outcome of one pipeline execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    #[serde(flatten)]
    pub counts: RunCounts,
    pub rows_synced: u64,
    pub sync_failed: bool,
    pub deadline_reached: bool,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
    pub stage: RunStage,
    pub status: RunStatus,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
