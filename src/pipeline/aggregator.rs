//! Merge metric samples into destination rows
//!
//! For every canonical field the most recent sample that defines it
//! wins. Recency is the sample's `fetched_at`; on equal timestamps an
//! insights read beats a listing counter, then the lower account id
//! wins, so the result never depends on arrival order. A prior row takes
//! part as a sample dated at its `updated_at` that loses every tie
//! against fresh samples.

use super::types::{AggregatedRow, EngagementMetrics, MetricField, MetricSample, SampleSource};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregationError {
    #[error("no samples to aggregate")]
    NoSamples,

    #[error("sample for post {found} mixed into aggregation of post {expected}")]
    PostMismatch { expected: String, found: String },
}

/// One input to the merge, borrowed from either a sample or the prior row
struct Candidate<'a> {
    at: DateTime<Utc>,
    account_id: &'a str,
    /// `None` for the prior row
    source: Option<SampleSource>,
    values: BTreeMap<MetricField, u64>,
    permalink: Option<&'a str>,
}

impl Candidate<'_> {
    /// Ascending: later candidates override earlier ones
    fn precedence(&self, other: &Self) -> Ordering {
        self.at
            .cmp(&other.at)
            .then_with(|| self.source.cmp(&other.source))
            // Lower account id wins the tie, so it must sort last
            .then_with(|| other.account_id.cmp(self.account_id))
            .then_with(|| self.values.cmp(&other.values))
            .then_with(|| self.permalink.cmp(&other.permalink))
    }
}

/// Build a new row from `samples`, falling back to `existing` for fields
/// no sample defines
pub fn aggregate(
    existing: Option<&AggregatedRow>,
    samples: &[MetricSample],
) -> Result<AggregatedRow, AggregationError> {
    let post_id = match (existing, samples.first()) {
        (Some(row), _) => row.post_id.as_str(),
        (None, Some(sample)) => sample.post_id.as_str(),
        (None, None) => return Err(AggregationError::NoSamples),
    };

    if let Some(stray) = samples.iter().find(|s| s.post_id != post_id) {
        return Err(AggregationError::PostMismatch {
            expected: post_id.to_string(),
            found: stray.post_id.clone(),
        });
    }

    let mut candidates: Vec<Candidate<'_>> = samples
        .iter()
        .map(|sample| Candidate {
            at: sample.fetched_at,
            account_id: &sample.account_id,
            source: Some(sample.source),
            values: sample.values.clone(),
            permalink: sample.permalink.as_deref(),
        })
        .collect();

    if let Some(row) = existing {
        candidates.push(Candidate {
            at: row.updated_at,
            account_id: &row.account_id,
            source: None,
            values: MetricField::ALL
                .iter()
                .filter_map(|field| row.metrics.get(*field).map(|v| (*field, v)))
                .collect(),
            permalink: row.permalink.as_deref(),
        });
    }

    candidates.sort_by(|a, b| a.precedence(b));

    let mut metrics = EngagementMetrics::default();
    let mut permalink = None;
    for candidate in &candidates {
        for (field, value) in &candidate.values {
            metrics.set(*field, Some(*value));
        }
        if candidate.permalink.is_some() {
            permalink = candidate.permalink;
        }
    }

    let latest = candidates.last().ok_or(AggregationError::NoSamples)?;

    Ok(AggregatedRow {
        post_id: post_id.to_string(),
        account_id: latest.account_id.to_string(),
        permalink: permalink.map(str::to_string),
        metrics,
        updated_at: latest.at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn sample(account: &str, secs: i64, values: &[(MetricField, u64)]) -> MetricSample {
        MetricSample {
            post_id: "p1".to_string(),
            account_id: account.to_string(),
            values: values.iter().copied().collect(),
            permalink: None,
            fetched_at: at(secs),
            source: SampleSource::Insights,
        }
    }

    fn existing_row() -> AggregatedRow {
        AggregatedRow {
            post_id: "p1".to_string(),
            account_id: "acc".to_string(),
            permalink: Some("/@acc/post/p1".to_string()),
            metrics: EngagementMetrics {
                views: Some(50),
                quotes: Some(1),
                ..Default::default()
            },
            updated_at: at(-3600),
        }
    }

    #[test]
    fn test_most_recent_sample_wins_per_field() {
        let older = sample("acc", 10, &[(MetricField::Likes, 3), (MetricField::Views, 90)]);
        let newer = sample("acc", 20, &[(MetricField::Likes, 5)]);

        let row = aggregate(None, &[older, newer]).unwrap();
        assert_eq!(row.metrics.likes, Some(5));
        assert_eq!(row.metrics.views, Some(90));
        assert_eq!(row.updated_at, at(20));
    }

    #[test]
    fn test_order_independent() {
        let existing = existing_row();
        let a = sample("acc", 10, &[(MetricField::Likes, 3), (MetricField::Replies, 1)]);
        let b = sample("acc", 20, &[(MetricField::Likes, 7)]);

        let ab = aggregate(Some(&existing), &[a.clone(), b.clone()]).unwrap();
        let ba = aggregate(Some(&existing), &[b, a]).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.metrics.likes, Some(7));
    }

    #[test]
    fn test_timestamp_tie_goes_to_lower_account() {
        let a = sample("alpha", 10, &[(MetricField::Views, 1)]);
        let b = sample("beta", 10, &[(MetricField::Views, 2)]);

        let ab = aggregate(None, &[a.clone(), b.clone()]).unwrap();
        let ba = aggregate(None, &[b, a]).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.metrics.views, Some(1));
        assert_eq!(ab.account_id, "alpha");
    }

    #[test]
    fn test_insights_beat_listing_counters_at_same_instant() {
        let mut listing = sample("acc", 10, &[(MetricField::Likes, 3)]);
        listing.source = SampleSource::Listing;
        let insights = sample("acc", 10, &[(MetricField::Views, 100), (MetricField::Likes, 7)]);

        let forward = aggregate(None, &[listing.clone(), insights.clone()]).unwrap();
        let reverse = aggregate(None, &[insights, listing]).unwrap();
        assert_eq!(forward, reverse);
        assert_eq!(forward.metrics.likes, Some(7));
        assert_eq!(forward.metrics.views, Some(100));
    }

    #[test]
    fn test_missing_fields_stay_null() {
        let row = aggregate(None, &[sample("acc", 0, &[(MetricField::Likes, 0)])]).unwrap();
        assert_eq!(row.metrics.likes, Some(0));
        assert_eq!(row.metrics.views, None);
        assert_eq!(row.metrics.replies, None);
        assert_eq!(row.metrics.reposts, None);
        assert_eq!(row.metrics.quotes, None);
    }

    #[test]
    fn test_existing_row_fills_gaps_without_mutation() {
        let existing = existing_row();
        let before = existing.clone();

        let row = aggregate(Some(&existing), &[sample("acc", 0, &[(MetricField::Views, 80)])]).unwrap();
        assert_eq!(row.metrics.views, Some(80));
        assert_eq!(row.metrics.quotes, Some(1));
        assert_eq!(row.permalink.as_deref(), Some("/@acc/post/p1"));
        assert_eq!(row.updated_at, at(0));
        assert_eq!(existing, before);
    }

    #[test]
    fn test_rejects_empty_and_mismatched_input() {
        assert_eq!(aggregate(None, &[]), Err(AggregationError::NoSamples));

        let mut stray = sample("acc", 0, &[]);
        stray.post_id = "p2".to_string();
        let err = aggregate(Some(&existing_row()), &[stray]).unwrap_err();
        assert!(matches!(err, AggregationError::PostMismatch { .. }));
    }
}
