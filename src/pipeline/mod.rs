//! # Engagement metrics pipeline
//!
//! One run walks a fixed shape:
//! 1. Load accounts from the account source and the prior state snapshot
//! 2. Enumerate each account's posts concurrently (`fetcher`)
//! 3. Fetch metrics for every post whose cached row has expired
//! 4. Aggregate samples with the cached row and commit (`ingestion`)
//! 5. Hand unsynced rows to the row store in one batch (`engine`)
//!
//! Every platform request passes through the shared `RateLimiter` and a
//! `RetryPolicy`. The state file is the only durable state; it is
//! rewritten atomically on every commit, so an interrupted run resumes
//! from the last committed post.
//!
//! ## Module Organization
//!
//! - `types` - Accounts, posts, samples, rows, run summary
//! - `rate_limiter` - Concurrency permits and global request pacing
//! - `retry` - Backoff with jitter and failure classification
//! - `state_store` - Crash-atomic state file and run lock
//! - `threads_api` - HTTP client for the platform API
//! - `fetcher` - Rate-limited, retried listing and metrics reads
//! - `aggregator` - Most-recent-wins merge into destination rows
//! - `ingestion` - Single-writer commit loop and heartbeat
//! - `engine` - Run orchestration
//! - `events` - Structured run events
//! - `db` - Account source and row store collaborators

pub mod aggregator;
pub mod db;
pub mod engine;
pub mod events;
pub mod fetcher;
pub mod ingestion;
pub mod rate_limiter;
pub mod retry;
pub mod state_store;
pub mod threads_api;
pub mod types;

// Re-export commonly used types
pub use aggregator::{aggregate, AggregationError};
pub use db::{AccountSource, RowStoreError, RowStoreWriter, SqliteSheetStore};
pub use engine::Pipeline;
pub use events::{EventSink, LogEventSink, RecordingSink, RunEvent};
pub use fetcher::Fetcher;
pub use rate_limiter::RateLimiter;
pub use retry::{RetryError, RetryPolicy};
pub use state_store::{RunLock, StateStore, StateStoreError};
pub use threads_api::{FetchError, ThreadsApi, ThreadsClient};
pub use types::{AggregatedRow, MetricSample, RunStatus, RunSummary};
