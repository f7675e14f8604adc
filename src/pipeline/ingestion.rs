//! Single-writer commit loop
//!
//! Metric workers send fetched samples over an mpsc channel; this loop
//! is the only task that aggregates and commits to the state store, so
//! commits are serialized no matter how many workers run. It also owns
//! the heartbeat timer.

use super::aggregator::{aggregate, AggregationError};
use super::events::{EventSink, RunEvent};
use super::state_store::{StateStore, StateStoreError};
use super::types::{MetricSample, PostRef, RunCounts, RunStage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Samples gathered for one post during this run
#[derive(Debug, Clone)]
pub struct FetchedPost {
    pub post: PostRef,
    pub samples: Vec<MetricSample>,
}

/// Live counters and furthest stage reached, shared by every run task
#[derive(Debug)]
pub struct RunProgress {
    counts: Mutex<RunCounts>,
    stage: Mutex<RunStage>,
}

impl Default for RunProgress {
    fn default() -> Self {
        Self {
            counts: Mutex::new(RunCounts::default()),
            stage: Mutex::new(RunStage::Init),
        }
    }
}

impl RunProgress {
    pub fn record<F: FnOnce(&mut RunCounts)>(&self, update: F) {
        match self.counts.lock() {
            Ok(mut counts) => update(&mut counts),
            Err(poisoned) => update(&mut poisoned.into_inner()),
        }
    }

    pub fn counts(&self) -> RunCounts {
        match self.counts.lock() {
            Ok(counts) => counts.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Move the stage forward; never moves back
    pub fn advance(&self, stage: RunStage) {
        let mut current = match self.stage.lock() {
            Ok(current) => current,
            Err(poisoned) => poisoned.into_inner(),
        };
        if stage > *current {
            log::debug!("Run stage {:?} -> {:?}", *current, stage);
            *current = stage;
        }
    }

    pub fn stage(&self) -> RunStage {
        match self.stage.lock() {
            Ok(stage) => *stage,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Decides whether new work may start
///
/// Closes on the run deadline, on an external stop request, or when a
/// run-fatal error is raised. Work already started is left to finish.
#[derive(Debug)]
pub struct RunGate {
    stop: Arc<AtomicBool>,
    deadline: Instant,
    deadline_reached: AtomicBool,
    abort_reason: Mutex<Option<(RunStage, String)>>,
}

impl RunGate {
    pub fn new(stop: Arc<AtomicBool>, deadline: Instant) -> Self {
        Self {
            stop,
            deadline,
            deadline_reached: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        if self.stop.load(Ordering::SeqCst) || self.abort_reason().is_some() {
            return false;
        }
        if Instant::now() >= self.deadline {
            if !self.deadline_reached.swap(true, Ordering::SeqCst) {
                log::warn!("⏱️  Run deadline reached, no new fetches will start");
            }
            return false;
        }
        true
    }

    pub fn deadline_reached(&self) -> bool {
        self.deadline_reached.load(Ordering::SeqCst)
    }

    /// Record a run-fatal failure; the first reason wins
    pub fn abort(&self, stage: RunStage, reason: String) {
        let mut slot = match self.abort_reason.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_none() {
            log::error!("❌ Aborting run during {:?}: {}", stage, reason);
            *slot = Some((stage, reason));
        }
    }

    pub fn abort_reason(&self) -> Option<(RunStage, String)> {
        match self.abort_reason.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Drain fetched posts into the state store until every sender is gone
///
/// A state store failure closes the gate and ends the loop with the
/// error. Aggregation failures only fail that post.
pub async fn run_commit_loop(
    mut rx: mpsc::Receiver<FetchedPost>,
    store: Arc<StateStore>,
    ttl: Duration,
    progress: Arc<RunProgress>,
    gate: Arc<RunGate>,
    events: Arc<dyn EventSink>,
    heartbeat_every: Duration,
) -> Result<(), StateStoreError> {
    let heartbeat_every = heartbeat_every.max(Duration::from_millis(1));
    let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            fetched = rx.recv() => {
                let Some(fetched) = fetched else {
                    break;
                };
                if let Err(e) = commit_post(&store, ttl, &progress, events.as_ref(), fetched) {
                    gate.abort(progress.stage(), e.to_string());
                    return Err(e);
                }
            }

            _ = heartbeat.tick() => {
                events.emit(&RunEvent::RunHeartbeat {
                    stage: progress.stage(),
                    counts: progress.counts(),
                });
            }
        }
    }

    log::debug!("Commit loop drained");
    Ok(())
}

fn commit_post(
    store: &StateStore,
    ttl: Duration,
    progress: &RunProgress,
    events: &dyn EventSink,
    fetched: FetchedPost,
) -> Result<(), StateStoreError> {
    let FetchedPost { post, samples } = fetched;
    progress.advance(RunStage::Aggregating);

    let existing = store.get(&post.post_id)?;
    let aggregated = aggregate(existing.as_ref().map(|record| &record.row), &samples).and_then(|row| {
        if row.post_id == post.post_id {
            Ok(row)
        } else {
            Err(AggregationError::PostMismatch {
                expected: post.post_id.clone(),
                found: row.post_id,
            })
        }
    });
    let row = match aggregated {
        Ok(row) => row,
        Err(e) => {
            progress.record(|c| c.posts_failed += 1);
            events.emit(&RunEvent::PostFetchFailed {
                post_id: post.post_id.clone(),
                account_id: post.account_id.clone(),
                reason: e.to_string(),
            });
            return Ok(());
        }
    };

    let Some(fetched_at) = samples.iter().map(|s| s.fetched_at).max() else {
        return Ok(());
    };

    progress.advance(RunStage::Committing);
    store.commit(&post.post_id, row, fetched_at, ttl)?;
    progress.record(|c| c.posts_committed += 1);
    Ok(())
}
