//! Structured run events
//!
//! The engine reports through an [`EventSink`] and never formats logs
//! itself. `LogEventSink` is the production sink.

use super::types::{RunCounts, RunStage, RunSummary};
use serde::Serialize;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        accounts: usize,
        posts_known: usize,
    },
    AccountSkipped {
        account_id: String,
        reason: String,
    },
    PostFetchFailed {
        post_id: String,
        account_id: String,
        reason: String,
    },
    PostFetchRetried {
        post_id: String,
        retries: u32,
    },
    RunHeartbeat {
        stage: RunStage,
        counts: RunCounts,
    },
    RowSyncFailed {
        rows: usize,
        reason: String,
    },
    RunCompleted {
        summary: RunSummary,
    },
    RunAborted {
        stage: RunStage,
        reason: String,
        summary: RunSummary,
    },
}

impl RunEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::RunStarted { .. } => "run_started",
            RunEvent::AccountSkipped { .. } => "account_skipped",
            RunEvent::PostFetchFailed { .. } => "post_fetch_failed",
            RunEvent::PostFetchRetried { .. } => "post_fetch_retried",
            RunEvent::RunHeartbeat { .. } => "run_heartbeat",
            RunEvent::RowSyncFailed { .. } => "row_sync_failed",
            RunEvent::RunCompleted { .. } => "run_completed",
            RunEvent::RunAborted { .. } => "run_aborted",
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &RunEvent);
}

/// Writes `event=<name> <json>` lines to the `threadflow::events` target
#[derive(Debug, Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, event: &RunEvent) {
        let payload = serde_json::to_string(event).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e));
        let level = match event {
            RunEvent::AccountSkipped { .. }
            | RunEvent::PostFetchFailed { .. }
            | RunEvent::RowSyncFailed { .. } => log::Level::Warn,
            RunEvent::RunAborted { .. } => log::Level::Error,
            RunEvent::PostFetchRetried { .. } => log::Level::Debug,
            _ => log::Level::Info,
        };
        log::log!(target: "threadflow::events", level, "event={} {}", event.name(), payload);
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RunEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn named(&self, name: &str) -> Vec<RunEvent> {
        self.events().into_iter().filter(|e| e.name() == name).collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &RunEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}
