//! Pipeline engine: one run from account enumeration to row handoff
//!
//! Task layout for a run:
//! - one enumerator per account, paging posts and queueing those that
//!   are due
//! - a fixed pool of metric workers sharing one work queue
//! - the single-writer commit loop (see `ingestion`)
//!
//! Only the shared [`RateLimiter`] bounds network concurrency; the worker
//! count may exceed its permits. Account- and post-scoped failures are
//! counted and skipped; state store failures abort the run.

use super::db::{AccountSource, RowStoreWriter};
use super::events::{EventSink, RunEvent};
use super::fetcher::{Clock, EnumeratedPost, Fetcher};
use super::ingestion::{run_commit_loop, FetchedPost, RunGate, RunProgress};
use super::rate_limiter::RateLimiter;
use super::retry::RetryPolicy;
use super::state_store::{StateStore, StateStoreError};
use super::threads_api::ThreadsApi;
use super::types::{Account, MetricSample, PostRef, RunStage, RunStatus, RunSummary};
use crate::config::{ConfigError, RuntimeConfig};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// One queued metrics fetch
#[derive(Debug, Clone)]
struct WorkItem {
    account: Arc<Account>,
    post: PostRef,
    listing_sample: Option<MetricSample>,
}

/// Shared, cheaply cloned handles every run task needs
#[derive(Clone)]
struct RunContext {
    fetcher: Arc<Fetcher>,
    store: Arc<StateStore>,
    progress: Arc<RunProgress>,
    gate: Arc<RunGate>,
    events: Arc<dyn EventSink>,
    dispatched: Arc<Mutex<HashSet<String>>>,
    now_fn: Clock,
    max_pages: u32,
}

pub struct Pipeline {
    config: RuntimeConfig,
    api: Arc<dyn ThreadsApi>,
    accounts: Arc<dyn AccountSource>,
    writer: Arc<dyn RowStoreWriter>,
    store: Arc<StateStore>,
    events: Arc<dyn EventSink>,
    limiter: Arc<RateLimiter>,
    retry: Arc<RetryPolicy>,
    now_fn: Clock,
}

impl Pipeline {
    pub fn new(
        config: RuntimeConfig,
        api: Arc<dyn ThreadsApi>,
        accounts: Arc<dyn AccountSource>,
        writer: Arc<dyn RowStoreWriter>,
        store: Arc<StateStore>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, ConfigError> {
        let limiter = RateLimiter::from_config(config.max_concurrency, config.min_request_spacing)?;
        let retry = RetryPolicy::from_config(&config.retry);

        Ok(Self {
            config,
            api,
            accounts,
            writer,
            store,
            events,
            limiter: Arc::new(limiter),
            retry: Arc::new(retry),
            now_fn: Arc::new(Utc::now),
        })
    }

    /// Replace the retry policy (seeded jitter in tests)
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Arc::new(retry);
        self
    }

    /// Replace the wall clock used for TTL checks and sample timestamps
    pub fn with_clock(mut self, now_fn: Clock) -> Self {
        self.now_fn = now_fn;
        self
    }

    /// Execute one run
    ///
    /// Always returns a summary; setting `stop` behaves like reaching the
    /// deadline.
    pub async fn run(&self, stop: Arc<AtomicBool>) -> RunSummary {
        let started = Instant::now();
        let progress = Arc::new(RunProgress::default());
        let gate = Arc::new(RunGate::new(stop, started + self.config.run_timeout));

        log::info!("🚀 Starting metrics run");
        log::info!("   ├─ Concurrency: {} permits, {} workers", self.config.max_concurrency, self.config.workers);
        log::info!("   ├─ Min spacing: {:?}", self.config.min_request_spacing);
        log::info!("   └─ Deadline: {:?}", self.config.run_timeout);

        let accounts = match self.accounts.load_accounts().await {
            Ok(accounts) => accounts,
            Err(e) => {
                gate.abort(RunStage::Init, format!("failed to load accounts: {}", e));
                return self.finish(started, &progress, &gate, 0, false);
            }
        };
        let known = match self.store.load_all() {
            Ok(known) => known,
            Err(e) => {
                gate.abort(RunStage::Init, e.to_string());
                return self.finish(started, &progress, &gate, 0, false);
            }
        };

        progress.record(|c| c.accounts_total = accounts.len() as u64);
        self.events.emit(&RunEvent::RunStarted {
            accounts: accounts.len(),
            posts_known: known.len(),
        });
        drop(known);

        progress.advance(RunStage::Enumerating);
        self.collect(accounts, &progress, &gate).await;

        if gate.abort_reason().is_some() {
            return self.finish(started, &progress, &gate, 0, false);
        }

        progress.advance(RunStage::Reporting);
        let (rows_synced, sync_failed) = self.report(&gate).await;
        self.finish(started, &progress, &gate, rows_synced, sync_failed)
    }

    /// Enumerate, fetch and commit until every task has drained
    async fn collect(&self, accounts: Vec<Account>, progress: &Arc<RunProgress>, gate: &Arc<RunGate>) {
        let fetcher = Arc::new(Fetcher::new(
            Arc::clone(&self.api),
            Arc::clone(&self.limiter),
            Arc::clone(&self.retry),
            self.config.page_limit,
            Arc::clone(&self.now_fn),
        ));
        let ctx = RunContext {
            fetcher,
            store: Arc::clone(&self.store),
            progress: Arc::clone(progress),
            gate: Arc::clone(gate),
            events: Arc::clone(&self.events),
            dispatched: Arc::new(Mutex::new(HashSet::new())),
            now_fn: Arc::clone(&self.now_fn),
            max_pages: self.config.max_pages,
        };

        let queue_depth = self.config.workers.max(1) * 4;
        let (work_tx, work_rx) = mpsc::channel::<WorkItem>(queue_depth);
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        let (result_tx, result_rx) = mpsc::channel::<FetchedPost>(queue_depth);

        let commit_loop = tokio::spawn(run_commit_loop(
            result_rx,
            Arc::clone(&self.store),
            self.config.metrics_ttl,
            Arc::clone(progress),
            Arc::clone(gate),
            Arc::clone(&self.events),
            self.config.heartbeat_interval,
        ));

        let mut workers = JoinSet::new();
        for _ in 0..self.config.workers.max(1) {
            workers.spawn(metrics_worker(ctx.clone(), Arc::clone(&work_rx), result_tx.clone()));
        }
        drop(result_tx);

        let mut enumerators = JoinSet::new();
        for account in accounts {
            let account_id = account.account_id.clone();
            let task = enumerate_account(ctx.clone(), Arc::new(account), work_tx.clone());
            enumerators.spawn(async move { (account_id, task.await) });
        }
        drop(work_tx);

        while let Some(joined) = enumerators.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((account_id, Err(e))) => {
                    gate.abort(RunStage::Enumerating, format!("state store failed for {}: {}", account_id, e));
                }
                Err(e) => {
                    log::error!("❌ Enumerator task failed: {}", e);
                    progress.record(|c| c.accounts_skipped += 1);
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                log::error!("❌ Metrics worker failed: {}", e);
            }
        }

        match commit_loop.await {
            Ok(Ok(())) => {}
            // The loop already closed the gate with its reason
            Ok(Err(_)) => {}
            Err(e) => gate.abort(RunStage::Committing, format!("commit loop failed: {}", e)),
        }
    }

    /// Hand unsynced rows to the row store in one batch
    ///
    /// Writer failures are warnings; the rows stay unsynced for the next
    /// run. State store failures abort.
    async fn report(&self, gate: &RunGate) -> (u64, bool) {
        let rows = match self.store.unsynced_rows() {
            Ok(rows) => rows,
            Err(e) => {
                gate.abort(RunStage::Reporting, e.to_string());
                return (0, false);
            }
        };
        if rows.is_empty() {
            log::info!("📭 No rows to sync");
            return (0, false);
        }

        let count = rows.len();
        match self.writer.upsert_rows(rows.clone()).await {
            Ok(written) => {
                if let Err(e) = self.store.mark_synced(&rows, (self.now_fn)()) {
                    gate.abort(RunStage::Reporting, e.to_string());
                    return (0, false);
                }
                log::info!("✅ Synced {} rows to the row store", written);
                (written as u64, false)
            }
            Err(e) => {
                log::warn!("⚠️  Row store rejected {} rows, will retry next run: {}", count, e);
                self.events.emit(&RunEvent::RowSyncFailed {
                    rows: count,
                    reason: e.to_string(),
                });
                (0, true)
            }
        }
    }

    fn finish(
        &self,
        started: Instant,
        progress: &RunProgress,
        gate: &RunGate,
        rows_synced: u64,
        sync_failed: bool,
    ) -> RunSummary {
        let mut summary = RunSummary {
            counts: progress.counts(),
            rows_synced,
            sync_failed,
            deadline_reached: gate.deadline_reached(),
            elapsed: started.elapsed(),
            stage: RunStage::Done,
            status: RunStatus::Completed,
        };

        match gate.abort_reason() {
            Some((stage, reason)) => {
                summary.stage = RunStage::Aborted;
                summary.status = RunStatus::Aborted {
                    reason: reason.clone(),
                };
                self.events.emit(&RunEvent::RunAborted {
                    stage,
                    reason,
                    summary: summary.clone(),
                });
            }
            None => {
                progress.advance(RunStage::Done);
                log::info!(
                    "✅ Run complete: {} committed, {} skipped, {} failed in {:.1}s",
                    summary.counts.posts_committed,
                    summary.counts.posts_skipped,
                    summary.counts.posts_failed,
                    summary.elapsed.as_secs_f64()
                );
                self.events.emit(&RunEvent::RunCompleted {
                    summary: summary.clone(),
                });
            }
        }
        summary
    }
}

/// Page through one account and queue every due post
///
/// Listing failures skip the account. Only state store errors surface.
async fn enumerate_account(
    ctx: RunContext,
    account: Arc<Account>,
    work_tx: mpsc::Sender<WorkItem>,
) -> Result<(), StateStoreError> {
    let resume_after = ctx.store.cursor(&account.account_id)?;
    if let Some(cursor) = &resume_after {
        log::info!("↪️  Resuming {} after cursor {}", account.account_id, cursor);
    }

    let mut pager = ctx.fetcher.list_posts(&account, resume_after);
    loop {
        if !ctx.gate.is_open() || pager.pages_fetched() >= ctx.max_pages {
            break;
        }

        let page = match pager.next_page().await {
            Ok(Some(page)) => page,
            Ok(None) => break,
            Err(e) => {
                ctx.progress.record(|c| c.accounts_skipped += 1);
                ctx.events.emit(&RunEvent::AccountSkipped {
                    account_id: account.account_id.clone(),
                    reason: e.to_string(),
                });
                return Ok(());
            }
        };

        for EnumeratedPost { post, listing_sample } in page {
            ctx.progress.record(|c| c.posts_seen += 1);

            let first_sighting = match ctx.dispatched.lock() {
                Ok(mut seen) => seen.insert(post.post_id.clone()),
                Err(poisoned) => poisoned.into_inner().insert(post.post_id.clone()),
            };
            if !first_sighting || !ctx.store.is_due(&post.post_id, (ctx.now_fn)())? {
                ctx.progress.record(|c| c.posts_skipped += 1);
                continue;
            }

            let item = WorkItem {
                account: Arc::clone(&account),
                post,
                listing_sample,
            };
            if work_tx.send(item).await.is_err() {
                return Ok(());
            }
        }
    }

    if pager.is_exhausted() {
        ctx.store.clear_cursor(&account.account_id)?;
    } else if let Some(cursor) = pager.cursor() {
        log::info!(
            "⏸️  Enumeration of {} stopped after {} pages, saving cursor",
            account.account_id,
            pager.pages_fetched()
        );
        ctx.store.set_cursor(&account.account_id, cursor)?;
    }
    Ok(())
}

/// Pull work items until the queue closes, fetching while the gate is open
async fn metrics_worker(
    ctx: RunContext,
    work_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
    result_tx: mpsc::Sender<FetchedPost>,
) {
    loop {
        let item = {
            let mut rx = work_rx.lock().await;
            rx.recv().await
        };
        let Some(WorkItem {
            account,
            post,
            listing_sample,
        }) = item
        else {
            break;
        };

        // Drain without fetching once the gate has closed
        if !ctx.gate.is_open() {
            log::debug!("Deferring {} to the next run", post.post_id);
            ctx.progress.record(|c| c.posts_skipped += 1);
            continue;
        }

        ctx.progress.advance(RunStage::Fetching);
        match ctx.fetcher.fetch_metrics(&account, &post).await {
            Ok(attempted) => {
                ctx.progress.record(|c| {
                    c.posts_fetched += 1;
                    c.post_fetch_retried += u64::from(attempted.retries);
                });
                if attempted.retries > 0 {
                    ctx.events.emit(&RunEvent::PostFetchRetried {
                        post_id: post.post_id.clone(),
                        retries: attempted.retries,
                    });
                }

                let samples = listing_sample.into_iter().chain([attempted.value]).collect();
                if result_tx.send(FetchedPost { post, samples }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                ctx.progress.record(|c| c.posts_failed += 1);
                ctx.events.emit(&RunEvent::PostFetchFailed {
                    post_id: post.post_id.clone(),
                    account_id: account.account_id.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }
}
