//! End-to-end runs against in-memory collaborators
//!
//! The platform, account source and row store are fakes; the state store
//! is the real file-backed one in a temp dir. Tests run on a paused tokio
//! clock so backoff sleeps and deadlines resolve instantly.

#[cfg(test)]
mod pipeline_integration_tests {
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::{BTreeMap, HashMap};
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use threadflow::config::RuntimeConfig;
    use threadflow::pipeline::db::{AccountSource, RowStoreError, RowStoreWriter};
    use threadflow::pipeline::events::RecordingSink;
    use threadflow::pipeline::fetcher::Clock;
    use threadflow::pipeline::threads_api::{FetchError, ListedPost, PostPage, ThreadsApi};
    use threadflow::pipeline::types::{
        Account, AggregatedRow, MetricField, PostRef, RunStage, RunStatus,
    };
    use threadflow::pipeline::{Pipeline, RetryPolicy, StateStore};

    /// Platform fake: pages of post ids per token, scripted insight failures
    #[derive(Default)]
    struct FakeThreads {
        pages: HashMap<String, Vec<Vec<&'static str>>>,
        rejected_tokens: Vec<String>,
        insight_failures: Mutex<HashMap<String, u32>>,
        insight_calls: AtomicU32,
        page_delay: Duration,
    }

    impl FakeThreads {
        fn with_account(mut self, token: &str, pages: Vec<Vec<&'static str>>) -> Self {
            self.pages.insert(token.to_string(), pages);
            self
        }

        fn rejecting(mut self, token: &str) -> Self {
            self.rejected_tokens.push(token.to_string());
            self
        }

        fn failing_insights(self, post_id: &str, times: u32) -> Self {
            self.insight_failures
                .lock()
                .unwrap()
                .insert(post_id.to_string(), times);
            self
        }
    }

    #[async_trait]
    impl ThreadsApi for FakeThreads {
        async fn list_posts_page(
            &self,
            account: &Account,
            after: Option<&str>,
            _limit: u32,
        ) -> Result<PostPage, FetchError> {
            if !self.page_delay.is_zero() {
                tokio::time::sleep(self.page_delay).await;
            }
            if self.rejected_tokens.contains(&account.token) {
                return Err(FetchError::Auth {
                    status: 401,
                    message: "Invalid OAuth access token".to_string(),
                });
            }

            let pages = self.pages.get(&account.token).cloned().unwrap_or_default();
            let index = after
                .and_then(|c| c.strip_prefix("page-"))
                .and_then(|n| n.parse::<usize>().ok())
                .unwrap_or(0);
            let posts = pages
                .get(index)
                .map(|ids| {
                    ids.iter()
                        .map(|id| ListedPost {
                            post_id: id.to_string(),
                            permalink: Some(format!("/@{}/post/{}", account.account_id, id)),
                            counts: BTreeMap::from([(MetricField::Likes, 1)]),
                        })
                        .collect()
                })
                .unwrap_or_default();
            let next_cursor = (index + 1 < pages.len()).then(|| format!("page-{}", index + 1));

            Ok(PostPage { posts, next_cursor })
        }

        async fn fetch_insights(
            &self,
            _account: &Account,
            post: &PostRef,
        ) -> Result<BTreeMap<MetricField, u64>, FetchError> {
            self.insight_calls.fetch_add(1, Ordering::SeqCst);

            {
                let mut failures = self.insight_failures.lock().unwrap();
                if let Some(remaining) = failures.get_mut(&post.post_id) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(FetchError::Server {
                            status: 503,
                            message: "Service temporarily unavailable".to_string(),
                        });
                    }
                }
            }

            Ok(BTreeMap::from([
                (MetricField::Views, 100),
                (MetricField::Likes, 7),
                (MetricField::Replies, 0),
            ]))
        }
    }

    struct StaticAccounts(Vec<Account>);

    #[async_trait]
    impl AccountSource for StaticAccounts {
        async fn load_accounts(&self) -> Result<Vec<Account>, RowStoreError> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct RecordingWriter {
        batches: Mutex<Vec<Vec<AggregatedRow>>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl RowStoreWriter for RecordingWriter {
        async fn upsert_rows(&self, rows: Vec<AggregatedRow>) -> Result<usize, RowStoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(RowStoreError::Unavailable("quota exceeded".to_string()));
            }
            let count = rows.len();
            self.batches.lock().unwrap().push(rows);
            Ok(count)
        }
    }

    fn account(id: &str, token: &str) -> Account {
        Account {
            account_id: id.to_string(),
            token: token.to_string(),
        }
    }

    fn config(dir: &Path, overrides: &[(&str, &str)]) -> RuntimeConfig {
        let mut vars: HashMap<String, String> = HashMap::from([
            (
                "THREADS_STATE_FILE".to_string(),
                dir.join("state.json").display().to_string(),
            ),
            ("THREADS_CONCURRENCY".to_string(), "2".to_string()),
            ("THREADS_MIN_SPACING_MS".to_string(), "0".to_string()),
            ("THREADS_RETRY_BASE_MS".to_string(), "10".to_string()),
            ("THREADS_RETRY_MAX_DELAY_MS".to_string(), "100".to_string()),
        ]);
        for (key, value) in overrides {
            vars.insert(key.to_string(), value.to_string());
        }
        RuntimeConfig::from_lookup(|key| vars.get(key).cloned()).unwrap()
    }

    /// Clock advancing one second per reading
    fn ticking_clock() -> Clock {
        let start: DateTime<Utc> = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let ticks = Arc::new(AtomicI64::new(0));
        Arc::new(move || start + chrono::Duration::seconds(ticks.fetch_add(1, Ordering::SeqCst)))
    }

    struct Harness {
        pipeline: Pipeline,
        api: Arc<FakeThreads>,
        writer: Arc<RecordingWriter>,
        store: Arc<StateStore>,
        sink: Arc<RecordingSink>,
    }

    fn harness(config: RuntimeConfig, api: FakeThreads, accounts: Vec<Account>) -> Harness {
        let api = Arc::new(api);
        let writer = Arc::new(RecordingWriter::default());
        let store = Arc::new(StateStore::open(&config.state_file).unwrap());
        let sink = Arc::new(RecordingSink::new());

        let pipeline = Pipeline::new(
            config,
            api.clone(),
            Arc::new(StaticAccounts(accounts)),
            writer.clone(),
            store.clone(),
            sink.clone(),
        )
        .unwrap()
        .with_retry_policy(RetryPolicy::with_seed(
            3,
            Duration::from_millis(10),
            Duration::from_millis(100),
            7,
        ))
        .with_clock(ticking_clock());

        Harness {
            pipeline,
            api,
            writer,
            store,
            sink,
        }
    }

    fn no_stop() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_token_skips_only_that_account() {
        let dir = tempfile::tempdir().unwrap();
        let api = FakeThreads::default()
            .with_account("good-token", vec![vec!["g1", "g2"], vec!["g3"]])
            .rejecting("bad-token");
        let h = harness(
            config(dir.path(), &[]),
            api,
            vec![account("broken", "bad-token"), account("writer", "good-token")],
        );

        let summary = h.pipeline.run(no_stop()).await;

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.stage, RunStage::Done);
        assert_eq!(summary.counts.accounts_total, 2);
        assert_eq!(summary.counts.accounts_skipped, 1);
        assert_eq!(summary.counts.posts_committed, 3);
        assert_eq!(summary.rows_synced, 3);

        let skipped = h.sink.named("account_skipped");
        assert_eq!(skipped.len(), 1);
        assert_eq!(h.sink.named("run_completed").len(), 1);

        let batches = h.writer.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);

        // Insights sample is newer than the listing counter
        let record = h.store.get("g1").unwrap().unwrap();
        assert_eq!(record.row.metrics.likes, Some(7));
        assert_eq!(record.row.metrics.views, Some(100));
        assert_eq!(record.row.metrics.quotes, None);
        assert_eq!(record.row.permalink.as_deref(), Some("/@writer/post/g1"));
        assert!(record.synced);
        assert!(h.store.cursor("writer").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let api = FakeThreads::default()
            .with_account("tok", vec![vec!["p1"]])
            .failing_insights("p1", 2);
        let h = harness(config(dir.path(), &[]), api, vec![account("acc", "tok")]);

        let summary = h.pipeline.run(no_stop()).await;

        assert!(summary.is_success());
        assert_eq!(summary.counts.posts_committed, 1);
        assert_eq!(summary.counts.post_fetch_retried, 2);
        assert_eq!(summary.counts.posts_failed, 0);
        assert_eq!(h.api.insight_calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.sink.named("post_fetch_retried").len(), 1);
        assert!(h.store.get("p1").unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_only_that_post() {
        let dir = tempfile::tempdir().unwrap();
        let api = FakeThreads::default()
            .with_account("tok", vec![vec!["ok", "flaky"]])
            .failing_insights("flaky", 10);
        let h = harness(config(dir.path(), &[]), api, vec![account("acc", "tok")]);

        let summary = h.pipeline.run(no_stop()).await;

        assert!(summary.is_success());
        assert_eq!(summary.counts.posts_committed, 1);
        assert_eq!(summary.counts.posts_failed, 1);
        assert_eq!(h.sink.named("post_fetch_failed").len(), 1);
        assert!(h.store.get("flaky").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_rerun_fetches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let api = FakeThreads::default().with_account("tok", vec![vec!["a", "b", "c"]]);
        let h = harness(config(dir.path(), &[]), api, vec![account("acc", "tok")]);

        let first = h.pipeline.run(no_stop()).await;
        assert_eq!(first.counts.posts_fetched, 3);

        let second = h.pipeline.run(no_stop()).await;
        assert!(second.is_success());
        assert_eq!(second.counts.posts_seen, 3);
        assert_eq!(second.counts.posts_fetched, 0);
        assert_eq!(second.counts.posts_skipped, 3);
        assert_eq!(second.rows_synced, 0);
        assert_eq!(h.api.insight_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_failure_keeps_rows_for_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let api = FakeThreads::default().with_account("tok", vec![vec!["a", "b", "c"]]);
        let h = harness(config(dir.path(), &[]), api, vec![account("acc", "tok")]);
        h.writer.fail.store(true, Ordering::SeqCst);

        let first = h.pipeline.run(no_stop()).await;
        assert!(first.is_success());
        assert!(first.sync_failed);
        assert_eq!(first.rows_synced, 0);
        assert_eq!(h.sink.named("row_sync_failed").len(), 1);
        assert_eq!(h.store.unsynced_rows().unwrap().len(), 3);
        assert!(h.store.last_batch_write().unwrap().is_none());

        h.writer.fail.store(false, Ordering::SeqCst);
        let second = h.pipeline.run(no_stop()).await;
        assert_eq!(second.counts.posts_fetched, 0);
        assert_eq!(second.rows_synced, 3);
        assert!(!second.sync_failed);
        assert!(h.store.unsynced_rows().unwrap().is_empty());
        assert!(h.store.last_batch_write().unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_new_work_and_saves_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = FakeThreads::default().with_account("tok", vec![vec!["a", "b"], vec!["c"]]);
        api.page_delay = Duration::from_secs(120);
        let h = harness(
            config(dir.path(), &[("THREADS_RUN_TIMEOUT_MIN", "1")]),
            api,
            vec![account("acc", "tok")],
        );

        let summary = h.pipeline.run(no_stop()).await;

        assert!(summary.is_success());
        assert!(summary.deadline_reached);
        assert_eq!(summary.counts.posts_seen, 2);
        assert_eq!(summary.counts.posts_fetched, 0);
        assert_eq!(summary.counts.posts_skipped, 2);
        let counts = &summary.counts;
        assert_eq!(
            counts.posts_seen,
            counts.posts_skipped + counts.posts_fetched + counts.posts_failed
        );
        assert_eq!(h.api.insight_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.cursor("acc").unwrap().as_deref(), Some("page-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_request_prevents_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let api = FakeThreads::default().with_account("tok", vec![vec!["a"]]);
        let h = harness(config(dir.path(), &[]), api, vec![account("acc", "tok")]);

        let summary = h.pipeline.run(Arc::new(AtomicBool::new(true))).await;

        assert!(summary.is_success());
        assert!(!summary.deadline_reached);
        assert_eq!(summary.counts.posts_fetched, 0);
        assert_eq!(h.api.insight_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_store_failure_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), &[]);
        let state_path = cfg.state_file.clone();
        let api = FakeThreads::default().with_account("tok", vec![vec!["a"]]);
        let h = harness(cfg, api, vec![account("acc", "tok")]);

        // A directory where the state file should go makes every commit fail
        std::fs::create_dir(&state_path).unwrap();

        let summary = h.pipeline.run(no_stop()).await;

        assert_eq!(summary.stage, RunStage::Aborted);
        assert!(matches!(summary.status, RunStatus::Aborted { .. }));
        assert_eq!(summary.counts.posts_committed, 0);
        assert_eq!(h.sink.named("run_aborted").len(), 1);
        assert!(h.writer.batches.lock().unwrap().is_empty());
    }
}
