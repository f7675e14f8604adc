//! Rate-limited, retried access to the platform
//!
//! Every request (each page and each metrics read, and each retry of
//! them) takes a [`RateLimiter`] permit for the duration of the call
//! only; permits are not held across backoff sleeps.

use super::rate_limiter::RateLimiter;
use super::retry::{Attempted, RetryError, RetryPolicy};
use super::threads_api::{FetchError, ListedPost, ThreadsApi};
use super::types::{Account, MetricSample, PostRef, SampleSource};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// A listed post plus the counters the listing already carried
#[derive(Debug, Clone, PartialEq)]
pub struct EnumeratedPost {
    pub post: PostRef,
    pub listing_sample: Option<MetricSample>,
}

pub struct Fetcher {
    api: Arc<dyn ThreadsApi>,
    limiter: Arc<RateLimiter>,
    retry: Arc<RetryPolicy>,
    page_limit: u32,
    now_fn: Clock,
}

impl Fetcher {
    pub fn new(
        api: Arc<dyn ThreadsApi>,
        limiter: Arc<RateLimiter>,
        retry: Arc<RetryPolicy>,
        page_limit: u32,
        now_fn: Clock,
    ) -> Self {
        Self {
            api,
            limiter,
            retry,
            page_limit,
            now_fn,
        }
    }

    /// Lazily page through an account's posts, optionally resuming
    /// after a saved cursor
    pub fn list_posts<'a>(&'a self, account: &'a Account, resume_after: Option<String>) -> PostPager<'a> {
        PostPager {
            fetcher: self,
            account,
            cursor: resume_after,
            exhausted: false,
            pages_fetched: 0,
            seen_cursors: HashSet::new(),
        }
    }

    /// Read one post's metrics
    pub async fn fetch_metrics(
        &self,
        account: &Account,
        post: &PostRef,
    ) -> Result<Attempted<MetricSample>, RetryError<FetchError>> {
        let api = &self.api;
        let limiter = &self.limiter;

        let attempted = self
            .retry
            .execute(|| async move {
                let _permit = limiter.acquire().await?;
                api.fetch_insights(account, post).await
            })
            .await?;

        Ok(Attempted {
            value: MetricSample {
                post_id: post.post_id.clone(),
                account_id: account.account_id.clone(),
                values: attempted.value,
                permalink: post.permalink.clone(),
                fetched_at: (self.now_fn)(),
                source: SampleSource::Insights,
            },
            retries: attempted.retries,
        })
    }

    fn listing_sample(&self, account: &Account, listed: &ListedPost, at: DateTime<Utc>) -> Option<MetricSample> {
        if listed.counts.is_empty() {
            return None;
        }
        Some(MetricSample {
            post_id: listed.post_id.clone(),
            account_id: account.account_id.clone(),
            values: listed.counts.clone(),
            permalink: listed.permalink.clone(),
            fetched_at: at,
            source: SampleSource::Listing,
        })
    }
}

/// Page-at-a-time cursor over an account's posts
pub struct PostPager<'a> {
    fetcher: &'a Fetcher,
    account: &'a Account,
    cursor: Option<String>,
    exhausted: bool,
    pages_fetched: u32,
    seen_cursors: HashSet<String>,
}

impl<'a> PostPager<'a> {
    /// Fetch the next page; `Ok(None)` once the listing is exhausted
    pub async fn next_page(&mut self) -> Result<Option<Vec<EnumeratedPost>>, RetryError<FetchError>> {
        if self.exhausted {
            return Ok(None);
        }

        let api = &self.fetcher.api;
        let limiter = &self.fetcher.limiter;
        let account = self.account;
        let limit = self.fetcher.page_limit;
        let after = self.cursor.clone();

        let attempted = self
            .fetcher
            .retry
            .execute(|| {
                let after = after.as_deref();
                async move {
                    let _permit = limiter.acquire().await?;
                    api.list_posts_page(account, after, limit).await
                }
            })
            .await?;

        if attempted.retries > 0 {
            log::debug!(
                "Listing page for {} needed {} retries",
                account.account_id,
                attempted.retries
            );
        }

        let page = attempted.value;
        let fetched_at = (self.fetcher.now_fn)();
        self.pages_fetched += 1;

        match page.next_cursor {
            Some(next) if self.seen_cursors.insert(next.clone()) => self.cursor = Some(next),
            Some(repeated) => {
                log::warn!(
                    "Cursor {} repeated for {}, stopping pagination",
                    repeated,
                    account.account_id
                );
                self.exhausted = true;
            }
            None => self.exhausted = true,
        }

        let page_cursor = after;
        let posts = page
            .posts
            .iter()
            .map(|listed| EnumeratedPost {
                post: PostRef {
                    account_id: account.account_id.clone(),
                    post_id: listed.post_id.clone(),
                    permalink: listed.permalink.clone(),
                    cursor: page_cursor.clone(),
                },
                listing_sample: self.fetcher.listing_sample(account, listed, fetched_at),
            })
            .collect();

        Ok(Some(posts))
    }

    /// Cursor the next page would be requested with
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }
}
