//! Threads Graph API integration
//!
//! Two reads are used by the pipeline:
//! - `GET {base}/me/threads` - paginated post listing for a token
//! - `GET {base}/{post_id}/insights` - engagement metrics for one post
//!
//! Both carry the account token as a bearer header. Failures are mapped
//! onto [`FetchError`] so the retry layer can tell throttling and
//! server trouble from rejected tokens.

use super::retry::Retryable;
use super::types::{Account, MetricField, PostRef};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::Url;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

const POST_FIELDS: &str = "id,permalink,timestamp,like_count,reply_count,repost_count,quote_count";

/// Platform error codes that mean "slow down" regardless of HTTP status
const RATE_LIMIT_CODES: [i64; 5] = [4, 17, 32, 613, 80016];

/// Error code for an invalid or expired access token
const INVALID_TOKEN_CODE: i64 = 190;

const PERMALINK_HOSTS: [&str; 2] = ["https://www.threads.com/", "https://www.threads.net/"];

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("token rejected (status {status}): {message}")]
    Auth { status: u16, message: String },

    #[error("rate limited (status {status}): {message}")]
    RateLimited {
        status: u16,
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("server error (status {status}): {message}")]
    Server { status: u16, message: String },

    #[error("request rejected (status {status}): {message}")]
    Client { status: u16, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("request limiter closed")]
    LimiterClosed,
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::RateLimited { .. }
                | FetchError::Server { .. }
                | FetchError::Timeout
                | FetchError::Network(_)
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<tokio::sync::AcquireError> for FetchError {
    fn from(_: tokio::sync::AcquireError) -> Self {
        FetchError::LimiterClosed
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if err.is_decode() {
            FetchError::Decode(err.to_string())
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::Decode(err.to_string())
    }
}

/// A post as returned by the listing endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct ListedPost {
    pub post_id: String,
    pub permalink: Option<String>,
    /// Counters included in the listing itself
    pub counts: BTreeMap<MetricField, u64>,
}

/// One page of the post listing
#[derive(Debug, Clone, PartialEq)]
pub struct PostPage {
    pub posts: Vec<ListedPost>,
    /// Cursor for the following page; `None` on the last page
    pub next_cursor: Option<String>,
}

/// Read access to the platform, one request per call
#[async_trait]
pub trait ThreadsApi: Send + Sync {
    async fn list_posts_page(
        &self,
        account: &Account,
        after: Option<&str>,
        limit: u32,
    ) -> Result<PostPage, FetchError>;

    async fn fetch_insights(
        &self,
        account: &Account,
        post: &PostRef,
    ) -> Result<BTreeMap<MetricField, u64>, FetchError>;
}

#[derive(Debug, Deserialize)]
struct PostsResponse {
    #[serde(default)]
    data: Vec<RawPost>,
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct RawPost {
    id: String,
    permalink: Option<String>,
    like_count: Option<u64>,
    reply_count: Option<u64>,
    repost_count: Option<u64>,
    quote_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    cursors: Option<Cursors>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Cursors {
    after: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InsightsResponse {
    #[serde(default)]
    data: Vec<InsightMetric>,
}

#[derive(Debug, Deserialize)]
struct InsightMetric {
    name: String,
    values: Option<Vec<InsightValue>>,
    total_value: Option<InsightValue>,
}

#[derive(Debug, Deserialize)]
struct InsightValue {
    value: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: Option<String>,
    code: Option<i64>,
}

/// reqwest-backed [`ThreadsApi`]
pub struct ThreadsClient {
    client: reqwest::Client,
    base_url: String,
}

impl ThreadsClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json(
        &self,
        url: &str,
        token: &str,
        query: &[(&str, String)],
    ) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await?;

        if !status.is_success() {
            return Err(classify_error(status.as_u16(), retry_after, &body));
        }

        Ok(body)
    }
}

#[async_trait]
impl ThreadsApi for ThreadsClient {
    async fn list_posts_page(
        &self,
        account: &Account,
        after: Option<&str>,
        limit: u32,
    ) -> Result<PostPage, FetchError> {
        let url = format!("{}/me/threads", self.base_url);
        let mut query = vec![("fields", POST_FIELDS.to_string()), ("limit", limit.to_string())];
        if let Some(after) = after {
            query.push(("after", after.to_string()));
        }

        let body = self.get_json(&url, &account.token, &query).await?;
        parse_posts_page(&body)
    }

    async fn fetch_insights(
        &self,
        account: &Account,
        post: &PostRef,
    ) -> Result<BTreeMap<MetricField, u64>, FetchError> {
        let url = format!("{}/{}/insights", self.base_url, post.post_id);
        let metrics = MetricField::ALL
            .iter()
            .map(|f| f.as_str())
            .collect::<Vec<_>>()
            .join(",");

        let body = self
            .get_json(&url, &account.token, &[("metric", metrics)])
            .await?;
        parse_insights(&body)
    }
}

/// Map a non-success response onto a [`FetchError`]
pub fn classify_error(status: u16, retry_after: Option<Duration>, body: &str) -> FetchError {
    let detail = serde_json::from_str::<ApiErrorBody>(body).ok().map(|b| b.error);
    let code = detail.as_ref().and_then(|d| d.code);
    let message = detail
        .and_then(|d| d.message)
        .unwrap_or_else(|| body.chars().take(200).collect());

    let throttled = code.map_or(false, |c| RATE_LIMIT_CODES.contains(&c));

    match status {
        429 => FetchError::RateLimited {
            status,
            retry_after,
            message,
        },
        400..=499 if throttled => FetchError::RateLimited {
            status,
            retry_after,
            message,
        },
        401 | 403 => FetchError::Auth { status, message },
        400 if code == Some(INVALID_TOKEN_CODE) => FetchError::Auth { status, message },
        408 => FetchError::Timeout,
        500..=599 => FetchError::Server { status, message },
        _ => FetchError::Client { status, message },
    }
}

fn parse_retry_after(raw: &str) -> Option<Duration> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

fn parse_posts_page(body: &str) -> Result<PostPage, FetchError> {
    let response: PostsResponse = serde_json::from_str(body)?;

    let posts = response
        .data
        .into_iter()
        .map(|raw| {
            let counts = [
                (MetricField::Likes, raw.like_count),
                (MetricField::Replies, raw.reply_count),
                (MetricField::Reposts, raw.repost_count),
                (MetricField::Quotes, raw.quote_count),
            ]
            .into_iter()
            .filter_map(|(field, value)| value.map(|v| (field, v)))
            .collect();

            ListedPost {
                post_id: raw.id,
                permalink: raw.permalink.as_deref().map(sanitize_permalink),
                counts,
            }
        })
        .collect();

    Ok(PostPage {
        posts,
        next_cursor: response.paging.as_ref().and_then(next_cursor),
    })
}

/// Cursor for the next page, or `None` when the listing is exhausted
///
/// Uses `paging.cursors.after`, falling back to the `after` query
/// parameter of `paging.next`. Without a `next` link there is no page
/// to follow.
fn next_cursor(paging: &Paging) -> Option<String> {
    let next = paging.next.as_deref()?;
    paging
        .cursors
        .as_ref()
        .and_then(|c| c.after.clone())
        .filter(|after| !after.is_empty())
        .or_else(|| after_from_url(next))
}

fn after_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let after = parsed
        .query_pairs()
        .find(|(key, _)| key == "after")
        .map(|(_, value)| value.into_owned());
    after.filter(|value| !value.is_empty())
}

fn parse_insights(body: &str) -> Result<BTreeMap<MetricField, u64>, FetchError> {
    let response: InsightsResponse = serde_json::from_str(body)?;

    let mut values = BTreeMap::new();
    for metric in response.data {
        let Some(field) = MetricField::from_api_name(&metric.name) else {
            log::debug!("Ignoring unknown insight metric '{}'", metric.name);
            continue;
        };
        let value = metric
            .total_value
            .and_then(|v| v.value)
            .or_else(|| {
                metric
                    .values
                    .and_then(|vs| vs.into_iter().rev().find_map(|v| v.value))
            });
        if let Some(value) = value {
            values.insert(field, value);
        }
    }
    Ok(values)
}

/// Strip platform host prefixes and query strings from a permalink
pub fn sanitize_permalink(permalink: &str) -> String {
    let mut path = permalink.to_string();

    for prefix in PERMALINK_HOSTS {
        if let Some(rest) = permalink.strip_prefix(prefix) {
            path = if rest.starts_with('/') {
                rest.to_string()
            } else {
                format!("/{}", rest)
            };
            break;
        }
    }

    match path.split_once('?') {
        Some((head, _)) => head.to_string(),
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_sanitize_permalink() {
        let cases = [
            ("https://www.threads.net/@example/post/123?utm_source=test", "/@example/post/123"),
            ("https://www.threads.com/@example/post/456", "/@example/post/456"),
            ("/@example/post/789?foo=bar", "/@example/post/789"),
            (
                "https://external.site/@example/post/000?utm_source=test",
                "https://external.site/@example/post/000",
            ),
        ];
        for (input, expected) in cases {
            assert_eq!(sanitize_permalink(input), expected);
        }
    }

    #[test]
    fn test_classify_error_statuses() {
        let throttled = r#"{"error":{"message":"There have been too many calls","code":80016}}"#;
        assert!(matches!(
            classify_error(403, Some(Duration::from_secs(12)), throttled),
            FetchError::RateLimited { status: 403, retry_after: Some(d), .. } if d == Duration::from_secs(12)
        ));
        assert!(matches!(classify_error(429, None, ""), FetchError::RateLimited { .. }));
        assert!(matches!(
            classify_error(401, None, r#"{"error":{"message":"Invalid OAuth access token","code":190}}"#),
            FetchError::Auth { status: 401, .. }
        ));
        assert!(matches!(
            classify_error(400, None, r#"{"error":{"message":"expired","code":190}}"#),
            FetchError::Auth { status: 400, .. }
        ));
        assert!(matches!(classify_error(502, None, "bad gateway"), FetchError::Server { .. }));
        assert!(matches!(
            classify_error(400, None, r#"{"error":{"message":"bad field","code":100}}"#),
            FetchError::Client { .. }
        ));

        assert!(classify_error(503, None, "").is_retryable());
        assert!(classify_error(429, None, "").is_retryable());
        assert!(!classify_error(401, None, "").is_retryable());
        assert!(!classify_error(404, None, "").is_retryable());
    }

    #[test]
    fn test_parse_posts_page_cursor_sources() {
        let body = r#"{
            "data": [
                {"id": "1", "permalink": "https://www.threads.net/@a/post/1?x=y", "like_count": 4, "reply_count": 0},
                {"id": "2"}
            ],
            "paging": {"cursors": {"after": "AFTER1"}, "next": "https://graph.threads.net/v1.0/me/threads?after=AFTER1"}
        }"#;
        let page = parse_posts_page(body).unwrap();
        assert_eq!(page.posts.len(), 2);
        assert_eq!(page.posts[0].permalink.as_deref(), Some("/@a/post/1"));
        assert_eq!(page.posts[0].counts.get(&MetricField::Likes), Some(&4));
        assert_eq!(page.posts[0].counts.get(&MetricField::Replies), Some(&0));
        assert!(page.posts[1].counts.is_empty());
        assert_eq!(page.next_cursor.as_deref(), Some("AFTER1"));

        let from_next = r#"{"data": [], "paging": {"next": "https://graph.threads.net/v1.0/me/threads?limit=25&after=XYZ"}}"#;
        assert_eq!(parse_posts_page(from_next).unwrap().next_cursor.as_deref(), Some("XYZ"));

        let last_page = r#"{"data": [], "paging": {"cursors": {"after": "END"}}}"#;
        assert_eq!(parse_posts_page(last_page).unwrap().next_cursor, None);
    }

    #[test]
    fn test_parse_insights_values() {
        let body = r#"{"data": [
            {"name": "views", "values": [{"value": 10}, {"value": 120}]},
            {"name": "likes", "total_value": {"value": 7}},
            {"name": "quotes", "values": []},
            {"name": "shares", "total_value": {"value": 2}}
        ]}"#;
        let values = parse_insights(body).unwrap();
        assert_eq!(values.get(&MetricField::Views), Some(&120));
        assert_eq!(values.get(&MetricField::Likes), Some(&7));
        assert!(!values.contains_key(&MetricField::Quotes));
        assert_eq!(values.len(), 2);
    }

    /// Serve canned HTTP responses, one connection each; returns base URL
    async fn stub_server(responses: Vec<String>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let mut requests = Vec::new();
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                requests.push(String::from_utf8_lossy(&buf).to_string());
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
            requests
        });

        (format!("http://{}", addr), handle)
    }

    fn http_response(status: &str, extra_headers: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n{}\r\n{}",
            status,
            body.len(),
            extra_headers,
            body
        )
    }

    fn account() -> Account {
        Account {
            account_id: "acc".to_string(),
            token: "tok123".to_string(),
        }
    }

    #[tokio::test]
    async fn test_client_lists_posts_with_bearer_token() {
        let body = r#"{"data":[{"id":"42","permalink":"https://www.threads.net/@acc/post/42"}],"paging":{}}"#;
        let (base, server) = stub_server(vec![http_response("200 OK", "", body)]).await;

        let client = ThreadsClient::new(&base, Duration::from_secs(5)).unwrap();
        let page = client.list_posts_page(&account(), Some("CUR"), 10).await.unwrap();

        assert_eq!(page.posts[0].post_id, "42");
        assert_eq!(page.next_cursor, None);

        let requests = server.await.unwrap();
        let request = requests[0].to_lowercase();
        assert!(request.starts_with("get /me/threads?"));
        assert!(request.contains("after=cur"));
        assert!(request.contains("authorization: bearer tok123"));
    }

    #[tokio::test]
    async fn test_client_maps_rate_limit_and_auth_failures() {
        let throttled = r#"{"error":{"message":"too many calls","code":80016}}"#;
        let rejected = r#"{"error":{"message":"Invalid OAuth access token","code":190}}"#;
        let (base, server) = stub_server(vec![
            http_response("403 Forbidden", "Retry-After: 12\r\n", throttled),
            http_response("401 Unauthorized", "", rejected),
        ])
        .await;

        let client = ThreadsClient::new(&base, Duration::from_secs(5)).unwrap();
        let post = PostRef {
            account_id: "acc".to_string(),
            post_id: "42".to_string(),
            permalink: None,
            cursor: None,
        };

        let first = client.fetch_insights(&account(), &post).await.unwrap_err();
        assert_eq!(first.retry_after(), Some(Duration::from_secs(12)));
        assert!(first.is_retryable());

        let second = client.fetch_insights(&account(), &post).await.unwrap_err();
        assert!(matches!(second, FetchError::Auth { status: 401, .. }));

        let requests = server.await.unwrap();
        assert!(requests[0].starts_with("GET /42/insights?metric=views%2Clikes%2Creplies%2Creposts%2Cquotes"));
    }
}
