//! HTTP fetch utilities, content hashing and manifest persistence for defsync.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

mod cache;
mod manifest;

pub use cache::{ContentCache, MemoryCache, NoopCache};
pub use manifest::{parse_manifest, validate_manifest_value, ManifestError, ManifestStore};

pub const CRATE_NAME: &str = "defsync-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NotFound,
    NonRetryable,
}

/// Classifies a non-success response.
pub fn classify_status(status: StatusCode, headers: &HeaderMap) -> RetryDisposition {
    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        RetryDisposition::NotFound
    } else if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && rate_limit_exhausted(headers))
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn rate_limit_exhausted(headers: &HeaderMap) -> bool {
    header_str(headers, "x-ratelimit-remaining") == Some("0")
}

/// Server-provided wait, from `Retry-After` or an exhausted rate-limit window.
pub fn retry_hint(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    if let Some(value) = header_str(headers, header::RETRY_AFTER.as_str()) {
        if let Ok(secs) = value.parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }
        if let Ok(at) = DateTime::parse_from_rfc2822(value) {
            let secs = (at.with_timezone(&Utc) - now).num_seconds().max(0);
            return Some(Duration::from_secs(secs as u64));
        }
    }

    if rate_limit_exhausted(headers) {
        let reset = header_str(headers, "x-ratelimit-reset")?.parse::<i64>().ok()?;
        let secs = (reset - now.timestamp()).max(0);
        return Some(Duration::from_secs(secs as u64));
    }

    None
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound applied to server hints.
    pub max_hint_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            max_hint_delay: Duration::from_secs(120),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Delay before the next attempt; a server hint wins over computed backoff.
    pub fn delay_for(&self, attempt_index: usize, server_hint: Option<Duration>) -> Duration {
        match server_hint {
            Some(hint) => hint.min(self.max_hint_delay),
            None => self.delay_for_attempt(attempt_index),
        }
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync + fmt::Debug {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Backoff deadline shared by every request issued through one fetcher.
#[derive(Debug, Default)]
pub struct RateLimitGate {
    resume_at: Mutex<Option<Instant>>,
}

impl RateLimitGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes the shared resume deadline out to at least `delay` from now.
    pub async fn defer(&self, delay: Duration) {
        let target = Instant::now() + delay;
        let mut resume_at = self.resume_at.lock().await;
        if resume_at.map_or(true, |current| target > current) {
            *resume_at = Some(target);
        }
    }

    pub async fn pending(&self) -> Option<Duration> {
        let resume_at = *self.resume_at.lock().await;
        resume_at
            .and_then(|at| at.checked_duration_since(Instant::now()))
            .filter(|d| !d.is_zero())
    }

    /// Sleeps until the shared deadline passes. `honored` tracks the deadline
    /// this caller already slept for, so each deadline costs one sleep.
    pub async fn wait(&self, sleeper: &dyn Sleeper, honored: &mut Option<Instant>) {
        loop {
            let Some(target) = *self.resume_at.lock().await else {
                return;
            };
            if honored.is_some_and(|h| h >= target) {
                return;
            }
            let Some(remaining) = target
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
            else {
                return;
            };
            sleeper.sleep(remaining).await;
            *honored = Some(target);
        }
    }
}

#[derive(Debug)]
pub enum AttemptOutcome<T> {
    Done(T),
    Retry {
        hint: Option<Duration>,
        error: FetchError,
    },
    Fail(FetchError),
}

/// Drives `attempt_fn` until it succeeds, fails permanently or exhausts the policy.
pub async fn run_with_retry<T, F, Fut>(
    policy: &BackoffPolicy,
    gate: &RateLimitGate,
    sleeper: &dyn Sleeper,
    url: &str,
    mut attempt_fn: F,
) -> Result<T, FetchError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = AttemptOutcome<T>>,
{
    let mut honored = None;
    let mut attempt = 0usize;
    loop {
        gate.wait(sleeper, &mut honored).await;
        match attempt_fn(attempt).await {
            AttemptOutcome::Done(value) => return Ok(value),
            AttemptOutcome::Fail(error) => return Err(error),
            AttemptOutcome::Retry { hint, error } => {
                if attempt >= policy.max_retries {
                    return Err(FetchError::Exhausted {
                        url: url.to_string(),
                        attempts: attempt + 1,
                        last: Box::new(error),
                    });
                }
                let delay = policy.delay_for(attempt, hint);
                warn!(url, attempt, ?delay, %error, "retryable fetch failure, backing off");
                gate.defer(delay).await;
                attempt += 1;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub bearer_token: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub request_budget: Option<RequestBudgetConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            bearer_token: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
            request_budget: None,
        }
    }
}

/// Steady request rate: `burst` requests up front, then one more every `refill_every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestBudgetConfig {
    pub burst: u32,
    pub refill_every: Duration,
}

/// Client-side request budget shared by every request issued through one fetcher.
///
/// Callers reserve a slot and sleep once for however long the slot lies in the
/// future, so concurrent callers queue behind each other instead of racing.
#[derive(Debug)]
pub struct RequestBudget {
    config: RequestBudgetConfig,
    state: Mutex<BudgetState>,
}

#[derive(Debug, Clone, Copy)]
struct BudgetState {
    /// Negative while callers hold reservations on future refills.
    available: i64,
    refilled_at: Instant,
}

impl RequestBudget {
    pub fn new(config: RequestBudgetConfig) -> Self {
        Self {
            config: RequestBudgetConfig {
                burst: config.burst.max(1),
                refill_every: config.refill_every,
            },
            state: Mutex::new(BudgetState {
                available: i64::from(config.burst.max(1)),
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Claims one request slot at `now` and returns how long to wait for it.
    pub async fn reserve_at(&self, now: Instant) -> Duration {
        let RequestBudgetConfig { burst, refill_every } = self.config;
        if refill_every.is_zero() {
            return Duration::ZERO;
        }
        let mut state = self.state.lock().await;
        let elapsed = now.saturating_duration_since(state.refilled_at);
        let refills = (elapsed.as_nanos() / refill_every.as_nanos()).min(u128::from(u32::MAX)) as u32;
        if refills > 0 {
            state.available += i64::from(refills);
            state.refilled_at += refill_every.saturating_mul(refills);
            if state.available >= i64::from(burst) {
                state.available = i64::from(burst);
                state.refilled_at = now;
            }
        }

        state.available -= 1;
        if state.available >= 0 {
            return Duration::ZERO;
        }
        let owed = refill_every.saturating_mul((-state.available).min(i64::from(u32::MAX)) as u32);
        owed.saturating_sub(now.saturating_duration_since(state.refilled_at))
    }

    pub async fn take(&self, sleeper: &dyn Sleeper) {
        let wait = self.reserve_at(Instant::now()).await;
        if !wait.is_zero() {
            debug!(?wait, "request budget exhausted, waiting for a slot");
            sleeper.sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Found(FetchedResponse),
    NotFound { url: String },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("gave up on {url} after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        attempts: usize,
        #[source]
        last: Box<FetchError>,
    },
    #[error("fetcher is shutting down")]
    Shutdown,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    request_budget: Option<RequestBudget>,
    backoff: BackoffPolicy,
    gate: RateLimitGate,
    sleeper: Arc<dyn Sleeper>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        if let Some(token) = &config.bearer_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("building authorization header")?;
            value.set_sensitive(true);
            let mut headers = HeaderMap::new();
            headers.insert(header::AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            request_budget: config.request_budget.map(RequestBudget::new),
            backoff: config.backoff,
            gate: RateLimitGate::new(),
            sleeper: Arc::new(TokioSleeper),
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// GETs `url`, retrying transient failures against the shared backoff budget.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        accept: Option<&str>,
    ) -> Result<FetchOutcome, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Shutdown)?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::Shutdown)?;

        let span = info_span!("http_fetch", %run_id, source_id, url);
        run_with_retry(
            &self.backoff,
            &self.gate,
            self.sleeper.as_ref(),
            url,
            |attempt| self.attempt_once(url, accept, attempt),
        )
        .instrument(span)
        .await
    }

    async fn attempt_once(
        &self,
        url: &str,
        accept: Option<&str>,
        attempt: usize,
    ) -> AttemptOutcome<FetchOutcome> {
        if let Some(budget) = &self.request_budget {
            budget.take(self.sleeper.as_ref()).await;
        }
        debug!(attempt, "sending request");

        let mut request = self.client.get(url);
        if let Some(accept) = accept {
            request = request.header(header::ACCEPT, accept);
        }

        let resp = match request.send().await {
            Ok(resp) => resp,
            Err(err) => return request_error_outcome(err),
        };

        let status = resp.status();
        let final_url = resp.url().to_string();
        if status.is_success() {
            return match resp.bytes().await {
                Ok(body) => AttemptOutcome::Done(FetchOutcome::Found(FetchedResponse {
                    status,
                    final_url,
                    body: body.to_vec(),
                })),
                Err(err) => request_error_outcome(err),
            };
        }

        let error = FetchError::HttpStatus {
            status: status.as_u16(),
            url: final_url.clone(),
        };
        match classify_status(status, resp.headers()) {
            RetryDisposition::NotFound => {
                AttemptOutcome::Done(FetchOutcome::NotFound { url: final_url })
            }
            RetryDisposition::Retryable => AttemptOutcome::Retry {
                hint: retry_hint(resp.headers(), Utc::now()),
                error,
            },
            RetryDisposition::NonRetryable => AttemptOutcome::Fail(error),
        }
    }
}

fn request_error_outcome<T>(err: reqwest::Error) -> AttemptOutcome<T> {
    match classify_reqwest_error(&err) {
        RetryDisposition::Retryable => AttemptOutcome::Retry {
            hint: None,
            error: FetchError::Request(err),
        },
        _ => AttemptOutcome::Fail(FetchError::Request(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        async fn recorded(&self) -> Vec<Duration> {
            self.slept.lock().await.clone()
        }
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().await.push(duration);
        }
    }

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            max_hint_delay: Duration::from_secs(30),
        }
    }

    fn transient() -> FetchError {
        FetchError::HttpStatus {
            status: 503,
            url: "https://example.test/x".into(),
        }
    }

    fn approx(actual: Duration, expected: Duration) -> bool {
        actual <= expected && actual + Duration::from_millis(50) >= expected
    }

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            ..policy()
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn server_hint_wins_over_computed_backoff() {
        let policy = policy();
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_secs(600))),
            Duration::from_secs(30)
        );
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(200));
    }

    #[test]
    fn status_classification_separates_not_found_from_retryable() {
        let empty = HeaderMap::new();
        let mut limited = HeaderMap::new();
        limited.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));

        assert_eq!(classify_status(StatusCode::NOT_FOUND, &empty), RetryDisposition::NotFound);
        assert_eq!(classify_status(StatusCode::GONE, &empty), RetryDisposition::NotFound);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, &empty),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, &empty),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, &limited),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, &empty),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, &empty),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn retry_hint_reads_retry_after_and_rate_limit_reset() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();

        let mut seconds = HeaderMap::new();
        seconds.insert(header::RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(retry_hint(&seconds, now), Some(Duration::from_secs(12)));

        let mut date = HeaderMap::new();
        date.insert(
            header::RETRY_AFTER,
            HeaderValue::from_static("Sun, 01 Mar 2026 12:00:30 +0000"),
        );
        assert_eq!(retry_hint(&date, now), Some(Duration::from_secs(30)));

        let mut reset = HeaderMap::new();
        reset.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        let reset_at = (now.timestamp() + 45).to_string();
        reset.insert("x-ratelimit-reset", HeaderValue::from_str(&reset_at).unwrap());
        assert_eq!(retry_hint(&reset, now), Some(Duration::from_secs(45)));

        let mut remaining = HeaderMap::new();
        remaining.insert("x-ratelimit-remaining", HeaderValue::from_static("12"));
        assert_eq!(retry_hint(&remaining, now), None);
        assert_eq!(retry_hint(&HeaderMap::new(), now), None);
    }

    #[tokio::test]
    async fn transient_failures_back_off_then_succeed() {
        let sleeper = RecordingSleeper::default();
        let gate = RateLimitGate::new();
        let calls = AtomicUsize::new(0);

        let result = run_with_retry(&policy(), &gate, &sleeper, "u", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    AttemptOutcome::Retry {
                        hint: None,
                        error: transient(),
                    }
                } else {
                    AttemptOutcome::Done("body")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "body");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let slept = sleeper.recorded().await;
        assert_eq!(slept.len(), 2);
        assert!(approx(slept[0], Duration::from_millis(100)), "{slept:?}");
        assert!(approx(slept[1], Duration::from_millis(200)), "{slept:?}");
    }

    #[tokio::test]
    async fn server_hint_drives_the_wait() {
        let sleeper = RecordingSleeper::default();
        let gate = RateLimitGate::new();

        let result = run_with_retry(&policy(), &gate, &sleeper, "u", |attempt| async move {
            if attempt == 0 {
                AttemptOutcome::Retry {
                    hint: Some(Duration::from_secs(9)),
                    error: transient(),
                }
            } else {
                AttemptOutcome::Done(())
            }
        })
        .await;

        assert!(result.is_ok());
        let slept = sleeper.recorded().await;
        assert_eq!(slept.len(), 1);
        assert!(approx(slept[0], Duration::from_secs(9)), "{slept:?}");
    }

    #[tokio::test]
    async fn exhausted_retries_report_attempt_count() {
        let sleeper = RecordingSleeper::default();
        let gate = RateLimitGate::new();
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = run_with_retry(&policy(), &gate, &sleeper, "u", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                AttemptOutcome::Retry {
                    hint: None,
                    error: transient(),
                }
            }
        })
        .await;

        match result {
            Err(FetchError::Exhausted { url, attempts, last }) => {
                assert_eq!(url, "u");
                assert_eq!(attempts, 4);
                assert!(matches!(*last, FetchError::HttpStatus { status: 503, .. }));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(sleeper.recorded().await.len(), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let sleeper = RecordingSleeper::default();
        let gate = RateLimitGate::new();
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = run_with_retry(&policy(), &gate, &sleeper, "u", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                AttemptOutcome::Fail(FetchError::HttpStatus {
                    status: 401,
                    url: "u".into(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(FetchError::HttpStatus { status: 401, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sleeper.recorded().await.is_empty());
    }

    #[tokio::test]
    async fn deferred_gate_delays_every_caller() {
        let sleeper = RecordingSleeper::default();
        let gate = RateLimitGate::new();
        gate.defer(Duration::from_secs(3)).await;
        gate.defer(Duration::from_secs(1)).await;
        assert!(gate.pending().await.is_some_and(|d| d > Duration::from_secs(2)));

        for _ in 0..2 {
            let result =
                run_with_retry(&policy(), &gate, &sleeper, "u", |_| async {
                    AttemptOutcome::Done(())
                })
                .await;
            assert!(result.is_ok());
        }

        let slept = sleeper.recorded().await;
        assert_eq!(slept.len(), 2);
        assert!(slept.iter().all(|d| approx(*d, Duration::from_secs(3))), "{slept:?}");
    }

    #[tokio::test]
    async fn concurrent_retries_share_one_deadline() {
        let sleeper = RecordingSleeper::default();
        let gate = RateLimitGate::new();
        let barrier = tokio::sync::Barrier::new(3);
        let calls = AtomicUsize::new(0);
        let policy = policy();

        let (policy, gate_ref, sleeper_ref, barrier, calls_ref) =
            (&policy, &gate, &sleeper, &barrier, &calls);
        let call = move || {
            run_with_retry(policy, gate_ref, sleeper_ref, "u", move |attempt| {
                calls_ref.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        barrier.wait().await;
                        AttemptOutcome::Retry {
                            hint: Some(Duration::from_secs(5)),
                            error: transient(),
                        }
                    } else {
                        AttemptOutcome::Done(())
                    }
                }
            })
        };
        let (a, b, c) = tokio::join!(call(), call(), call());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 6);

        // Three simultaneous 5s hints leave one 5s deadline, not 15s.
        let pending = gate.pending().await.unwrap_or_default();
        assert!(pending <= Duration::from_secs(5), "{pending:?}");
        assert!(pending > Duration::from_secs(4), "{pending:?}");

        let slept = sleeper.recorded().await;
        assert!(slept.iter().all(|d| *d <= Duration::from_secs(5)), "{slept:?}");
        assert_eq!(slept.iter().filter(|d| **d > Duration::from_secs(4)).count(), 3);
    }

    #[tokio::test]
    async fn request_budget_spaces_requests_past_the_burst() {
        let budget = RequestBudget::new(RequestBudgetConfig {
            burst: 2,
            refill_every: Duration::from_secs(1),
        });
        let t0 = Instant::now();
        assert_eq!(budget.reserve_at(t0).await, Duration::ZERO);
        assert_eq!(budget.reserve_at(t0).await, Duration::ZERO);
        assert!(approx(budget.reserve_at(t0).await, Duration::from_secs(1)));
        assert!(approx(budget.reserve_at(t0).await, Duration::from_secs(2)));

        // One refill has landed; the next free slot is three seconds after t0.
        let later = t0 + Duration::from_millis(1500);
        assert!(approx(budget.reserve_at(later).await, Duration::from_millis(1500)));

        let idle = t0 + Duration::from_secs(60);
        assert_eq!(budget.reserve_at(idle).await, Duration::ZERO);
        assert_eq!(budget.reserve_at(idle).await, Duration::ZERO);
        assert!(approx(budget.reserve_at(idle).await, Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn request_budget_waits_through_the_sleeper() {
        let sleeper = RecordingSleeper::default();
        let budget = RequestBudget::new(RequestBudgetConfig {
            burst: 1,
            refill_every: Duration::from_millis(400),
        });
        for _ in 0..3 {
            budget.take(&sleeper).await;
        }
        let slept = sleeper.recorded().await;
        assert_eq!(slept.len(), 2, "{slept:?}");
        assert!(approx(slept[0], Duration::from_millis(400)), "{slept:?}");
        assert!(approx(slept[1], Duration::from_millis(800)), "{slept:?}");

        let unlimited = RequestBudget::new(RequestBudgetConfig {
            burst: 1,
            refill_every: Duration::ZERO,
        });
        assert_eq!(unlimited.reserve_at(Instant::now()).await, Duration::ZERO);
        assert_eq!(unlimited.reserve_at(Instant::now()).await, Duration::ZERO);
    }
}
