//! Gateway client
//!
//! The admission controller and request lifecycle. Every verb helper funnels
//! into [`Client::send`], which normalizes the request, resolves its
//! rate-limit group, and then either dispatches (after the admission sleep)
//! or parks the request in the retry queue when the computed delay exceeds
//! the deferral threshold. Responses feed quota announcements back into the
//! accounting engine; retryable statuses and transient transport failures
//! re-enter admission until the retry budget runs out; redirects restart the
//! lifecycle at the new URL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderValue, ACCEPT_ENCODING, USER_AGENT};
use http::{Method, StatusCode};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::config::{self, ClientConfig, RequestBody, RequestOptions};
use crate::error::{Error, Result};
use crate::headers;
use crate::limits::{GroupLimits, GroupSnapshot};
use crate::queue::{
    QueuedRequest, RetryQueue, DEQUEUES_PER_TIER, DRAIN_JITTER_MS, DRAIN_PAUSE_MS, PUMP_ROUNDS,
    REPUMP_DELAY_MS, TIER_ORDER,
};
use crate::request::PreparedRequest;
use crate::resolver::{canonicalize, GroupResolver};
use crate::response::ResponseView;
use crate::transport::{ReqwestTransport, Transport};

/// Statuses that re-enter admission instead of completing the request.
const RETRYABLE_STATUSES: [u16; 7] = [408, 425, 429, 500, 502, 503, 504];

/// Backoff floor for transient transport failures, in milliseconds.
const TRANSPORT_BACKOFF_MS: u64 = 500;

fn is_retryable_status(status: StatusCode) -> bool {
    RETRYABLE_STATUSES.contains(&status.as_u16())
}

/// Per-status backoff floor; the effective delay also honors `Retry-After`
/// and scales with the retry ordinal.
fn default_backoff_ms(status: StatusCode) -> u64 {
    match status.as_u16() {
        408 | 425 => 500,
        _ => 1_000,
    }
}

/// Transport failures worth retrying: the origin was never reached or timed
/// out, so the exchange is safe to repeat.
fn is_transient(err: &Error) -> bool {
    let Error::Transport(source) = err else {
        return false;
    };
    if let Some(e) = source.downcast_ref::<reqwest::Error>() {
        return e.is_timeout() || e.is_connect();
    }
    if let Some(e) = source.downcast_ref::<std::io::Error>() {
        return matches!(
            e.kind(),
            std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        );
    }
    false
}

/// Outcome of one pass through admission and (possibly) dispatch.
enum Step {
    /// The request completed with a non-retryable response.
    Done(ResponseView),
    /// State changed (retry, redirect); re-enter admission.
    Again,
    /// The admission delay exceeds the deferral threshold; park the request.
    Defer,
}

struct Inner {
    config: ClientConfig,
    resolver: GroupResolver,
    transport: Arc<dyn Transport>,
    limits: Mutex<HashMap<String, Arc<GroupLimits>>>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    queue: RetryQueue,
    dispatch_permits: Arc<Semaphore>,
}

/// Point-in-time view of the gateway's internal state.
#[derive(Debug, Clone)]
pub struct ClientStats {
    pub groups: Vec<GroupSnapshot>,
    pub queued_high: usize,
    pub queued_normal: usize,
    pub queued_low: usize,
    pub available_permits: usize,
}

/// The gateway client. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Builds a client over the default pooled transport.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_transport(config, ReqwestTransport::shared())
    }

    /// Builds a client over an injected transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let mut resolver = GroupResolver::builder().anchor(config.api_path_anchor.clone());
        for (from, group) in &config.group_literals {
            resolver = resolver.literal(from, group);
        }
        for (pattern, group) in &config.group_patterns {
            resolver = resolver.pattern(pattern, group)?;
        }

        let queue = RetryQueue::new(config.queue_capacity);
        let dispatch_permits = Arc::new(Semaphore::new(config.max_concurrent_requests.max(1)));

        Ok(Self {
            inner: Arc::new(Inner {
                resolver: resolver.build(),
                transport,
                limits: Mutex::new(HashMap::new()),
                breakers: Mutex::new(HashMap::new()),
                queue,
                dispatch_permits,
                config,
            }),
        })
    }

    pub async fn get(&self, url: &str, options: RequestOptions) -> Result<ResponseView> {
        self.send(Method::GET, url, options, RequestBody::Empty)
            .await
    }

    pub async fn post(
        &self,
        url: &str,
        options: RequestOptions,
        body: impl Into<RequestBody>,
    ) -> Result<ResponseView> {
        self.send(Method::POST, url, options, body.into()).await
    }

    pub async fn put(
        &self,
        url: &str,
        options: RequestOptions,
        body: impl Into<RequestBody>,
    ) -> Result<ResponseView> {
        self.send(Method::PUT, url, options, body.into()).await
    }

    pub async fn patch(
        &self,
        url: &str,
        options: RequestOptions,
        body: impl Into<RequestBody>,
    ) -> Result<ResponseView> {
        self.send(Method::PATCH, url, options, body.into()).await
    }

    pub async fn delete(&self, url: &str, options: RequestOptions) -> Result<ResponseView> {
        self.send(Method::DELETE, url, options, RequestBody::Empty)
            .await
    }

    pub async fn head(&self, url: &str, options: RequestOptions) -> Result<ResponseView> {
        self.send(Method::HEAD, url, options, RequestBody::Empty)
            .await
    }

    pub async fn options(&self, url: &str, options: RequestOptions) -> Result<ResponseView> {
        self.send(Method::OPTIONS, url, options, RequestBody::Empty)
            .await
    }

    pub async fn trace(&self, url: &str, options: RequestOptions) -> Result<ResponseView> {
        self.send(Method::TRACE, url, options, RequestBody::Empty)
            .await
    }

    /// Sends one request through admission, returning the final response or
    /// a boundary error. Suspends for admission sleeps, queue waits, the
    /// exchange itself and retry backoffs; cancellation wakes any of them.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
        body: RequestBody,
    ) -> Result<ResponseView> {
        let mut request = self.prepare(method, url, options, body).await?;
        let abort = request.abort.clone();

        let result = loop {
            match self.step(&mut request).await {
                Ok(Step::Done(view)) => break Ok(view),
                Ok(Step::Again) => continue,
                Ok(Step::Defer) => break self.park(request).await,
                Err(err) => break Err(err),
            }
        };

        // Settled either way; this only releases the timeout watchdog.
        abort.cancel();
        result
    }

    /// Normalizes one request: URL and header assembly, credential
    /// attachment, body materialization, priority resolution, and the
    /// timeout watchdog.
    async fn prepare(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
        body: RequestBody,
    ) -> Result<PreparedRequest> {
        let url =
            Url::parse(url).map_err(|e| Error::Config(format!("unparseable URL {url:?}: {e}")))?;

        let limits = self.inner.config.merge(&options);

        let mut headers = config::header_map(&self.inner.config.headers)?;
        headers.extend(config::header_map(&options.headers)?);

        let credentials = options
            .credentials
            .as_ref()
            .or(self.inner.config.credentials.as_ref());
        if let Some(credentials) = credentials {
            credentials.apply(&mut headers)?;
        }

        if !headers.contains_key(USER_AGENT) {
            headers.insert(
                USER_AGENT,
                HeaderValue::from_static(concat!("apigate/", env!("CARGO_PKG_VERSION"))),
            );
        }
        if !limits.decompress {
            headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        }

        let is_json = body.is_json();
        let body = body.into_bytes(limits.max_body_length).await?;
        if is_json {
            config::ensure_json_content_type(&mut headers);
        }

        let priority = options.priority.resolve(&method, url.path());

        // The per-request timeout fires cancellation no matter where the
        // request is waiting: admission sleep, queue, exchange or backoff.
        let abort = match &options.abort {
            Some(token) => token.child_token(),
            None => CancellationToken::new(),
        };
        let watchdog = abort.clone();
        let timeout = limits.timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = watchdog.cancelled() => {}
                _ = tokio::time::sleep(timeout) => watchdog.cancel(),
            }
        });

        let transport = options
            .transport
            .clone()
            .unwrap_or_else(|| self.inner.transport.clone());

        Ok(PreparedRequest {
            method,
            url,
            headers,
            body,
            limits,
            priority,
            abort,
            transport,
            retries: 0,
            redirects: 0,
        })
    }

    /// One admission pass: breaker check, delay computation, sleep, dispatch,
    /// absorption and response classification.
    async fn step(&self, request: &mut PreparedRequest) -> Result<Step> {
        if request.abort.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let group = self.inner.resolver.resolve(&request.url);
        let limits = self.limits_for(&group);

        if self.inner.config.circuit_breaker_enabled && !self.breaker_for(&group).allow_request() {
            return Err(Error::CircuitOpen(group));
        }

        let delay = limits.calculate_delay();
        if delay > request.limits.max_deferral_ms {
            debug!(
                group = %group,
                delay_ms = delay,
                deferral_ms = request.limits.max_deferral_ms,
                "Admission delay exceeds deferral threshold"
            );
            return Ok(Step::Defer);
        }

        cancellable_sleep(&request.abort, delay).await?;

        let permit = tokio::select! {
            _ = request.abort.cancelled() => return Err(Error::Cancelled),
            permit = self.inner.dispatch_permits.clone().acquire_owned() => {
                permit.map_err(|_| Error::Fatal("dispatch semaphore closed".to_string()))?
            }
        };

        limits.increment();
        let outcome = request.transport.execute(request.transport_request()).await;
        drop(permit);

        // Queued work can make progress whenever an exchange settles.
        self.kick_pump();

        match outcome {
            Ok(view) => self.classify_response(request, &group, &limits, view).await,
            Err(err) => self.classify_transport_error(request, &group, err).await,
        }
    }

    async fn classify_response(
        &self,
        request: &mut PreparedRequest,
        group: &str,
        limits: &Arc<GroupLimits>,
        view: ResponseView,
    ) -> Result<Step> {
        if self.inner.config.circuit_breaker_enabled {
            self.breaker_for(group).record_success();
        }

        // Quota announcements may name a different group than the request
        // resolved to; honor the response's naming.
        match headers::group_name(view.headers()) {
            Some(named) if named != group => self.limits_for(named).absorb(view.headers()),
            _ => limits.absorb(view.headers()),
        }

        if view.is_redirect() {
            if let Some(target) = view.redirect_url() {
                let target = canonicalize(&target);
                if canonicalize(&request.url) == target {
                    return Err(Error::RedirectLoop(request.url.to_string()));
                }
                if request.redirects >= request.limits.max_redirects {
                    return Err(Error::RedirectsExhausted(request.redirects));
                }
                request.redirects += 1;
                debug!(
                    from = %request.url,
                    to = %target,
                    redirects = request.redirects,
                    "Following redirect"
                );
                request.url = target;
                return Ok(Step::Again);
            }
        }

        if is_retryable_status(view.status()) {
            let status = view.status();

            if status == StatusCode::TOO_MANY_REQUESTS && request.limits.max_retries == 0 {
                return Err(Error::RateLimited {
                    group: group.to_string(),
                    retry_after_ms: view.retry_after_ms().unwrap_or(0),
                });
            }
            if request.retries >= request.limits.max_retries {
                return Err(Error::RetriesExhausted {
                    retries: request.retries,
                    last: Box::new(view),
                });
            }
            request.retries += 1;

            if status == StatusCode::TOO_MANY_REQUESTS {
                if let Some(retry_after) = view.retry_after_ms() {
                    // Re-absorbed as a group-wide wait; the next admission
                    // pass sleeps it out or defers to the queue.
                    limits.apply_retry_after(retry_after);
                    warn!(
                        group = %group,
                        retry_after_ms = retry_after,
                        retries = request.retries,
                        "Rate limited, re-entering admission"
                    );
                    return Ok(Step::Again);
                }
            }

            let base = view
                .retry_after_ms()
                .unwrap_or(0)
                .max(default_backoff_ms(status));
            let backoff = base * u64::from(request.retries);
            warn!(
                group = %group,
                status = status.as_u16(),
                retries = request.retries,
                backoff_ms = backoff,
                "Retryable status, backing off"
            );
            cancellable_sleep(&request.abort, backoff).await?;
            return Ok(Step::Again);
        }

        Ok(Step::Done(view))
    }

    async fn classify_transport_error(
        &self,
        request: &mut PreparedRequest,
        group: &str,
        err: Error,
    ) -> Result<Step> {
        if matches!(err, Error::Cancelled) {
            return Err(err);
        }

        if self.inner.config.circuit_breaker_enabled {
            self.breaker_for(group).record_failure();
        }

        if is_transient(&err) && request.retries < request.limits.max_retries {
            request.retries += 1;
            let backoff = TRANSPORT_BACKOFF_MS * u64::from(request.retries);
            warn!(
                group = %group,
                error = %err,
                retries = request.retries,
                backoff_ms = backoff,
                "Transient transport failure, backing off"
            );
            cancellable_sleep(&request.abort, backoff).await?;
            return Ok(Step::Again);
        }

        Err(err)
    }

    /// Parks a deferred request in the retry queue and awaits its waiter.
    async fn park(&self, request: PreparedRequest) -> Result<ResponseView> {
        let abort = request.abort.clone();
        let priority = request.priority;
        let (tx, rx) = oneshot::channel();
        let id = self.inner.queue.next_id();

        if self
            .inner
            .queue
            .add(QueuedRequest::new(id, request, tx))
            .is_err()
        {
            return Err(Error::Backpressure(priority));
        }
        self.kick_pump();

        tokio::select! {
            _ = abort.cancelled() => {
                // Either still parked (remove and settle) or already picked
                // up by the pump, which observes the token itself.
                self.inner.queue.abort(id);
                Err(Error::Cancelled)
            }
            settled = rx => {
                settled.map_err(|_| Error::Fatal("queued request dropped without settling".to_string()))?
            }
        }
    }

    /// Drives a dequeued request; it re-enters admission exactly like a
    /// fresh send and may be re-parked if its group is still limited.
    async fn drive_queued(&self, mut qr: QueuedRequest) {
        loop {
            match self.step(&mut qr.request).await {
                Ok(Step::Done(view)) => return qr.settle(Ok(view)),
                Ok(Step::Again) => continue,
                Ok(Step::Defer) => {
                    // Raced with other admissions since the availability
                    // check; park it back at the head of its tier.
                    self.inner.queue.requeue_front(qr);
                    self.kick_pump_later();
                    return;
                }
                Err(err) => return qr.settle(Err(err)),
            }
        }
    }

    /// Starts the pump unless one is already active.
    fn kick_pump(&self) {
        if self.inner.queue.is_empty() || !self.inner.queue.try_begin_pump() {
            return;
        }
        let client = self.clone();
        tokio::spawn(async move { client.pump().await });
    }

    /// Schedules a pump attempt after the re-pump delay.
    fn kick_pump_later(&self) {
        let client = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(REPUMP_DELAY_MS)).await;
            client.kick_pump();
        });
    }

    /// Drains the queue: a bounded number of rounds, each visiting tiers in
    /// priority order with a bounded number of dequeues per tier. A tier is
    /// drained only up to its group availability; a head whose group is
    /// still limited stays parked so the tier keeps FIFO order.
    async fn pump(self) {
        debug!(depth = self.inner.queue.len(), "Retry queue pump started");

        for _ in 0..PUMP_ROUNDS {
            for priority in TIER_ORDER {
                for _ in 0..DEQUEUES_PER_TIER {
                    let Some(qr) = self.inner.queue.pop(priority) else {
                        break;
                    };
                    if qr.request.abort.is_cancelled() {
                        qr.settle(Err(Error::Cancelled));
                        continue;
                    }

                    let group = self.inner.resolver.resolve(&qr.request.url);
                    let delay = self.limits_for(&group).calculate_delay();
                    if delay > qr.request.limits.max_deferral_ms {
                        // Head of the tier is not dispatchable yet; the
                        // whole tier waits behind it.
                        self.inner.queue.requeue_front(qr);
                        break;
                    }

                    debug!(
                        id = qr.id,
                        priority = ?priority,
                        waited_ms = qr.queued_at.elapsed().as_millis() as u64,
                        "Pump dispatching queued request"
                    );
                    let client = self.clone();
                    tokio::spawn(async move { client.drive_queued(qr).await });

                    let jitter = rand::thread_rng().gen_range(0..=DRAIN_JITTER_MS);
                    tokio::time::sleep(Duration::from_millis(DRAIN_PAUSE_MS + jitter)).await;
                }
            }
        }

        self.inner.queue.end_pump();
        if !self.inner.queue.is_empty() {
            self.kick_pump_later();
        }
        debug!("Retry queue pump finished");
    }

    /// Accounting state for a group, lazily created on first traffic.
    fn limits_for(&self, group: &str) -> Arc<GroupLimits> {
        let mut map = self.inner.limits.lock();
        if let Some(limits) = map.get(group) {
            return limits.clone();
        }

        let limits = Arc::new(GroupLimits::new(group, self.inner.config.quotas_for(group)));
        GroupLimits::spawn_reset_task(&limits);
        debug!(group = %group, "Created rate-limit accounting for group");
        map.insert(group.to_string(), limits.clone());
        limits
    }

    fn breaker_for(&self, group: &str) -> Arc<CircuitBreaker> {
        let mut map = self.inner.breakers.lock();
        if let Some(breaker) = map.get(group) {
            return breaker.clone();
        }

        let breaker = Arc::new(CircuitBreaker::new(
            group,
            BreakerConfig {
                failure_threshold: self.inner.config.circuit_breaker_failure_threshold,
                open_duration: Duration::from_secs(
                    self.inner.config.circuit_breaker_open_duration_secs,
                ),
                ..BreakerConfig::default()
            },
        ));
        map.insert(group.to_string(), breaker.clone());
        breaker
    }

    /// Snapshot of one group's accounting state, if it has seen traffic.
    pub fn group_stats(&self, group: &str) -> Option<GroupSnapshot> {
        self.inner.limits.lock().get(group).map(|l| l.snapshot())
    }

    /// Snapshot of all groups, queue depths and dispatch capacity.
    pub fn stats(&self) -> ClientStats {
        let groups = self
            .inner
            .limits
            .lock()
            .values()
            .map(|l| l.snapshot())
            .collect();
        ClientStats {
            groups,
            queued_high: self.inner.queue.tier_len(crate::config::Priority::High),
            queued_normal: self.inner.queue.tier_len(crate::config::Priority::Normal),
            queued_low: self.inner.queue.tier_len(crate::config::Priority::Low),
            available_permits: self.inner.dispatch_permits.available_permits(),
        }
    }
}

async fn cancellable_sleep(abort: &CancellationToken, ms: u64) -> Result<()> {
    tokio::select! {
        _ = abort.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_status_set() {
        for status in [408, 425, 429, 500, 502, 503, 504] {
            assert!(is_retryable_status(StatusCode::from_u16(status).unwrap()));
        }
        for status in [200, 201, 301, 400, 401, 404, 501] {
            assert!(!is_retryable_status(StatusCode::from_u16(status).unwrap()));
        }
    }

    #[test]
    fn test_backoff_floors() {
        assert_eq!(default_backoff_ms(StatusCode::REQUEST_TIMEOUT), 500);
        assert_eq!(default_backoff_ms(StatusCode::TOO_MANY_REQUESTS), 1_000);
        assert_eq!(default_backoff_ms(StatusCode::BAD_GATEWAY), 1_000);
    }

    #[test]
    fn test_transient_classification() {
        let timeout = Error::Transport(Box::new(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out",
        )));
        assert!(is_transient(&timeout));

        let refused = Error::Transport(Box::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        )));
        assert!(is_transient(&refused));

        let other = Error::Transport("tls handshake failed".into());
        assert!(!is_transient(&other));
        assert!(!is_transient(&Error::Cancelled));
    }

    #[tokio::test]
    async fn test_cancellable_sleep_wakes_on_cancel() {
        let token = CancellationToken::new();
        let waker = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waker.cancel();
        });

        let started = std::time::Instant::now();
        let result = cancellable_sleep(&token, 5_000).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_client_construction_validates_patterns() {
        let config = ClientConfig {
            group_patterns: vec![("(unclosed".to_string(), "broken".to_string())],
            ..Default::default()
        };
        assert!(matches!(Client::new(config), Err(Error::Config(_))));

        assert!(Client::new(ClientConfig::default()).is_ok());
    }
}
