//! Single-URL requests with bounded retries
//!
//! Every attempt gets its own timeout, and the sum of attempts plus the
//! sleeps between them never exceeds the budget's `max_wait`: when an
//! attempt's timeout would run past the budget it is clamped to what is left
//! and becomes the final attempt.

use reqwest::{Client, Method};
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::time::{Duration, Instant};
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, debug, info, warn};

use super::CancelFlag;
use crate::{CloudInitError, UrlError};

/// Attempts per step of the escalating schedule
pub const DEFAULT_STEP_ATTEMPTS: u32 = 5;

/// Longest sleep the escalating schedule reaches
pub const DEFAULT_SLEEP_CAP: Duration = Duration::from_secs(3);

/// Delay inserted between two attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepSchedule {
    /// Same delay after every attempt
    Fixed(Duration),
    /// 1s for the first `step_attempts` attempts, then 2s, then 3s... up to `cap`
    Escalating { step_attempts: u32, cap: Duration },
}

impl SleepSchedule {
    pub fn escalating() -> Self {
        Self::Escalating {
            step_attempts: DEFAULT_STEP_ATTEMPTS,
            cap: DEFAULT_SLEEP_CAP,
        }
    }

    /// Delay after the given 1-based attempt
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Escalating { step_attempts, cap } => {
                let step = 1 + attempt.saturating_sub(1) / step_attempts.max(1);
                Duration::from_secs(u64::from(step)).min(cap)
            }
        }
    }
}

impl Default for SleepSchedule {
    fn default() -> Self {
        Self::escalating()
    }
}

/// Wall-clock limits for one logical request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    /// Total time allowed for all attempts and sleeps
    pub max_wait: Duration,
    /// Upper bound for a single attempt
    pub per_attempt_timeout: Duration,
    pub sleep: SleepSchedule,
}

/// Timeout and finality of the next attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AttemptPlan {
    pub timeout: Duration,
    pub last: bool,
}

impl RetryBudget {
    /// Budget using the escalating sleep schedule
    pub fn new(max_wait: Duration, per_attempt_timeout: Duration) -> Self {
        Self {
            max_wait,
            per_attempt_timeout,
            sleep: SleepSchedule::escalating(),
        }
    }

    /// One try, no retries
    pub fn single_attempt(timeout: Duration) -> Self {
        Self::new(Duration::ZERO, timeout)
    }

    /// Use a fixed delay between attempts
    pub fn with_sleep(mut self, sleep: Duration) -> Self {
        self.sleep = SleepSchedule::Fixed(sleep);
        self
    }

    pub fn with_schedule(mut self, schedule: SleepSchedule) -> Self {
        self.sleep = schedule;
        self
    }

    pub fn remaining(&self, elapsed: Duration) -> Duration {
        self.max_wait.saturating_sub(elapsed)
    }

    /// Same per-attempt behaviour with a smaller wall-clock allowance
    pub fn shrink_to(&self, max_wait: Duration) -> Self {
        Self {
            max_wait: self.max_wait.min(max_wait),
            ..*self
        }
    }

    pub(crate) fn plan(&self, elapsed: Duration, attempt: u32) -> AttemptPlan {
        // A zero budget still gets one full attempt.
        if attempt == 1 && self.max_wait.is_zero() {
            return AttemptPlan {
                timeout: self.per_attempt_timeout,
                last: true,
            };
        }

        let remaining = self.remaining(elapsed);
        if self.per_attempt_timeout >= remaining {
            AttemptPlan {
                timeout: remaining,
                last: true,
            }
        } else {
            AttemptPlan {
                timeout: self.per_attempt_timeout,
                last: false,
            }
        }
    }

    /// Sleep to take before another attempt, or `None` when the budget cannot
    /// fit a sleep plus a further attempt
    pub(crate) fn sleep_before_retry(&self, elapsed: Duration, attempt: u32) -> Option<Duration> {
        let sleep = self.sleep.delay_after(attempt);
        (self.remaining(elapsed) > sleep).then_some(sleep)
    }
}

/// A request to issue, possibly several times
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    /// Treat non-2xx responses as failed attempts
    pub require_success: bool,
    /// Non-2xx statuses that are still a final answer
    pub accepted_statuses: Vec<u16>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::GET,
            headers: Vec::new(),
            body: None,
            require_success: true,
            accepted_statuses: Vec::new(),
        }
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            body: Some(body.into()),
            ..Self::get(url)
        }
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self {
            method: Method::PUT,
            ..Self::get(url)
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Hand back any HTTP response and let the caller judge the status
    pub fn accept_any_status(mut self) -> Self {
        self.require_success = false;
        self
    }

    /// Hand back responses with `status` instead of retrying them
    pub fn accept_status(mut self, status: u16) -> Self {
        self.accepted_statuses.push(status);
        self
    }
}

/// A fully read HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub url: String,
    pub status: u16,
    pub body: String,
    /// Attempts it took to get this response
    pub attempts: u32,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Log record for one attempt
struct FetchAttempt<'a> {
    url: &'a str,
    number: u32,
    started_at: Instant,
    timeout: Duration,
}

impl<'a> FetchAttempt<'a> {
    fn begin(url: &'a str, number: u32, timeout: Duration) -> Self {
        Self {
            url,
            number,
            started_at: Instant::now(),
            timeout,
        }
    }

    fn outcome(error: &UrlError) -> &'static str {
        match error {
            UrlError::Timeout { .. } => "timeout",
            UrlError::Status { .. } => "http_error",
            UrlError::Connection { .. } | UrlError::Build { .. } => "connection_error",
            UrlError::Cancelled { .. } => "cancelled",
        }
    }
}

impl fmt::Display for FetchAttempt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[attempt {}] {} (timeout {:.3}s, elapsed {:.3}s)",
            self.number,
            self.url,
            self.timeout.as_secs_f64(),
            self.started_at.elapsed().as_secs_f64()
        )
    }
}

/// GET/POST against one URL with retries
#[derive(Debug, Clone)]
pub struct RetryingFetcher {
    client: Client,
    dispatch: Dispatch,
}

impl RetryingFetcher {
    pub fn new() -> Result<Self, CloudInitError> {
        let client = Client::builder()
            .build()
            .map_err(|e| CloudInitError::Http(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self::with_client(client))
    }

    /// Share an existing client (and its connection pool)
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            dispatch: tracing::dispatcher::get_default(Dispatch::clone),
        }
    }

    /// Send this fetcher's log events to `dispatch`
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    pub async fn fetch(
        &self,
        request: &FetchRequest,
        budget: &RetryBudget,
    ) -> Result<FetchResponse, CloudInitError> {
        self.fetch_cancellable(request, budget, &CancelFlag::new())
            .await
    }

    /// Like [`fetch`](Self::fetch), but stops before the next attempt once
    /// `cancel` is set
    pub async fn fetch_cancellable(
        &self,
        request: &FetchRequest,
        budget: &RetryBudget,
        cancel: &CancelFlag,
    ) -> Result<FetchResponse, CloudInitError> {
        self.run(request, budget, cancel)
            .with_subscriber(self.dispatch.clone())
            .await
    }

    async fn run(
        &self,
        request: &FetchRequest,
        budget: &RetryBudget,
        cancel: &CancelFlag,
    ) -> Result<FetchResponse, CloudInitError> {
        let start = Instant::now();
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                debug!("{} {} cancelled before attempt {}", request.method, request.url, attempt + 1);
                return Err(CloudInitError::fetch(
                    attempt,
                    UrlError::Cancelled {
                        url: request.url.clone(),
                    },
                ));
            }

            attempt += 1;
            let plan = budget.plan(start.elapsed(), attempt);
            let record = FetchAttempt::begin(&request.url, attempt, plan.timeout);

            match self.attempt(request, plan.timeout).await {
                Ok(mut response) => {
                    response.attempts = attempt;
                    info!(
                        "{} {} succeeded after {} attempt(s) ({:.3}s)",
                        request.method,
                        request.url,
                        attempt,
                        start.elapsed().as_secs_f64()
                    );
                    return Ok(response);
                }
                Err(err) => {
                    warn!("{} {}: {}", record, FetchAttempt::outcome(&err), err);

                    let sleep = if plan.last || err.is_futile() {
                        None
                    } else {
                        budget.sleep_before_retry(start.elapsed(), attempt)
                    };

                    let Some(sleep) = sleep else {
                        warn!(
                            "{} {} failed after {} attempt(s) ({:.3}s): {}",
                            request.method,
                            request.url,
                            attempt,
                            start.elapsed().as_secs_f64(),
                            err
                        );
                        return Err(CloudInitError::fetch(attempt, err));
                    };

                    if !sleep.is_zero() {
                        debug!("Waiting {:.3}s before retrying {}", sleep.as_secs_f64(), request.url);
                        tokio::time::sleep(sleep).await;
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        request: &FetchRequest,
        timeout: Duration,
    ) -> Result<FetchResponse, UrlError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify(&request.url, timeout, &e))?;

        let status = response.status();
        if request.require_success
            && !status.is_success()
            && !request.accepted_statuses.contains(&status.as_u16())
        {
            return Err(UrlError::Status {
                url: request.url.clone(),
                status: status.as_u16(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| classify(&request.url, timeout, &e))?;

        Ok(FetchResponse {
            url: request.url.clone(),
            status: status.as_u16(),
            body,
            attempts: 0,
        })
    }
}

/// Map a reqwest failure onto the attempt failure classes
fn classify(url: &str, timeout: Duration, err: &reqwest::Error) -> UrlError {
    if err.is_timeout() {
        UrlError::Timeout {
            url: url.to_string(),
            timeout,
        }
    } else if err.is_builder() {
        UrlError::Build {
            url: url.to_string(),
            message: error_chain(err),
        }
    } else {
        UrlError::Connection {
            url: url.to_string(),
            message: error_chain(err),
            futile: is_unreachable(err),
        }
    }
}

/// Network or host unreachable: no route, retrying will not change that
fn is_unreachable(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>()
            && matches!(
                io_err.kind(),
                io::ErrorKind::NetworkUnreachable | io::ErrorKind::HostUnreachable
            )
        {
            return true;
        }
        current = e.source();
    }
    false
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut current = err.source();
    while let Some(e) = current {
        message.push_str(": ");
        message.push_str(&e.to_string());
        current = e.source();
    }
    message
}
