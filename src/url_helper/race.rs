//! Staggered racing of candidate addresses
//!
//! Candidate `i` starts `i * stagger_delay` after the race begins. The first
//! candidate to finish without error wins, wherever it sits in the list; the
//! rest are told to stop at their next retry checkpoint and whatever they
//! produce afterwards is dropped.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, debug, info, warn};

use super::fetch::{FetchRequest, FetchResponse, RetryBudget, RetryingFetcher};
use super::CancelFlag;
use crate::CloudInitError;

/// The candidate that answered first and what it produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaceWinner<T> {
    pub candidate: String,
    pub value: T,
    /// Time from race start to the winning answer
    pub elapsed: Duration,
}

enum RaceMessage<T> {
    Won(String, T),
    Failed(String, CloudInitError),
}

/// Runs one probe per candidate and keeps the fastest success
#[derive(Debug, Clone)]
pub struct AddressRacer {
    stagger_delay: Duration,
    timeout: Duration,
    dispatch: Dispatch,
}

impl AddressRacer {
    pub fn new(stagger_delay: Duration, timeout: Duration) -> Self {
        Self {
            stagger_delay,
            timeout,
            dispatch: tracing::dispatcher::get_default(Dispatch::clone),
        }
    }

    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn stagger_delay(&self) -> Duration {
        self.stagger_delay
    }

    /// Race `probe` across `candidates`
    ///
    /// `probe` is called for candidate `i` only once its start time
    /// (`i * stagger_delay`) has come and the race is still open.
    ///
    /// Returns `Ok(None)` when the overall timeout passes with no winner (and
    /// when there is nothing to race). When every candidate fails, all errors
    /// are logged and the last one to arrive is returned.
    pub async fn race<T, F, Fut>(
        &self,
        candidates: &[String],
        probe: F,
    ) -> Result<Option<RaceWinner<T>>, CloudInitError>
    where
        F: Fn(String, CancelFlag) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, CloudInitError>> + Send + 'static,
        T: Send + 'static,
    {
        self.run(candidates, probe)
            .with_subscriber(self.dispatch.clone())
            .await
    }

    async fn run<T, F, Fut>(
        &self,
        candidates: &[String],
        probe: F,
    ) -> Result<Option<RaceWinner<T>>, CloudInitError>
    where
        F: Fn(String, CancelFlag) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, CloudInitError>> + Send + 'static,
        T: Send + 'static,
    {
        if candidates.is_empty() {
            warn!("No candidates to race");
            return Ok(None);
        }

        let start = Instant::now();
        let probe = Arc::new(probe);
        let cancel = CancelFlag::new();
        let claimed = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::channel(candidates.len());
        let mut tasks = JoinSet::new();

        for (index, candidate) in candidates.iter().enumerate() {
            let delay = self.stagger_delay.saturating_mul(index as u32);
            let probe = Arc::clone(&probe);
            let candidate = candidate.clone();
            let cancel = cancel.clone();
            let claimed = Arc::clone(&claimed);
            let tx = tx.clone();

            let task = async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if cancel.is_cancelled() {
                    debug!("Race already decided, not starting {}", candidate);
                    return;
                }
                debug!("Starting candidate {} ({}) at {:?}", index, candidate, start.elapsed());

                let message = match probe(candidate.clone(), cancel.clone()).await {
                    Ok(value) => {
                        if claimed
                            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                            .is_err()
                        {
                            debug!("Discarding late success from {}", candidate);
                            return;
                        }
                        cancel.cancel();
                        RaceMessage::Won(candidate, value)
                    }
                    Err(err) => RaceMessage::Failed(candidate, err),
                };
                let _ = tx.send(message).await;
            };
            tasks.spawn(task.with_subscriber(self.dispatch.clone()));
        }
        drop(tx);

        let mut failures: Vec<(String, CloudInitError)> = Vec::new();
        let outcome = tokio::time::timeout(self.timeout, async {
            while let Some(message) = rx.recv().await {
                match message {
                    RaceMessage::Won(candidate, value) => return Some((candidate, value)),
                    RaceMessage::Failed(candidate, err) => {
                        debug!("Candidate {} failed: {}", candidate, err);
                        failures.push((candidate, err));
                    }
                }
            }
            None
        })
        .await;

        // Losers wind down on their own at the next checkpoint.
        cancel.cancel();
        tasks.detach_all();

        match outcome {
            Ok(Some((candidate, value))) => {
                let elapsed = start.elapsed();
                info!("{} won the race after {:.3}s", candidate, elapsed.as_secs_f64());
                Ok(Some(RaceWinner {
                    candidate,
                    value,
                    elapsed,
                }))
            }
            Ok(None) => {
                for (candidate, err) in &failures {
                    warn!("Race candidate {} failed: {}", candidate, err);
                }
                warn!("All {} race candidates failed", failures.len());
                match failures.pop() {
                    Some((_, err)) => Err(err),
                    None => Ok(None),
                }
            }
            Err(_) => {
                for (candidate, err) in &failures {
                    debug!("Race candidate {} failed: {}", candidate, err);
                }
                warn!(
                    "No candidate answered within {:.3}s ({} of {} failed)",
                    self.timeout.as_secs_f64(),
                    failures.len(),
                    candidates.len()
                );
                Ok(None)
            }
        }
    }
}

/// Race GET requests for `urls` and return the first URL to answer successfully
///
/// Each candidate retries under `budget`, capped to the racer's overall timeout.
pub async fn wait_for_url(
    fetcher: &RetryingFetcher,
    racer: &AddressRacer,
    urls: &[String],
    headers: &[(String, String)],
    budget: &RetryBudget,
) -> Result<Option<RaceWinner<FetchResponse>>, CloudInitError> {
    let budget = budget.shrink_to(racer.timeout());
    let fetcher = fetcher.clone();
    let headers = headers.to_vec();

    racer
        .race(urls, move |url, cancel| {
            let fetcher = fetcher.clone();
            let request = FetchRequest::get(url).headers(headers.iter().cloned());
            async move { fetcher.fetch_cancellable(&request, &budget, &cancel).await }
        })
        .await
}
