//! Dispatch Engine
//!
//! Fans out one burst of authorized like actions for a single token and
//! target. Every attempt in the burst is always issued, each gets its own
//! slot in the report, and no attempt's failure cancels another.
//!
//! Per-attempt statuses are informational. Whether the burst did anything is
//! decided by the orchestrator from before/after profile snapshots.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinSet;

use crate::error::DispatchAttemptError;
use crate::metrics;

/// Burst size used when none is configured
pub const DEFAULT_BURST_SIZE: usize = 100;

/// What one attempt carries to the remote action endpoint
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub target_id: String,
    pub region: String,
    pub token: String,
}

/// Remote endpoint accepting like actions
#[async_trait]
pub trait ActionProvider: Send + Sync {
    /// Send one action and return the response status
    async fn send(&self, request: &ActionRequest) -> Result<u16, DispatchAttemptError>;
}

/// Action provider speaking HTTP
///
/// Each attempt is a `POST <url>` with the token as a bearer credential and
/// `{"uid": <target>, "server_name": <region>}` as body.
#[derive(Debug, Clone)]
pub struct HttpActionProvider {
    client: reqwest::Client,
    url: String,
}

impl HttpActionProvider {
    pub fn new(url: impl Into<String>, timeout: Duration, burst_size: usize) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(burst_size)
            .build()
            .context("Failed to build action provider HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ActionProvider for HttpActionProvider {
    async fn send(&self, request: &ActionRequest) -> Result<u16, DispatchAttemptError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&request.token)
            .json(&json!({
                "uid": request.target_id,
                "server_name": request.region,
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DispatchAttemptError::Timeout
                } else {
                    DispatchAttemptError::Transport(e.to_string())
                }
            })?;

        Ok(response.status().as_u16())
    }
}

/// Outcome of one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The remote answered, with any status
    Acknowledged(u16),
    /// No answer reached us
    Failed(DispatchAttemptError),
}

impl AttemptOutcome {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, AttemptOutcome::Acknowledged(_))
    }
}

/// Per-attempt outcomes of one burst, in issue order
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub outcomes: Vec<AttemptOutcome>,
    pub elapsed: Duration,
}

impl DispatchReport {
    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }

    pub fn acknowledged(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_acknowledged()).count()
    }

    pub fn failed(&self) -> usize {
        self.attempted() - self.acknowledged()
    }

    /// Acknowledged attempts with a 2xx status
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, AttemptOutcome::Acknowledged(s) if (200..300).contains(s)))
            .count()
    }

    pub fn summary(&self) -> DispatchSummary {
        DispatchSummary {
            attempted: self.attempted(),
            acknowledged: self.acknowledged(),
            succeeded: self.succeeded(),
            failed: self.failed(),
        }
    }
}

/// Counts-only view of a burst
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub attempted: usize,
    pub acknowledged: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Issues bursts of concurrent attempts through an [`ActionProvider`]
#[derive(Clone)]
pub struct DispatchEngine {
    provider: Arc<dyn ActionProvider>,
    attempt_timeout: Duration,
}

impl DispatchEngine {
    pub fn new(provider: Arc<dyn ActionProvider>, attempt_timeout: Duration) -> Self {
        Self {
            provider,
            attempt_timeout,
        }
    }

    /// Issue `burst_size` attempts concurrently and wait for all of them
    pub async fn dispatch(
        &self,
        target_id: &str,
        region: &str,
        token: &str,
        burst_size: usize,
    ) -> DispatchReport {
        let started = Instant::now();
        let request = Arc::new(ActionRequest {
            target_id: target_id.to_string(),
            region: region.to_string(),
            token: token.to_string(),
        });

        let mut tasks = JoinSet::new();
        for index in 0..burst_size {
            let provider = Arc::clone(&self.provider);
            let request = Arc::clone(&request);
            let timeout = self.attempt_timeout;
            tasks.spawn(async move {
                let outcome = match tokio::time::timeout(timeout, provider.send(&request)).await {
                    Ok(Ok(status)) => AttemptOutcome::Acknowledged(status),
                    Ok(Err(e)) => AttemptOutcome::Failed(e),
                    Err(_) => AttemptOutcome::Failed(DispatchAttemptError::Timeout),
                };
                (index, outcome)
            });
        }

        // A slot only keeps this default if its task panicked.
        let mut outcomes = vec![
            AttemptOutcome::Failed(DispatchAttemptError::Aborted(
                "attempt task did not complete".to_string()
            ));
            burst_size
        ];

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    if let AttemptOutcome::Failed(e) = &outcome {
                        tracing::debug!("Dispatch attempt {} failed: {}", index, e);
                    }
                    outcomes[index] = outcome;
                }
                Err(e) => tracing::error!("Dispatch attempt task failed: {}", e),
            }
        }

        let report = DispatchReport {
            outcomes,
            elapsed: started.elapsed(),
        };

        metrics::DISPATCH_ATTEMPTS_TOTAL
            .with_label_values(&["acknowledged"])
            .inc_by(report.acknowledged() as u64);
        metrics::DISPATCH_ATTEMPTS_TOTAL
            .with_label_values(&["failed"])
            .inc_by(report.failed() as u64);

        tracing::info!(
            "Dispatched {} attempts to {} in {:?}: {} acknowledged ({} 2xx), {} failed",
            report.attempted(),
            target_id,
            report.elapsed,
            report.acknowledged(),
            report.succeeded(),
            report.failed()
        );

        report
    }
}

impl std::fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("attempt_timeout", &self.attempt_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::HeaderMap, routing::post, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails every attempt whose sequence number is in `fail_every`'s multiples
    struct FlakyProvider {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        fail_every: usize,
        panic_on: Option<usize>,
    }

    impl FlakyProvider {
        fn new(fail_every: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                fail_every,
                panic_on: None,
            }
        }
    }

    #[async_trait]
    impl ActionProvider for FlakyProvider {
        async fn send(&self, request: &ActionRequest) -> Result<u16, DispatchAttemptError> {
            assert_eq!(request.token, "tok");
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.panic_on == Some(n) {
                panic!("provider blew up");
            }
            if self.fail_every > 0 && n % self.fail_every == 0 {
                Err(DispatchAttemptError::Transport("reset by peer".into()))
            } else if n % 2 == 0 {
                Ok(500)
            } else {
                Ok(200)
            }
        }
    }

    #[tokio::test]
    async fn test_all_attempts_issued_despite_failures() {
        for fail_every in [0, 1, 2, 3, 7] {
            let provider = Arc::new(FlakyProvider::new(fail_every));
            let engine = DispatchEngine::new(provider.clone(), Duration::from_secs(5));

            let report = engine.dispatch("42", "IND", "tok", 100).await;

            assert_eq!(report.attempted(), 100);
            assert_eq!(provider.calls.load(Ordering::SeqCst), 100);
            assert_eq!(report.acknowledged() + report.failed(), 100);
        }
    }

    #[tokio::test]
    async fn test_non_2xx_is_acknowledged() {
        let provider = Arc::new(FlakyProvider::new(0));
        let engine = DispatchEngine::new(provider, Duration::from_secs(5));

        let report = engine.dispatch("42", "IND", "tok", 10).await;

        assert_eq!(report.failed(), 0);
        assert_eq!(report.acknowledged(), 10);
        assert_eq!(report.succeeded(), 5);
    }

    #[tokio::test]
    async fn test_burst_runs_concurrently() {
        let provider = Arc::new(FlakyProvider::new(0));
        let engine = DispatchEngine::new(provider.clone(), Duration::from_secs(5));

        engine.dispatch("42", "IND", "tok", 50).await;

        assert!(provider.peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_panicking_attempt_recorded_as_failed() {
        let mut provider = FlakyProvider::new(0);
        provider.panic_on = Some(3);
        let engine = DispatchEngine::new(Arc::new(provider), Duration::from_secs(5));

        let report = engine.dispatch("42", "IND", "tok", 8).await;

        assert_eq!(report.attempted(), 8);
        assert_eq!(report.failed(), 1);
        assert!(report
            .outcomes
            .iter()
            .any(|o| matches!(o, AttemptOutcome::Failed(DispatchAttemptError::Aborted(_)))));
    }

    struct SlowProvider;

    #[async_trait]
    impl ActionProvider for SlowProvider {
        async fn send(&self, _request: &ActionRequest) -> Result<u16, DispatchAttemptError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(200)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout() {
        let engine = DispatchEngine::new(Arc::new(SlowProvider), Duration::from_secs(2));

        let report = engine.dispatch("42", "IND", "tok", 3).await;

        assert_eq!(
            report.outcomes,
            vec![AttemptOutcome::Failed(DispatchAttemptError::Timeout); 3]
        );
    }

    #[tokio::test]
    async fn test_zero_burst() {
        let engine = DispatchEngine::new(Arc::new(FlakyProvider::new(0)), Duration::from_secs(1));
        let report = engine.dispatch("42", "IND", "tok", 0).await;
        assert_eq!(report.summary().attempted, 0);
    }

    #[tokio::test]
    async fn test_http_provider_sends_token_and_target() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let app = Router::new().route(
            "/like",
            post(move |headers: HeaderMap, Json(body): Json<serde_json::Value>| {
                let counter = Arc::clone(&counter);
                async move {
                    assert_eq!(headers["authorization"], "Bearer tok");
                    assert_eq!(body["uid"], "42");
                    assert_eq!(body["server_name"], "IND");
                    counter.fetch_add(1, Ordering::SeqCst);
                    axum::http::StatusCode::ACCEPTED
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let provider =
            HttpActionProvider::new(format!("http://{}/like", addr), Duration::from_secs(5), 5).unwrap();
        let engine = DispatchEngine::new(Arc::new(provider), Duration::from_secs(5));

        let report = engine.dispatch("42", "IND", "tok", 5).await;

        assert_eq!(report.outcomes, vec![AttemptOutcome::Acknowledged(202); 5]);
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }
}
