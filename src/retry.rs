//! Retry wrapper for the remote order source.
//!
//! Timeouts, connection resets, TLS handshake failures and DNS/host
//! reachability problems are retried with exponential backoff. Everything
//! else, HTTP error statuses included, goes straight back to the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::{CallContext, OrderQuery, OrderSource};
use crate::error::SourceError;
use crate::models::OrderRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Terminal,
}

pub fn classify(err: &SourceError) -> ErrorClass {
    match err {
        SourceError::Timeout(_)
        | SourceError::ConnectionReset(_)
        | SourceError::Handshake(_)
        | SourceError::Dns(_)
        | SourceError::Unreachable(_) => ErrorClass::Transient,
        SourceError::Http { .. } | SourceError::Decode(_) | SourceError::Other(_) => {
            ErrorClass::Terminal
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base: f64,
    /// Resets usually mean the server is shedding load, so they back off
    /// harder.
    pub connection_reset_base: f64,
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: 2.0,
            connection_reset_base: 3.0,
            max_delay_secs: 60,
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (1-based): `base^retry` seconds,
    /// capped at `max_delay_secs`.
    pub fn delay_for(&self, retry: u32, err: &SourceError) -> Duration {
        let base = match err {
            SourceError::ConnectionReset(_) => self.connection_reset_base,
            _ => self.base,
        };
        let secs = base.max(1.0).powi(retry.min(30) as i32);
        Duration::from_secs_f64(secs.min(self.max_delay_secs as f64))
    }
}

/// [`OrderSource`] that retries transient failures of an inner source.
pub struct RetryingTransport {
    inner: Arc<dyn OrderSource>,
    policy: RetryPolicy,
}

impl RetryingTransport {
    pub fn new(inner: Arc<dyn OrderSource>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, SourceError>
    where
        F: FnMut(CallContext) -> Fut,
        Fut: std::future::Future<Output = Result<T, SourceError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut retry_count = 0;
        loop {
            match call(CallContext { retry_count }).await {
                Ok(value) => {
                    if retry_count > 0 {
                        debug!(operation, retry_count, "order source call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if classify(&err) == ErrorClass::Terminal => {
                    warn!(operation, error = %err, "order source call failed (terminal)");
                    return Err(err);
                }
                Err(err) => {
                    let attempt = retry_count + 1;
                    if attempt >= max_attempts {
                        warn!(operation, attempts = attempt, error = %err, "order source retries exhausted");
                        return Err(err);
                    }
                    retry_count += 1;
                    let delay = self.policy.delay_for(retry_count, &err);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient order source failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl OrderSource for RetryingTransport {
    async fn fetch_orders(
        &self,
        query: &OrderQuery,
        _ctx: CallContext,
    ) -> Result<Vec<OrderRecord>, SourceError> {
        self.run("fetch_orders", |ctx| self.inner.fetch_orders(query, ctx))
            .await
    }

    async fn update_order_status(
        &self,
        id: i64,
        status: &str,
        _ctx: CallContext,
    ) -> Result<OrderRecord, SourceError> {
        self.run("update_order_status", |ctx| {
            self.inner.update_order_status(id, status, ctx)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Source that replays scripted results and records call contexts.
    #[derive(Default)]
    struct ScriptedSource {
        results: Mutex<VecDeque<Result<Vec<OrderRecord>, SourceError>>>,
        calls: Mutex<Vec<CallContext>>,
    }

    impl ScriptedSource {
        fn new(results: Vec<Result<Vec<OrderRecord>, SourceError>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<CallContext> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OrderSource for ScriptedSource {
        async fn fetch_orders(
            &self,
            _query: &OrderQuery,
            ctx: CallContext,
        ) -> Result<Vec<OrderRecord>, SourceError> {
            self.calls.lock().unwrap().push(ctx);
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn update_order_status(
            &self,
            id: i64,
            status: &str,
            ctx: CallContext,
        ) -> Result<OrderRecord, SourceError> {
            self.calls.lock().unwrap().push(ctx);
            Ok(OrderRecord::new(id, id.to_string(), status))
        }
    }

    fn timeout() -> SourceError {
        SourceError::Timeout("shop".into())
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify(&timeout()), ErrorClass::Transient);
        assert_eq!(classify(&SourceError::Dns("x".into())), ErrorClass::Transient);
        assert_eq!(
            classify(&SourceError::Http {
                status: 503,
                message: "down".into()
            }),
            ErrorClass::Terminal
        );
        assert_eq!(classify(&SourceError::Decode("x".into())), ErrorClass::Terminal);
    }

    #[test]
    fn test_backoff_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1, &timeout()), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3, &timeout()), Duration::from_secs(8));
        let reset = SourceError::ConnectionReset("shop".into());
        assert_eq!(policy.delay_for(2, &reset), Duration::from_secs(9));
        assert_eq!(policy.delay_for(4, &reset), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_exhaust_attempts() {
        let source = ScriptedSource::new((0..5).map(|_| Err(timeout())).collect());
        let transport = RetryingTransport::new(source.clone(), RetryPolicy::default());

        let err = transport
            .fetch_orders(&OrderQuery::default(), CallContext::default())
            .await
            .unwrap_err();
        assert_eq!(err, timeout());
        let counts: Vec<u32> = source.calls().iter().map(|c| c.retry_count).collect();
        assert_eq!(counts, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_is_not_retried() {
        let unauthorized = SourceError::Http {
            status: 401,
            message: "bad key".into(),
        };
        let source = ScriptedSource::new(vec![Err(unauthorized.clone())]);
        let transport = RetryingTransport::new(source.clone(), RetryPolicy::default());

        let err = transport
            .fetch_orders(&OrderQuery::default(), CallContext::default())
            .await
            .unwrap_err();
        assert_eq!(err, unauthorized);
        assert_eq!(source.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let source = ScriptedSource::new(vec![
            Err(SourceError::ConnectionReset("shop".into())),
            Ok(vec![OrderRecord::new(1, "1", "processing")]),
        ]);
        let transport = RetryingTransport::new(source.clone(), RetryPolicy::default());

        let start = tokio::time::Instant::now();
        let orders = transport
            .fetch_orders(&OrderQuery::default(), CallContext::default())
            .await
            .unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(source.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_update_status_passes_through() {
        let source = ScriptedSource::new(Vec::new());
        let transport = RetryingTransport::new(source.clone(), RetryPolicy::default());
        let order = transport
            .update_order_status(9, "completed", CallContext::default())
            .await
            .unwrap();
        assert_eq!(order.status, "completed");
    }
}
