//! Serialized, rate-limited queue in front of the analysis provider
//!
//! Callers hand a request body to [`RequestQueue::enqueue`] and await the
//! reply. A single [`QueueWorker`] drains the channel, so at most one call is
//! in flight and calls leave in submission order. Throttling (429) and server
//! errors (5xx) are retried in place with a quadratic delay; anything else is
//! handed back to the caller untouched.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Status and body of one upstream call
#[derive(Debug, Clone)]
pub struct UpstreamReply {
    pub status: u16,
    pub body: Bytes,
}

impl UpstreamReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Throttled or server-side failure
    pub fn is_transient(&self) -> bool {
        self.status == 429 || self.status >= 500
    }
}

/// The quota-constrained call the queue fronts
#[async_trait]
pub trait Upstream: Send + Sync + 'static {
    /// Perform one call. Transport failures are errors; every HTTP status,
    /// including failures, is a reply.
    async fn call(&self, body: Bytes) -> Result<UpstreamReply>;
}

/// Retry limits for transient replies
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Unit of the quadratic backoff
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `retry² × base_delay`
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(retry.saturating_mul(retry))
    }
}

/// A request waiting for the worker
pub struct QueuedRequest {
    body: Bytes,
    reply: oneshot::Sender<Result<UpstreamReply>>,
}

/// Handle for submitting requests. Cloning shares the same queue; the worker
/// stops once every handle is dropped.
#[derive(Clone)]
pub struct RequestQueue {
    sender: mpsc::Sender<QueuedRequest>,
}

impl RequestQueue {
    /// Create a queue and the receiver its worker drains
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<QueuedRequest>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Create a queue and spawn its worker
    pub fn spawn(
        upstream: Arc<dyn Upstream>,
        policy: RetryPolicy,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (queue, receiver) = Self::new(capacity);
        let worker = QueueWorker::new(upstream, policy);
        let handle = tokio::spawn(worker.run(receiver));
        (queue, handle)
    }

    /// Submit a request and wait for its (possibly retried) reply
    pub async fn enqueue(&self, body: Bytes) -> Result<UpstreamReply> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(QueuedRequest { body, reply })
            .await
            .map_err(|_| Error::internal("analysis queue is shut down"))?;

        response
            .await
            .map_err(|_| Error::internal("analysis queue dropped the request"))?
    }
}

/// Drains a [`RequestQueue`] one request at a time
pub struct QueueWorker {
    upstream: Arc<dyn Upstream>,
    policy: RetryPolicy,
}

impl QueueWorker {
    pub fn new(upstream: Arc<dyn Upstream>, policy: RetryPolicy) -> Self {
        Self { upstream, policy }
    }

    pub async fn run(self, mut receiver: mpsc::Receiver<QueuedRequest>) {
        tracing::info!(
            "Analysis queue worker started (max {} retries, base delay {:?})",
            self.policy.max_retries,
            self.policy.base_delay
        );

        while let Some(request) = receiver.recv().await {
            let result = self.execute(request.body).await;
            if let Err(e) = &result {
                tracing::error!("Analysis request failed: {}", e);
            }
            if request.reply.send(result).is_err() {
                tracing::debug!("Analysis caller went away before its reply arrived");
            }
        }

        tracing::info!("Analysis queue worker stopped");
    }

    async fn execute(&self, body: Bytes) -> Result<UpstreamReply> {
        let mut retry = 0u32;
        loop {
            let reply = self.upstream.call(body.clone()).await?;
            if !reply.is_transient() {
                return Ok(reply);
            }
            if retry >= self.policy.max_retries {
                return Err(Error::UpstreamExhausted {
                    status: reply.status,
                    attempts: retry + 1,
                });
            }

            retry += 1;
            let delay = self.policy.delay_for(retry);
            tracing::warn!(
                "Analysis upstream answered {}, retry {}/{} in {:?}",
                reply.status,
                retry,
                self.policy.max_retries,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedUpstream;
    use std::time::Duration;

    fn policy(max_retries: u32, base_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(base_ms),
        }
    }

    #[test]
    fn test_delay_is_quadratic() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(9));
    }

    #[tokio::test]
    async fn test_one_call_in_flight_in_submission_order() {
        let upstream = Arc::new(ScriptedUpstream::new(200).with_latency(Duration::from_millis(20)));
        let (queue, _worker) = RequestQueue::spawn(upstream.clone(), policy(0, 1), 8);

        let (a, b, c) = tokio::join!(
            queue.enqueue(Bytes::from_static(b"a")),
            queue.enqueue(Bytes::from_static(b"b")),
            queue.enqueue(Bytes::from_static(b"c")),
        );
        assert!(a.unwrap().is_success());
        assert!(b.unwrap().is_success());
        assert!(c.unwrap().is_success());

        assert_eq!(upstream.max_in_flight(), 1);
        assert_eq!(upstream.bodies(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_throttled_calls_back_off_quadratically() {
        let upstream = Arc::new(ScriptedUpstream::new(200).with_script([429, 429]));
        let (queue, _worker) = RequestQueue::spawn(upstream.clone(), policy(5, 25), 8);

        let reply = queue.enqueue(Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(reply.status, 200);

        let times = upstream.call_times();
        assert_eq!(times.len(), 3);
        let first_gap = times[1] - times[0];
        let second_gap = times[2] - times[1];
        assert!(first_gap >= Duration::from_millis(25), "first gap {:?}", first_gap);
        assert!(second_gap >= Duration::from_millis(100), "second gap {:?}", second_gap);
    }

    #[tokio::test]
    async fn test_exhaustion_does_not_poison_later_requests() {
        let upstream = Arc::new(ScriptedUpstream::new(200).with_script([503, 503, 503]));
        let (queue, _worker) = RequestQueue::spawn(upstream.clone(), policy(2, 1), 8);

        let err = queue.enqueue(Bytes::from_static(b"doomed")).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamExhausted { status: 503, attempts: 3 }));

        let reply = queue.enqueue(Bytes::from_static(b"fine")).await.unwrap();
        assert_eq!(reply.status, 200);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let upstream = Arc::new(ScriptedUpstream::new(200).with_script([400]));
        let (queue, _worker) = RequestQueue::spawn(upstream.clone(), policy(5, 1), 8);

        let reply = queue.enqueue(Bytes::from_static(b"bad")).await.unwrap();
        assert_eq!(reply.status, 400);
        assert_eq!(upstream.call_times().len(), 1);
    }

    #[tokio::test]
    async fn test_worker_stops_when_handles_drop() {
        let upstream = Arc::new(ScriptedUpstream::new(200));
        let (queue, worker) = RequestQueue::spawn(upstream, policy(0, 1), 1);

        tokio_test::assert_ok!(queue.enqueue(Bytes::new()).await);
        drop(queue);
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker should stop")
            .unwrap();
    }
}
