//! Pending requests tracker
//!
//! Correlates `request` envelopes sent through a tunnel with the `response`
//! the agent sends back. Every entry is completed exactly once: whoever
//! removes it from the map (response, timeout, cancellation or connection
//! loss) delivers the outcome; everyone else is a no-op.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use edgelink_proto::ProxiedResponse;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::TunnelError;

/// Outcome delivered to a waiter
pub type RequestOutcome = Result<ProxiedResponse, TunnelError>;

/// Registration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PendingError {
    #[error("Request id {0} is already pending")]
    DuplicateId(String),

    /// `cancel_all` already ran; the connection is gone
    #[error("Pending table closed")]
    Closed,
}

struct Inner {
    requests: DashMap<String, oneshot::Sender<RequestOutcome>>,
    closed: AtomicBool,
    label: String,
}

/// Tracks requests awaiting responses on one connection
#[derive(Clone)]
pub struct PendingRequests {
    inner: Arc<Inner>,
}

impl PendingRequests {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                requests: DashMap::new(),
                closed: AtomicBool::new(false),
                label: label.into(),
            }),
        }
    }

    /// Register a new pending request with its own deadline
    pub fn register(&self, id: &str, timeout: Duration) -> Result<PendingResponse, PendingError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(PendingError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        match self.inner.requests.entry(id.to_string()) {
            Entry::Occupied(_) => return Err(PendingError::DuplicateId(id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        // A concurrent cancel_all may have drained the map before our insert
        if self.inner.closed.load(Ordering::SeqCst) {
            self.inner.requests.remove(id);
            return Err(PendingError::Closed);
        }

        debug!("[{}] Registered pending request {}", self.inner.label, id);
        Ok(PendingResponse {
            id: id.to_string(),
            rx: Some(rx),
            deadline: Instant::now() + timeout,
            table: self.clone(),
        })
    }

    /// Deliver the outcome for a pending request.
    ///
    /// Returns false if the id is unknown (already completed, timed out,
    /// cancelled, or never registered).
    pub fn resolve(&self, id: &str, outcome: RequestOutcome) -> bool {
        match self.inner.requests.remove(id) {
            Some((_, tx)) => {
                debug!("[{}] Routing response for request {}", self.inner.label, id);
                if tx.send(outcome).is_err() {
                    debug!(
                        "[{}] Waiter for request {} went away before the response",
                        self.inner.label, id
                    );
                    return false;
                }
                true
            }
            None => {
                warn!(
                    "[{}] Dropping response for unknown request {}",
                    self.inner.label, id
                );
                false
            }
        }
    }

    /// Fail the request with [`TunnelError::Timeout`]
    pub fn expire(&self, id: &str) -> bool {
        match self.inner.requests.remove(id) {
            Some((_, tx)) => {
                debug!("[{}] Request {} timed out", self.inner.label, id);
                let _ = tx.send(Err(TunnelError::Timeout));
                true
            }
            None => false,
        }
    }

    /// Forget a pending request without notifying the peer
    pub fn cancel(&self, id: &str) -> bool {
        if self.inner.requests.remove(id).is_some() {
            debug!("[{}] Cancelled pending request {}", self.inner.label, id);
            return true;
        }
        false
    }

    /// Fail every pending request with [`TunnelError::ConnectionLost`] and
    /// refuse later registrations
    pub fn cancel_all(&self, reason: &str) -> usize {
        self.inner.closed.store(true, Ordering::SeqCst);

        let ids: Vec<String> = self
            .inner
            .requests
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut failed = 0;
        for id in ids {
            if let Some((_, tx)) = self.inner.requests.remove(&id) {
                let _ = tx.send(Err(TunnelError::ConnectionLost(reason.to_string())));
                failed += 1;
            }
        }

        if failed > 0 {
            debug!(
                "[{}] Failed {} pending requests: {}",
                self.inner.label, failed, reason
            );
        }
        failed
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Get count of pending requests
    pub fn count(&self) -> usize {
        self.inner.requests.len()
    }
}

/// Waiter for one pending request.
///
/// Dropping it before completion cancels the request.
pub struct PendingResponse {
    id: String,
    rx: Option<oneshot::Receiver<RequestOutcome>>,
    deadline: Instant,
    table: PendingRequests,
}

impl PendingResponse {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the response or the deadline, whichever comes first
    pub async fn wait(mut self) -> RequestOutcome {
        let outcome = match self.rx.as_mut() {
            None => Err(TunnelError::ConnectionClosed),
            Some(rx) => match tokio::time::timeout_at(self.deadline, &mut *rx).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(TunnelError::ConnectionClosed),
                Err(_) => {
                    // Either we expire it, or the winner's outcome is already on its way
                    self.table.expire(&self.id);
                    rx.await.unwrap_or(Err(TunnelError::Timeout))
                }
            },
        };

        self.rx = None;
        outcome
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if self.rx.is_some() {
            self.table.cancel(&self.id);
        }
    }
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("id", &self.id)
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG: Duration = Duration::from_secs(30);

    fn ok(status: u16) -> RequestOutcome {
        Ok(ProxiedResponse::new(status, "[]"))
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let tracker = PendingRequests::new("test");

        let pending = tracker.register("r1", LONG).unwrap();
        assert_eq!(tracker.count(), 1);

        assert!(tracker.resolve("r1", ok(200)));
        assert_eq!(tracker.count(), 0);

        let response = pending.wait().await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body.as_ref(), b"[]");
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let tracker = PendingRequests::new("test");
        let _first = tracker.register("r1", LONG).unwrap();

        assert_eq!(
            tracker.register("r1", LONG).unwrap_err(),
            PendingError::DuplicateId("r1".to_string())
        );
        assert_eq!(tracker.count(), 1);
    }

    #[tokio::test]
    async fn test_resolve_not_found() {
        let tracker = PendingRequests::new("test");
        assert!(!tracker.resolve("r999", ok(200)));
    }

    #[tokio::test]
    async fn test_double_resolve_delivers_once() {
        let tracker = PendingRequests::new("test");
        let pending = tracker.register("r5", LONG).unwrap();

        assert!(tracker.resolve("r5", ok(200)));
        assert!(!tracker.resolve("r5", ok(500)));

        assert_eq!(pending.wait().await.unwrap().status, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let tracker = PendingRequests::new("test");
        let pending = tracker.register("r2", Duration::from_secs(5)).unwrap();

        let started = Instant::now();
        assert_eq!(pending.wait().await, Err(TunnelError::Timeout));
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(tracker.count(), 0);

        // A late response is dropped
        assert!(!tracker.resolve("r2", ok(200)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadlines_are_per_request() {
        let tracker = PendingRequests::new("test");
        let short = tracker.register("short", Duration::from_secs(1)).unwrap();
        let long = tracker.register("long", Duration::from_secs(60)).unwrap();

        assert_eq!(short.wait().await, Err(TunnelError::Timeout));
        assert_eq!(tracker.count(), 1);

        assert!(tracker.resolve("long", ok(201)));
        assert_eq!(long.wait().await.unwrap().status, 201);
    }

    #[tokio::test]
    async fn test_expire_vs_resolve_first_wins() {
        let tracker = PendingRequests::new("test");
        let pending = tracker.register("r3", LONG).unwrap();

        assert!(tracker.resolve("r3", ok(204)));
        assert!(!tracker.expire("r3"));

        assert_eq!(pending.wait().await.unwrap().status, 204);
    }

    #[tokio::test]
    async fn test_dropped_waiter_cancels() {
        let tracker = PendingRequests::new("test");
        let pending = tracker.register("r4", LONG).unwrap();
        drop(pending);

        assert_eq!(tracker.count(), 0);
        assert!(!tracker.resolve("r4", ok(200)));
    }

    #[tokio::test]
    async fn test_cancel_all_fails_everyone_and_closes() {
        let tracker = PendingRequests::new("test");

        let waiters: Vec<_> = (1..=5)
            .map(|i| tracker.register(&format!("r{}", i), LONG).unwrap())
            .collect();

        assert_eq!(tracker.cancel_all("agent disconnected"), 5);
        assert!(tracker.is_closed());

        for waiter in waiters {
            assert_eq!(
                waiter.wait().await,
                Err(TunnelError::ConnectionLost("agent disconnected".to_string()))
            );
        }

        assert_eq!(
            tracker.register("r6", LONG).unwrap_err(),
            PendingError::Closed
        );
    }

    #[tokio::test]
    async fn test_concurrent_register_and_resolve() {
        let tracker = PendingRequests::new("test");

        let mut handles = vec![];
        for i in 1..=20 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("r{}", i);
                let pending = tracker.register(&id, LONG).unwrap();

                tokio::time::sleep(Duration::from_millis(1)).await;
                tracker.resolve(&id, ok(200 + i as u16));

                pending.wait().await.unwrap().status
            }));
        }

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), 201 + i as u16);
        }
        assert_eq!(tracker.count(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_is_delivered() {
        let tracker = PendingRequests::new("test");
        let pending = tracker.register("r7", LONG).unwrap();

        tracker.resolve(
            "r7",
            Err(TunnelError::Remote {
                code: "unavailable".into(),
                message: "docker down".into(),
            }),
        );

        assert!(matches!(
            pending.wait().await,
            Err(TunnelError::Remote { ref code, .. }) if code == "unavailable"
        ));
    }
}
