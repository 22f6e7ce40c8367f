//! Request/response correlation.
//!
//! Each outgoing request takes a correlation ID from a monotonic counter
//! and parks a oneshot sender in the pending table. The reader resolves
//! the entry when the matching response arrives; close fails every entry
//! at once. An entry is settled exactly once: the first of resolve,
//! expire, cancel or fail wins and the rest are no-ops.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Sleep;

use crate::error::{Result, TransportError};
use crate::protocol::Payload;

type Outcome = Result<Payload>;

struct PendingEntry {
    tx: oneshot::Sender<Outcome>,
    created: Instant,
    deadline: Option<Instant>,
}

struct Table {
    next_id: u32,
    pending: HashMap<u32, PendingEntry>,
    closed: bool,
}

/// Pending-request table of one connection.
pub struct Correlator {
    table: Mutex<Table>,
}

impl Correlator {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                next_id: 1,
                pending: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Register a new pending request.
    ///
    /// IDs are handed out in increasing order, wrap at `u32::MAX`, and
    /// skip zero as well as any ID still waiting for its response.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` once [`fail_all`](Self::fail_all) has run.
    pub fn issue(self: &Arc<Self>, timeout: Option<Duration>) -> Result<ResponseFuture> {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let deadline = timeout.map(|t| now + t);

        let id = {
            let mut table = self.table.lock();
            if table.closed {
                return Err(TransportError::ConnectionClosed);
            }
            if table.pending.len() >= u32::MAX as usize - 1 {
                return Err(TransportError::IllegalState(
                    "correlation ids exhausted".into(),
                ));
            }

            let mut id = table.next_id;
            while id == 0 || table.pending.contains_key(&id) {
                id = id.wrapping_add(1);
            }
            table.next_id = id.wrapping_add(1);

            table.pending.insert(
                id,
                PendingEntry {
                    tx,
                    created: now,
                    deadline,
                },
            );
            id
        };

        Ok(ResponseFuture {
            id,
            rx,
            correlator: self.clone(),
            sleep: timeout.map(|t| Box::pin(tokio::time::sleep(t))),
            done: false,
        })
    }

    /// Complete a pending request with its response.
    ///
    /// Returns `false` when the ID is unknown (already settled, or never
    /// issued); that is logged and otherwise ignored.
    pub fn resolve(&self, id: u32, payload: Payload) -> bool {
        let entry = self.table.lock().pending.remove(&id);
        match entry {
            Some(entry) => {
                tracing::trace!(
                    "request {} resolved after {:?}",
                    id,
                    entry.created.elapsed()
                );
                let _ = entry.tx.send(Ok(payload));
                true
            }
            None => {
                let anomaly = TransportError::ProtocolAnomaly(format!(
                    "response for unknown request {}",
                    id
                ));
                tracing::warn!("{}", anomaly);
                false
            }
        }
    }

    /// Fail a pending request with `RequestTimeout`.
    pub fn expire(&self, id: u32) -> bool {
        self.settle(id, TransportError::RequestTimeout(id))
    }

    /// Drop a pending request whose caller went away.
    pub fn cancel(&self, id: u32) -> bool {
        self.table.lock().pending.remove(&id).is_some()
    }

    /// Expire every entry whose deadline has passed. Returns the count.
    pub fn expire_overdue(&self) -> usize {
        let now = Instant::now();
        let overdue: Vec<(u32, PendingEntry)> = {
            let mut table = self.table.lock();
            let ids: Vec<u32> = table
                .pending
                .iter()
                .filter(|(_, e)| e.deadline.is_some_and(|d| d <= now))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| table.pending.remove(&id).map(|e| (id, e)))
                .collect()
        };

        let count = overdue.len();
        for (id, entry) in overdue {
            tracing::debug!("request {} expired", id);
            let _ = entry.tx.send(Err(TransportError::RequestTimeout(id)));
        }
        count
    }

    /// Fail every pending request and refuse new ones.
    ///
    /// `make_err` builds the error handed to each waiter.
    pub fn fail_all(&self, make_err: impl Fn() -> TransportError) -> usize {
        let drained: Vec<PendingEntry> = {
            let mut table = self.table.lock();
            table.closed = true;
            table.pending.drain().map(|(_, e)| e).collect()
        };

        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(make_err()));
        }
        count
    }

    /// Number of requests waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.table.lock().pending.len()
    }

    /// Whether [`fail_all`](Self::fail_all) has run.
    pub fn is_closed(&self) -> bool {
        self.table.lock().closed
    }

    fn settle(&self, id: u32, err: TransportError) -> bool {
        let entry = self.table.lock().pending.remove(&id);
        match entry {
            Some(entry) => {
                let _ = entry.tx.send(Err(err));
                true
            }
            None => false,
        }
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the eventual response of one request.
///
/// Await it, give it a deadline with [`with_timeout`](Self::with_timeout),
/// or poll it without blocking through [`try_result`](Self::try_result).
/// Dropping an unsettled handle cancels the pending entry.
pub struct ResponseFuture {
    id: u32,
    rx: oneshot::Receiver<Outcome>,
    correlator: Arc<Correlator>,
    sleep: Option<Pin<Box<Sleep>>>,
    done: bool,
}

impl ResponseFuture {
    /// Correlation ID of the request.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Replace the deadline, counted from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.sleep = Some(Box::pin(tokio::time::sleep(timeout)));
        self
    }

    /// Non-blocking check for the outcome.
    ///
    /// Returns `None` while the response is still outstanding.
    pub fn try_result(&mut self) -> Option<Result<Payload>> {
        if self.done {
            return Some(Err(TransportError::IllegalState(
                "response already taken".into(),
            )));
        }
        match self.rx.try_recv() {
            Ok(outcome) => {
                self.done = true;
                Some(outcome)
            }
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.done = true;
                Some(Err(TransportError::ConnectionClosed))
            }
        }
    }

    fn finish(
        &mut self,
        outcome: std::result::Result<Outcome, oneshot::error::RecvError>,
    ) -> Outcome {
        self.done = true;
        outcome.unwrap_or(Err(TransportError::ConnectionClosed))
    }
}

impl Future for ResponseFuture {
    type Output = Result<Payload>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if let Poll::Ready(outcome) = Pin::new(&mut this.rx).poll(cx) {
            return Poll::Ready(this.finish(outcome));
        }

        if let Some(sleep) = this.sleep.as_mut() {
            if sleep.as_mut().poll(cx).is_ready() {
                this.sleep = None;
                // Expire through the table so a response racing the timer
                // still settles the entry exactly once.
                this.correlator.expire(this.id);
                if let Poll::Ready(outcome) = Pin::new(&mut this.rx).poll(cx) {
                    return Poll::Ready(this.finish(outcome));
                }
            }
        }

        Poll::Pending
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        if !self.done {
            self.correlator.cancel(self.id);
        }
    }
}

impl std::fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("id", &self.id)
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn payload(body: &'static [u8]) -> Payload {
        Payload::new(7, Bytes::from_static(body))
    }

    #[tokio::test]
    async fn test_issue_and_resolve() {
        let correlator = Arc::new(Correlator::new());
        let fut = correlator.issue(None).unwrap();
        let id = fut.id();
        assert_eq!(id, 1);
        assert_eq!(correlator.pending_count(), 1);

        assert!(correlator.resolve(id, payload(b"ok")));
        assert_eq!(fut.await.unwrap(), payload(b"ok"));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn test_resolve_unknown_is_not_fatal() {
        let correlator = Correlator::new();
        assert!(!correlator.resolve(99, payload(b"late")));
    }

    #[tokio::test]
    async fn test_settles_exactly_once() {
        let correlator = Arc::new(Correlator::new());
        let fut = correlator.issue(None).unwrap();
        let id = fut.id();

        assert!(correlator.resolve(id, payload(b"first")));
        assert!(!correlator.resolve(id, payload(b"second")));
        assert!(!correlator.expire(id));

        assert_eq!(fut.await.unwrap(), payload(b"first"));
    }

    #[test]
    fn test_ids_skip_zero_and_in_use() {
        let correlator = Arc::new(Correlator::new());
        correlator.table.lock().next_id = u32::MAX;

        let a = correlator.issue(None).unwrap();
        assert_eq!(a.id(), u32::MAX);

        let b = correlator.issue(None).unwrap();
        assert_eq!(b.id(), 1);

        correlator.table.lock().next_id = 1;
        let c = correlator.issue(None).unwrap();
        assert_eq!(c.id(), 2);
    }

    #[tokio::test]
    async fn test_fail_all_and_refuse_new() {
        let correlator = Arc::new(Correlator::new());
        let futs: Vec<_> = (0..5).map(|_| correlator.issue(None).unwrap()).collect();

        assert_eq!(correlator.fail_all(|| TransportError::ConnectionClosed), 5);

        for fut in futs {
            assert!(matches!(fut.await, Err(TransportError::ConnectionClosed)));
        }
        assert!(matches!(
            correlator.issue(None),
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_expires_entry() {
        let correlator = Arc::new(Correlator::new());
        let fut = correlator
            .issue(None)
            .unwrap()
            .with_timeout(Duration::from_millis(50));
        let id = fut.id();

        let err = fut.await.unwrap_err();
        assert!(matches!(err, TransportError::RequestTimeout(i) if i == id));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_try_result() {
        let correlator = Arc::new(Correlator::new());
        let mut fut = correlator.issue(None).unwrap();

        assert!(fut.try_result().is_none());
        correlator.resolve(fut.id(), payload(b"x"));
        assert_eq!(fut.try_result().unwrap().unwrap(), payload(b"x"));
    }

    #[test]
    fn test_drop_cancels() {
        let correlator = Arc::new(Correlator::new());
        let fut = correlator.issue(None).unwrap();
        drop(fut);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_expire_overdue() {
        let correlator = Arc::new(Correlator::new());
        let mut short = correlator.issue(Some(Duration::from_millis(10))).unwrap();
        let mut long = correlator.issue(Some(Duration::from_secs(60))).unwrap();

        // Deadlines are wall-clock instants; wait for real.
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(correlator.expire_overdue(), 1);

        assert!(matches!(
            short.try_result(),
            Some(Err(TransportError::RequestTimeout(_)))
        ));
        assert!(long.try_result().is_none());
    }
}
