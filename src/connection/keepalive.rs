//! Keep-alive monitor.
//!
//! Every `ping_interval` a Ping goes out and the monitor waits up to
//! `ping_timeout` for the matching Pong. A missing Pong closes the
//! connection; client connections then fall back to reconnecting.
//! Overdue requests are swept on the same tick.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::Inner;
use crate::error::TransportError;
use crate::protocol::Frame;

/// Ping bookkeeping shared between the monitor and the reader.
pub(crate) struct KeepAlive {
    next_ping_id: AtomicU32,
    outstanding: Mutex<Option<(u32, Instant)>>,
    last_rtt: Mutex<Option<Duration>>,
    pong: Arc<Notify>,
}

impl KeepAlive {
    pub(crate) fn new() -> Self {
        Self {
            next_ping_id: AtomicU32::new(1),
            outstanding: Mutex::new(None),
            last_rtt: Mutex::new(None),
            pong: Arc::new(Notify::new()),
        }
    }

    fn begin_ping(&self) -> u32 {
        let id = self.next_ping_id.fetch_add(1, Ordering::Relaxed);
        *self.outstanding.lock() = Some((id, Instant::now()));
        id
    }

    /// Record a pong. Stale or unsolicited pongs are ignored.
    pub(crate) fn on_pong(&self, ping_id: u32) {
        let mut outstanding = self.outstanding.lock();
        match *outstanding {
            Some((id, sent_at)) if id == ping_id => {
                *outstanding = None;
                *self.last_rtt.lock() = Some(sent_at.elapsed());
                self.pong.notify_one();
            }
            _ => tracing::debug!("ignoring pong {}", ping_id),
        }
    }

    /// Round-trip time of the last answered ping.
    pub(crate) fn last_rtt(&self) -> Option<Duration> {
        *self.last_rtt.lock()
    }
}

/// Monitor loop; returns when the connection goes away or times out.
pub(crate) async fn monitor(conn: Weak<Inner>, interval: Duration, timeout: Duration) {
    loop {
        tokio::time::sleep(interval).await;

        let Some(inner) = conn.upgrade() else {
            return;
        };
        if inner.is_closed() {
            return;
        }

        let expired = inner.correlator.expire_overdue();
        if expired > 0 {
            tracing::debug!("connection {}: {} requests expired", inner.id, expired);
        }

        let ping_id = inner.keepalive.begin_ping();
        let pong_signal = inner.keepalive.pong.clone();
        inner.writer.send_nowait(Frame::Ping { ping_id });
        // The wait must not keep a dropped connection alive.
        drop(inner);

        let pong = tokio::time::timeout(timeout, pong_signal.notified()).await;

        match pong {
            Ok(()) => tracing::trace!("ping {} answered", ping_id),
            Err(_) => {
                if let Some(inner) = conn.upgrade() {
                    tracing::warn!(
                        "connection {}: no pong within {:?}, closing",
                        inner.id,
                        timeout
                    );
                    inner.shutdown(Some(&TransportError::ConnectionClosed));
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_pong_clears_outstanding() {
        let ka = KeepAlive::new();
        let id = ka.begin_ping();
        ka.on_pong(id);
        assert!(ka.outstanding.lock().is_none());
        assert!(ka.last_rtt().is_some());
    }

    #[test]
    fn test_stale_pong_ignored() {
        let ka = KeepAlive::new();
        let first = ka.begin_ping();
        let second = ka.begin_ping();
        ka.on_pong(first);
        assert_eq!(ka.outstanding.lock().map(|(id, _)| id), Some(second));
        assert!(ka.last_rtt().is_none());
    }
}
