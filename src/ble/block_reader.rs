//! Notification-fed block accumulation.
//!
//! A multi-packet transfer arrives as a burst of notifications on a single
//! characteristic. The link keeps one [`ReadAccumulator`] per download in
//! its exclusive region; the event pump appends to it, and the waiter in
//! [`TransportLink::read_block_with_notification`](crate::ble::TransportLink::read_block_with_notification)
//! checks its length under the same lock.

use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    received: AtomicUsize,
    target: AtomicUsize,
    notify: Notify,
}

/// Cancel and progress token shared between a download and its observer.
///
/// Cancelling is cooperative: the surrounding wait notices it at its next
/// check and gives up, but a platform call already in flight is not
/// interrupted.
#[derive(Debug, Clone, Default)]
pub struct ProgressToken {
    inner: Arc<TokenInner>,
}

impl ProgressToken {
    /// Create a fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Bytes received so far by the current transfer.
    pub fn bytes_received(&self) -> usize {
        self.inner.received.load(Ordering::SeqCst)
    }

    /// Bytes the current transfer is waiting for.
    pub fn target_bytes(&self) -> usize {
        self.inner.target.load(Ordering::SeqCst)
    }

    /// Transfer progress in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        let target = self.target_bytes();
        if target == 0 {
            return 0.0;
        }
        (self.bytes_received() as f64 / target as f64).min(1.0)
    }

    pub(crate) fn report(&self, received: usize, target: usize) {
        self.inner.received.store(received, Ordering::SeqCst);
        self.inner.target.store(target, Ordering::SeqCst);
    }
}

/// Growing buffer for one notification-delivered transfer.
#[derive(Debug)]
pub(crate) struct ReadAccumulator {
    uuid: Uuid,
    buffer: BytesMut,
    target: usize,
}

impl ReadAccumulator {
    pub fn new(uuid: Uuid, target: usize) -> Self {
        Self {
            uuid,
            buffer: BytesMut::with_capacity(target),
            target,
        }
    }

    /// Append a fragment if it belongs to this transfer's characteristic.
    pub fn append(&mut self, uuid: &Uuid, data: &[u8]) -> bool {
        if *uuid != self.uuid {
            return false;
        }
        self.buffer.extend_from_slice(data);
        true
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn is_complete(&self) -> bool {
        self.buffer.len() >= self.target
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::*;
    use std::time::Duration;

    #[test]
    fn test_accumulator_filters_by_uuid() {
        let mut acc = ReadAccumulator::new(WAVEFORM_READ_CHARACTERISTIC_UUID, 4);
        assert!(!acc.append(&CONTROL_CHARACTERISTIC_UUID, &[1, 2]));
        assert_eq!(acc.len(), 0);

        assert!(acc.append(&WAVEFORM_READ_CHARACTERISTIC_UUID, &[1, 2]));
        assert!(!acc.is_complete());
        assert!(acc.append(&WAVEFORM_READ_CHARACTERISTIC_UUID, &[3, 4, 5]));
        assert!(acc.is_complete());
        assert_eq!(acc.target(), 4);
        assert_eq!(acc.into_bytes(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_token_progress() {
        let token = ProgressToken::new();
        assert_eq!(token.fraction(), 0.0);
        token.report(50, 200);
        assert!((token.fraction() - 0.25).abs() < 1e-9);
        token.report(300, 200);
        assert_eq!(token.fraction(), 1.0);
    }

    #[tokio::test]
    async fn test_token_cancel_wakes_waiter() {
        let token = ProgressToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!token.is_cancelled());
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .expect("waiter task");
        assert!(token.is_cancelled());
    }
}
