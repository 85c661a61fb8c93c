//! Correlation of RPC replies with blocked callers.

use dashmap::DashMap;
use proto::Frame;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

/// Outstanding RPC calls of one session, keyed by correlation id.
#[derive(Default)]
pub struct PendingCalls {
    waiters: DashMap<String, oneshot::Sender<Frame>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter under a fresh correlation id.
    ///
    /// Must happen before the request is published so a fast reply always
    /// finds its waiter.
    pub fn register(&self) -> (String, oneshot::Receiver<Frame>) {
        let (tx, rx) = oneshot::channel();
        let correlation_id = Uuid::new_v4().to_string();
        self.waiters.insert(correlation_id.clone(), tx);
        (correlation_id, rx)
    }

    /// Delivers a reply to its waiter. Returns `false` when nobody waits for
    /// this correlation id (late or duplicate reply).
    pub fn resolve(&self, correlation_id: &str, reply: Frame) -> bool {
        match self.waiters.remove(correlation_id) {
            Some((_, tx)) => {
                // Receiver may have dropped (caller timed out); that's fine.
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    /// Unregisters a waiter that gave up.
    pub fn cancel(&self, correlation_id: &str) {
        self.waiters.remove(correlation_id);
    }

    /// Drops every waiter; their callers observe a closed channel.
    pub fn fail_all(&self) {
        let count = self.waiters.len();
        self.waiters.clear();
        if count > 0 {
            debug!(pending = count, "Failed outstanding RPC calls");
        }
    }

    /// Number of calls still waiting for a reply.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_to_matching_waiter_only() {
        let pending = PendingCalls::new();
        let (id_a, rx_a) = pending.register();
        let (id_b, rx_b) = pending.register();
        assert_ne!(id_a, id_b);

        assert!(pending.resolve(&id_b, Frame::new(b"b".to_vec())));
        assert!(pending.resolve(&id_a, Frame::new(b"a".to_vec())));

        assert_eq!(rx_a.await.expect("reply a").payload, b"a");
        assert_eq!(rx_b.await.expect("reply b").payload, b"b");
        assert!(pending.is_empty());
    }

    #[test]
    fn unknown_or_duplicate_reply_is_rejected() {
        let pending = PendingCalls::new();
        assert!(!pending.resolve("nobody", Frame::default()));

        let (id, _rx) = pending.register();
        assert!(pending.resolve(&id, Frame::default()));
        assert!(!pending.resolve(&id, Frame::default()));
    }

    #[test]
    fn cancel_removes_waiter() {
        let pending = PendingCalls::new();
        let (id, _rx) = pending.register();
        assert_eq!(pending.len(), 1);

        pending.cancel(&id);
        assert!(pending.is_empty());
        assert!(!pending.resolve(&id, Frame::default()));
    }

    #[tokio::test]
    async fn fail_all_closes_every_waiter() {
        let pending = PendingCalls::new();
        let (_, rx_a) = pending.register();
        let (_, rx_b) = pending.register();

        pending.fail_all();
        assert!(rx_a.await.is_err());
        assert!(rx_b.await.is_err());
        assert!(pending.is_empty());
    }
}
