//! Routing of inbound frames to the callers waiting for them.
//!
//! Owned by a single connection event loop, so it needs no locking. A
//! frame goes to the pending reply with its id, else to the subscription
//! with its id, else (when it has no id) to the subscriptions of the number
//! it names.
//!
//! Several subscriptions may share a number. The correlator counts the live
//! handles per number so the daemon is only told to unsubscribe once the
//! last of them is released.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use signald_bridge_shared::{DaemonFrame, ProtocolError, RequestId};

use crate::error::NetError;

pub type ReplySender = oneshot::Sender<Result<DaemonFrame, NetError>>;
pub type FrameSender = mpsc::UnboundedSender<DaemonFrame>;

/// Where a frame ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Handed to the single-reply waiter with the same id.
    Reply,
    /// Forwarded to this many subscriptions.
    Subscriptions(usize),
    /// Nobody was waiting for it.
    Dropped,
}

struct SubscriptionEntry {
    number: String,
    frames: FrameSender,
}

#[derive(Default)]
pub struct Correlator {
    pending: HashMap<RequestId, ReplySender>,
    subscriptions: HashMap<RequestId, SubscriptionEntry>,
    holders: HashMap<String, usize>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the single reply carrying `id`.
    pub fn register_reply(&mut self, id: RequestId, reply: ReplySender) {
        if self.pending.insert(id.clone(), reply).is_some() {
            warn!(id = %id, "Replaced an outstanding waiter with the same request id");
        }
    }

    /// Forget a waiter that gave up.
    pub fn cancel_reply(&mut self, id: &RequestId) -> bool {
        self.pending.remove(id).is_some()
    }

    pub fn register_subscription(&mut self, id: RequestId, number: String, frames: FrameSender) {
        *self.holders.entry(number.clone()).or_default() += 1;
        self.subscriptions
            .insert(id, SubscriptionEntry { number, frames });
    }

    /// Release the handle registered as `id` for `number`.
    ///
    /// Returns true when it was the last handle for that number. The routing
    /// entry may already be gone if a frame found its receiver closed; the
    /// count is kept until the release arrives.
    pub fn release_subscription(&mut self, id: &RequestId, number: &str) -> bool {
        self.subscriptions.remove(id);
        match self.holders.get_mut(number) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.holders.remove(number);
                true
            }
            None => {
                debug!(id = %id, number, "Released a subscription that was never counted");
                false
            }
        }
    }

    /// Number of live subscription handles for `number`.
    pub fn holders(&self, number: &str) -> usize {
        self.holders.get(number).copied().unwrap_or(0)
    }

    pub fn route(&mut self, frame: DaemonFrame) -> Route {
        if let Some(id) = frame.id.clone() {
            if let Some(reply) = self.pending.remove(&id) {
                if reply.send(Ok(frame)).is_err() {
                    debug!(id = %id, "Reply arrived after its waiter went away");
                }
                return Route::Reply;
            }

            if let Some(entry) = self.subscriptions.get(&id) {
                if entry.frames.send(frame).is_err() {
                    self.subscriptions.remove(&id);
                    return Route::Dropped;
                }
                return Route::Subscriptions(1);
            }

            debug!(id = %id, kind = %frame.kind, "Dropping frame with unknown request id");
            return Route::Dropped;
        }

        let target = frame.username().map(str::to_string);
        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, entry) in &self.subscriptions {
            if target.as_deref().is_some_and(|number| number != entry.number) {
                continue;
            }
            if entry.frames.send(frame.clone()).is_ok() {
                delivered += 1;
            } else {
                closed.push(id.clone());
            }
        }

        for id in closed {
            self.subscriptions.remove(&id);
        }

        if delivered == 0 {
            debug!(kind = %frame.kind, "Dropping uncorrelated frame with no subscriber");
            Route::Dropped
        } else {
            Route::Subscriptions(delivered)
        }
    }

    /// Wake the waiter a malformed frame was meant for, if it can be told
    /// apart. Returns whether a waiter was woken.
    pub fn deliver_protocol_error(&mut self, error: ProtocolError) -> bool {
        let Some(id) = error.request_id.clone() else {
            return false;
        };
        match self.pending.remove(&RequestId(id)) {
            Some(reply) => {
                let _ = reply.send(Err(NetError::Protocol(error)));
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding waiter and end every subscription.
    pub fn fail_all(&mut self, reason: &str) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(NetError::Transport(reason.to_string())));
        }
        // Dropping the senders ends each subscriber's stream.
        self.subscriptions.clear();
        self.holders.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(json: &str) -> DaemonFrame {
        DaemonFrame::parse(json).unwrap()
    }

    #[test]
    fn test_reply_routed_by_id() {
        let mut correlator = Correlator::new();
        let (tx, mut rx) = oneshot::channel();
        correlator.register_reply(RequestId::from("a"), tx);

        assert_eq!(
            correlator.route(frame(r#"{"id":"b","type":"success"}"#)),
            Route::Dropped
        );
        assert_eq!(
            correlator.route(frame(r#"{"id":"a","type":"success"}"#)),
            Route::Reply
        );

        let reply = rx.try_recv().unwrap().unwrap();
        assert_eq!(reply.kind, "success");
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn test_reply_is_not_fanned_out() {
        let mut correlator = Correlator::new();
        let (tx, _rx) = oneshot::channel();
        correlator.register_reply(RequestId::from("a"), tx);

        assert_eq!(correlator.route(frame(r#"{"id":"a","type":"x"}"#)), Route::Reply);
        assert_eq!(correlator.route(frame(r#"{"id":"a","type":"x"}"#)), Route::Dropped);
    }

    #[test]
    fn test_uncorrelated_frames_follow_username() {
        let mut correlator = Correlator::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        correlator.register_subscription(RequestId::from("s1"), "+1".into(), tx1);
        correlator.register_subscription(RequestId::from("s2"), "+2".into(), tx2);

        let route = correlator.route(frame(r#"{"type":"message","data":{"username":"+2"}}"#));
        assert_eq!(route, Route::Subscriptions(1));
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap().username(), Some("+2"));

        let route = correlator.route(frame(r#"{"type":"message","data":{}}"#));
        assert_eq!(route, Route::Subscriptions(2));
    }

    #[test]
    fn test_tagged_frame_goes_to_its_subscription_in_order() {
        let mut correlator = Correlator::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        correlator.register_subscription(RequestId::from("s1"), "+1".into(), tx);

        correlator.route(frame(r#"{"id":"s1","type":"subscribed"}"#));
        correlator.route(frame(r#"{"type":"message","data":{"n":1}}"#));
        correlator.route(frame(r#"{"type":"message","data":{"n":2}}"#));

        assert_eq!(rx.try_recv().unwrap().kind, "subscribed");
        assert_eq!(rx.try_recv().unwrap().data["n"], 1);
        assert_eq!(rx.try_recv().unwrap().data["n"], 2);
    }

    #[test]
    fn test_closed_subscription_is_pruned() {
        let mut correlator = Correlator::new();
        let (tx, rx) = mpsc::unbounded_channel();
        correlator.register_subscription(RequestId::from("s1"), "+1".into(), tx);
        drop(rx);

        assert_eq!(correlator.route(frame(r#"{"type":"message"}"#)), Route::Dropped);
        assert_eq!(correlator.subscription_count(), 0);
    }

    #[test]
    fn test_protocol_error_wakes_matching_waiter() {
        let mut correlator = Correlator::new();
        let (tx, mut rx) = oneshot::channel();
        correlator.register_reply(RequestId::from("a"), tx);

        assert!(!correlator.deliver_protocol_error(ProtocolError::new("garbage")));

        let err = DaemonFrame::parse(r#"{"id":"a","type":[]}"#).unwrap_err();
        assert!(correlator.deliver_protocol_error(err));
        assert!(matches!(rx.try_recv().unwrap(), Err(NetError::Protocol(_))));
    }

    #[test]
    fn test_fail_all() {
        let mut correlator = Correlator::new();
        let (tx, mut rx) = oneshot::channel();
        let (sub_tx, mut sub_rx) = mpsc::unbounded_channel();
        correlator.register_reply(RequestId::from("a"), tx);
        correlator.register_subscription(RequestId::from("s"), "+1".into(), sub_tx);

        correlator.fail_all("daemon went away");

        match rx.try_recv().unwrap() {
            Err(NetError::Transport(reason)) => assert_eq!(reason, "daemon went away"),
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(matches!(
            sub_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(correlator.subscription_count(), 0);
    }

    #[test]
    fn test_last_release_per_number_reports_true() {
        let mut correlator = Correlator::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let (tx3, _rx3) = mpsc::unbounded_channel();
        correlator.register_subscription(RequestId::from("s1"), "+1".into(), tx1);
        correlator.register_subscription(RequestId::from("s2"), "+1".into(), tx2);
        correlator.register_subscription(RequestId::from("s3"), "+2".into(), tx3);
        assert_eq!(correlator.holders("+1"), 2);

        assert!(!correlator.release_subscription(&RequestId::from("s1"), "+1"));
        assert_eq!(correlator.holders("+1"), 1);
        assert_eq!(correlator.subscription_count(), 2);

        assert!(correlator.release_subscription(&RequestId::from("s3"), "+2"));
        assert!(correlator.release_subscription(&RequestId::from("s2"), "+1"));
        assert_eq!(correlator.holders("+1"), 0);
        assert_eq!(correlator.subscription_count(), 0);

        assert!(!correlator.release_subscription(&RequestId::from("s2"), "+1"));
    }

    #[test]
    fn test_pruned_subscription_still_counts_until_released() {
        let mut correlator = Correlator::new();
        let (tx, rx) = mpsc::unbounded_channel();
        correlator.register_subscription(RequestId::from("s1"), "+1".into(), tx);
        drop(rx);

        assert_eq!(correlator.route(frame(r#"{"type":"message"}"#)), Route::Dropped);
        assert_eq!(correlator.subscription_count(), 0);
        assert_eq!(correlator.holders("+1"), 1);
        assert!(correlator.release_subscription(&RequestId::from("s1"), "+1"));
    }

    #[test]
    fn test_cancel_reply() {
        let mut correlator = Correlator::new();
        let (tx, _rx) = oneshot::channel();
        correlator.register_reply(RequestId::from("a"), tx);
        assert!(correlator.cancel_reply(&RequestId::from("a")));
        assert!(!correlator.cancel_reply(&RequestId::from("a")));
    }
}
