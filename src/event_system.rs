//! Event system for UA and call state transitions.
//!
//! One ordered list of `(handler, context)` subscriptions. Delivery is
//! synchronous, on the publishing task, against a snapshot of the list
//! taken at publish time, so a handler may unsubscribe anything or destroy
//! the UA the event refers to without corrupting delivery to the rest of
//! the snapshot.
//!
//! Re-subscribing a handler that is already present replaces its stored
//! context in place instead of duplicating delivery.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::core::{Error, Result};
use crate::ua::{CallId, UaId};

/// Enumerated event kinds surfaced by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Registering,
    RegisterOk,
    RegisterFail,
    Unregistering,
    CallIncoming,
    CallRinging,
    CallProgress,
    CallEstablished,
    CallClosed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Registering => "REGISTERING",
            EventKind::RegisterOk => "REGISTER_OK",
            EventKind::RegisterFail => "REGISTER_FAIL",
            EventKind::Unregistering => "UNREGISTERING",
            EventKind::CallIncoming => "CALL_INCOMING",
            EventKind::CallRinging => "CALL_RINGING",
            EventKind::CallProgress => "CALL_PROGRESS",
            EventKind::CallEstablished => "CALL_ESTABLISHED",
            EventKind::CallClosed => "CALL_CLOSED",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable event record, constructed, delivered and discarded.
#[derive(Debug, Clone)]
pub struct UaEvent {
    pub kind: EventKind,
    pub ua: UaId,
    /// Canonical AOR of the originating UA.
    pub aor: String,
    pub call: Option<CallId>,
    /// Failure or closure reason, when the kind carries one.
    pub param: Option<String>,
}

/// Opaque per-subscription context.
pub type EventArg = Arc<dyn Any + Send + Sync>;

/// Subscription handler. Identity (the fn pointer) keys the subscriber
/// list: subscribing the same handler again replaces its context.
pub type EventHandler = fn(&UaEvent, &EventArg);

pub struct EventBus {
    subscribers: Mutex<Vec<(EventHandler, EventArg)>>,
    notify: Notify,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            subscribers: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    /// Append `(handler, ctx)`; insertion order is delivery order. If the
    /// handler is already subscribed only its context changes, keeping the
    /// original position.
    pub fn subscribe(&self, handler: EventHandler, ctx: EventArg) {
        let mut subs = self.subscribers.lock().unwrap();
        match subs.iter_mut().find(|(h, _)| *h == handler) {
            Some((_, slot)) => *slot = ctx,
            None => subs.push((handler, ctx)),
        }
    }

    /// Remove a handler; no-op when absent.
    pub fn unsubscribe(&self, handler: EventHandler) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|(h, _)| *h != handler);
    }

    /// Deliver to a snapshot of the current subscribers, in order, on the
    /// calling task. No lock is held while handlers run.
    pub fn publish(&self, event: &UaEvent) {
        tracing::debug!(kind = %event.kind, aor = %event.aor, "event");
        let snapshot: Vec<(EventHandler, EventArg)> =
            self.subscribers.lock().unwrap().clone();
        for (handler, ctx) in &snapshot {
            handler(event, ctx);
        }
        self.notify.notify_waiters();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Run until `cond` holds or the bounded wait elapses.
    ///
    /// The condition is re-checked after every published event; a stalled
    /// wait fails with `Timeout`.
    pub async fn wait_until(
        &self,
        limit: Duration,
        cond: impl Fn() -> bool,
    ) -> Result<()> {
        let deadline = Instant::now() + limit;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if cond() {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::Timeout);
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event() -> UaEvent {
        UaEvent {
            kind: EventKind::RegisterOk,
            ua: UaId(1),
            aor: "sip:user@example.com".to_string(),
            call: None,
            param: None,
        }
    }

    fn counting_handler(_ev: &UaEvent, ctx: &EventArg) {
        ctx.downcast_ref::<AtomicUsize>()
            .unwrap()
            .fetch_add(1, Ordering::SeqCst);
    }

    fn other_handler(_ev: &UaEvent, ctx: &EventArg) {
        ctx.downcast_ref::<AtomicUsize>()
            .unwrap()
            .fetch_add(10, Ordering::SeqCst);
    }

    #[test]
    fn delivers_in_subscription_order() {
        let bus = EventBus::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        bus.subscribe(counting_handler, a.clone());
        bus.subscribe(other_handler, b.clone());

        bus.publish(&event());
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn resubscribe_replaces_context_without_double_delivery() {
        let bus = EventBus::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        bus.subscribe(counting_handler, first.clone());
        bus.subscribe(counting_handler, second.clone());
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(&event());
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_is_noop_when_absent() {
        let bus = EventBus::new();
        bus.unsubscribe(counting_handler);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn handler_may_unsubscribe_during_delivery() {
        struct Ctx {
            bus: Arc<EventBus>,
            hits: AtomicUsize,
        }

        fn self_removing(_ev: &UaEvent, ctx: &EventArg) {
            let ctx = ctx.downcast_ref::<Ctx>().unwrap();
            ctx.hits.fetch_add(1, Ordering::SeqCst);
            ctx.bus.unsubscribe(self_removing);
        }

        let bus = Arc::new(EventBus::new());
        let later = Arc::new(AtomicUsize::new(0));
        let ctx = Arc::new(Ctx {
            bus: bus.clone(),
            hits: AtomicUsize::new(0),
        });
        bus.subscribe(self_removing, ctx.clone());
        bus.subscribe(counting_handler, later.clone());

        bus.publish(&event());
        // The snapshot still reached the second subscriber.
        assert_eq!(ctx.hits.load(Ordering::SeqCst), 1);
        assert_eq!(later.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(&event());
        assert_eq!(ctx.hits.load(Ordering::SeqCst), 1);
        assert_eq!(later.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn wait_until_observes_condition() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe(counting_handler, hits.clone());

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(&event());
        });

        let hits2 = hits.clone();
        bus.wait_until(Duration::from_secs(5), move || {
            hits2.load(Ordering::SeqCst) > 0
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn wait_until_times_out() {
        let bus = EventBus::new();
        let err = bus
            .wait_until(Duration::from_millis(20), || false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }
}
