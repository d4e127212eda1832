//! Subscription manager: the set of live queries and their callbacks.
//!
//! Each subscription id owns one slot. A slot holds the query, the
//! callback, the `show_hidden` option and the lifecycle state:
//!
//! ```text
//! Pending → Active → Stale (disconnect) → Pending (resubscribe) → Active
//!     any state → Cancelled (unsubscribe, terminal)
//! ```
//!
//! Registration and resubscription start a new epoch for the slot. Send
//! outcomes reported by the writer carry the epoch of their frame and are
//! ignored once the slot has moved to a newer one.
//!
//! Deliveries run with the slot's gate held for reading. Replacing a
//! callback or cancelling a slot takes the gate for writing, so once
//! `register` or `unsubscribe` returns no delivery to the old callback is
//! still running and none can start.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};

use unigraph_core::{SchemaCatalog, SubscriptionId, UnigraphObject};

/// Receives every result batch of one subscription.
pub type Callback = Arc<dyn Fn(Vec<UnigraphObject>) + Send + Sync>;

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Registered; the subscribe frame is queued or in flight.
    Pending,
    /// Acknowledged by the transport; receiving pushes.
    Active,
    /// The channel dropped. No deliveries until it is re-issued.
    Stale,
    Cancelled,
}

/// Options for type subscriptions.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Include hidden entities. Falls back to the client configuration.
    pub show_hidden: Option<bool>,
    /// Replacement for the default selection body of the type query.
    pub query_as: Option<String>,
}

impl SubscribeOptions {
    pub fn show_hidden(mut self, show_hidden: bool) -> Self {
        self.show_hidden = Some(show_hidden);
        self
    }

    pub fn query_as(mut self, body: impl Into<String>) -> Self {
        self.query_as = Some(body.into());
        self
    }
}

/// A callback failed while handling a batch. Logged and counted, never
/// returned to callers.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Delivery to subscription {subscription_id} failed: {message}")]
pub struct DeliveryError {
    pub subscription_id: SubscriptionId,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// A subscription that should be (re-)sent to the store.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Resend {
    pub id: SubscriptionId,
    pub query: String,
    pub show_hidden: bool,
    pub epoch: u64,
}

struct SlotInner {
    query: String,
    show_hidden: bool,
    callback: Callback,
    state: SubscriptionState,
    epoch: u64,
}

struct Slot {
    inner: Mutex<SlotInner>,
    gate: RwLock<()>,
}

impl Slot {
    fn lock(&self) -> std::sync::MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait until no delivery holds the gate.
    ///
    /// Skipped when called from this slot's own callback, which already
    /// holds it.
    fn drain(&self, id: SubscriptionId) {
        if DELIVERING.with(|d| d.get()) == Some(id) {
            return;
        }
        drop(self.gate.write().unwrap_or_else(|e| e.into_inner()));
    }
}

thread_local! {
    static DELIVERING: Cell<Option<SubscriptionId>> = const { Cell::new(None) };
}

/// Marks the current thread as running `id`'s callback.
struct DeliveringMark(Option<SubscriptionId>);

impl DeliveringMark {
    fn enter(id: SubscriptionId) -> Self {
        Self(DELIVERING.with(|d| d.replace(Some(id))))
    }
}

impl Drop for DeliveringMark {
    fn drop(&mut self) {
        DELIVERING.with(|d| d.set(self.0));
    }
}

#[derive(Default)]
struct ErrorLog {
    total: u64,
    last: HashMap<SubscriptionId, DeliveryError>,
}

pub(crate) struct SubscriptionRegistry {
    slots: Mutex<HashMap<SubscriptionId, Arc<Slot>>>,
    cancelled: Mutex<HashSet<SubscriptionId>>,
    errors: Mutex<ErrorLog>,
    malformed: std::sync::atomic::AtomicU64,
    catalog: Arc<SchemaCatalog>,
}

impl SubscriptionRegistry {
    pub(crate) fn new(catalog: Arc<SchemaCatalog>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(HashSet::new()),
            errors: Mutex::new(ErrorLog::default()),
            malformed: std::sync::atomic::AtomicU64::new(0),
            catalog,
        }
    }

    fn slot(&self, id: SubscriptionId) -> Option<Arc<Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    fn slots(&self) -> Vec<(SubscriptionId, Arc<Slot>)> {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect()
    }

    /// Register or replace the subscription `id`.
    ///
    /// `connected` says whether the subscribe frame can go out now; when it
    /// cannot, the slot starts out stale and is sent on the next reconnect.
    /// Returns the epoch to tag the subscribe frame with when the caller
    /// should send it now.
    pub(crate) fn register(
        &self,
        id: SubscriptionId,
        query: String,
        show_hidden: bool,
        callback: Callback,
        connected: bool,
    ) -> Option<u64> {
        let state = if connected {
            SubscriptionState::Pending
        } else {
            SubscriptionState::Stale
        };

        self.cancelled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);

        let (replaced, epoch) = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            match slots.get(&id) {
                Some(slot) => {
                    let slot = slot.clone();
                    let mut inner = slot.lock();
                    inner.query = query;
                    inner.show_hidden = show_hidden;
                    inner.callback = callback;
                    inner.state = state;
                    inner.epoch += 1;
                    let epoch = inner.epoch;
                    drop(inner);
                    (Some(slot), epoch)
                }
                None => {
                    slots.insert(
                        id,
                        Arc::new(Slot {
                            inner: Mutex::new(SlotInner {
                                query,
                                show_hidden,
                                callback,
                                state,
                                epoch: 1,
                            }),
                            gate: RwLock::new(()),
                        }),
                    );
                    (None, 1)
                }
            }
        };

        if let Some(slot) = replaced {
            tracing::debug!(subscription_id = %id, "Replaced subscription callback");
            slot.drain(id);
        } else {
            tracing::debug!(subscription_id = %id, ?state, "Registered subscription");
        }
        connected.then_some(epoch)
    }

    /// Cancel `id`. Returns `false` when there was nothing to cancel.
    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        let Some(slot) = removed else {
            return false;
        };

        self.cancelled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);
        slot.lock().state = SubscriptionState::Cancelled;
        slot.drain(id);
        tracing::debug!(subscription_id = %id, "Cancelled subscription");
        true
    }

    /// Route one pushed batch to its callback.
    pub(crate) fn deliver(&self, id: SubscriptionId, batch: &[serde_json::Value]) {
        let Some(slot) = self.slot(id) else {
            tracing::debug!(subscription_id = %id, "Dropping batch for unknown subscription");
            return;
        };

        let _gate = slot.gate.read().unwrap_or_else(|e| e.into_inner());
        let (callback, show_hidden) = {
            let inner = slot.lock();
            match inner.state {
                SubscriptionState::Pending | SubscriptionState::Active => {
                    (inner.callback.clone(), inner.show_hidden)
                }
                state => {
                    tracing::debug!(subscription_id = %id, ?state, "Suppressed delivery");
                    return;
                }
            }
        };

        let objects = self.decode_batch(id, batch, show_hidden);
        let count = objects.len();

        let _mark = DeliveringMark::enter(id);
        match catch_unwind(AssertUnwindSafe(|| callback(objects))) {
            Ok(()) => {
                tracing::trace!(subscription_id = %id, objects = count, "Delivered batch");
            }
            Err(payload) => self.record_error(id, panic_message(payload.as_ref())),
        }
    }

    fn decode_batch(
        &self,
        id: SubscriptionId,
        batch: &[serde_json::Value],
        show_hidden: bool,
    ) -> Vec<UnigraphObject> {
        batch
            .iter()
            .filter_map(|wire| match self.catalog.decode_contained(wire) {
                Ok(decoded) => {
                    if !decoded.malformed.is_empty() {
                        self.malformed.fetch_add(
                            decoded.malformed.len() as u64,
                            std::sync::atomic::Ordering::Relaxed,
                        );
                        tracing::warn!(
                            subscription_id = %id,
                            uid = ?decoded.entity.uid,
                            malformed = decoded.malformed.len(),
                            "Delivering entity with malformed values kept raw"
                        );
                    }
                    Some(decoded.entity)
                }
                Err(e) => {
                    self.malformed
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    tracing::warn!(subscription_id = %id, error = %e, "Skipping malformed entity");
                    None
                }
            })
            .filter(|entity| show_hidden || !entity.hide)
            .map(|entity| {
                UnigraphObject::new(entity, self.catalog.clone()).with_show_hidden(show_hidden)
            })
            .collect()
    }

    fn record_error(&self, id: SubscriptionId, message: String) {
        let error = DeliveryError {
            subscription_id: id,
            message,
            at: Utc::now(),
        };
        tracing::warn!(subscription_id = %id, error = %error, "Subscription callback failed");
        let mut log = self.errors.lock().unwrap_or_else(|e| e.into_inner());
        log.total += 1;
        log.last.insert(id, error);
    }

    /// Active and pending subscriptions go stale. Returns how many did.
    pub(crate) fn mark_all_stale(&self) -> usize {
        let mut count = 0;
        for (_, slot) in self.slots() {
            let mut inner = slot.lock();
            if matches!(
                inner.state,
                SubscriptionState::Pending | SubscriptionState::Active
            ) {
                inner.state = SubscriptionState::Stale;
                count += 1;
            }
        }
        count
    }

    /// Move stale subscriptions back to pending and return what to re-send.
    pub(crate) fn take_stale(&self) -> Vec<Resend> {
        let mut out = Vec::new();
        for (id, slot) in self.slots() {
            let mut inner = slot.lock();
            if inner.state == SubscriptionState::Stale {
                inner.state = SubscriptionState::Pending;
                inner.epoch += 1;
                out.push(Resend {
                    id,
                    query: inner.query.clone(),
                    show_hidden: inner.show_hidden,
                    epoch: inner.epoch,
                });
            }
        }
        out.sort_by_key(|r| r.id);
        out
    }

    /// The subscribe frame queued for `id` under `epoch` left the client.
    pub(crate) fn mark_sent(&self, id: SubscriptionId, epoch: u64) {
        if let Some(slot) = self.slot(id) {
            let mut inner = slot.lock();
            if inner.epoch == epoch && inner.state == SubscriptionState::Pending {
                inner.state = SubscriptionState::Active;
            }
        }
    }

    /// The subscribe frame queued for `id` under `epoch` could not be sent.
    pub(crate) fn mark_send_failed(&self, id: SubscriptionId, epoch: u64) {
        if let Some(slot) = self.slot(id) {
            let mut inner = slot.lock();
            if inner.epoch != epoch {
                tracing::debug!(subscription_id = %id, epoch, current = inner.epoch, "Ignoring outdated send failure");
                return;
            }
            if inner.state != SubscriptionState::Cancelled {
                inner.state = SubscriptionState::Stale;
            }
        }
    }

    pub(crate) fn state(&self, id: SubscriptionId) -> Option<SubscriptionState> {
        if let Some(slot) = self.slot(id) {
            return Some(slot.lock().state);
        }
        self.cancelled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&id)
            .then_some(SubscriptionState::Cancelled)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub(crate) fn delivery_error_count(&self) -> u64 {
        self.errors.lock().unwrap_or_else(|e| e.into_inner()).total
    }

    pub(crate) fn last_delivery_error(&self, id: SubscriptionId) -> Option<DeliveryError> {
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last
            .get(&id)
            .cloned()
    }

    pub(crate) fn malformed_count(&self) -> u64 {
        self.malformed.load(std::sync::atomic::Ordering::Relaxed)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    fn registry() -> SubscriptionRegistry {
        SubscriptionRegistry::new(Arc::new(SchemaCatalog::with_builtins()))
    }

    fn counter() -> (Arc<AtomicUsize>, Callback) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        (hits, Arc::new(move |_: Vec<UnigraphObject>| {
            h.fetch_add(1, Ordering::SeqCst);
        }))
    }

    fn note(text: &str) -> serde_json::Value {
        json!({"uid": "0x1", "_value.%": text})
    }

    #[test]
    fn replacing_a_callback_silences_the_old_one() {
        let reg = registry();
        let id = SubscriptionId(1);
        let (old_hits, old) = counter();
        let (new_hits, new) = counter();

        reg.register(id, "q".into(), false, old, true);
        reg.deliver(id, &[note("a")]);
        reg.register(id, "q".into(), false, new, true);
        reg.deliver(id, &[note("b")]);

        assert_eq!(old_hits.load(Ordering::SeqCst), 1);
        assert_eq!(new_hits.load(Ordering::SeqCst), 1);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn cancelled_subscription_gets_nothing() {
        let reg = registry();
        let id = SubscriptionId(2);
        let (hits, cb) = counter();
        reg.register(id, "q".into(), false, cb, true);

        assert!(reg.unsubscribe(id));
        reg.deliver(id, &[note("late")]);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(reg.state(id), Some(SubscriptionState::Cancelled));

        // Idempotent, and unknown ids are fine.
        assert!(!reg.unsubscribe(id));
        assert!(!reg.unsubscribe(SubscriptionId(999)));
    }

    #[test]
    fn stale_subscriptions_wait_for_resend() {
        let reg = registry();
        let id = SubscriptionId(3);
        let (hits, cb) = counter();
        let first = reg.register(id, "q".into(), true, cb, true).unwrap();
        reg.mark_sent(id, first);
        assert_eq!(reg.state(id), Some(SubscriptionState::Active));

        assert_eq!(reg.mark_all_stale(), 1);
        reg.deliver(id, &[note("while down")]);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let resend = reg.take_stale();
        assert_eq!(
            resend,
            vec![Resend {
                id,
                query: "q".into(),
                show_hidden: true,
                epoch: first + 1,
            }]
        );
        reg.mark_sent(id, resend[0].epoch);
        reg.deliver(id, &[note("back")]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_callback_is_contained_and_counted() {
        let reg = registry();
        let bad = SubscriptionId(4);
        let good = SubscriptionId(5);
        let (hits, cb) = counter();
        reg.register(bad, "q".into(), false, Arc::new(|_: Vec<UnigraphObject>| panic!("boom")), true);
        reg.register(good, "q".into(), false, cb, true);

        reg.deliver(bad, &[note("x")]);
        reg.deliver(good, &[note("y")]);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(reg.delivery_error_count(), 1);
        let err = reg.last_delivery_error(bad).unwrap();
        assert_eq!(err.subscription_id, bad);
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn malformed_and_hidden_entities_are_filtered_per_entity() {
        let reg = registry();
        let id = SubscriptionId(6);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        reg.register(
            id,
            "q".into(),
            false,
            Arc::new(move |objs: Vec<UnigraphObject>| {
                sink.lock().unwrap().push(objs.len());
            }),
            true,
        );

        reg.deliver(
            id,
            &[
                note("ok"),
                json!({"uid": "0x2", "_value.%": 1}),
                json!({"uid": "0x3", "_hide": true, "_value.%": "hidden"}),
            ],
        );
        assert_eq!(*seen.lock().unwrap(), vec![1]);
        assert_eq!(reg.malformed_count(), 1);
    }

    #[test]
    fn malformed_field_keeps_its_siblings() {
        let reg = registry();
        let id = SubscriptionId(11);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        reg.register(
            id,
            "q".into(),
            false,
            Arc::new(move |objs: Vec<UnigraphObject>| {
                sink.lock().unwrap().extend(objs);
            }),
            true,
        );

        reg.deliver(
            id,
            &[json!({
                "uid": "0x1",
                "_value": {"name": {"_value.%": "ok"}, "bad": {"_value.#i": "NaN"}}
            })],
        );
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].get("name").unwrap().as_str(), Some("ok"));
        assert_eq!(reg.malformed_count(), 1);
    }

    #[test]
    fn callback_may_unsubscribe_itself() {
        let reg = Arc::new(registry());
        let id = SubscriptionId(7);
        let (hits, _) = counter();
        let weak = Arc::downgrade(&reg);
        let h = hits.clone();
        reg.register(
            id,
            "q".into(),
            false,
            Arc::new(move |_: Vec<UnigraphObject>| {
                h.fetch_add(1, Ordering::SeqCst);
                if let Some(reg) = weak.upgrade() {
                    reg.unsubscribe(id);
                }
            }),
            true,
        );

        reg.deliver(id, &[note("first")]);
        reg.deliver(id, &[note("second")]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn offline_registration_starts_stale() {
        let reg = registry();
        let (_, cb) = counter();
        assert_eq!(reg.register(SubscriptionId(8), "q".into(), false, cb, false), None);
        assert_eq!(reg.state(SubscriptionId(8)), Some(SubscriptionState::Stale));
    }

    #[test]
    fn late_send_failure_does_not_undo_resubscription() {
        let reg = registry();
        let id = SubscriptionId(9);
        let (hits, cb) = counter();
        let first = reg.register(id, "q".into(), false, cb, true).unwrap();

        // The channel drops and returns while the first frame is in flight.
        reg.mark_all_stale();
        let resend = reg.take_stale();
        assert_eq!(resend.len(), 1);

        reg.mark_send_failed(id, first);
        assert_eq!(reg.state(id), Some(SubscriptionState::Pending));
        reg.mark_sent(id, first);
        assert_eq!(reg.state(id), Some(SubscriptionState::Pending));

        reg.mark_sent(id, resend[0].epoch);
        assert_eq!(reg.state(id), Some(SubscriptionState::Active));
        reg.deliver(id, &[note("after reconnect")]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn current_send_failure_marks_stale() {
        let reg = registry();
        let id = SubscriptionId(10);
        let (_, cb) = counter();
        let epoch = reg.register(id, "q".into(), false, cb, true).unwrap();
        reg.mark_send_failed(id, epoch);
        assert_eq!(reg.state(id), Some(SubscriptionState::Stale));
        assert_eq!(reg.take_stale().len(), 1);
    }
}
