//! Tool-Log Event Bus
//!
//! Process-wide ordered event stream with session/trace filtered fan-out
//! and bounded memory. Publishing assigns a strictly monotonic `seq`,
//! appends to a fixed-capacity ring buffer, and pushes matching events into
//! each subscriber's bounded outbox. A full outbox drops its oldest pending
//! event and counts it as missed; publishers never block.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::config::BusConfig;
use crate::types::{EventId, SessionId, ToolLogEvent, ToolStage, TraceId};

/// Filter selecting a slice of the event stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub session_id: Option<SessionId>,
    pub trace_id: Option<TraceId>,
}

impl EventFilter {
    pub fn for_trace(trace_id: TraceId) -> Self {
        Self {
            session_id: None,
            trace_id: Some(trace_id),
        }
    }

    pub fn matches(&self, event: &ToolLogEvent) -> bool {
        if let Some(session_id) = &self.session_id {
            if event.session_id.as_ref() != Some(session_id) {
                return false;
            }
        }
        if let Some(trace_id) = &self.trace_id {
            if event.trace_id.as_ref() != Some(trace_id) {
                return false;
            }
        }
        true
    }
}

/// An event before the bus assigns `id`, `seq`, and (if absent) `ts`.
#[derive(Debug, Clone, Default)]
pub struct EventDraft {
    pub session_id: Option<SessionId>,
    pub trace_id: Option<TraceId>,
    pub tool: String,
    pub stage: ToolStage,
    pub text: Option<String>,
    pub ok: Option<bool>,
    pub duration_ms: Option<u64>,
    pub ts: Option<DateTime<Utc>>,
}

impl EventDraft {
    pub fn new(tool: impl Into<String>, stage: ToolStage) -> Self {
        Self {
            tool: tool.into(),
            stage,
            ..Default::default()
        }
    }

    pub fn trace(mut self, trace_id: TraceId) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    pub fn session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn ok(mut self, ok: bool) -> Self {
        self.ok = Some(ok);
        self
    }

    pub fn duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Subscription lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionState {
    Active,
    /// Producer side is gone but buffered events remain to be flushed.
    Draining,
    Closed,
}

struct Outbox {
    capacity: usize,
    queue: Mutex<VecDeque<ToolLogEvent>>,
    state: Mutex<SubscriptionState>,
    missed: AtomicU64,
    notify: Notify,
}

impl Outbox {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: Mutex::new(VecDeque::new()),
            state: Mutex::new(SubscriptionState::Active),
            missed: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Non-blocking push; evicts the oldest pending event when full.
    fn push(&self, event: ToolLogEvent) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.missed.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Transition out of `Active`: drain if events remain, close otherwise.
    fn begin_close(&self) {
        let mut state = self.state.lock();
        if *state == SubscriptionState::Closed {
            return;
        }
        let has_pending = !self.queue.lock().is_empty();
        *state = if has_pending {
            SubscriptionState::Draining
        } else {
            SubscriptionState::Closed
        };
        drop(state);
        self.notify.notify_waiters();
    }

    fn force_close(&self) {
        *self.state.lock() = SubscriptionState::Closed;
        self.queue.lock().clear();
        self.notify.notify_waiters();
    }
}

struct SubscriberEntry {
    filter: EventFilter,
    outbox: Arc<Outbox>,
}

struct BusInner {
    next_seq: u64,
    buffer: VecDeque<ToolLogEvent>,
    subscribers: HashMap<u64, SubscriberEntry>,
    next_subscriber_id: u64,
    published: u64,
    evicted: u64,
}

/// Counters exposed on the health surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusStats {
    pub published: u64,
    pub evicted: u64,
    pub buffered: usize,
    pub subscribers: usize,
}

/// The in-process tool-log bus.
pub struct ToolLogBus {
    config: BusConfig,
    inner: RwLock<BusInner>,
}

impl ToolLogBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: RwLock::new(BusInner {
                next_seq: 0,
                buffer: VecDeque::with_capacity(config.capacity.min(1_024)),
                subscribers: HashMap::new(),
                next_subscriber_id: 0,
                published: 0,
                evicted: 0,
            }),
            config,
        }
    }

    /// Publish an event: assign `seq` and `id`, stamp the time if absent,
    /// append to the ring buffer, and fan out to matching subscribers.
    ///
    /// The append step is serialized under the write lock, which is what
    /// keeps `seq` strictly monotonic for every observer.
    pub fn publish(&self, draft: EventDraft) -> ToolLogEvent {
        let mut inner = self.inner.write();
        inner.next_seq += 1;
        let event = ToolLogEvent {
            id: EventId::new(),
            seq: inner.next_seq,
            ts: draft.ts.unwrap_or_else(Utc::now),
            session_id: draft.session_id,
            trace_id: draft.trace_id,
            tool: draft.tool,
            stage: draft.stage,
            text: draft.text,
            ok: draft.ok,
            duration_ms: draft.duration_ms,
        };

        if inner.buffer.len() >= self.config.capacity {
            inner.buffer.pop_front();
            inner.evicted += 1;
        }
        inner.buffer.push_back(event.clone());
        inner.published += 1;

        for entry in inner.subscribers.values() {
            if entry.filter.matches(&event) {
                entry.outbox.push(event.clone());
            }
        }

        event
    }

    /// Subscribe with a filter. Up to `replay_limit` of the newest matching
    /// buffered events are queued first, in `seq` order, followed by live
    /// events until the subscription is dropped.
    pub fn subscribe(
        self: &Arc<Self>,
        filter: EventFilter,
        replay_limit: Option<usize>,
    ) -> Subscription {
        let outbox = Arc::new(Outbox::new(self.config.outbox_capacity));
        let mut inner = self.inner.write();

        let mut matches: Vec<&ToolLogEvent> = inner
            .buffer
            .iter()
            .filter(|event| filter.matches(event))
            .collect();
        if let Some(limit) = replay_limit {
            let skip = matches.len().saturating_sub(limit);
            matches.drain(..skip);
        }
        for event in matches {
            outbox.push(event.clone());
        }

        inner.next_subscriber_id += 1;
        let id = inner.next_subscriber_id;
        inner.subscribers.insert(
            id,
            SubscriberEntry {
                filter,
                outbox: outbox.clone(),
            },
        );

        Subscription {
            id,
            bus: Arc::downgrade(self),
            outbox,
        }
    }

    /// Catch-up read: buffered events with `seq > since` matching `filter`,
    /// capped at `max`.
    pub fn since(&self, since: u64, filter: &EventFilter, max: usize) -> Vec<ToolLogEvent> {
        self.inner
            .read()
            .buffer
            .iter()
            .filter(|event| event.seq > since && filter.matches(event))
            .take(max)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> BusStats {
        let inner = self.inner.read();
        BusStats {
            published: inner.published,
            evicted: inner.evicted,
            buffered: inner.buffer.len(),
            subscribers: inner.subscribers.len(),
        }
    }

    /// Move every subscription towards `closed`, flushing pending events.
    pub fn shutdown(&self) {
        let inner = self.inner.read();
        for entry in inner.subscribers.values() {
            entry.outbox.begin_close();
        }
        tracing::info!("Tool-log bus shutting down");
    }

    fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.subscribers.remove(&id) {
            entry.outbox.force_close();
        }
    }
}

/// Handle to one bus subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    bus: std::sync::Weak<ToolLogBus>,
    outbox: Arc<Outbox>,
}

impl Subscription {
    /// Receive the next matching event in `seq` order. Returns `None` once
    /// the subscription is closed and its outbox is drained.
    pub async fn recv(&mut self) -> Option<ToolLogEvent> {
        loop {
            let notified = self.outbox.notify.notified();

            if let Some(event) = self.outbox.queue.lock().pop_front() {
                return Some(event);
            }

            {
                let mut state = self.outbox.state.lock();
                match *state {
                    SubscriptionState::Closed => return None,
                    SubscriptionState::Draining => {
                        // Queue is empty, flush is complete.
                        *state = SubscriptionState::Closed;
                        return None;
                    }
                    SubscriptionState::Active => {}
                }
            }

            notified.await;
        }
    }

    /// Pop the next pending event without waiting.
    pub fn try_recv(&mut self) -> Option<ToolLogEvent> {
        self.outbox.queue.lock().pop_front()
    }

    /// Events dropped from this subscription's outbox under back-pressure.
    pub fn missed_events(&self) -> u64 {
        self.outbox.missed.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> Arc<ToolLogBus> {
        Arc::new(ToolLogBus::new(BusConfig::default()))
    }

    fn draft(trace: &str) -> EventDraft {
        EventDraft::new("helix.ask.start", ToolStage::Start).trace(TraceId(trace.into()))
    }

    #[tokio::test]
    async fn fan_out_preserves_seq_order_per_subscriber() {
        let bus = bus();
        let mut first = bus.subscribe(EventFilter::for_trace(TraceId("ask:42".into())), None);
        let mut second = bus.subscribe(EventFilter::for_trace(TraceId("ask:42".into())), None);
        let mut other = bus.subscribe(EventFilter::for_trace(TraceId("ask:99".into())), None);

        for _ in 0..5 {
            bus.publish(draft("ask:42"));
        }

        let mut last_seq = 0;
        for _ in 0..5 {
            let event = first.recv().await.unwrap();
            assert!(event.seq > last_seq);
            last_seq = event.seq;
        }
        for _ in 0..5 {
            second.recv().await.unwrap();
        }

        // The unrelated trace saw nothing.
        assert!(other.outbox.queue.lock().is_empty());
    }

    #[tokio::test]
    async fn ring_buffer_is_bounded_and_seq_survives_eviction() {
        let config = BusConfig {
            capacity: 8,
            ..Default::default()
        };
        let bus = Arc::new(ToolLogBus::new(config));

        for _ in 0..20 {
            bus.publish(draft("ask:1"));
        }

        let stats = bus.stats();
        assert_eq!(stats.buffered, 8);
        assert_eq!(stats.evicted, 12);

        let events = bus.since(0, &EventFilter::default(), 100);
        assert_eq!(events.len(), 8);
        // Oldest surviving event is seq 13; order is still increasing.
        assert_eq!(events.first().unwrap().seq, 13);
        assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_and_counts_missed() {
        let config = BusConfig {
            outbox_capacity: 4,
            ..Default::default()
        };
        let bus = Arc::new(ToolLogBus::new(config));
        let mut sub = bus.subscribe(EventFilter::default(), None);

        for _ in 0..10 {
            bus.publish(draft("ask:1"));
        }

        assert_eq!(sub.missed_events(), 6);
        // The survivors are the newest four, still in order.
        let first = sub.recv().await.unwrap();
        assert_eq!(first.seq, 7);
    }

    #[tokio::test]
    async fn subscribe_replays_newest_matches_then_goes_live() {
        let bus = bus();
        for _ in 0..6 {
            bus.publish(draft("ask:7"));
        }

        let mut sub = bus.subscribe(EventFilter::for_trace(TraceId("ask:7".into())), Some(3));
        let replayed: Vec<u64> = vec![
            sub.recv().await.unwrap().seq,
            sub.recv().await.unwrap().seq,
            sub.recv().await.unwrap().seq,
        ];
        assert_eq!(replayed, vec![4, 5, 6]);

        let live = bus.publish(draft("ask:7"));
        assert_eq!(sub.recv().await.unwrap().seq, live.seq);
    }

    #[tokio::test]
    async fn since_filters_by_seq_and_trace() {
        let bus = bus();
        bus.publish(draft("ask:1"));
        bus.publish(draft("ask:2"));
        let third = bus.publish(draft("ask:1"));

        let filter = EventFilter::for_trace(TraceId("ask:1".into()));
        let caught_up = bus.since(1, &filter, 10);
        assert_eq!(caught_up.len(), 1);
        assert_eq!(caught_up[0].seq, third.seq);
    }

    #[tokio::test]
    async fn shutdown_drains_pending_then_closes() {
        let bus = bus();
        let mut sub = bus.subscribe(EventFilter::default(), None);
        bus.publish(draft("ask:1"));
        bus.publish(draft("ask:1"));

        bus.shutdown();

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_subscription_is_removed_from_fan_out() {
        let bus = bus();
        let sub = bus.subscribe(EventFilter::default(), None);
        assert_eq!(bus.stats().subscribers, 1);

        drop(sub);
        assert_eq!(bus.stats().subscribers, 0);
    }
}
