//! Filtered push fan-out for external observers.
//!
//! The [`SubscriberHub`] bridges the in-process bus to push consumers
//! (websocket sessions, SSE streams). Each subscriber declares an interest
//! set and optional payload filters; a forwarding task re-filters every
//! bus event and pushes matches into a bounded per-subscriber channel.
//!
//! Delivery discipline: the publisher is never blocked. A subscriber whose
//! channel is full accumulates failures and is dropped after a few in a
//! row; a closed channel is dropped immediately. Liveness: the hub pings
//! on a fixed interval, and a subscriber that has not been
//! [touched](SubscriberHub::touch) within the timeout is terminated and
//! its resources reclaimed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use conveyor::EventBus;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{EventType, PipelineEvent};

/// Consecutive failed pushes before a slow subscriber is dropped.
const MAX_SEND_FAILURES: u32 = 3;

/// Per-subscriber channel depth.
const CHANNEL_CAPACITY: usize = 256;

/// Which event types a subscriber wants.
#[derive(Debug, Clone)]
pub enum EventInterest {
    /// Everything.
    All,
    /// Only the listed types.
    Only(HashSet<EventType>),
}

/// A subscriber's declared interests.
#[derive(Debug, Clone)]
pub struct SubscriberFilter {
    pub interest: EventInterest,
    /// Matched against the payload's `user_id` field.
    pub user_id: Option<String>,
    /// Matched against the payload's `agent_id` field.
    pub agent_id: Option<String>,
    /// Matched against the payload's `plan_id` field.
    pub plan_id: Option<String>,
}

impl SubscriberFilter {
    /// Subscribe to everything.
    pub fn all() -> Self {
        Self {
            interest: EventInterest::All,
            user_id: None,
            agent_id: None,
            plan_id: None,
        }
    }

    /// Subscribe to a specific set of event types.
    pub fn only(types: impl IntoIterator<Item = EventType>) -> Self {
        Self {
            interest: EventInterest::Only(types.into_iter().collect()),
            user_id: None,
            agent_id: None,
            plan_id: None,
        }
    }

    /// Restrict to events carrying this user id.
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Restrict to events carrying this agent id.
    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Restrict to events carrying this plan id.
    pub fn with_plan_id(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = Some(plan_id.into());
        self
    }

    /// Whether an event passes this filter: the type must be subscribed
    /// and every declared key must match the payload.
    pub fn matches(&self, event: &PipelineEvent) -> bool {
        match &self.interest {
            EventInterest::All => {}
            EventInterest::Only(types) => {
                if !types.contains(&event.event_type) {
                    return false;
                }
            }
        }

        for (expected, key) in [
            (&self.user_id, "user_id"),
            (&self.agent_id, "agent_id"),
            (&self.plan_id, "plan_id"),
        ] {
            if let Some(expected) = expected {
                if event.payload_str(key) != Some(expected.as_str()) {
                    return false;
                }
            }
        }
        true
    }
}

/// What a subscriber receives.
#[derive(Debug, Clone)]
pub enum Push {
    /// A matching pipeline event.
    Event(PipelineEvent),
    /// A liveness probe. Consumers answer by calling
    /// [`SubscriberHub::touch`].
    Ping,
}

/// Receiving end handed to the subscriber.
pub struct Subscription {
    id: Uuid,
    receiver: mpsc::Receiver<Push>,
}

impl Subscription {
    /// The subscriber's id, used for `touch` and `unsubscribe`.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Receive the next push; `None` once the hub has dropped this
    /// subscriber.
    pub async fn recv(&mut self) -> Option<Push> {
        self.receiver.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Push> {
        self.receiver.try_recv().ok()
    }
}

struct SubscriberEntry {
    sender: mpsc::Sender<Push>,
    filter: SubscriberFilter,
    last_seen: Mutex<DateTime<Utc>>,
    send_failures: AtomicU32,
}

/// Registry plus forwarding and liveness tasks.
pub struct SubscriberHub {
    entries: Arc<DashMap<Uuid, SubscriberEntry>>,
    cancel: CancellationToken,
}

impl SubscriberHub {
    /// Start a hub on the given bus with the default liveness policy
    /// (ping every 30 s, terminate after 60 s of silence).
    pub fn new(bus: EventBus<PipelineEvent>) -> Self {
        Self::with_liveness(bus, Duration::from_secs(30), Duration::from_secs(60))
    }

    /// Start a hub with a custom ping interval and silence threshold.
    pub fn with_liveness(
        bus: EventBus<PipelineEvent>,
        ping_interval: Duration,
        liveness_timeout: Duration,
    ) -> Self {
        let entries: Arc<DashMap<Uuid, SubscriberEntry>> = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();

        // Forwarding task: bus -> per-subscriber channels.
        {
            let entries = entries.clone();
            let cancel = cancel.clone();
            let mut rx = bus.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        received = rx.recv() => match received {
                            Ok(event) => Self::deliver(&entries, &event),
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(missed, "fan-out lagged behind the bus");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            });
        }

        // Liveness task: ping and reap.
        {
            let entries = entries.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(ping_interval);
                ticker.tick().await; // skip the immediate tick
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            Self::ping_and_reap(&entries, liveness_timeout);
                        }
                    }
                }
            });
        }

        Self { entries, cancel }
    }

    fn deliver(entries: &DashMap<Uuid, SubscriberEntry>, event: &PipelineEvent) {
        let mut dropped: Vec<Uuid> = Vec::new();
        for entry in entries.iter() {
            if !entry.filter.matches(event) {
                continue;
            }
            match entry.sender.try_send(Push::Event(event.clone())) {
                Ok(()) => {
                    entry.send_failures.store(0, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let failures = entry.send_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    if failures >= MAX_SEND_FAILURES {
                        dropped.push(*entry.key());
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dropped.push(*entry.key());
                }
            }
        }
        for id in dropped {
            entries.remove(&id);
            info!(subscriber_id = %id, "dropped unresponsive subscriber");
        }
    }

    fn ping_and_reap(entries: &DashMap<Uuid, SubscriberEntry>, liveness_timeout: Duration) {
        let deadline =
            Utc::now() - chrono::Duration::milliseconds(liveness_timeout.as_millis() as i64);
        let mut dead: Vec<Uuid> = Vec::new();
        for entry in entries.iter() {
            if *entry.last_seen.lock() < deadline {
                dead.push(*entry.key());
                continue;
            }
            let _ = entry.sender.try_send(Push::Ping);
        }
        for id in dead {
            entries.remove(&id);
            info!(subscriber_id = %id, "terminated silent subscriber");
        }
    }

    /// Register a subscriber. Events start flowing immediately.
    pub fn subscribe(&self, filter: SubscriberFilter) -> Subscription {
        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        self.entries.insert(
            id,
            SubscriberEntry {
                sender,
                filter,
                last_seen: Mutex::new(Utc::now()),
                send_failures: AtomicU32::new(0),
            },
        );
        debug!(subscriber_id = %id, "subscriber registered");
        Subscription { id, receiver }
    }

    /// Record liveness for a subscriber (a pong, or any client activity).
    pub fn touch(&self, id: Uuid) {
        if let Some(entry) = self.entries.get(&id) {
            *entry.last_seen.lock() = Utc::now();
        }
    }

    /// Remove a subscriber and reclaim its channel.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.entries.len()
    }

    /// Stop the forwarding and liveness tasks.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SubscriberHub {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TransactionEvent;

    fn tx_event(event_type: EventType, user_id: Option<&str>) -> PipelineEvent {
        PipelineEvent::from_payload(
            event_type,
            &TransactionEvent {
                transaction_id: Uuid::new_v4(),
                chain_id: 1,
                hash: None,
                block_number: None,
                gas_used: None,
                user_id: user_id.map(str::to_string),
                agent_id: None,
                plan_id: None,
                error: None,
            },
        )
    }

    async fn next_event(sub: &mut Subscription) -> Option<PipelineEvent> {
        loop {
            match tokio::time::timeout(Duration::from_millis(500), sub.recv()).await {
                Ok(Some(Push::Event(event))) => return Some(event),
                Ok(Some(Push::Ping)) => continue,
                Ok(None) | Err(_) => return None,
            }
        }
    }

    #[test]
    fn filter_matches_type_and_keys() {
        let filter = SubscriberFilter::only([EventType::TransactionConfirmed]).with_user_id("u42");

        assert!(filter.matches(&tx_event(EventType::TransactionConfirmed, Some("u42"))));
        assert!(!filter.matches(&tx_event(EventType::TransactionSubmitted, Some("u42"))));
        assert!(!filter.matches(&tx_event(EventType::TransactionConfirmed, Some("u7"))));
        // Declared key missing from the payload: no match.
        assert!(!filter.matches(&tx_event(EventType::TransactionConfirmed, None)));
    }

    #[tokio::test]
    async fn wildcard_and_filtered_subscribers() {
        let bus: EventBus<PipelineEvent> = EventBus::new();
        let hub = SubscriberHub::new(bus.clone());

        let mut all = hub.subscribe(SubscriberFilter::all());
        let mut filtered = hub.subscribe(
            SubscriberFilter::only([EventType::TransactionConfirmed]).with_user_id("u42"),
        );
        tokio::task::yield_now().await;

        bus.publish(tx_event(EventType::TransactionConfirmed, Some("u42")));
        assert!(next_event(&mut all).await.is_some());
        assert!(next_event(&mut filtered).await.is_some());

        bus.publish(tx_event(EventType::TransactionSubmitted, Some("u42")));
        let received = next_event(&mut all).await.unwrap();
        assert_eq!(received.event_type, EventType::TransactionSubmitted);
        assert!(
            next_event(&mut filtered).await.is_none(),
            "filtered subscriber must not see transaction:submitted"
        );
    }

    #[tokio::test]
    async fn silent_subscriber_is_terminated() {
        let bus: EventBus<PipelineEvent> = EventBus::new();
        let hub = SubscriberHub::with_liveness(
            bus.clone(),
            Duration::from_millis(20),
            Duration::from_millis(50),
        );

        let _sub = hub.subscribe(SubscriberFilter::all());
        assert_eq!(hub.subscriber_count(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn touched_subscriber_survives_the_reaper()  {
        let bus: EventBus<PipelineEvent> = EventBus::new();
        let hub = SubscriberHub::with_liveness(
            bus.clone(),
            Duration::from_millis(20),
            Duration::from_millis(80),
        );

        let sub = hub.subscribe(SubscriberFilter::all());
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            hub.touch(sub.id());
        }
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_reclaims_the_entry() {
        let bus: EventBus<PipelineEvent> = EventBus::new();
        let hub = SubscriberHub::new(bus);

        let sub = hub.subscribe(SubscriberFilter::all());
        assert!(hub.unsubscribe(sub.id()));
        assert!(!hub.unsubscribe(sub.id()));
        assert_eq!(hub.subscriber_count(), 0);
    }
}
