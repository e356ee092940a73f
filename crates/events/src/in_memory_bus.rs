//! In-memory message bus for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::bus::{Acknowledge, BusError, BusMessage, Delivery, DeliveryTag, MessageBus, Subscription};
use crate::topic::TopicPattern;

/// In-memory topic bus with consumer groups and explicit acknowledgment.
///
/// - Every group whose patterns match a topic gets its own copy of the message
/// - Members of one group compete (round-robin)
/// - Nacked or dropped-unsettled deliveries are redelivered with `attempt + 1`
/// - Messages for a group with no live member are parked until one subscribes
#[derive(Clone)]
pub struct InMemoryMessageBus {
    inner: Arc<Inner>,
}

struct Inner {
    this: Weak<Inner>,
    state: Mutex<BusState>,
}

#[derive(Default)]
struct BusState {
    groups: HashMap<String, Group>,
    in_flight: HashMap<DeliveryTag, String>,
    published: Vec<BusMessage>,
    acked: u64,
    nacked: u64,
    next_tag: u64,
    unavailable: bool,
}

#[derive(Default)]
struct Group {
    patterns: Vec<TopicPattern>,
    members: Vec<mpsc::UnboundedSender<Delivery>>,
    cursor: usize,
    parked: VecDeque<(BusMessage, u32)>,
}

impl Group {
    fn accepts(&self, topic: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(topic))
    }
}

impl core::fmt::Debug for InMemoryMessageBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryMessageBus").finish_non_exhaustive()
    }
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self {
            inner: Arc::new_cyclic(|this| Inner {
                this: this.clone(),
                state: Mutex::new(BusState::default()),
            }),
        }
    }
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message accepted by `publish`, in order.
    pub fn published(&self) -> Vec<BusMessage> {
        self.inner.lock().map(|s| s.published.clone()).unwrap_or_default()
    }

    pub fn acked_count(&self) -> u64 {
        self.inner.lock().map(|s| s.acked).unwrap_or_default()
    }

    pub fn nacked_count(&self) -> u64 {
        self.inner.lock().map(|s| s.nacked).unwrap_or_default()
    }

    /// Deliveries handed out and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().map(|s| s.in_flight.len()).unwrap_or_default()
    }

    /// Simulate an outage: while set, `publish` fails with [`BusError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.inner.lock() {
            state.unavailable = unavailable;
        }
    }
}

impl Inner {
    fn lock(&self) -> Result<MutexGuard<'_, BusState>, BusError> {
        self.state
            .lock()
            .map_err(|_| BusError::Unavailable("in-memory bus lock poisoned".to_string()))
    }

    fn handle(&self) -> Result<Arc<Inner>, BusError> {
        self.this.upgrade().ok_or(BusError::Closed)
    }
}

impl BusState {
    /// Hand a message to the next live member of `group_name`, parking it if none is left.
    ///
    /// Must never drop an armed [`Delivery`]: its `Drop` re-enters the bus lock.
    fn dispatch(&mut self, acker: &Arc<Inner>, group_name: &str, message: BusMessage, attempt: u32) {
        let Some(group) = self.groups.get_mut(group_name) else {
            return;
        };

        let mut next = Some((message, attempt));
        while let Some((message, attempt)) = next.take() {
            if group.members.is_empty() {
                group.parked.push_back((message, attempt));
                return;
            }

            self.next_tag += 1;
            let tag = DeliveryTag(format!("{group_name}:{}", self.next_tag));
            let idx = group.cursor % group.members.len();
            let settle: Arc<dyn Acknowledge> = acker.clone();
            let delivery = Delivery::new(message, tag.clone(), attempt, settle);

            match group.members[idx].send(delivery) {
                Ok(()) => {
                    group.cursor = idx + 1;
                    self.in_flight.insert(tag, group_name.to_string());
                }
                Err(err) => {
                    // receiver gone
                    group.members.remove(idx);
                    next = Some(err.0.disarm());
                }
            }
        }
    }
}

impl Acknowledge for Inner {
    fn ack(&self, tag: &DeliveryTag) -> Result<(), BusError> {
        let mut state = self.lock()?;
        if state.in_flight.remove(tag).is_some() {
            state.acked += 1;
        }
        Ok(())
    }

    fn nack(&self, tag: &DeliveryTag, message: &BusMessage, attempt: u32) -> Result<(), BusError> {
        let handle = self.handle()?;
        let mut state = self.lock()?;
        let Some(group) = state.in_flight.remove(tag) else {
            return Ok(());
        };
        state.nacked += 1;
        debug!(topic = %message.topic, group = %group, attempt, "redelivering nacked message");
        state.dispatch(&handle, &group, message.clone(), attempt.saturating_add(1));
        Ok(())
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, message: BusMessage) -> Result<(), BusError> {
        let mut state = self.inner.lock()?;
        if state.unavailable {
            return Err(BusError::Unavailable("in-memory bus marked unavailable".to_string()));
        }

        let targets: Vec<String> = state
            .groups
            .iter()
            .filter(|(_, g)| g.accepts(&message.topic))
            .map(|(name, _)| name.clone())
            .collect();

        for group in targets {
            state.dispatch(&self.inner, &group, message.clone(), 1);
        }
        state.published.push(message);
        Ok(())
    }

    async fn subscribe(&self, group: &str, patterns: &[TopicPattern]) -> Result<Subscription, BusError> {
        if group.trim().is_empty() {
            return Err(BusError::InvalidSubscription("consumer group must not be empty".to_string()));
        }
        if patterns.is_empty() {
            return Err(BusError::InvalidSubscription("at least one topic pattern is required".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.lock()?;
        let entry = state.groups.entry(group.to_string()).or_default();
        for pattern in patterns {
            if !entry.patterns.contains(pattern) {
                entry.patterns.push(pattern.clone());
            }
        }
        entry.members.push(tx);

        let parked: Vec<_> = entry.parked.drain(..).collect();
        for (message, attempt) in parked {
            state.dispatch(&self.inner, group, message, attempt);
        }

        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(raw: &str) -> TopicPattern {
        TopicPattern::new(raw).unwrap()
    }

    #[tokio::test]
    async fn every_group_gets_its_own_copy() {
        let bus = InMemoryMessageBus::new();
        let mut a = bus.subscribe("projections", &[pattern("domain.#")]).await.unwrap();
        let mut b = bus.subscribe("audit", &[TopicPattern::all()]).await.unwrap();

        bus.publish(BusMessage::new("domain.sales.changed", "t1", "{}")).await.unwrap();

        let da = a.try_recv().expect("projections delivery");
        let db = b.try_recv().expect("audit delivery");
        assert_eq!(da.message().topic, "domain.sales.changed");
        assert_eq!(db.message().topic, "domain.sales.changed");
        da.ack().unwrap();
        db.ack().unwrap();
        assert_eq!(bus.acked_count(), 2);
        assert_eq!(bus.in_flight(), 0);
    }

    #[tokio::test]
    async fn non_matching_topics_are_not_delivered() {
        let bus = InMemoryMessageBus::new();
        let mut sub = bus.subscribe("g", &[pattern("domain.sales.*")]).await.unwrap();

        bus.publish(BusMessage::new("domain.hr.changed", "t1", "{}")).await.unwrap();
        assert!(sub.try_recv().is_none());
        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test]
    async fn members_of_a_group_compete() {
        let bus = InMemoryMessageBus::new();
        let mut first = bus.subscribe("g", &[TopicPattern::all()]).await.unwrap();
        let mut second = bus.subscribe("g", &[TopicPattern::all()]).await.unwrap();

        bus.publish(BusMessage::new("a.b", "k", "1")).await.unwrap();
        bus.publish(BusMessage::new("a.b", "k", "2")).await.unwrap();

        let one = first.try_recv().expect("first member gets one");
        let two = second.try_recv().expect("second member gets one");
        assert!(first.try_recv().is_none());
        assert_ne!(one.message().payload, two.message().payload);
        one.ack().unwrap();
        two.ack().unwrap();
    }

    #[tokio::test]
    async fn nack_redelivers_with_next_attempt() {
        let bus = InMemoryMessageBus::new();
        let mut sub = bus.subscribe("g", &[TopicPattern::all()]).await.unwrap();
        bus.publish(BusMessage::new("a.b", "k", "payload")).await.unwrap();

        let first = sub.try_recv().unwrap();
        assert_eq!(first.attempt(), 1);
        first.nack().unwrap();

        let second = sub.try_recv().expect("redelivered");
        assert_eq!(second.attempt(), 2);
        assert_eq!(second.message().payload, "payload");
        second.ack().unwrap();
        assert_eq!(bus.nacked_count(), 1);
        assert_eq!(bus.acked_count(), 1);
    }

    #[tokio::test]
    async fn dropping_an_unsettled_delivery_redelivers_it() {
        let bus = InMemoryMessageBus::new();
        let mut sub = bus.subscribe("g", &[TopicPattern::all()]).await.unwrap();
        bus.publish(BusMessage::new("a.b", "k", "x")).await.unwrap();

        drop(sub.try_recv().unwrap());

        let again = sub.try_recv().expect("redelivered after drop");
        assert_eq!(again.attempt(), 2);
        again.ack().unwrap();
    }

    #[tokio::test]
    async fn messages_survive_until_a_member_returns() {
        let bus = InMemoryMessageBus::new();
        let sub = bus.subscribe("g", &[TopicPattern::all()]).await.unwrap();
        drop(sub);

        bus.publish(BusMessage::new("a.b", "k", "parked")).await.unwrap();

        let mut sub = bus.subscribe("g", &[TopicPattern::all()]).await.unwrap();
        let delivery = sub.try_recv().expect("parked message delivered");
        assert_eq!(delivery.message().payload, "parked");
        delivery.ack().unwrap();
    }

    #[tokio::test]
    async fn unavailable_bus_rejects_publish() {
        let bus = InMemoryMessageBus::new();
        bus.set_unavailable(true);
        let err = bus.publish(BusMessage::new("a.b", "k", "x")).await.unwrap_err();
        assert_eq!(err.kind(), smartproj_core::FailureKind::Transient);
        assert!(bus.published().is_empty());

        bus.set_unavailable(false);
        bus.publish(BusMessage::new("a.b", "k", "x")).await.unwrap();
    }

    #[tokio::test]
    async fn subscribe_requires_group_and_patterns() {
        let bus = InMemoryMessageBus::new();
        assert!(bus.subscribe(" ", &[TopicPattern::all()]).await.is_err());
        assert!(bus.subscribe("g", &[]).await.is_err());
    }
}
