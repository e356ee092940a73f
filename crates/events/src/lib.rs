//! Event envelopes, topics and the message-bus contract.
//!
//! This crate is transport-agnostic: it defines what travels over the bus and
//! how delivery is acknowledged, plus an in-memory bus for tests/dev.

pub mod bus;
pub mod envelope;
pub mod in_memory_bus;
pub mod topic;

pub use bus::{Acknowledge, BusError, BusMessage, Delivery, DeliveryTag, MessageBus, Subscription};
pub use envelope::{EnvelopeError, EventEnvelope};
pub use in_memory_bus::InMemoryMessageBus;
pub use topic::{Topic, TopicError, TopicPattern};
