//! A durable pub/sub message-store client layered on a JetStream-style
//! broker.
//!
//! Three primitives for application code:
//! - [`MessageStore::publish`] — publish with dedup and retry.
//! - [`MessageStore::fetch`] — replay a subject's history through a
//!   [`Projection`].
//! - [`MessageStore::create_subscription`] /
//!   [`Subscription::start`] — run a durable pull subscription with
//!   heartbeats, bounded retries, and dead-lettering.

pub mod broker;
pub mod error;
pub mod fetch;
pub mod incoming;
pub mod message;
pub mod nats_broker;
pub mod progress;
pub mod projection;
pub mod retry;
pub mod store;
pub mod subscription;

#[cfg(test)]
pub(crate) mod test_support;

pub use broker::{
    Broker, ConsumerCounts, DeliveryAck, OrderedDrain, PlainSubscription, PubAck, PullConsumer,
    PullOutcome, RawDelivery,
};
pub use error::StoreError;
pub use fetch::Fetch;
pub use incoming::IncomingMessage;
pub use message::{Message, MessageMetadata};
pub use nats_broker::NatsBroker;
pub use progress::ProgressReporter;
pub use projection::Projection;
pub use retry::retry_with_backoff;
pub use store::{MessageStore, StoreConfig};
pub use subscription::{Handler, HandlerMap, Subscription};
