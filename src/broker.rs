//! The seam between orchestration logic ([`crate::Fetch`], [`crate::Subscription`],
//! [`crate::MessageStore`]) and a concrete JetStream-style broker client.
//!
//! Only [`crate::nats_broker::NatsBroker`] is allowed to name `async_nats`
//! types; everything else in this crate talks to brokers only through
//! [`Broker`] and its associated handle traits, which is what makes
//! [`crate::Fetch`] and [`crate::Subscription`] unit-testable without a live
//! NATS server (see `crate::test_support::FakeBroker`).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StoreError;

/// A raw, still-undecoded delivery off the wire.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    /// Full subject the message arrived on (prefix included).
    pub subject: String,
    pub payload: Bytes,
    /// Stream sequence number of this delivery.
    pub stream_sequence: u64,
    /// How many times this message has been delivered (1 on first delivery).
    pub num_delivered: u64,
}

/// `num_pending` / `delivered` fields off a consumer's info, as needed to
/// compute the total message count a [`crate::Fetch`] drain expects.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumerCounts {
    pub num_pending: u64,
    /// `None` when the consumer info has no `delivered` block yet (treated
    /// as zero per the adopted redesign flag).
    pub delivered_consumer_sequence: Option<u64>,
}

impl ConsumerCounts {
    pub fn total(&self) -> u64 {
        self.num_pending + self.delivered_consumer_sequence.unwrap_or(0)
    }
}

/// Result of a successful [`Broker::publish`].
#[derive(Debug, Clone)]
pub struct PubAck {
    pub duplicate: bool,
    pub seq: u64,
    pub stream: String,
}

/// Outcome of one pull-consumer fetch attempt.
pub enum PullOutcome {
    Delivered(Box<dyn DeliveryAck>),
    TimedOut,
    ConnectionClosed,
}

/// A single delivery from a durable pull consumer, with its ack discipline.
#[async_trait]
pub trait DeliveryAck: Send + Sync {
    fn subject(&self) -> &str;
    fn payload(&self) -> &Bytes;
    fn stream_sequence(&self) -> u64;
    fn num_delivered(&self) -> u64;

    async fn ack(&self) -> Result<(), StoreError>;
    async fn nak(&self) -> Result<(), StoreError>;
    async fn term(&self) -> Result<(), StoreError>;
    async fn in_progress(&self) -> Result<(), StoreError>;
}

/// A durable pull consumer bound to one subject filter.
#[async_trait]
pub trait PullConsumer: Send {
    /// Pull exactly one message, waiting up to `wait` for it to arrive.
    async fn fetch_one(&mut self, wait: Duration) -> PullOutcome;
}

/// An ephemeral ordered consumer drain, as used by [`crate::Fetch`].
#[async_trait]
pub trait OrderedDrain: Send {
    async fn consumer_counts(&mut self) -> Result<ConsumerCounts, StoreError>;
    /// Next delivery in stream order, or `None` once the underlying
    /// subscription ends.
    async fn next(&mut self) -> Option<Result<RawDelivery, StoreError>>;
    /// Best-effort unsubscribe; errors are logged by the caller, not raised.
    async fn unsubscribe(&mut self) -> Result<(), StoreError>;
    /// Best-effort consumer deletion; errors are logged by the caller, not raised.
    async fn delete_consumer(&mut self) -> Result<(), StoreError>;
}

/// A plain (non-JetStream) subscription, as used by [`crate::MessageStore::wait_for`].
#[async_trait]
pub trait PlainSubscription: Send {
    async fn next_message(&mut self) -> Option<RawDelivery>;
    async fn unsubscribe(&mut self) -> Result<(), StoreError>;
}

/// The broker contract this crate depends on.
#[async_trait]
pub trait Broker: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Look up the stream covering `subject_pattern`, if any.
    async fn find_stream_name_by_subject(
        &self,
        subject_pattern: &str,
    ) -> Result<Option<String>, StoreError>;

    /// Create a stream named `name` covering `subject_pattern`.
    async fn add_stream(
        &self,
        name: &str,
        subject_pattern: &str,
        max_bytes: i64,
        max_msg_size: i32,
    ) -> Result<(), StoreError>;

    /// Publish `payload` to `subject`, setting the dedup header when `msg_id`
    /// is supplied.
    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        msg_id: Option<&str>,
        timeout: Duration,
    ) -> Result<PubAck, StoreError>;

    /// Publish raw bytes with no JetStream acknowledgement, used for
    /// dead-letter republishing.
    async fn publish_raw(&self, subject: &str, payload: Bytes) -> Result<(), StoreError>;

    /// Open an ephemeral ordered consumer over `subject`, for [`crate::Fetch`].
    async fn open_ordered_consumer(
        &self,
        subject: &str,
    ) -> Result<Box<dyn OrderedDrain>, StoreError>;

    /// Open (or bind to) a durable pull consumer named `durable_name` filtered
    /// to `subject_filter`, for [`crate::Subscription`].
    async fn open_pull_consumer(
        &self,
        subject_filter: &str,
        durable_name: &str,
        max_retries: Option<u64>,
    ) -> Result<Box<dyn PullConsumer>, StoreError>;

    /// Plain (non-JetStream) subscribe, for [`crate::MessageStore::wait_for`].
    async fn subscribe_plain(&self, subject: &str) -> Result<Box<dyn PlainSubscription>, StoreError>;
}
