//! [`Broker`] implementation over a live `async_nats` JetStream connection.
//!
//! Grounded on `ouroboros-tasks/src/broker/nats.rs`'s consumer construction
//! and pull-loop idioms (`ConsumerConfig`, `get_or_create_consumer`,
//! `.batch().max_messages(..).expires(..).messages()`,
//! `publish_with_headers`, `msg.info()`), cross-checked against the ordered
//! ephemeral consumer and ack/nak/term idioms attested independently in
//! `other_examples/04f3adc2_*-nats.rs.rs` and `other_examples/c3942d9e_*-nats-client.rs.rs`.

use std::time::Duration;

use async_nats::jetstream::consumer::pull::{Config as PullConfig, OrderedConfig};
use async_nats::jetstream::consumer::AckPolicy;
use async_nats::jetstream::context::{Context, PublishAckFuture};
use async_nats::jetstream::stream::Config as StreamConfig;
use async_nats::jetstream::AckKind;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::debug;

use crate::broker::{
    Broker, ConsumerCounts, DeliveryAck, OrderedDrain, PubAck, PullConsumer, PullOutcome,
    RawDelivery,
};
use crate::error::StoreError;

fn broker_err(err: impl std::fmt::Display) -> StoreError {
    let text = err.to_string();
    if text.contains("no stream response") {
        StoreError::NoStreamResponse
    } else if text.contains("503") {
        StoreError::ServiceUnavailable
    } else if text.contains("timeout") || text.contains("timed out") {
        StoreError::TransportTimeout
    } else if text.contains("10014") || text.contains("consumer not found") {
        StoreError::ConsumerNotFound
    } else {
        StoreError::Broker(text)
    }
}

/// A `Broker` backed by a real NATS JetStream context.
pub struct NatsBroker {
    client: async_nats::Client,
    jetstream: Context,
}

impl NatsBroker {
    pub fn new(client: async_nats::Client) -> Self {
        let jetstream = async_nats::jetstream::new(client.clone());
        Self { client, jetstream }
    }

    /// Convenience constructor: dial `url` and wrap the resulting client.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| StoreError::Broker(e.to_string()))?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl Broker for NatsBroker {
    fn is_connected(&self) -> bool {
        !matches!(
            self.client.connection_state(),
            async_nats::connection::State::Disconnected
        )
    }

    async fn find_stream_name_by_subject(
        &self,
        subject_pattern: &str,
    ) -> Result<Option<String>, StoreError> {
        match self.jetstream.get_stream_by_subject(subject_pattern).await {
            Ok(mut stream) => {
                let info = stream.info().await.map_err(broker_err)?;
                Ok(Some(info.config.name.clone()))
            }
            Err(err) => {
                let text = err.to_string();
                if text.contains("not found") || text.contains("no stream matches") {
                    Ok(None)
                } else {
                    Err(broker_err(err))
                }
            }
        }
    }

    async fn add_stream(
        &self,
        name: &str,
        subject_pattern: &str,
        max_bytes: i64,
        max_msg_size: i32,
    ) -> Result<(), StoreError> {
        self.jetstream
            .get_or_create_stream(StreamConfig {
                name: name.to_string(),
                subjects: vec![subject_pattern.to_string()],
                max_bytes,
                max_message_size: max_msg_size,
                ..Default::default()
            })
            .await
            .map_err(broker_err)?;
        Ok(())
    }

    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        msg_id: Option<&str>,
        timeout: Duration,
    ) -> Result<PubAck, StoreError> {
        let mut headers = async_nats::HeaderMap::new();
        if let Some(msg_id) = msg_id {
            headers.insert("Nats-Msg-Id", msg_id);
        }
        let publish: PublishAckFuture = self
            .jetstream
            .publish_with_headers(subject.to_string(), headers, payload)
            .await
            .map_err(broker_err)?;
        let ack = tokio::time::timeout(timeout, publish)
            .await
            .map_err(|_| StoreError::TransportTimeout)?
            .map_err(broker_err)?;
        Ok(PubAck {
            duplicate: ack.duplicate,
            seq: ack.sequence,
            stream: ack.stream,
        })
    }

    async fn publish_raw(&self, subject: &str, payload: Bytes) -> Result<(), StoreError> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(broker_err)?;
        Ok(())
    }

    async fn open_ordered_consumer(
        &self,
        subject: &str,
    ) -> Result<Box<dyn OrderedDrain>, StoreError> {
        let stream = self
            .jetstream
            .get_stream_by_subject(subject)
            .await
            .map_err(broker_err)?;
        let consumer = stream
            .create_consumer(OrderedConfig {
                filter_subject: subject.to_string(),
                ..Default::default()
            })
            .await
            .map_err(broker_err)?;
        let messages = consumer
            .messages()
            .await
            .map_err(broker_err)?;
        Ok(Box::new(NatsOrderedDrain {
            stream,
            consumer_name: None,
            consumer,
            messages,
        }))
    }

    async fn open_pull_consumer(
        &self,
        subject_filter: &str,
        durable_name: &str,
        max_retries: Option<u64>,
    ) -> Result<Box<dyn PullConsumer>, StoreError> {
        let stream = self
            .jetstream
            .get_stream_by_subject(subject_filter)
            .await
            .map_err(broker_err)?;
        let consumer = stream
            .get_or_create_consumer(
                durable_name,
                PullConfig {
                    durable_name: Some(durable_name.to_string()),
                    filter_subject: subject_filter.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    max_deliver: max_retries.map(|m| m as i64 + 1).unwrap_or(-1),
                    ..Default::default()
                },
            )
            .await
            .map_err(broker_err)?;
        Ok(Box::new(NatsPullConsumer { consumer }))
    }

    async fn subscribe_plain(
        &self,
        subject: &str,
    ) -> Result<Box<dyn crate::broker::PlainSubscription>, StoreError> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(broker_err)?;
        Ok(Box::new(NatsPlainSubscription { subscriber }))
    }
}

struct NatsOrderedDrain {
    stream: async_nats::jetstream::stream::Stream,
    consumer_name: Option<String>,
    consumer: async_nats::jetstream::consumer::Consumer<OrderedConfig>,
    messages: async_nats::jetstream::consumer::pull::Ordered,
}

#[async_trait]
impl OrderedDrain for NatsOrderedDrain {
    async fn consumer_counts(&mut self) -> Result<ConsumerCounts, StoreError> {
        let info = self.consumer.info().await.map_err(broker_err)?;
        self.consumer_name = Some(info.name.clone());
        Ok(ConsumerCounts {
            num_pending: info.num_pending,
            delivered_consumer_sequence: Some(info.delivered.consumer_sequence),
        })
    }

    async fn next(&mut self) -> Option<Result<RawDelivery, StoreError>> {
        let message = self.messages.next().await?;
        let message = match message {
            Ok(m) => m,
            Err(e) => return Some(Err(broker_err(e))),
        };
        let info = match message.info() {
            Ok(info) => info,
            Err(e) => return Some(Err(broker_err(e))),
        };
        Some(Ok(RawDelivery {
            subject: message.subject.to_string(),
            payload: message.payload.clone(),
            stream_sequence: info.stream_sequence,
            num_delivered: info.delivered,
        }))
    }

    async fn unsubscribe(&mut self) -> Result<(), StoreError> {
        debug!("unsubscribing ephemeral ordered consumer");
        Ok(())
    }

    async fn delete_consumer(&mut self) -> Result<(), StoreError> {
        if let Some(name) = &self.consumer_name {
            if let Err(e) = self.stream.delete_consumer(name).await {
                debug!(error = %e, "best-effort ephemeral consumer delete failed");
            }
        }
        Ok(())
    }
}

struct NatsPullConsumer {
    consumer: async_nats::jetstream::consumer::Consumer<PullConfig>,
}

#[async_trait]
impl PullConsumer for NatsPullConsumer {
    async fn fetch_one(&mut self, wait: Duration) -> PullOutcome {
        let batch = match self
            .consumer
            .batch()
            .max_messages(1)
            .expires(wait)
            .messages()
            .await
        {
            Ok(batch) => batch,
            Err(_) => return PullOutcome::ConnectionClosed,
        };
        tokio::pin!(batch);
        match batch.next().await {
            Some(Ok(message)) => {
                let info = match message.info() {
                    Ok(info) => info,
                    Err(_) => return PullOutcome::ConnectionClosed,
                };
                PullOutcome::Delivered(Box::new(NatsDeliveryAck {
                    subject: message.subject.to_string(),
                    payload: message.payload.clone(),
                    stream_sequence: info.stream_sequence,
                    num_delivered: info.delivered,
                    message,
                }))
            }
            Some(Err(_)) => PullOutcome::ConnectionClosed,
            None => PullOutcome::TimedOut,
        }
    }
}

struct NatsDeliveryAck {
    subject: String,
    payload: Bytes,
    stream_sequence: u64,
    num_delivered: u64,
    message: async_nats::jetstream::Message,
}

#[async_trait]
impl DeliveryAck for NatsDeliveryAck {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn payload(&self) -> &Bytes {
        &self.payload
    }

    fn stream_sequence(&self) -> u64 {
        self.stream_sequence
    }

    fn num_delivered(&self) -> u64 {
        self.num_delivered
    }

    async fn ack(&self) -> Result<(), StoreError> {
        self.message.ack().await.map_err(broker_err)
    }

    async fn nak(&self) -> Result<(), StoreError> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(broker_err)
    }

    async fn term(&self) -> Result<(), StoreError> {
        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(broker_err)
    }

    async fn in_progress(&self) -> Result<(), StoreError> {
        self.message
            .ack_with(AckKind::Progress)
            .await
            .map_err(broker_err)
    }
}

struct NatsPlainSubscription {
    subscriber: async_nats::Subscriber,
}

#[async_trait]
impl crate::broker::PlainSubscription for NatsPlainSubscription {
    async fn next_message(&mut self) -> Option<RawDelivery> {
        let message = self.subscriber.next().await?;
        Some(RawDelivery {
            subject: message.subject.to_string(),
            payload: message.payload,
            stream_sequence: 0,
            num_delivered: 1,
        })
    }

    async fn unsubscribe(&mut self) -> Result<(), StoreError> {
        self.subscriber.unsubscribe().await.map_err(broker_err)
    }
}
