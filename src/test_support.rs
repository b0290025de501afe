//! A fully in-memory [`Broker`] fake realizing the scenarios spec'd for
//! [`crate::Fetch`] and [`crate::Subscription`] without a live NATS server.
//!
//! Grounded on `original_source/test/fetch_test.py`'s `TestableFetch`
//! pattern (mocked `subscribe`/`consumer_info`/`ensure_consumer_is_deleted`),
//! ported to a real trait-object fake instead of a mocking library.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::broker::{
    Broker, ConsumerCounts, DeliveryAck, OrderedDrain, PlainSubscription, PubAck, PullConsumer,
    PullOutcome, RawDelivery,
};
use crate::error::StoreError;

/// One message to preload into a fake subject's ordered or pull queue.
#[derive(Clone)]
pub struct QueuedMessage {
    pub message_type: String,
    pub data: serde_json::Value,
    pub seq: u64,
    pub num_delivered: u64,
}

impl QueuedMessage {
    pub fn new(message_type: impl Into<String>, data: serde_json::Value, seq: u64) -> Self {
        Self {
            message_type: message_type.into(),
            data,
            seq,
            num_delivered: 1,
        }
    }

    pub fn with_num_delivered(mut self, num_delivered: u64) -> Self {
        self.num_delivered = num_delivered;
        self
    }

    fn to_raw(&self, subject: &str) -> RawDelivery {
        let payload = serde_json::to_vec(&serde_json::json!({
            "type": self.message_type,
            "data": self.data,
        }))
        .unwrap();
        RawDelivery {
            subject: subject.to_string(),
            payload: Bytes::from(payload),
            stream_sequence: self.seq,
            num_delivered: self.num_delivered,
        }
    }
}

/// What happened to one fake delivery, recorded for test assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum AckEvent {
    Ack(u64),
    Nak(u64),
    Term(u64),
    InProgress(u64),
}

#[derive(Default)]
struct State {
    ordered_queues: HashMap<String, VecDeque<RawDelivery>>,
    pull_queues: HashMap<String, VecDeque<RawDelivery>>,
    streams: HashMap<String, String>,
    published: Vec<(String, Bytes, Option<String>)>,
    published_raw: Vec<(String, Bytes)>,
}

/// Shared delivery-outcome log, cloned into every fake delivery handed out
/// so `ack`/`nak`/`term`/`in_progress` calls are observable after the fact.
#[derive(Clone, Default)]
struct AckLog(Arc<Mutex<Vec<AckEvent>>>);

impl AckLog {
    fn record(&self, event: AckEvent) {
        self.0.lock().unwrap().push(event);
    }

    fn snapshot(&self) -> Vec<AckEvent> {
        self.0.lock().unwrap().clone()
    }
}

pub struct FakeBroker {
    state: Mutex<State>,
    connected: AtomicBool,
    consumer_delete_calls: Arc<AtomicU64>,
    ack_log: AckLog,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            connected: AtomicBool::new(true),
            consumer_delete_calls: Arc::new(AtomicU64::new(0)),
            ack_log: AckLog::default(),
        }
    }

    pub fn queue(&self, subject: &str, messages: Vec<QueuedMessage>) {
        let raws = messages.iter().map(|m| m.to_raw(subject)).collect();
        self.state
            .lock()
            .unwrap()
            .ordered_queues
            .insert(subject.to_string(), raws);
    }

    pub fn queue_pull(&self, subject_filter: &str, messages: Vec<QueuedMessage>) {
        let raws = messages.iter().map(|m| m.to_raw(subject_filter)).collect();
        self.state
            .lock()
            .unwrap()
            .pull_queues
            .insert(subject_filter.to_string(), raws);
    }

    pub fn register_stream(&self, subject_pattern: &str, stream_name: &str) {
        self.state
            .lock()
            .unwrap()
            .streams
            .insert(subject_pattern.to_string(), stream_name.to_string());
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn consumer_delete_calls(&self) -> u64 {
        self.consumer_delete_calls.load(Ordering::SeqCst)
    }

    pub fn ack_log(&self) -> Vec<AckEvent> {
        self.ack_log.snapshot()
    }

    pub fn published_raw(&self) -> Vec<(String, Bytes)> {
        self.state.lock().unwrap().published_raw.clone()
    }

    pub fn published(&self) -> Vec<(String, Bytes, Option<String>)> {
        self.state.lock().unwrap().published.clone()
    }
}

impl Default for FakeBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for FakeBroker {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn find_stream_name_by_subject(
        &self,
        subject_pattern: &str,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .streams
            .get(subject_pattern)
            .cloned())
    }

    async fn add_stream(
        &self,
        name: &str,
        subject_pattern: &str,
        _max_bytes: i64,
        _max_msg_size: i32,
    ) -> Result<(), StoreError> {
        self.state
            .lock()
            .unwrap()
            .streams
            .insert(subject_pattern.to_string(), name.to_string());
        Ok(())
    }

    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        msg_id: Option<&str>,
        _timeout: Duration,
    ) -> Result<PubAck, StoreError> {
        let mut state = self.state.lock().unwrap();
        let seq = state.published.len() as u64 + 1;
        state
            .published
            .push((subject.to_string(), payload, msg_id.map(str::to_string)));
        Ok(PubAck {
            duplicate: false,
            seq,
            stream: "fake-stream".to_string(),
        })
    }

    async fn publish_raw(&self, subject: &str, payload: Bytes) -> Result<(), StoreError> {
        self.state
            .lock()
            .unwrap()
            .published_raw
            .push((subject.to_string(), payload));
        Ok(())
    }

    async fn open_ordered_consumer(
        &self,
        subject: &str,
    ) -> Result<Box<dyn OrderedDrain>, StoreError> {
        let queue = self
            .state
            .lock()
            .unwrap()
            .ordered_queues
            .remove(subject)
            .unwrap_or_default();
        Ok(Box::new(FakeOrderedDrain {
            queue,
            delete_calls: self.consumer_delete_calls.clone(),
        }))
    }

    async fn open_pull_consumer(
        &self,
        subject_filter: &str,
        _durable_name: &str,
        _max_retries: Option<u64>,
    ) -> Result<Box<dyn PullConsumer>, StoreError> {
        let queue = self
            .state
            .lock()
            .unwrap()
            .pull_queues
            .remove(subject_filter)
            .unwrap_or_default();
        Ok(Box::new(FakePullConsumer {
            queue,
            log: self.ack_log.clone(),
        }))
    }

    async fn subscribe_plain(
        &self,
        subject: &str,
    ) -> Result<Box<dyn PlainSubscription>, StoreError> {
        let queue = self
            .state
            .lock()
            .unwrap()
            .pull_queues
            .remove(subject)
            .unwrap_or_default();
        Ok(Box::new(FakePlainSubscription { queue }))
    }
}

struct FakeOrderedDrain {
    queue: VecDeque<RawDelivery>,
    delete_calls: Arc<AtomicU64>,
}

#[async_trait]
impl OrderedDrain for FakeOrderedDrain {
    async fn consumer_counts(&mut self) -> Result<ConsumerCounts, StoreError> {
        Ok(ConsumerCounts {
            num_pending: self.queue.len() as u64,
            delivered_consumer_sequence: Some(0),
        })
    }

    async fn next(&mut self) -> Option<Result<RawDelivery, StoreError>> {
        self.queue.pop_front().map(Ok)
    }

    async fn unsubscribe(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn delete_consumer(&mut self) -> Result<(), StoreError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakePullConsumer {
    queue: VecDeque<RawDelivery>,
    log: AckLog,
}

#[async_trait]
impl PullConsumer for FakePullConsumer {
    async fn fetch_one(&mut self, _wait: Duration) -> PullOutcome {
        match self.queue.pop_front() {
            Some(raw) => PullOutcome::Delivered(Box::new(FakeDeliveryAck {
                raw,
                log: self.log.clone(),
            })),
            None => PullOutcome::ConnectionClosed,
        }
    }
}

struct FakeDeliveryAck {
    raw: RawDelivery,
    log: AckLog,
}

#[async_trait]
impl DeliveryAck for FakeDeliveryAck {
    fn subject(&self) -> &str {
        &self.raw.subject
    }

    fn payload(&self) -> &Bytes {
        &self.raw.payload
    }

    fn stream_sequence(&self) -> u64 {
        self.raw.stream_sequence
    }

    fn num_delivered(&self) -> u64 {
        self.raw.num_delivered
    }

    async fn ack(&self) -> Result<(), StoreError> {
        self.log.record(AckEvent::Ack(self.raw.stream_sequence));
        Ok(())
    }

    async fn nak(&self) -> Result<(), StoreError> {
        self.log.record(AckEvent::Nak(self.raw.stream_sequence));
        Ok(())
    }

    async fn term(&self) -> Result<(), StoreError> {
        self.log.record(AckEvent::Term(self.raw.stream_sequence));
        Ok(())
    }

    async fn in_progress(&self) -> Result<(), StoreError> {
        self.log
            .record(AckEvent::InProgress(self.raw.stream_sequence));
        Ok(())
    }
}

struct FakePlainSubscription {
    queue: VecDeque<RawDelivery>,
}

#[async_trait]
impl PlainSubscription for FakePlainSubscription {
    async fn next_message(&mut self) -> Option<RawDelivery> {
        self.queue.pop_front()
    }

    async fn unsubscribe(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}
