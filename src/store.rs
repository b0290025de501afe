//! Facade tying subject/stream-name prefixing, stream administration,
//! retried publish/fetch, subscription construction, and `wait_for`
//! together.
//!
//! Grounded on `message_store/message_store.py` for each operation's exact
//! retry wrapping and error classification.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::info;

use crate::broker::{Broker, PubAck};
use crate::error::StoreError;
use crate::fetch::Fetch;
use crate::message::Message;
use crate::projection::Projection;
use crate::progress::DEFAULT_REPORT_INTERVAL_SECS;
use crate::retry::retry_with_backoff;
use crate::subscription::{HandlerMap, Subscription, DEFAULT_MAX_RETRIES};

const DEFAULT_MAX_BYTES: i64 = 1024 * 1024 * 1024; // 1 GiB
const DEFAULT_MAX_MSG_SIZE: i32 = 4 * 1024 * 1024; // 4 MiB
const DEFAULT_PUBLISH_TIMEOUT_SECS: u64 = 60;
const DEFAULT_WAIT_FOR_TIMEOUT_SECS: u64 = 5;

/// Store-wide configuration: subject/stream prefix and whether `ensure_stream`
/// is allowed to create missing streams.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub prefix: String,
    pub should_create_missing_streams: bool,
}

impl StoreConfig {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let prefix = prefix.trim_end_matches('.').to_string();
        Self {
            prefix,
            should_create_missing_streams: false,
        }
    }

    pub fn with_should_create_missing_streams(mut self, value: bool) -> Self {
        self.should_create_missing_streams = value;
        self
    }

    fn subject_prefix(&self) -> String {
        if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}.", self.prefix)
        }
    }

    fn stream_prefix(&self) -> String {
        if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}-", self.prefix)
        }
    }
}

/// The message-store client: publish, fetch, and durable subscriptions over
/// a category-prefixed subject namespace.
pub struct MessageStore {
    broker: Arc<dyn Broker>,
    config: StoreConfig,
}

impl MessageStore {
    pub fn new(broker: Arc<dyn Broker>, config: StoreConfig) -> Self {
        Self { broker, config }
    }

    /// Dial `broker_url` and wrap the resulting NATS client. Supplements the
    /// distilled spec (`original_source/` callers always construct the NATS
    /// client before the store; this collapses both steps into one).
    pub async fn connect(broker_url: &str, config: StoreConfig) -> Result<Self, StoreError> {
        let broker = crate::nats_broker::NatsBroker::connect(broker_url).await?;
        Ok(Self::new(Arc::new(broker), config))
    }

    fn subject_prefix(&self) -> String {
        self.config.subject_prefix()
    }

    fn stream_prefix(&self) -> String {
        self.config.stream_prefix()
    }

    fn category_pattern(&self, category: &str) -> String {
        format!("{}{}.>", self.subject_prefix(), category)
    }

    /// Ensure a stream covers `category`'s subject pattern
    /// (`{prefix}{category}.>`), creating `{streamPrefix}{category}` with
    /// the given caps if `should_create_missing_streams` allows it.
    /// A pre-existing covering stream is a no-op success.
    pub async fn ensure_stream(
        &self,
        category: &str,
        max_bytes: Option<i64>,
        max_msg_size: Option<i32>,
    ) -> Result<(), StoreError> {
        let pattern = self.category_pattern(category);
        if self
            .broker
            .find_stream_name_by_subject(&pattern)
            .await?
            .is_some()
        {
            return Ok(());
        }

        let suggested_name = format!("{}{}", self.stream_prefix(), category);
        if !self.config.should_create_missing_streams {
            return Err(StoreError::StreamMissing {
                subject_pattern: pattern,
                suggested_name,
            });
        }

        self.broker
            .add_stream(
                &suggested_name,
                &pattern,
                max_bytes.unwrap_or(DEFAULT_MAX_BYTES),
                max_msg_size.unwrap_or(DEFAULT_MAX_MSG_SIZE),
            )
            .await?;
        info!(stream = %suggested_name, pattern = %pattern, "created stream");
        Ok(())
    }

    /// Publish `message` to `bare_subject`, deduplicated by `msg_id` when
    /// supplied. Attempted up to 3 times total (the first attempt plus up to
    /// 2 retries) with a 0.25s initial backoff on transient transport
    /// errors.
    pub async fn publish(
        &self,
        bare_subject: &str,
        message: &Message,
        msg_id: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<PubAck, StoreError> {
        let full_subject = format!("{}{}", self.subject_prefix(), bare_subject);
        let payload = Bytes::from(serde_json::to_vec(message)?);
        let timeout = timeout.unwrap_or(Duration::from_secs(DEFAULT_PUBLISH_TIMEOUT_SECS));

        retry_with_backoff(
            "message_store.publish",
            || {
                let full_subject = full_subject.clone();
                let payload = payload.clone();
                async move {
                    self.broker
                        .publish(&full_subject, payload, msg_id, timeout)
                        .await
                }
            },
            StoreError::is_publish_retriable,
            3,
            Duration::from_millis(250),
        )
        .await
    }

    /// Drain `bare_subject`'s history through `projection`, optionally
    /// stopping once a delivery's stream sequence exceeds `until_seq`.
    /// Attempted up to 5 times total (the first attempt plus up to 4
    /// retries) with a 5s initial backoff on transient transport errors.
    ///
    /// Note: on a retried attempt, `projection` is *not* reset — a
    /// partially folded state from a failed attempt carries into the
    /// retry, faithfully matching `original_source/`'s behavior of
    /// retrying the same captured projection object.
    pub async fn fetch<T>(
        &self,
        bare_subject: &str,
        projection: &mut Projection<T>,
        until_seq: Option<u64>,
    ) -> Result<(), StoreError> {
        let fetcher = Fetch::new(self.broker.clone(), self.subject_prefix());

        retry_with_backoff(
            "message_store.fetch",
            || fetcher.fetch(bare_subject, &mut *projection, until_seq),
            StoreError::is_fetch_retriable,
            5,
            Duration::from_secs(5),
        )
        .await
    }

    /// Build a [`Subscription`] over `bare_subject`. Does not start its
    /// pull loop; call [`Subscription::start`] explicitly.
    #[allow(clippy::too_many_arguments)]
    pub fn create_subscription(
        &self,
        bare_subject: &str,
        durable_name: &str,
        handlers: HandlerMap,
        max_retries: Option<u64>,
        dead_letter_subject: Option<&str>,
        report_interval: Option<Duration>,
    ) -> Subscription {
        let dead_letter_subject = dead_letter_subject
            .map(|bare| format!("{}{}", self.subject_prefix(), bare));
        Subscription::new(
            self.broker.clone(),
            self.subject_prefix(),
            bare_subject.to_string(),
            durable_name.to_string(),
            handlers,
            max_retries.or(Some(DEFAULT_MAX_RETRIES)),
            dead_letter_subject,
            report_interval.unwrap_or(Duration::from_secs(DEFAULT_REPORT_INTERVAL_SECS)),
        )
    }

    /// Plain (non-JetStream) subscribe to `bare_subject`, returning the
    /// first message matching `predicate` or failing with
    /// [`StoreError::WaitForTimeout`] after `timeout`.
    pub async fn wait_for(
        &self,
        bare_subject: &str,
        predicate: impl Fn(&Message) -> bool,
        timeout: Option<Duration>,
    ) -> Result<Message, StoreError> {
        let full_subject = format!("{}{}", self.subject_prefix(), bare_subject);
        let timeout = timeout.unwrap_or(Duration::from_secs(DEFAULT_WAIT_FOR_TIMEOUT_SECS));

        let mut subscription = self.broker.subscribe_plain(&full_subject).await?;

        let result = tokio::time::timeout(timeout, async {
            loop {
                match subscription.next_message().await {
                    Some(raw) => {
                        let message: Message = match serde_json::from_slice(&raw.payload) {
                            Ok(message) => message,
                            Err(_) => continue,
                        };
                        if predicate(&message) {
                            return message;
                        }
                    }
                    None => {
                        // subscription ended with no match; park until the
                        // outer timeout fires.
                        std::future::pending::<()>().await;
                    }
                }
            }
        })
        .await;

        if let Err(err) = subscription.unsubscribe().await {
            tracing::debug!(error = %err, "wait_for: best-effort unsubscribe failed");
        }

        result.map_err(|_| StoreError::WaitForTimeout)
    }
}
