//! Durable pull-consumer dispatch loop: heartbeats, bounded retries, and
//! dead-lettering.
//!
//! Grounded on `subscriptions/subscription.py` for the exact state machine
//! (over-delivery checked before handler invocation, per the adopted
//! redesign flag; ack/nak/term discipline; connection-closed exit without
//! ack; dead-letter subject composition), and on
//! `ouroboros-tasks/src/broker/nats.rs`'s `SubscriptionHandle` for the
//! spawn/cancellation shape.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{Broker, DeliveryAck, PullOutcome};
use crate::error::StoreError;
use crate::incoming::IncomingMessage;
use crate::progress::ProgressReporter;

pub const DEFAULT_MAX_RETRIES: u64 = 3;
const PULL_WAIT: Duration = Duration::from_secs(5);

/// Implemented by application code to react to one message type.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, message: &IncomingMessage) -> Result<(), StoreError>;
}

pub type HandlerMap = HashMap<String, Arc<dyn Handler>>;

struct Inner {
    broker: Arc<dyn Broker>,
    subject_prefix: String,
    bare_subject: String,
    durable_name: String,
    handlers: HandlerMap,
    max_retries: Option<u64>,
    /// Already composed as `{subjectPrefix}{deadLetterBase}` at construction.
    dead_letter_subject: Option<String>,
    report_interval: Duration,
    active: AtomicBool,
    task: AsyncMutex<Option<JoinHandle<()>>>,
}

/// A durable pull subscription over one subject, dispatching to typed
/// handlers. Constructed via [`crate::MessageStore::create_subscription`];
/// does not start its background task until [`Subscription::start`] is
/// called.
pub struct Subscription {
    inner: Arc<Inner>,
}

impl Subscription {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        broker: Arc<dyn Broker>,
        subject_prefix: String,
        bare_subject: String,
        durable_name: String,
        handlers: HandlerMap,
        max_retries: Option<u64>,
        dead_letter_subject: Option<String>,
        report_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker,
                subject_prefix,
                bare_subject,
                durable_name,
                handlers,
                max_retries,
                dead_letter_subject,
                report_interval,
                active: AtomicBool::new(false),
                task: AsyncMutex::new(None),
            }),
        }
    }

    /// Start the background pull loop. Idempotent: a call while already
    /// started is a no-op.
    pub async fn start(&self) -> Result<(), StoreError> {
        if self
            .inner
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let full_subject = format!("{}{}", self.inner.subject_prefix, self.inner.bare_subject);
        let consumer = self
            .inner
            .broker
            .open_pull_consumer(&full_subject, &self.inner.durable_name, self.inner.max_retries)
            .await?;

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            run_pull_loop(inner, consumer).await;
        });
        *self.inner.task.lock().await = Some(handle);
        Ok(())
    }

    /// Flip the active flag and wait for the background task to finish its
    /// current iteration and exit. Safe to call after the loop has already
    /// stopped on its own (e.g. connection closed).
    pub async fn stop(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
        let handle = self.inner.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run_pull_loop(inner: Arc<Inner>, mut consumer: Box<dyn crate::broker::PullConsumer>) {
    while inner.active.load(Ordering::SeqCst) && inner.broker.is_connected() {
        match consumer.fetch_one(PULL_WAIT).await {
            PullOutcome::TimedOut => {
                debug!(subject = %inner.bare_subject, "pull wait timed out, re-arming");
                continue;
            }
            PullOutcome::ConnectionClosed => {
                info!(subject = %inner.bare_subject, "connection closed, exiting subscription loop");
                break;
            }
            PullOutcome::Delivered(delivery) => {
                let delivery: Arc<dyn DeliveryAck> = Arc::from(delivery);
                if !dispatch_one(&inner, delivery).await {
                    break;
                }
            }
        }
    }
}

/// Guards one in-flight delivery against abrupt task cancellation.
///
/// `Subscription::stop` always lets the current delivery finish before the
/// pull-loop task exits, so under that path the guard's `Drop` never has
/// anything to do — `dispatch_one` calls [`DeliveryGuard::finalize`] before
/// returning. But if the task hosting `run_pull_loop` is ever aborted or
/// dropped from outside that graceful path (mirroring spec.md §5's
/// "cancelling the subscription task directly is treated like an exception
/// in the handler path"), this is the only thing standing between the
/// delivery and silently falling out of `[ack, nak, term]` discipline, so
/// the guard naks (or terms, if the handler had already called
/// `mark_for_termination`) the delivery from a detached best-effort task.
struct DeliveryGuard {
    delivery: Arc<dyn DeliveryAck>,
    terminate: bool,
    finalized: bool,
}

impl DeliveryGuard {
    fn new(delivery: Arc<dyn DeliveryAck>) -> Self {
        Self {
            delivery,
            terminate: false,
            finalized: false,
        }
    }

    fn mark_terminate(&mut self) {
        self.terminate = true;
    }

    /// Call once the delivery has been explicitly ack'd, nak'd, or
    /// term'd (or deliberately left untouched on the connection-closed exit
    /// path) so `Drop` knows there is nothing left to clean up.
    fn finalize(mut self) {
        self.finalized = true;
    }
}

impl Drop for DeliveryGuard {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }
        let delivery = self.delivery.clone();
        let terminate = self.terminate;
        let seq = delivery.stream_sequence();
        tokio::spawn(async move {
            let result = if terminate {
                delivery.term().await
            } else {
                delivery.nak().await
            };
            if let Err(err) = result {
                warn!(error = %err, seq, "best-effort cleanup after abrupt cancellation failed");
            }
        });
    }
}

/// Handle one delivery through the spec's state machine. Returns `false`
/// if the pull loop should exit (connection closed mid-dispatch).
async fn dispatch_one(inner: &Arc<Inner>, delivery: Arc<dyn DeliveryAck>) -> bool {
    let mut guard = DeliveryGuard::new(delivery.clone());

    if let Some(max) = inner.max_retries {
        if delivery.num_delivered() > max {
            guard.mark_terminate();
            terminate(inner, &delivery).await;
            guard.finalize();
            return true;
        }
    }

    let mut reporter = ProgressReporter::new(inner.report_interval);
    reporter.start(delivery.clone());

    let stripped_subject = delivery
        .subject()
        .strip_prefix(inner.subject_prefix.as_str())
        .unwrap_or_else(|| delivery.subject())
        .to_string();

    let decoded = IncomingMessage::decode(
        stripped_subject,
        delivery.stream_sequence(),
        delivery.num_delivered(),
        inner.max_retries,
        delivery.payload(),
    );

    enum Outcome {
        Acked,
        Naked,
        Terminated,
        ConnectionClosedExit,
    }

    let outcome = match decoded {
        Ok(incoming) => match inner.handlers.get(&incoming.message_type).cloned() {
            Some(handler) => match handler.handle(&incoming).await {
                Ok(()) => {
                    if incoming.is_marked_for_termination() {
                        Outcome::Terminated
                    } else {
                        Outcome::Acked
                    }
                }
                Err(err) => {
                    warn!(error = %err, message_type = %incoming.message_type, seq = delivery.stream_sequence(), "handler failed");
                    if !inner.broker.is_connected() {
                        Outcome::ConnectionClosedExit
                    } else if incoming.is_marked_for_termination() {
                        Outcome::Terminated
                    } else {
                        Outcome::Naked
                    }
                }
            },
            None => {
                debug!(message_type = %incoming.message_type, "no handler registered for message type, acking");
                Outcome::Acked
            }
        },
        Err(err) => {
            warn!(error = %err, seq = delivery.stream_sequence(), "failed to decode delivery");
            Outcome::Naked
        }
    };

    reporter.stop();

    let result = match outcome {
        Outcome::Acked => {
            if let Err(err) = delivery.ack().await {
                warn!(error = %err, "ack failed");
            }
            true
        }
        Outcome::Naked => {
            if let Err(err) = delivery.nak().await {
                warn!(error = %err, "nak failed");
            }
            true
        }
        Outcome::Terminated => {
            guard.mark_terminate();
            terminate(inner, &delivery).await;
            true
        }
        Outcome::ConnectionClosedExit => false,
    };

    guard.finalize();
    result
}

async fn terminate(inner: &Arc<Inner>, delivery: &Arc<dyn DeliveryAck>) {
    if let Err(err) = delivery.term().await {
        warn!(error = %err, seq = delivery.stream_sequence(), "term failed");
    }
    info!(
        subject = %delivery.subject(),
        seq = delivery.stream_sequence(),
        "message terminated after exceeding retry budget"
    );

    if let Some(dead_letter_subject) = &inner.dead_letter_subject {
        let subject_without_prefix = delivery
            .subject()
            .strip_prefix(inner.subject_prefix.as_str())
            .unwrap_or_else(|| delivery.subject());
        let dlq_subject = format!("{}.{}", dead_letter_subject, subject_without_prefix);
        match inner
            .broker
            .publish_raw(&dlq_subject, delivery.payload().clone())
            .await
        {
            Ok(()) => info!(subject = %dlq_subject, "dead-lettered message"),
            Err(err) => warn!(error = %err, subject = %dlq_subject, "dead-letter publish failed"),
        }
    }
}
