//! One-shot drain of a subject's full history through a [`Projection`].
//!
//! Grounded line-for-line on `projections/fetch.py`: open an ephemeral
//! ordered consumer, compute the total message count up front, iterate in
//! stream order until either `until_seq` or the total is reached, and
//! always clean the ephemeral consumer up — success, early stop, or error.

use std::sync::Arc;

use tracing::debug;

use crate::broker::{Broker, OrderedDrain};
use crate::error::StoreError;
use crate::incoming::IncomingMessage;
use crate::projection::Projection;

pub struct Fetch {
    broker: Arc<dyn Broker>,
    subject_prefix: String,
}

impl Fetch {
    pub fn new(broker: Arc<dyn Broker>, subject_prefix: String) -> Self {
        Self {
            broker,
            subject_prefix,
        }
    }

    /// Drain `bare_subject`'s full history into `projection`.
    ///
    /// When `until_seq` is set, stops once a delivery's stream sequence
    /// exceeds it, without invoking the projection for that delivery.
    pub async fn fetch<T>(
        &self,
        bare_subject: &str,
        projection: &mut Projection<T>,
        until_seq: Option<u64>,
    ) -> Result<(), StoreError> {
        let full_subject = format!("{}{}", self.subject_prefix, bare_subject);
        let mut drain = self.broker.open_ordered_consumer(&full_subject).await?;

        let result = self.drain_into(drain.as_mut(), projection, until_seq).await;

        if let Err(err) = drain.unsubscribe().await {
            debug!(error = %err, "fetch: best-effort unsubscribe failed");
        }
        if let Err(err) = drain.delete_consumer().await {
            debug!(error = %err, "fetch: best-effort consumer delete failed");
        }

        result
    }

    async fn drain_into<T>(
        &self,
        drain: &mut dyn OrderedDrain,
        projection: &mut Projection<T>,
        until_seq: Option<u64>,
    ) -> Result<(), StoreError> {
        let counts = drain.consumer_counts().await?;
        let total = counts.total();
        if total == 0 {
            return Ok(());
        }

        let mut processed = 0u64;
        while let Some(next) = drain.next().await {
            let raw = next?;
            if let Some(until) = until_seq {
                if raw.stream_sequence > until {
                    break;
                }
            }

            let stripped_subject = raw
                .subject
                .strip_prefix(self.subject_prefix.as_str())
                .unwrap_or(raw.subject.as_str());
            let incoming = IncomingMessage::decode(
                stripped_subject,
                raw.stream_sequence,
                raw.num_delivered,
                None,
                &raw.payload,
            )?;
            projection.handle(&incoming);

            processed += 1;
            if processed == total {
                break;
            }
        }

        Ok(())
    }
}
