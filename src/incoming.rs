//! Decoded broker deliveries handed to subscription handlers and projections.

use std::cell::Cell;

use serde_json::Value;

use crate::error::StoreError;
use crate::message::MessageMetadata;

/// A message as delivered from a subscription or fetch, carrying delivery
/// bookkeeping the originating [`crate::Message`] doesn't have.
#[derive(Debug)]
pub struct IncomingMessage {
    pub message_type: String,
    pub data: Value,
    /// Subject with the store's configured prefix stripped.
    pub subject: String,
    /// Stream sequence number of this delivery.
    pub seq: u64,
    pub metadata: Option<MessageMetadata>,
    /// `Some(true)` if this is the last allowed delivery attempt (reached
    /// when a bounded `max_retries` is configured), `Some(false)` if more
    /// attempts remain, `None` if retries are unbounded.
    pub is_last_attempt: Option<bool>,
    terminate: Cell<bool>,
}

impl IncomingMessage {
    /// Decode a raw delivery's JSON payload into an `IncomingMessage`.
    ///
    /// `num_delivered` and `max_retries` determine `is_last_attempt`:
    /// `num_delivered >= max_retries` when `max_retries` is `Some`, else
    /// `None` for unbounded retry budgets.
    pub fn decode(
        prefix_stripped_subject: impl Into<String>,
        seq: u64,
        num_delivered: u64,
        max_retries: Option<u64>,
        payload: &[u8],
    ) -> Result<Self, StoreError> {
        let envelope: Value = serde_json::from_slice(payload)?;
        let message_type = envelope
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Internal("message payload missing \"type\" field".to_string()))?
            .to_string();
        let data = envelope.get("data").cloned().unwrap_or(Value::Null);
        let metadata = match envelope.get("metadata") {
            Some(value) => Some(serde_json::from_value(value.clone())?),
            None => None,
        };
        let is_last_attempt = max_retries.map(|max| num_delivered >= max);

        Ok(Self {
            message_type,
            data,
            subject: prefix_stripped_subject.into(),
            seq,
            metadata,
            is_last_attempt,
            terminate: Cell::new(false),
        })
    }

    /// Mark this delivery for termination (`term` instead of `ack`) once the
    /// handler returns successfully.
    pub fn mark_for_termination(&self) {
        self.terminate.set(true);
    }

    /// Whether [`IncomingMessage::mark_for_termination`] has been called.
    pub fn is_marked_for_termination(&self) -> bool {
        self.terminate.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(json: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&json).unwrap()
    }

    #[test]
    fn decodes_type_data_and_subject() {
        let msg = IncomingMessage::decode(
            "orders.placed",
            7,
            1,
            Some(3),
            &payload(serde_json::json!({ "type": "OrderPlaced", "data": { "id": 1 } })),
        )
        .unwrap();
        assert_eq!(msg.message_type, "OrderPlaced");
        assert_eq!(msg.subject, "orders.placed");
        assert_eq!(msg.seq, 7);
        assert_eq!(msg.is_last_attempt, Some(false));
    }

    #[test]
    fn is_last_attempt_true_once_num_delivered_reaches_max() {
        let msg = IncomingMessage::decode(
            "orders.placed",
            7,
            3,
            Some(3),
            &payload(serde_json::json!({ "type": "OrderPlaced", "data": null })),
        )
        .unwrap();
        assert_eq!(msg.is_last_attempt, Some(true));
    }

    #[test]
    fn is_last_attempt_none_when_unbounded() {
        let msg = IncomingMessage::decode(
            "orders.placed",
            7,
            99,
            None,
            &payload(serde_json::json!({ "type": "OrderPlaced", "data": null })),
        )
        .unwrap();
        assert_eq!(msg.is_last_attempt, None);
    }

    #[test]
    fn termination_flag_starts_false_and_is_settable() {
        let msg = IncomingMessage::decode(
            "orders.placed",
            1,
            1,
            None,
            &payload(serde_json::json!({ "type": "OrderPlaced", "data": null })),
        )
        .unwrap();
        assert!(!msg.is_marked_for_termination());
        msg.mark_for_termination();
        assert!(msg.is_marked_for_termination());
    }
}
