//! Wire-format value objects: [`Message`] and [`MessageMetadata`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An immutable application message as published to or replayed from a subject.
///
/// Encodes to and decodes from `{"type": ..., "data": ..., "metadata"?: ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    pub fn new(message_type: impl Into<String>, data: Value) -> Self {
        Self {
            message_type: message_type.into(),
            data,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Metadata attached to a [`Message`].
///
/// `origin_subject` and `trace_id` are recognized fields with dedicated
/// accessors; anything else round-trips through `additional_props`. Encoding
/// starts from `additional_props` and overlays the recognized fields;
/// decoding pops the recognized keys out of the incoming object and leaves
/// the rest as `additional_props`, so `decode(encode(m)) == m`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageMetadata {
    pub origin_subject: Option<String>,
    pub trace_id: Option<String>,
    pub additional_props: Map<String, Value>,
}

impl MessageMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_origin_subject(mut self, origin_subject: impl Into<String>) -> Self {
        self.origin_subject = Some(origin_subject.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

impl Serialize for MessageMetadata {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut map = self.additional_props.clone();
        if let Some(origin_subject) = &self.origin_subject {
            map.insert(
                "originSubject".to_string(),
                Value::String(origin_subject.clone()),
            );
        }
        if let Some(trace_id) = &self.trace_id {
            map.insert("traceId".to_string(), Value::String(trace_id.clone()));
        }
        map.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MessageMetadata {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let mut map = Map::deserialize(deserializer)?;
        let origin_subject = map
            .remove("originSubject")
            .and_then(|v| v.as_str().map(str::to_string));
        let trace_id = map
            .remove("traceId")
            .and_then(|v| v.as_str().map(str::to_string));
        Ok(MessageMetadata {
            origin_subject,
            trace_id,
            additional_props: map,
        })
    }
}
