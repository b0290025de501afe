//! Generic stateful reducer used by [`crate::Fetch`] and subscriptions.

use std::collections::HashMap;

use crate::incoming::IncomingMessage;

type Handler<T> = Box<dyn FnMut(&mut T, &IncomingMessage) + Send>;

/// Folds a stream of [`IncomingMessage`]s into an accumulator `T`.
///
/// Not thread-safe: callers are expected to drain a single subject's
/// messages through one `Projection` on one task, per spec.
pub struct Projection<T> {
    state: T,
    handlers: HashMap<String, Handler<T>>,
}

impl<T> Projection<T> {
    /// Build a projection starting from `init`'s initial state, with one
    /// handler per message type.
    pub fn new(init: T) -> Self {
        Self {
            state: init,
            handlers: HashMap::new(),
        }
    }

    /// Register a handler invoked for messages of `message_type`. Replaces
    /// `state` with the handler's mutation; message types with no handler
    /// are silently ignored.
    pub fn on(
        mut self,
        message_type: impl Into<String>,
        handler: impl FnMut(&mut T, &IncomingMessage) + Send + 'static,
    ) -> Self {
        self.handlers.insert(message_type.into(), Box::new(handler));
        self
    }

    /// Fold one message into the accumulator, if a handler for its type
    /// exists. A no-op for unrecognized types.
    pub fn handle(&mut self, message: &IncomingMessage) {
        if let Some(handler) = self.handlers.get_mut(&message.message_type) {
            handler(&mut self.state, message);
        }
    }

    /// Consume the projection and return its accumulated state.
    pub fn into_result(self) -> T {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incoming(message_type: &str, seq: u64) -> IncomingMessage {
        IncomingMessage::decode(
            "orders",
            seq,
            1,
            None,
            serde_json::to_vec(&serde_json::json!({ "type": message_type, "data": null }))
                .unwrap()
                .as_slice(),
        )
        .unwrap()
    }

    #[test]
    fn folds_matching_messages_and_ignores_others() {
        let mut projection = Projection::new(0u32).on("TheEvent", |state, _msg| *state += 1);

        projection.handle(&incoming("TheEvent", 1));
        projection.handle(&incoming("Unrelated", 2));
        projection.handle(&incoming("TheEvent", 3));

        assert_eq!(projection.into_result(), 2);
    }

    #[test]
    fn empty_projection_returns_init() {
        let projection: Projection<Vec<u64>> = Projection::new(Vec::new());
        assert!(projection.into_result().is_empty());
    }
}
