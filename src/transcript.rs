//! Live captions for both sides of the conversation
//!
//! The service sends transcription text as it recognizes it. Each fragment
//! replaces the previous text for its direction; nothing is accumulated.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Who was speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The user (input transcription)
    In,
    /// The agent (output transcription)
    Out,
}

/// Latest caption text per direction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptionState {
    pub input_text: String,
    pub output_text: String,
}

/// Publishes caption updates to any number of observers.
#[derive(Debug, Clone)]
pub struct TranscriptionRelay {
    tx: Arc<watch::Sender<TranscriptionState>>,
}

impl TranscriptionRelay {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(TranscriptionState::default());
        Self { tx: Arc::new(tx) }
    }

    /// Replace the text for `direction` and notify observers.
    pub fn on_fragment(&self, direction: Direction, text: impl Into<String>) {
        let text = text.into();
        debug!("📝 {:?} transcript: {}", direction, text);
        self.tx.send_modify(|state| match direction {
            Direction::In => state.input_text = text,
            Direction::Out => state.output_text = text,
        });
    }

    /// Blank both captions, e.g. when a new session starts.
    pub fn clear(&self) {
        self.tx.send_modify(|state| *state = TranscriptionState::default());
    }

    pub fn current(&self) -> TranscriptionState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TranscriptionState> {
        self.tx.subscribe()
    }
}

impl Default for TranscriptionRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_fragment_wins() {
        let relay = TranscriptionRelay::new();
        relay.on_fragment(Direction::Out, "Hel");
        relay.on_fragment(Direction::Out, "Hello th");
        relay.on_fragment(Direction::Out, "Hello there");

        let state = relay.current();
        assert_eq!(state.output_text, "Hello there");
        assert_eq!(state.input_text, "");
    }

    #[test]
    fn test_directions_are_independent() {
        let relay = TranscriptionRelay::new();
        relay.on_fragment(Direction::In, "I feel tired");
        relay.on_fragment(Direction::Out, "That sounds hard");
        relay.on_fragment(Direction::In, "today");

        assert_eq!(
            relay.current(),
            TranscriptionState {
                input_text: "today".to_string(),
                output_text: "That sounds hard".to_string(),
            }
        );

        relay.clear();
        assert_eq!(relay.current(), TranscriptionState::default());
    }

    #[tokio::test]
    async fn test_observer_sees_each_update() {
        let relay = TranscriptionRelay::new();
        let mut rx = relay.subscribe();

        relay.on_fragment(Direction::In, "hi");
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().input_text, "hi");

        // An identical fragment still counts as an update.
        relay.on_fragment(Direction::In, "hi");
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().input_text, "hi");
    }
}
