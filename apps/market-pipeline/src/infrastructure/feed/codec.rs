//! Feed Codec
//!
//! Decodes JSON text frames from the price feed. Frames are either a single
//! message object or an array of them; the `type` field selects the message.

use super::messages::{ErrorMessage, FeedMessage, SubscribedMessage, TickMessage};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame was neither an object nor an array.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    /// A message had no `type` field.
    #[error("message without type")]
    MissingType,
}

/// JSON codec for the feed stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct FeedCodec;

impl FeedCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode a text frame.
    ///
    /// Unknown message types are skipped. Any undecodable element fails
    /// the whole frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not valid JSON or an element does
    /// not match its declared type.
    pub fn decode(&self, text: &str) -> Result<Vec<FeedMessage>, CodecError> {
        let trimmed = text.trim();
        let values = if trimmed.starts_with('[') {
            serde_json::from_str::<Vec<serde_json::Value>>(trimmed)?
        } else if trimmed.starts_with('{') {
            vec![serde_json::from_str::<serde_json::Value>(trimmed)?]
        } else {
            let preview: String = trimmed.chars().take(50).collect();
            return Err(CodecError::InvalidFormat(format!(
                "expected JSON array or object, got: {preview}..."
            )));
        };

        let mut messages = Vec::with_capacity(values.len());
        for value in values {
            if let Some(message) = Self::decode_value(value)? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    fn decode_value(value: serde_json::Value) -> Result<Option<FeedMessage>, CodecError> {
        let msg_type = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or(CodecError::MissingType)?;

        let message = match msg_type {
            "tick" => FeedMessage::Tick(serde_json::from_value::<TickMessage>(value)?),
            "subscribed" => {
                FeedMessage::Subscribed(serde_json::from_value::<SubscribedMessage>(value)?)
            }
            "pong" => FeedMessage::Pong,
            "error" => FeedMessage::Error(serde_json::from_value::<ErrorMessage>(value)?),
            other => {
                tracing::trace!(msg_type = other, "Ignoring unhandled message type");
                return Ok(None);
            }
        };
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;

    #[test]
    fn decodes_single_object() {
        let messages = FeedCodec::new()
            .decode(r#"{"type":"tick","symbol":"BTC-USD","price":"100","volume":"1","timestamp":1}"#)
            .unwrap();

        assert_eq!(messages.len(), 1);
        let FeedMessage::Tick(tick) = &messages[0] else {
            panic!("expected tick");
        };
        assert_eq!(tick.price, Decimal::from(100));
    }

    #[test]
    fn decodes_mixed_array() {
        let json = r#"[
            {"type":"subscribed","symbols":["BTC-USD"]},
            {"type":"tick","symbol":"BTC-USD","price":101.5,"volume":2,"timestamp":2},
            {"type":"pong"},
            {"type":"error","code":400,"message":"bad"}
        ]"#;
        let messages = FeedCodec::new().decode(json).unwrap();

        assert_eq!(messages.len(), 4);
        assert!(matches!(messages[0], FeedMessage::Subscribed(_)));
        assert!(matches!(messages[2], FeedMessage::Pong));
        assert!(matches!(&messages[3], FeedMessage::Error(e) if e.code == 400));
    }

    #[test]
    fn skips_unknown_types() {
        let messages = FeedCodec::new()
            .decode(r#"[{"type":"heartbeat"},{"type":"pong"}]"#)
            .unwrap();
        assert_eq!(messages, vec![FeedMessage::Pong]);
    }

    #[test]
    fn empty_array_decodes_to_nothing() {
        assert!(FeedCodec::new().decode("[]").unwrap().is_empty());
    }

    #[test]
    fn rejects_malformed_frames() {
        let codec = FeedCodec::new();
        assert!(matches!(codec.decode("not json"), Err(CodecError::InvalidFormat(_))));
        assert!(matches!(codec.decode("{broken"), Err(CodecError::Json(_))));
        assert!(matches!(codec.decode(r#"{"symbol":"X"}"#), Err(CodecError::MissingType)));
        assert!(matches!(
            codec.decode(r#"{"type":"tick","symbol":"X","price":"abc","timestamp":1}"#),
            Err(CodecError::Json(_))
        ));
    }
}
