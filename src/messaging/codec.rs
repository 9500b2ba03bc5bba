//! Context wire codecs
//!
//! The dispatch server treats payloads as opaque bytes; a [`ContextCodec`] turns them
//! into a context and back. [`JsonCodec`] covers any serde context.

use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};

use super::errors::{MessagingError, MessagingResult};

pub trait ContextCodec<C>: Send + Sync + 'static {
    fn decode(&self, payload: &[u8]) -> MessagingResult<C>;

    fn encode(&self, context: &C) -> MessagingResult<Vec<u8>>;

    fn content_type(&self) -> &'static str;
}

/// serde_json codec
pub struct JsonCodec<C> {
    _context: PhantomData<fn() -> C>,
}

impl<C> JsonCodec<C> {
    pub fn new() -> Self {
        Self {
            _context: PhantomData,
        }
    }
}

impl<C> Default for JsonCodec<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Clone for JsonCodec<C> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<C> std::fmt::Debug for JsonCodec<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<C> ContextCodec<C> for JsonCodec<C>
where
    C: Serialize + DeserializeOwned + 'static,
{
    fn decode(&self, payload: &[u8]) -> MessagingResult<C> {
        serde_json::from_slice(payload).map_err(MessagingError::from)
    }

    fn encode(&self, context: &C) -> MessagingResult<Vec<u8>> {
        serde_json::to_vec(context).map_err(|e| MessagingError::message_serialization(e.to_string()))
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextStatus, ErrorRecord, RequestContext};
    use serde::Deserialize;

    #[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
    enum SettingsCommand {
        #[default]
        Read,
        Update,
    }

    type SettingsContext = RequestContext<SettingsCommand, Option<String>, Vec<String>>;

    #[test]
    fn test_json_codec_preserves_empty_errors() {
        let codec = JsonCodec::<SettingsContext>::new();
        let ctx = SettingsContext::new(SettingsCommand::Read, None);

        let decoded = codec.decode(&codec.encode(&ctx).unwrap()).unwrap();
        assert_eq!(decoded, ctx);
        assert!(decoded.errors.is_empty());
    }

    #[test]
    fn test_json_codec_preserves_errors_with_cause() {
        let codec = JsonCodec::<SettingsContext>::new();
        let mut ctx = SettingsContext::new(SettingsCommand::Update, Some("theme".into()));
        ctx.status = ContextStatus::Fail;
        ctx.errors.push(
            ErrorRecord::new("bad-value", "validation", "theme", "unknown theme")
                .with_cause("expected one of: light, dark"),
        );

        let decoded = codec.decode(&codec.encode(&ctx).unwrap()).unwrap();
        assert_eq!(decoded, ctx);
    }

    #[test]
    fn test_json_codec_rejects_garbage() {
        let codec = JsonCodec::<SettingsContext>::new();
        let err = codec.decode(b"\x00not json").unwrap_err();
        assert!(matches!(err, MessagingError::MessageDeserialization { .. }));
        assert_eq!(codec.content_type(), "application/json");
    }
}
