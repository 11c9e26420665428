//! Channel frames
//!
//! Every message on an open channel is one JSON object tagged by `type`.
//! All frames except `generate` flow from the donor back to the requester,
//! and `cancel` flows requester → donor.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn default_stream() -> bool {
    true
}

/// A single typed message exchanged over a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// Start a generation on the remote peer
    #[serde(rename_all = "camelCase")]
    Generate {
        request_id: String,
        model: String,
        prompt: String,
        #[serde(default = "default_stream")]
        stream: bool,
    },

    /// One streamed chunk of output
    #[serde(rename_all = "camelCase")]
    Token { request_id: String, token: String },

    /// Generation finished successfully
    #[serde(rename_all = "camelCase")]
    Done { request_id: String },

    /// Generation failed on the remote peer
    #[serde(rename_all = "camelCase")]
    Error { request_id: String, message: String },

    /// Requester no longer wants this generation
    #[serde(rename_all = "camelCase")]
    Cancel { request_id: String },
}

impl Frame {
    pub fn generate(
        request_id: impl Into<String>,
        model: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Frame::Generate {
            request_id: request_id.into(),
            model: model.into(),
            prompt: prompt.into(),
            stream: true,
        }
    }

    pub fn token(request_id: impl Into<String>, token: impl Into<String>) -> Self {
        Frame::Token {
            request_id: request_id.into(),
            token: token.into(),
        }
    }

    pub fn done(request_id: impl Into<String>) -> Self {
        Frame::Done {
            request_id: request_id.into(),
        }
    }

    pub fn error(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Frame::Error {
            request_id: request_id.into(),
            message: message.into(),
        }
    }

    pub fn cancel(request_id: impl Into<String>) -> Self {
        Frame::Cancel {
            request_id: request_id.into(),
        }
    }

    /// The request this frame belongs to
    pub fn request_id(&self) -> &str {
        match self {
            Frame::Generate { request_id, .. }
            | Frame::Token { request_id, .. }
            | Frame::Done { request_id }
            | Frame::Error { request_id, .. }
            | Frame::Cancel { request_id } => request_id,
        }
    }

    /// Wire name of the frame type
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Generate { .. } => "generate",
            Frame::Token { .. } => "token",
            Frame::Done { .. } => "done",
            Frame::Error { .. } => "error",
            Frame::Cancel { .. } => "cancel",
        }
    }

    /// `done` and `error` end a session
    pub fn is_terminal(&self) -> bool {
        matches!(self, Frame::Done { .. } | Frame::Error { .. })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Internal(format!("frame encode: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generate_wire_shape() {
        let value = serde_json::to_value(Frame::generate("r1", "deepseek-r1:7b", "ping")).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "generate",
                "requestId": "r1",
                "model": "deepseek-r1:7b",
                "prompt": "ping",
                "stream": true
            })
        );
    }

    #[test]
    fn test_generate_without_stream_flag() {
        let frame = Frame::decode(br#"{"type":"generate","requestId":"r1","model":"m","prompt":"p"}"#)
            .unwrap();
        assert!(matches!(frame, Frame::Generate { stream: true, .. }));
    }

    #[test]
    fn test_decode_token_and_error() {
        let token = Frame::decode(br#"{"type":"token","requestId":"r2","token":"po"}"#).unwrap();
        assert_eq!(token, Frame::token("r2", "po"));
        assert!(!token.is_terminal());

        let error = Frame::decode(br#"{"type":"error","requestId":"r2","message":"oom"}"#).unwrap();
        assert_eq!(error.request_id(), "r2");
        assert!(error.is_terminal());
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let err = Frame::decode(br#"{"type":"ping","requestId":"r1"}"#).unwrap_err();
        assert!(matches!(err, Error::ProtocolMalformed { .. }));
    }

    #[test]
    fn test_decode_rejects_missing_request_id() {
        assert!(Frame::decode(br#"{"type":"done"}"#).is_err());
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Frame::cancel("r").type_name(), "cancel");
        assert_eq!(Frame::done("r").type_name(), "done");
    }
}
