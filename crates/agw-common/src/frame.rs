//! Gateway wire frames.
//!
//! Every WebSocket text message is one JSON object tagged by `type`:
//! `event` (gateway → client), `req` (client → gateway) or `res`
//! (gateway → client, correlated to a `req` by `id`). Some gateways also
//! acknowledge the handshake with a bare `hello-ok` frame.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::event;

/// Maximum accepted text frame size (25 MiB).
pub const MAX_FRAME_SIZE: usize = 25 * 1024 * 1024;

/// A parsed gateway protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// Unsolicited server push.
    Event(EventFrame),
    /// Client request.
    Req(RequestFrame),
    /// Server response to a request.
    Res(ResponseFrame),
    /// Connection-level handshake acknowledgement, sent by gateways that
    /// do not answer `connect` with a `res`. Carries the `hello-ok` body.
    #[serde(rename = "hello-ok")]
    HelloOk(Map<String, Value>),
}

/// Server-pushed event. Delivered at most once, no correlation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    /// Event name, e.g. `connect.challenge` or `tick`.
    pub event: String,
    /// Event-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Monotonic sequence number, when the gateway assigns one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Opaque state version marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_version: Option<Value>,
}

/// Client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Unique request id.
    pub id: String,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Server response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// Id of the originating request.
    pub id: String,
    /// Whether the request succeeded.
    pub ok: bool,
    /// Result payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Structured error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

/// Structured error carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorShape {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Whether the caller may retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    /// Suggested retry delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Errors that can occur during frame parsing.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The frame exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: max {max}, got {actual}")]
    TooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size received.
        actual: usize,
    },
    /// The text is not a valid frame.
    #[error("invalid frame: {0}")]
    Json(#[from] serde_json::Error),
}

impl Frame {
    /// Creates a request frame.
    #[must_use]
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Req(RequestFrame {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    /// Creates a successful response frame.
    #[must_use]
    pub fn ok(id: impl Into<String>, payload: Value) -> Self {
        Self::Res(ResponseFrame {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        })
    }

    /// Creates a failed response frame.
    #[must_use]
    pub fn err(id: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Res(ResponseFrame {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(ErrorShape {
                code: code.into(),
                message: message.into(),
                details: None,
                retryable: None,
                retry_after_ms: None,
            }),
        })
    }

    /// Creates an event frame.
    #[must_use]
    pub fn event(name: impl Into<String>, payload: Option<Value>, seq: Option<u64>) -> Self {
        Self::Event(EventFrame {
            event: name.into(),
            payload,
            seq,
            state_version: None,
        })
    }

    /// Creates the `connect.challenge` event sent by the gateway on accept.
    #[must_use]
    pub fn connect_challenge(nonce: &str) -> Self {
        Self::event(
            event::CONNECT_CHALLENGE,
            Some(serde_json::json!({ "nonce": nonce })),
            None,
        )
    }

    /// Serializes the frame to its JSON text form.
    ///
    /// # Examples
    ///
    /// ```
    /// use agw_common::frame::Frame;
    /// let text = Frame::request("r1", "health", None).serialize();
    /// assert_eq!(text, r#"{"type":"req","id":"r1","method":"health"}"#);
    /// ```
    #[must_use]
    pub fn serialize(&self) -> String {
        // Serializing these types cannot fail: all keys are strings.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parses a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] if the text is oversized, not JSON, or does
    /// not match any frame shape.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        if text.len() > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge {
                max: MAX_FRAME_SIZE,
                actual: text.len(),
            });
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Returns the frame tag as it appears on the wire.
    #[must_use]
    pub const fn frame_type(&self) -> &'static str {
        match self {
            Self::Event(_) => "event",
            Self::Req(_) => "req",
            Self::Res(_) => "res",
            Self::HelloOk(_) => "hello-ok",
        }
    }
}

impl EventFrame {
    /// Extracts the nonce from a `connect.challenge` event.
    ///
    /// Returns `None` for any other event, or when the nonce is missing,
    /// not a string, or blank.
    #[must_use]
    pub fn challenge_nonce(&self) -> Option<&str> {
        if self.event != event::CONNECT_CHALLENGE {
            return None;
        }
        self.payload
            .as_ref()?
            .get("nonce")?
            .as_str()
            .map(str::trim)
            .filter(|n| !n.is_empty())
    }
}
