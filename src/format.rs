//! Usage: Wire-format adapter between the two chat protocols and the canonical model.
//!
//! `anthropic` is the "messages with typed content blocks" protocol, `openai` the
//! "chat messages with function calls" protocol. Every function here is pure; the only
//! state lives in the per-stream decoders/encoders, which are owned by one stream.

pub mod anthropic;
pub mod canonical;
mod fields;
pub mod openai;
pub mod sse;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use canonical::{CanonicalRequest, CanonicalResponse, StreamEvent};
use sse::SseFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
}

impl WireFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
        }
    }

    /// Default upstream path appended to a provider base URL.
    pub fn request_path(self) -> &'static str {
        match self {
            Self::Anthropic => "/v1/messages",
            Self::OpenAi => "/v1/chat/completions",
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranslationError {
    #[error("malformed {format} payload: {reason}")]
    Malformed { format: WireFormat, reason: String },
    #[error("{construct} has no representation in the {format} format")]
    Unsupported {
        format: WireFormat,
        construct: String,
    },
}

impl TranslationError {
    pub(crate) fn malformed(format: WireFormat, reason: impl Into<String>) -> Self {
        Self::Malformed {
            format,
            reason: reason.into(),
        }
    }

    pub(crate) fn unsupported(format: WireFormat, construct: impl Into<String>) -> Self {
        Self::Unsupported {
            format,
            construct: construct.into(),
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Malformed { .. } => "GW_INVALID_REQUEST",
            Self::Unsupported { .. } => "GW_TRANSLATION_UNSUPPORTED",
        }
    }
}

/// Failure while pulling canonical events out of an upstream stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Translation(#[from] TranslationError),
    #[error("upstream sent an error event: {0}")]
    UpstreamEvent(String),
    #[error("upstream stream ended before its final event")]
    Truncated,
    #[error("upstream stream transport failed: {0}")]
    Transport(String),
    #[error("upstream stream idle for more than {0:?}")]
    IdleTimeout(Duration),
}

impl StreamError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Translation(err) => err.error_code(),
            Self::IdleTimeout(_) => "GW_UPSTREAM_TIMEOUT",
            Self::UpstreamEvent(_) | Self::Truncated | Self::Transport(_) => "GW_STREAM_ERROR",
        }
    }
}

/// Client-visible error categories, rendered in each protocol's own error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    NotFound,
    Unavailable,
    Upstream,
}

fn parse_json(format: WireFormat, body: &[u8]) -> Result<Value, TranslationError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| TranslationError::malformed(format, format!("invalid JSON: {e}")))?;
    if !value.is_object() {
        return Err(TranslationError::malformed(format, "body must be a JSON object"));
    }
    Ok(value)
}

fn to_bytes(format: WireFormat, value: &Value) -> Result<Vec<u8>, TranslationError> {
    serde_json::to_vec(value)
        .map_err(|e| TranslationError::malformed(format, format!("serialize failed: {e}")))
}

pub fn decode_request(format: WireFormat, body: &[u8]) -> Result<CanonicalRequest, TranslationError> {
    let value = parse_json(format, body)?;
    match format {
        WireFormat::Anthropic => anthropic::decode_request(&value),
        WireFormat::OpenAi => openai::decode_request(&value),
    }
}

/// Encodes `request` for a provider speaking `format`, addressed to `backend_model`.
pub fn encode_request(
    format: WireFormat,
    request: &CanonicalRequest,
    backend_model: &str,
) -> Result<Vec<u8>, TranslationError> {
    let value = match format {
        WireFormat::Anthropic => anthropic::encode_request(request, backend_model)?,
        WireFormat::OpenAi => openai::encode_request(request, backend_model)?,
    };
    to_bytes(format, &value)
}

pub fn decode_response(
    format: WireFormat,
    body: &[u8],
) -> Result<CanonicalResponse, TranslationError> {
    let value = parse_json(format, body)?;
    match format {
        WireFormat::Anthropic => anthropic::decode_response(&value),
        WireFormat::OpenAi => openai::decode_response(&value),
    }
}

pub fn encode_response(
    format: WireFormat,
    response: &CanonicalResponse,
) -> Result<Vec<u8>, TranslationError> {
    let value = match format {
        WireFormat::Anthropic => anthropic::encode_response(response)?,
        WireFormat::OpenAi => openai::encode_response(response)?,
    };
    to_bytes(format, &value)
}

pub fn error_body(format: WireFormat, kind: ErrorKind, code: &str, message: &str) -> Value {
    match format {
        WireFormat::Anthropic => anthropic::error_body(kind, message),
        WireFormat::OpenAi => openai::error_body(kind, code, message),
    }
}

/// Turns upstream SSE frames into canonical stream events.
#[derive(Debug)]
pub enum StreamDecoder {
    Anthropic(anthropic::StreamDecoder),
    OpenAi(openai::StreamDecoder),
}

impl StreamDecoder {
    pub fn new(format: WireFormat) -> Self {
        match format {
            WireFormat::Anthropic => Self::Anthropic(anthropic::StreamDecoder::default()),
            WireFormat::OpenAi => Self::OpenAi(openai::StreamDecoder::default()),
        }
    }

    pub fn push_frame(&mut self, frame: &SseFrame) -> Result<Vec<StreamEvent>, StreamError> {
        match self {
            Self::Anthropic(decoder) => decoder.push_frame(frame),
            Self::OpenAi(decoder) => decoder.push_frame(frame),
        }
    }

    /// Called once the upstream body ends.
    pub fn finish(&mut self) -> Result<Vec<StreamEvent>, StreamError> {
        match self {
            Self::Anthropic(decoder) => decoder.finish(),
            Self::OpenAi(decoder) => decoder.finish(),
        }
    }

    pub fn is_finished(&self) -> bool {
        match self {
            Self::Anthropic(decoder) => decoder.is_finished(),
            Self::OpenAi(decoder) => decoder.is_finished(),
        }
    }
}

/// Renders canonical stream events as the caller's SSE frames.
#[derive(Debug)]
pub enum StreamEncoder {
    Anthropic(anthropic::StreamEncoder),
    OpenAi(openai::StreamEncoder),
}

impl StreamEncoder {
    pub fn new(format: WireFormat) -> Self {
        match format {
            WireFormat::Anthropic => Self::Anthropic(anthropic::StreamEncoder::default()),
            WireFormat::OpenAi => Self::OpenAi(openai::StreamEncoder::default()),
        }
    }

    pub fn encode(&mut self, event: &StreamEvent) -> Result<Vec<SseFrame>, TranslationError> {
        match self {
            Self::Anthropic(encoder) => Ok(encoder.encode(event)),
            Self::OpenAi(encoder) => encoder.encode(event),
        }
    }

    /// In-band error frame for failures after the response head was sent.
    pub fn error_frame(&self, code: &str, message: &str) -> SseFrame {
        match self {
            Self::Anthropic(_) => anthropic::stream_error_frame(message),
            Self::OpenAi(_) => openai::stream_error_frame(code, message),
        }
    }
}

#[cfg(test)]
mod tests;
