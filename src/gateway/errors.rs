//! Usage: Client-visible error responses, rendered in the caller's own protocol.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::format::{self, ErrorKind, TranslationError, WireFormat};
use crate::router::RoutingError;

/// Status, category and the message a caller may see. Never carries upstream bodies.
#[derive(Debug, Clone)]
pub(super) struct ClientError {
    pub(super) status: StatusCode,
    pub(super) kind: ErrorKind,
    pub(super) error_code: &'static str,
    pub(super) message: String,
    pub(super) retry_after_secs: Option<u64>,
}

impl ClientError {
    pub(super) fn invalid_request(err: &TranslationError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: ErrorKind::InvalidRequest,
            error_code: err.error_code(),
            message: err.to_string(),
            retry_after_secs: None,
        }
    }

    /// The served reply had no representation in the caller's protocol.
    pub(super) fn untranslatable_reply(err: &TranslationError) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            kind: ErrorKind::Upstream,
            error_code: err.error_code(),
            message: format!("upstream reply could not be translated: {err}"),
            retry_after_secs: None,
        }
    }

    pub(super) fn from_routing(model: &str, err: &RoutingError) -> Self {
        match err {
            RoutingError::UnknownModel(_) => Self {
                status: StatusCode::NOT_FOUND,
                kind: ErrorKind::NotFound,
                error_code: err.error_code(),
                message: format!("model `{model}` is not configured"),
                retry_after_secs: None,
            },
            RoutingError::Translation { error, .. } => Self::invalid_request(error),
            RoutingError::ExhaustedFallbacks { failures } => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                kind: ErrorKind::Unavailable,
                error_code: err.error_code(),
                message: format!(
                    "all {} candidate(s) for model `{model}` are unavailable",
                    failures.len()
                ),
                retry_after_secs: err.retry_after_secs(),
            },
        }
    }

    pub(super) fn into_response(self, inbound: WireFormat, trace_id: &str) -> Response {
        let body = format::error_body(inbound, self.kind, self.error_code, &self.message);
        let mut resp = (self.status, Json(body)).into_response();
        insert_trace_id(&mut resp, trace_id);
        if let Some(seconds) = self.retry_after_secs.filter(|v| *v > 0) {
            if let Ok(v) = HeaderValue::from_str(&seconds.to_string()) {
                resp.headers_mut().insert(header::RETRY_AFTER, v);
            }
        }
        resp
    }
}

#[derive(Debug, Serialize)]
struct AdminErrorResponse {
    error_code: &'static str,
    message: String,
}

/// Protocol-neutral JSON error for the admin surface.
pub(super) fn admin_error(status: StatusCode, error_code: &'static str, message: String) -> Response {
    (status, Json(AdminErrorResponse { error_code, message })).into_response()
}

pub(super) fn insert_trace_id(resp: &mut Response, trace_id: &str) {
    if let Ok(v) = HeaderValue::from_str(trace_id) {
        resp.headers_mut().insert("x-trace-id", v);
    }
}

pub(super) fn insert_served_by(resp: &mut Response, provider: &str, backend_model: &str) {
    if let Ok(v) = HeaderValue::from_str(provider) {
        resp.headers_mut().insert("x-gateway-provider", v);
    }
    if let Ok(v) = HeaderValue::from_str(backend_model) {
        resp.headers_mut().insert("x-gateway-backend-model", v);
    }
}
