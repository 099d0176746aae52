//! Usage: Per-request pipeline: decode, route, encode back in the caller's protocol, report.

use axum::{
    body::{Body, Bytes},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use std::time::Instant;

use super::errors::{insert_served_by, insert_trace_id, ClientError};
use super::streams::spawn_sse_relay_body;
use super::util::{duration_ms, new_trace_id};
use super::GatewayAppState;
use crate::format::canonical::Usage;
use crate::format::{self, WireFormat};
use crate::provider_client::ProviderReply;
use crate::request_logs::{AttemptOutcome, OutcomeSender};
use crate::router::CandidateFailure;
use crate::shared::clock::now_unix_millis;

/// Request identity carried until the outcome is reported; moves into the stream relay.
pub(super) struct RequestScope {
    pub(super) trace_id: String,
    pub(super) inbound: WireFormat,
    pub(super) requested_model: String,
    pub(super) started: Instant,
    created_at_ms: u64,
    outcomes: OutcomeSender,
}

#[derive(Debug, Default)]
pub(super) struct OutcomeFields {
    pub(super) status: u16,
    pub(super) error_code: Option<&'static str>,
    pub(super) provider: Option<String>,
    pub(super) backend_model: Option<String>,
    pub(super) usage: Option<Usage>,
    pub(super) ttfb_ms: Option<u64>,
    pub(super) failures: Vec<CandidateFailure>,
}

impl RequestScope {
    fn new(inbound: WireFormat, outcomes: OutcomeSender) -> Self {
        Self {
            trace_id: new_trace_id(),
            inbound,
            requested_model: String::new(),
            started: Instant::now(),
            created_at_ms: now_unix_millis(),
            outcomes,
        }
    }

    /// Hands the outcome to the buffered writer; never waits on it.
    pub(super) fn report(self, fields: OutcomeFields) {
        self.outcomes.enqueue(AttemptOutcome {
            trace_id: self.trace_id,
            requested_model: self.requested_model,
            inbound_format: self.inbound,
            provider: fields.provider,
            backend_model: fields.backend_model,
            success: fields.error_code.is_none(),
            status: fields.status,
            error_code: fields.error_code,
            latency_ms: duration_ms(self.started.elapsed()),
            ttfb_ms: fields.ttfb_ms,
            usage: fields.usage,
            failures: fields.failures,
            created_at_ms: self.created_at_ms,
        });
    }

    fn fail(self, err: ClientError, failures: Vec<CandidateFailure>) -> Response {
        tracing::debug!(
            trace_id = %self.trace_id,
            model = %self.requested_model,
            status = err.status.as_u16(),
            error_code = err.error_code,
            "request rejected"
        );
        let resp = err.clone().into_response(self.inbound, &self.trace_id);
        self.report(OutcomeFields {
            status: err.status.as_u16(),
            error_code: Some(err.error_code),
            failures,
            ..OutcomeFields::default()
        });
        resp
    }
}

pub(super) async fn handle_chat(
    state: GatewayAppState,
    inbound: WireFormat,
    body: Bytes,
) -> Response {
    let mut scope = RequestScope::new(inbound, state.outcomes.clone());

    let request = match format::decode_request(inbound, &body) {
        Ok(request) => request,
        Err(err) => return scope.fail(ClientError::invalid_request(&err), Vec::new()),
    };
    scope.requested_model = request.model.clone();

    let routed = match state.router.route(&request.model, &request).await {
        Ok(routed) => routed,
        Err(err) => {
            let client_err = ClientError::from_routing(&request.model, &err);
            return scope.fail(client_err, err.failures().to_vec());
        }
    };

    match routed.reply {
        ProviderReply::Complete(response) => {
            let bytes = match format::encode_response(inbound, &response) {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(
                        trace_id = %scope.trace_id,
                        provider = %routed.provider,
                        error = %err,
                        "reply not representable in caller protocol"
                    );
                    return scope.fail(ClientError::untranslatable_reply(&err), routed.failures);
                }
            };

            let mut resp = (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                bytes,
            )
                .into_response();
            insert_trace_id(&mut resp, &scope.trace_id);
            insert_served_by(&mut resp, &routed.provider, &routed.backend_model);

            scope.report(OutcomeFields {
                status: StatusCode::OK.as_u16(),
                provider: Some(routed.provider),
                backend_model: Some(routed.backend_model),
                usage: Some(response.usage),
                failures: routed.failures,
                ..OutcomeFields::default()
            });
            resp
        }
        ProviderReply::Stream(events) => {
            let mut resp = Response::new(Body::empty());
            insert_trace_id(&mut resp, &scope.trace_id);
            insert_served_by(&mut resp, &routed.provider, &routed.backend_model);
            let headers = resp.headers_mut();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/event-stream"),
            );
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));

            let served = OutcomeFields {
                status: StatusCode::OK.as_u16(),
                provider: Some(routed.provider),
                backend_model: Some(routed.backend_model),
                failures: routed.failures,
                ..OutcomeFields::default()
            };
            *resp.body_mut() = spawn_sse_relay_body(events, scope, served);
            resp
        }
    }
}
