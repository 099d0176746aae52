//! Usage: Scripted provider fakes and fixtures shared by router and gateway tests.

use crate::config::{GatewayConfig, ProviderConfig, RouteCandidate};
use crate::format::canonical::{
    CanonicalRequest, CanonicalResponse, ContentBlock, GenerationParams, Message, Role,
    StopReason, StreamEvent, Usage,
};
use crate::format::{StreamError, WireFormat};
use crate::provider_client::{ProviderClient, ProviderReply, UpstreamError, UpstreamRequest};
use crate::providers::ProviderRegistry;
use crate::router::ModelRouter;
use crate::shared::stream_util::IterStream;
use async_trait::async_trait;
use axum::body::Bytes;
use futures_core::Stream;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

#[derive(Clone)]
pub(crate) enum Script {
    Reply(CanonicalResponse),
    Events(Vec<Result<StreamEvent, StreamError>>),
    /// Emits the events, then never ends; flags `dropped` once the consumer lets go.
    Stalling {
        events: Vec<Result<StreamEvent, StreamError>>,
        dropped: Arc<AtomicBool>,
    },
    Fail(UpstreamError),
}

pub(crate) struct ScriptedClient {
    script: Script,
    calls: AtomicUsize,
    last_body: Mutex<Option<Bytes>>,
}

impl ScriptedClient {
    pub(crate) fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
            last_body: Mutex::new(None),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_body(&self) -> Option<Value> {
        let body = self.last_body.lock().unwrap().clone()?;
        Some(serde_json::from_slice(&body).unwrap())
    }
}

#[async_trait]
impl ProviderClient for ScriptedClient {
    async fn send(&self, request: UpstreamRequest) -> Result<ProviderReply, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_body.lock().unwrap() = Some(request.body);
        match &self.script {
            Script::Reply(response) => Ok(ProviderReply::Complete(response.clone())),
            Script::Events(events) => Ok(ProviderReply::Stream(Box::pin(IterStream::new(
                events.clone(),
            )))),
            Script::Stalling { events, dropped } => {
                Ok(ProviderReply::Stream(Box::pin(StallingEvents {
                    events: events.clone().into(),
                    dropped: dropped.clone(),
                })))
            }
            Script::Fail(err) => Err(err.clone()),
        }
    }
}

struct StallingEvents {
    events: VecDeque<Result<StreamEvent, StreamError>>,
    dropped: Arc<AtomicBool>,
}

impl Stream for StallingEvents {
    type Item = Result<StreamEvent, StreamError>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut().events.pop_front() {
            Some(item) => Poll::Ready(Some(item)),
            None => Poll::Pending,
        }
    }
}

impl Drop for StallingEvents {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

pub(crate) fn provider(name: &str, format: WireFormat) -> ProviderConfig {
    let mut config = ProviderConfig::new(name, format, "http://127.0.0.1:9", "sk-secret-key");
    config.circuit_breaker.failure_threshold = 1;
    config.circuit_breaker.open_duration_secs = 30;
    config
}

/// Providers plus the scripted client behind each one.
pub(crate) struct Fixture {
    pub(crate) config: GatewayConfig,
    pub(crate) clients: BTreeMap<String, Arc<ScriptedClient>>,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
            clients: BTreeMap::new(),
        }
    }

    pub(crate) fn provider(mut self, name: &str, format: WireFormat, script: Script) -> Self {
        self.config
            .providers
            .insert(name.to_string(), provider(name, format));
        self.clients
            .insert(name.to_string(), ScriptedClient::new(script));
        self
    }

    pub(crate) fn route(mut self, model: &str, candidates: &[(&str, &str)]) -> Self {
        self.config.routes.insert(
            model.to_string(),
            candidates
                .iter()
                .map(|(provider, backend)| RouteCandidate::new(*provider, *backend))
                .collect(),
        );
        self
    }

    pub(crate) fn client(&self, name: &str) -> &Arc<ScriptedClient> {
        &self.clients[name]
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.clients.values().map(|c| c.calls()).sum()
    }

    pub(crate) fn router(&self) -> ModelRouter {
        let registry = ProviderRegistry::with_clients(&self.config, |p| {
            let client: Arc<dyn ProviderClient> = self.clients[&p.name].clone();
            client
        });
        ModelRouter::from_config(&self.config, Arc::new(registry)).unwrap()
    }
}

pub(crate) fn text_request(model: &str, text: &str) -> CanonicalRequest {
    CanonicalRequest {
        model: model.to_string(),
        system: None,
        messages: vec![Message {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
        }],
        params: GenerationParams {
            max_tokens: Some(256),
            ..GenerationParams::default()
        },
        stream: false,
    }
}

pub(crate) fn text_response(id: &str, text: &str) -> CanonicalResponse {
    CanonicalResponse {
        id: id.to_string(),
        model: "backend".to_string(),
        content: vec![ContentBlock::text(text)],
        stop_reason: Some(StopReason::EndTurn),
        stop_sequence: None,
        usage: Usage {
            input_tokens: 7,
            output_tokens: 3,
            ..Usage::default()
        },
    }
}
