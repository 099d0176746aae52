//! Usage: Upstream transport for one provider (encoded request in, canonical reply out).

use crate::config::ProviderConfig;
use crate::format::canonical::{CanonicalResponse, StreamEvent};
use crate::format::sse::SseDecoder;
use crate::format::{self, StreamDecoder, StreamError, TranslationError, WireFormat};
use crate::shared::stream_util::{next_item, PrefixedStream};
use async_trait::async_trait;
use axum::body::Bytes;
use futures_core::Stream;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ERROR_BODY_LOG_LIMIT: usize = 512;

/// Lazy, finite, non-restartable sequence of canonical events; dropping it abandons the upstream.
pub type CanonicalStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, StreamError>> + Send>>;

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub backend_model: String,
    /// Body already encoded in the provider's wire format.
    pub body: Bytes,
    pub stream: bool,
}

pub enum ProviderReply {
    Complete(CanonicalResponse),
    Stream(CanonicalStream),
}

impl fmt::Debug for ProviderReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete(response) => f.debug_tuple("Complete").field(response).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream connection failed: {0}")]
    Connect(String),
    #[error("upstream request failed: {0}")]
    Transport(String),
    #[error("upstream responded with HTTP {status}")]
    Status { status: u16 },
    #[error("upstream response could not be decoded: {0}")]
    Decode(#[from] TranslationError),
    #[error("upstream stream failed before its first event: {0}")]
    Stream(StreamError),
}

impl UpstreamError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "GW_UPSTREAM_TIMEOUT",
            Self::Connect(_) => "GW_UPSTREAM_CONNECT_FAILED",
            Self::Transport(_) => "GW_INTERNAL_ERROR",
            Self::Status { status } if *status >= 500 => "GW_UPSTREAM_5XX",
            Self::Status { status } if *status >= 400 => "GW_UPSTREAM_4XX",
            Self::Status { .. } => "GW_INTERNAL_ERROR",
            Self::Decode(_) => "GW_UPSTREAM_DECODE",
            Self::Stream(err) => err.error_code(),
        }
    }
}

fn classify_reqwest_error(err: &reqwest::Error) -> UpstreamError {
    if err.is_connect() {
        return UpstreamError::Connect(err.to_string());
    }
    UpstreamError::Transport(err.to_string())
}

/// Uniform capability over one upstream: send a request, get a response or a stream.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn send(&self, request: UpstreamRequest) -> Result<ProviderReply, UpstreamError>;
}

pub struct HttpProviderClient {
    http: reqwest::Client,
    provider: ProviderConfig,
}

impl HttpProviderClient {
    pub fn new(http: reqwest::Client, provider: ProviderConfig) -> Self {
        Self { http, provider }
    }

    fn build_request(&self, request: &UpstreamRequest) -> reqwest::RequestBuilder {
        let accept = if request.stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        let mut builder = self
            .http
            .post(self.provider.endpoint_url())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, accept);

        let api_key = self.provider.api_key.as_str();
        builder = match self.provider.format {
            WireFormat::Anthropic => {
                let builder = builder.header("anthropic-version", ANTHROPIC_VERSION);
                if api_key.is_empty() {
                    builder
                } else {
                    builder.header("x-api-key", api_key)
                }
            }
            WireFormat::OpenAi if api_key.is_empty() => builder,
            WireFormat::OpenAi => builder.bearer_auth(api_key),
        };
        builder.body(request.body.clone())
    }

    async fn send_within_deadline(
        &self,
        request: UpstreamRequest,
    ) -> Result<ProviderReply, UpstreamError> {
        let response = self
            .build_request(&request)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            let end = body.len().min(ERROR_BODY_LOG_LIMIT);
            tracing::debug!(
                provider = %self.provider.name,
                status = status.as_u16(),
                body = %String::from_utf8_lossy(&body[..end]),
                "upstream error body"
            );
            return Err(UpstreamError::Status {
                status: status.as_u16(),
            });
        }

        if !request.stream {
            let body = response
                .bytes()
                .await
                .map_err(|e| classify_reqwest_error(&e))?;
            let decoded = format::decode_response(self.provider.format, &body)?;
            return Ok(ProviderReply::Complete(decoded));
        }

        let bytes: ByteStream = Box::pin(response.bytes_stream());
        let mut events =
            UpstreamEventStream::new(bytes, self.provider.format, self.provider.timeout());
        match next_item(&mut events).await {
            Some(Ok(first)) => Ok(ProviderReply::Stream(Box::pin(PrefixedStream::new(
                Ok(first),
                events,
            )))),
            Some(Err(err)) => Err(UpstreamError::Stream(err)),
            None => Err(UpstreamError::Stream(StreamError::Truncated)),
        }
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    /// The deadline covers connect, response head and the first stream event.
    async fn send(&self, request: UpstreamRequest) -> Result<ProviderReply, UpstreamError> {
        let timeout = self.provider.timeout();
        match tokio::time::timeout(timeout, self.send_within_deadline(request)).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout(timeout)),
        }
    }
}

/// Upstream SSE bytes -> canonical events, with an idle timeout between chunks.
pub(crate) struct UpstreamEventStream<S> {
    upstream: S,
    sse: SseDecoder,
    decoder: StreamDecoder,
    queued: VecDeque<Result<StreamEvent, StreamError>>,
    done: bool,
    idle_timeout: Duration,
    idle: Pin<Box<tokio::time::Sleep>>,
}

impl<S, E> UpstreamEventStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: fmt::Display,
{
    pub(crate) fn new(upstream: S, format: WireFormat, idle_timeout: Duration) -> Self {
        Self {
            upstream,
            sse: SseDecoder::default(),
            decoder: StreamDecoder::new(format),
            queued: VecDeque::new(),
            done: false,
            idle_timeout,
            idle: Box::pin(tokio::time::sleep(idle_timeout)),
        }
    }

    fn push_frames(&mut self, frames: Vec<crate::format::sse::SseFrame>) {
        for frame in frames {
            match self.decoder.push_frame(&frame) {
                Ok(events) => self.queued.extend(events.into_iter().map(Ok)),
                Err(err) => {
                    self.queued.push_back(Err(err));
                    self.done = true;
                    return;
                }
            }
            if self.decoder.is_finished() {
                self.done = true;
                return;
            }
        }
    }

    fn finish_upstream(&mut self) {
        if let Some(frame) = self.sse.finish() {
            self.push_frames(vec![frame]);
        }
        if self.done {
            return;
        }
        self.done = true;
        match self.decoder.finish() {
            Ok(events) => self.queued.extend(events.into_iter().map(Ok)),
            Err(err) => self.queued.push_back(Err(err)),
        }
    }
}

impl<S, E> Stream for UpstreamEventStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: fmt::Display,
{
    type Item = Result<StreamEvent, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(item) = this.queued.pop_front() {
                return Poll::Ready(Some(item));
            }
            if this.done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.upstream).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    let deadline = tokio::time::Instant::now() + this.idle_timeout;
                    this.idle.as_mut().reset(deadline);
                    let frames = this.sse.ingest_chunk(&chunk);
                    this.push_frames(frames);
                }
                Poll::Ready(Some(Err(err))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(StreamError::Transport(err.to_string()))));
                }
                Poll::Ready(None) => this.finish_upstream(),
                Poll::Pending => {
                    if this.idle.as_mut().poll(cx).is_ready() {
                        this.done = true;
                        return Poll::Ready(Some(Err(StreamError::IdleTimeout(
                            this.idle_timeout,
                        ))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
