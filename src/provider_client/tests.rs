use super::*;
use crate::format::canonical::{BlockDelta, BlockStart, ContentBlock, StopReason};
use crate::shared::stream_util::IterStream;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use std::collections::VecDeque;

const OPENAI_SSE: &str = concat!(
    "data: {\"id\":\"chatcmpl-1\",\"model\":\"gpt-x\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"}}]}\n\n",
    "data: {\"id\":\"chatcmpl-1\",\"model\":\"gpt-x\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
    "data: [DONE]\n\n",
);

fn chunks(parts: &[&str]) -> IterStream<Result<Bytes, std::io::Error>> {
    IterStream::new(
        parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect::<Vec<_>>(),
    )
}

/// Yields its chunks, then stays pending forever.
struct StallingStream {
    items: VecDeque<Result<Bytes, std::io::Error>>,
}

impl Stream for StallingStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut().items.pop_front() {
            Some(item) => Poll::Ready(Some(item)),
            None => Poll::Pending,
        }
    }
}

async fn collect<S>(stream: &mut S) -> Vec<Result<StreamEvent, StreamError>>
where
    S: Stream<Item = Result<StreamEvent, StreamError>> + Unpin,
{
    let mut out = Vec::new();
    while let Some(item) = next_item(stream).await {
        out.push(item);
    }
    out
}

async fn spawn_upstream(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn client_for(format: WireFormat, base_url: &str, timeout_secs: u64) -> HttpProviderClient {
    let mut provider = ProviderConfig::new("p", format, base_url, "sk-test");
    provider.timeout_secs = timeout_secs;
    HttpProviderClient::new(reqwest::Client::new(), provider)
}

fn request(stream: bool) -> UpstreamRequest {
    UpstreamRequest {
        backend_model: "m".into(),
        body: Bytes::from_static(b"{}"),
        stream,
    }
}

#[tokio::test]
async fn event_stream_splits_frames_across_chunks() {
    let (head, tail) = OPENAI_SSE.split_at(37);
    let mut events = UpstreamEventStream::new(
        chunks(&[head, tail]),
        WireFormat::OpenAi,
        Duration::from_secs(5),
    );
    let items = collect(&mut events).await;
    let items: Vec<StreamEvent> = items.into_iter().map(|i| i.unwrap()).collect();

    assert!(matches!(items[0], StreamEvent::MessageStart { .. }));
    assert_eq!(
        items[1],
        StreamEvent::BlockStart {
            index: 0,
            block: BlockStart::Text
        }
    );
    let text: String = items
        .iter()
        .filter_map(|e| match e {
            StreamEvent::BlockDelta {
                delta: BlockDelta::Text(t),
                ..
            } => Some(t.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "Hello");
    assert!(matches!(
        items.last(),
        Some(StreamEvent::MessageStop {
            stop_reason: Some(StopReason::EndTurn),
            ..
        })
    ));
}

#[tokio::test]
async fn event_stream_reports_truncation_after_partial_output() {
    let partial = "data: {\"id\":\"c\",\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"}}]}\n\n";
    let mut events =
        UpstreamEventStream::new(chunks(&[partial]), WireFormat::OpenAi, Duration::from_secs(5));
    let items = collect(&mut events).await;

    assert!(items[..items.len() - 1].iter().all(Result::is_ok));
    assert_eq!(items.last(), Some(&Err(StreamError::Truncated)));
}

#[tokio::test]
async fn event_stream_surfaces_transport_errors_once() {
    let upstream = IterStream::new(vec![
        Ok(Bytes::from_static(b"data: {\"id\":\"c\",\"model\":\"m\",\"choices\":[]}\n\n")),
        Err(std::io::Error::other("connection reset")),
        Ok(Bytes::from_static(b"data: [DONE]\n\n")),
    ]);
    let mut events = UpstreamEventStream::new(upstream, WireFormat::OpenAi, Duration::from_secs(5));
    let items = collect(&mut events).await;

    assert_eq!(items.len(), 2);
    assert!(matches!(items[1], Err(StreamError::Transport(ref m)) if m.contains("connection reset")));
}

#[tokio::test(start_paused = true)]
async fn event_stream_times_out_when_upstream_goes_quiet() {
    let upstream = StallingStream {
        items: VecDeque::from(vec![Ok(Bytes::from_static(
            b"data: {\"id\":\"c\",\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"}}]}\n\n",
        ))]),
    };
    let idle = Duration::from_secs(3);
    let mut events = UpstreamEventStream::new(upstream, WireFormat::OpenAi, idle);
    let items = collect(&mut events).await;

    assert_eq!(items.len(), 4);
    assert_eq!(items[3], Err(StreamError::IdleTimeout(idle)));
}

#[tokio::test]
async fn anthropic_request_carries_api_key_headers() {
    let router = Router::new().route(
        "/v1/messages",
        post(|headers: HeaderMap| async move {
            let key = headers.get("x-api-key").and_then(|v| v.to_str().ok());
            let version = headers.get("anthropic-version").and_then(|v| v.to_str().ok());
            if key != Some("sk-test") || version != Some(ANTHROPIC_VERSION) {
                return (StatusCode::UNAUTHORIZED, String::new());
            }
            (
                StatusCode::OK,
                serde_json::json!({
                    "id": "msg_1",
                    "type": "message",
                    "role": "assistant",
                    "model": "claude-x",
                    "content": [{"type": "text", "text": "pong"}],
                    "stop_reason": "end_turn",
                    "usage": {"input_tokens": 3, "output_tokens": 1}
                })
                .to_string(),
            )
        }),
    );
    let base = spawn_upstream(router).await;
    let client = client_for(WireFormat::Anthropic, &base, 5);

    let reply = client.send(request(false)).await.unwrap();
    let ProviderReply::Complete(response) = reply else {
        panic!("expected a complete response");
    };
    assert_eq!(response.content, vec![ContentBlock::text("pong")]);
    assert_eq!(response.usage.input_tokens, 3);
}

#[tokio::test]
async fn openai_stream_is_returned_after_first_event() {
    let router = Router::new().route(
        "/v1/chat/completions",
        post(|headers: HeaderMap| async move {
            let auth = headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok());
            if auth != Some("Bearer sk-test") {
                return (StatusCode::UNAUTHORIZED, String::new());
            }
            (StatusCode::OK, OPENAI_SSE.to_string())
        }),
    );
    let base = spawn_upstream(router).await;
    let client = client_for(WireFormat::OpenAi, &base, 5);

    let reply = client.send(request(true)).await.unwrap();
    let ProviderReply::Stream(mut stream) = reply else {
        panic!("expected a stream");
    };
    let items = collect(&mut stream).await;
    assert!(items.iter().all(Result::is_ok));
    assert!(matches!(items[0], Ok(StreamEvent::MessageStart { .. })));
    assert!(matches!(items.last(), Some(Ok(StreamEvent::MessageStop { .. }))));
}

#[tokio::test]
async fn error_status_maps_to_upstream_codes() {
    let router = Router::new().route(
        "/v1/chat/completions",
        post(|| async { (StatusCode::BAD_GATEWAY, "{\"error\":\"down\"}") }),
    );
    let base = spawn_upstream(router).await;
    let client = client_for(WireFormat::OpenAi, &base, 5);

    let err = client.send(request(false)).await.unwrap_err();
    assert_eq!(err, UpstreamError::Status { status: 502 });
    assert_eq!(err.error_code(), "GW_UPSTREAM_5XX");
    assert_eq!(UpstreamError::Status { status: 429 }.error_code(), "GW_UPSTREAM_4XX");
}

#[tokio::test]
async fn undecodable_body_is_a_decode_failure() {
    let router = Router::new().route(
        "/v1/chat/completions",
        post(|| async { "not json" }),
    );
    let base = spawn_upstream(router).await;
    let client = client_for(WireFormat::OpenAi, &base, 5);

    let err = client.send(request(false)).await.unwrap_err();
    assert!(matches!(err, UpstreamError::Decode(TranslationError::Malformed { .. })));
}

#[tokio::test]
async fn empty_stream_body_fails_before_first_event() {
    let router = Router::new().route("/v1/chat/completions", post(|| async { "" }));
    let base = spawn_upstream(router).await;
    let client = client_for(WireFormat::OpenAi, &base, 5);

    let err = client.send(request(true)).await.unwrap_err();
    assert_eq!(err, UpstreamError::Stream(StreamError::Truncated));
}

#[tokio::test]
async fn slow_upstream_hits_the_deadline() {
    let router = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            "{}"
        }),
    );
    let base = spawn_upstream(router).await;
    let client = client_for(WireFormat::OpenAi, &base, 1);

    let err = client.send(request(false)).await.unwrap_err();
    assert_eq!(err, UpstreamError::Timeout(Duration::from_secs(1)));
    assert_eq!(err.error_code(), "GW_UPSTREAM_TIMEOUT");
}

#[tokio::test]
async fn refused_connection_is_a_connect_failure() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let client = client_for(WireFormat::OpenAi, &format!("http://{addr}"), 5);

    let err = client.send(request(false)).await.unwrap_err();
    assert_eq!(err.error_code(), "GW_UPSTREAM_CONNECT_FAILED");
}
