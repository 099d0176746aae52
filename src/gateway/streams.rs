//! Usage: Relays canonical stream events to the caller as SSE in the caller's protocol.

use axum::body::{Body, Bytes};
use futures_core::Stream;
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use super::handler::{OutcomeFields, RequestScope};
use super::util::duration_ms;
use crate::format::canonical::{StreamEvent, Usage};
use crate::format::StreamEncoder;
use crate::provider_client::CanonicalStream;
use crate::shared::stream_util::next_item;

const SSE_RELAY_BUFFER_CAPACITY: usize = 32;

struct RelayBodyStream {
    rx: tokio::sync::mpsc::Receiver<Bytes>,
}

impl Stream for RelayBodyStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx).map(|item| item.map(Ok))
    }
}

fn track_usage(usage: &mut Usage, event: &StreamEvent) {
    match event {
        StreamEvent::MessageStart { usage: reported, .. }
        | StreamEvent::MessageStop {
            usage: reported, ..
        } => usage.merge(reported),
        _ => {}
    }
}

/// Spawns the relay task and returns the response body it feeds.
///
/// Dropping the body (client gone) closes the channel; the task notices on its next
/// wake and drops the upstream stream instead of draining it.
pub(super) fn spawn_sse_relay_body(
    events: CanonicalStream,
    scope: RequestScope,
    mut served: OutcomeFields,
) -> Body {
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(SSE_RELAY_BUFFER_CAPACITY);

    tokio::spawn(async move {
        let mut events = events;
        let mut encoder = StreamEncoder::new(scope.inbound);
        let mut usage = Usage::default();
        let mut forwarded_frames: u64 = 0;
        let mut client_gone = false;

        'relay: loop {
            let item = tokio::select! {
                _ = tx.closed() => {
                    client_gone = true;
                    break 'relay;
                }
                item = next_item(&mut events) => item,
            };
            let Some(item) = item else {
                break;
            };

            let frames = match item {
                Ok(event) => {
                    track_usage(&mut usage, &event);
                    match encoder.encode(&event) {
                        Ok(frames) => frames,
                        Err(err) => {
                            tracing::warn!(
                                trace_id = %scope.trace_id,
                                error = %err,
                                "stream event not representable in caller protocol"
                            );
                            served.error_code = Some(err.error_code());
                            vec![encoder.error_frame(
                                err.error_code(),
                                "upstream reply could not be translated",
                            )]
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        trace_id = %scope.trace_id,
                        provider = served.provider.as_deref().unwrap_or(""),
                        error_code = err.error_code(),
                        error = %err,
                        "upstream stream failed mid-response"
                    );
                    served.error_code = Some(err.error_code());
                    vec![encoder.error_frame(err.error_code(), "upstream stream failed")]
                }
            };

            for frame in frames {
                if served.ttfb_ms.is_none() {
                    served.ttfb_ms = Some(duration_ms(scope.started.elapsed()));
                }
                if tx.send(frame.to_bytes()).await.is_err() {
                    client_gone = true;
                    break 'relay;
                }
                forwarded_frames += 1;
            }
            if served.error_code.is_some() {
                break;
            }
        }

        drop(events);
        if client_gone {
            tracing::info!(
                trace_id = %scope.trace_id,
                forwarded_frames,
                "client disconnected; upstream stream abandoned"
            );
        }

        served.usage = Some(usage);
        scope.report(served);
    });

    Body::from_stream(RelayBodyStream { rx })
}
