//! Usage: Small pull helpers over `futures_core::Stream` (no futures-util in the tree).

use futures_core::Stream;
#[cfg(test)]
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

struct NextFuture<'a, S: Stream + Unpin>(&'a mut S);

impl<'a, S: Stream + Unpin> Future for NextFuture<'a, S> {
    type Output = Option<S::Item>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut *self.0).poll_next(cx)
    }
}

pub(crate) async fn next_item<S: Stream + Unpin>(stream: &mut S) -> Option<S::Item> {
    NextFuture(stream).await
}

/// Replays a queued item in front of the remaining stream.
pub(crate) struct PrefixedStream<T, S> {
    first: Option<T>,
    rest: S,
}

impl<T, S> PrefixedStream<T, S> {
    pub(crate) fn new(first: T, rest: S) -> Self {
        Self {
            first: Some(first),
            rest,
        }
    }
}

impl<T, S> Stream for PrefixedStream<T, S>
where
    T: Unpin,
    S: Stream<Item = T> + Unpin,
{
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(item) = this.first.take() {
            return Poll::Ready(Some(item));
        }
        Pin::new(&mut this.rest).poll_next(cx)
    }
}

/// Ready-made stream over a fixed list of items; used to script upstreams in tests.
#[cfg(test)]
pub(crate) struct IterStream<T> {
    items: VecDeque<T>,
}

#[cfg(test)]
impl<T> IterStream<T> {
    pub(crate) fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }
}

#[cfg(test)]
impl<T: Unpin> Stream for IterStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(self.get_mut().items.pop_front())
    }
}

#[cfg(test)]
mod tests;
