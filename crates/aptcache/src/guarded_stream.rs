//! A [`Stream`] wrapper that keeps a guard value alive for as long as the
//! stream is being polled, releasing it only once the stream is exhausted
//! or dropped. Used to hold a cache [`ReadLockGuard`](aptcache_cache::lock::ReadLockGuard)
//! for the full duration of a streamed cache-hit response (spec.md §4.4
//! step 2f), instead of releasing it the moment the handler function
//! returns.

use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Wraps `inner`, carrying `guard` purely for its `Drop` impl.
pub struct GuardedStream<S, G> {
    inner: S,
    _guard: G,
}

impl<S, G> GuardedStream<S, G> {
    /// Pairs `inner` with `guard`, which is dropped when the stream is.
    pub fn new(inner: S, guard: G) -> Self {
        Self {
            inner,
            _guard: guard,
        }
    }
}

impl<S: Stream + Unpin, G> Stream for GuardedStream<S, G> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

impl<S: Unpin, G> Unpin for GuardedStream<S, G> {}
