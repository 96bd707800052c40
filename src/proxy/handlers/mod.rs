pub mod admin;
pub mod claude;
pub mod errors;
pub mod gemini;
pub mod openai;

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;

use crate::proxy::orchestrator::InFlightGuard;

/// Keeps the account's in-flight guard alive for as long as the client is
/// reading the response body. Dropping the body (client disconnect) drops
/// the guard and releases the slot.
pub struct GuardedStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>,
    _guard: InFlightGuard,
}

impl GuardedStream {
    pub fn new(
        inner: Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>,
        guard: InFlightGuard,
    ) -> Self {
        Self {
            inner,
            _guard: guard,
        }
    }
}

impl Stream for GuardedStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
