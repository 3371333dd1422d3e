//! Response body that holds a backend lease until it is finished.

use crate::backend::LoadGuard;
use hyper::body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};

pin_project! {
    /// Wraps a body and releases the backend's load when the body ends,
    /// errors, or is dropped, whichever comes first.
    pub struct LeasedBody<B> {
        #[pin]
        inner: B,
        guard: Option<LoadGuard>,
    }
}

impl<B> LeasedBody<B> {
    pub fn new(inner: B, guard: LoadGuard) -> Self {
        Self {
            inner,
            guard: Some(guard),
        }
    }

    /// Whether the lease is still held.
    pub fn is_leased(&self) -> bool {
        self.guard.is_some()
    }
}

impl<B: Body> Body for LeasedBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let polled = this.inner.poll_frame(cx);
        if let Poll::Ready(None | Some(Err(_))) = &polled {
            this.guard.take();
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
