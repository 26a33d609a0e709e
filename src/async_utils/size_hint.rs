//! Size hints for streams whose length we learned ahead of time.
//!
//! We count the document list before processing it, and attach the count to
//! the record stream so the progress bar knows how long it is.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures::Stream;

/// Decrement a size hint, saturating at zero.
pub fn decrement_size_hint(size_hint: (usize, Option<usize>)) -> (usize, Option<usize>) {
    let (lower, upper) = size_hint;
    (lower.saturating_sub(1), upper.map(|x| x.saturating_sub(1)))
}

/// A [`Stream`] with an externally supplied size hint, which counts down as
/// items are consumed.
pub struct SizeHintStream<S> {
    /// The stream to wrap.
    stream: S,

    /// Items we still expect to see.
    size_hint: (usize, Option<usize>),
}

impl<S> SizeHintStream<S> {
    /// Create a new [`SizeHintStream`] from a stream and a size hint.
    pub fn new(stream: S, size_hint: (usize, Option<usize>)) -> Self {
        Self { stream, size_hint }
    }
}

impl<S> Stream for SizeHintStream<S>
where
    S: Stream + Send + Unpin + 'static,
    S::Item: Send + Unpin + 'static,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.stream).poll_next(cx);
        if let Poll::Ready(Some(_)) = &polled {
            this.size_hint = decrement_size_hint(this.size_hint);
        }
        polled
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.size_hint
    }
}

/// Extension method adding `with_size_hint` to every [`Stream`].
pub trait WithSizeHintExt: Stream {
    /// Wrap the stream in a [`SizeHintStream`] with the given size hint.
    fn with_size_hint(self, size_hint: (usize, Option<usize>)) -> SizeHintStream<Self>
    where
        Self: Sized,
    {
        SizeHintStream::new(self, size_hint)
    }
}

impl<S> WithSizeHintExt for S where S: Stream {}
