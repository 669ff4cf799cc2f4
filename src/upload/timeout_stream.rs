use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use futures::Stream;
use pin_project_lite::pin_project;
use tokio::time::{sleep, Sleep};
use super::errors::{Result, UploadError};

pin_project! {
    /// Fails the stream when its first item does not arrive in time.
    ///
    /// Later items are not timed, a long transfer only has to start reporting.
    pub struct FirstTimeout<S> {
        #[pin]
        inner: S,
        #[pin]
        deadline: Option<Sleep>,
        limit: Duration,
        done: bool,
    }
}

impl<S> FirstTimeout<S> {
    pub fn new(inner: S, limit: Option<Duration>) -> Self {
        Self {
            inner,
            deadline: limit.map(sleep),
            limit: limit.unwrap_or_default(),
            done: false,
        }
    }
}

impl<S, T> Stream for FirstTimeout<S>
where
    S: Stream<Item = Result<T>>,
{
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if *this.done {
            return Poll::Ready(None);
        }

        if let Poll::Ready(item) = this.inner.poll_next(cx) {
            this.deadline.set(None);
            if item.is_none() {
                *this.done = true;
            }
            return Poll::Ready(item);
        }

        if let Some(deadline) = this.deadline.as_mut().as_pin_mut() {
            if deadline.poll(cx).is_ready() {
                this.deadline.set(None);
                *this.done = true;
                return Poll::Ready(Some(Err(UploadError::Timeout(*this.limit))));
            }
        }

        Poll::Pending
    }
}
