//! Timeouts for one upstream exchange.
//!
//! A stalled peer must not pin a proxy task forever. [`IdleTimeoutBody`]
//! fails the stream once the inner body has produced nothing for
//! `idle_timeout` while being polled; time spent while nobody polls (the
//! caller is slow to read) does not count.
//!
//! The wait for response headers is bounded by [`await_response`], whose
//! timer restarts every time the request body hands a frame to the target,
//! so a large upload that keeps moving is never cut off.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use tokio::sync::watch;
use tokio::time::{sleep, Instant, Sleep};

use crate::error::{ProxyError, TimeoutPhase};
use crate::proxy_body::BoxError;

/// Timeouts applied to one upstream exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Limit for connecting, and for waiting on response headers after the
    /// last upload progress
    pub connect_timeout: Duration,
    /// Limit for the gap between two body frames
    pub idle_timeout: Duration,
}

impl TimeoutConfig {
    pub fn new(connect_timeout: Duration, idle_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            idle_timeout,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(30))
    }
}

/// Body wrapper that errors with [`ProxyError::Timeout`] when the inner body
/// stays idle for too long.
pub struct IdleTimeoutBody<B> {
    inner: B,
    idle_timeout: Duration,
    deadline: Pin<Box<Sleep>>,
    waiting: bool,
}

impl<B> IdleTimeoutBody<B> {
    pub fn new(inner: B, idle_timeout: Duration) -> Self {
        Self {
            inner,
            idle_timeout,
            deadline: Box::pin(sleep(idle_timeout)),
            waiting: false,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

impl<B> Body for IdleTimeoutBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;

        // Arm the timer when a new wait starts, not on every wakeup.
        if !this.waiting {
            this.waiting = true;
            let deadline = Instant::now() + this.idle_timeout;
            this.deadline.as_mut().reset(deadline);
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(result) => {
                this.waiting = false;
                Poll::Ready(result.map(|r| r.map_err(Into::into)))
            }
            Poll::Pending => {
                if this.deadline.as_mut().poll(cx).is_ready() {
                    let err = ProxyError::Timeout {
                        phase: TimeoutPhase::Streaming,
                        after: this.idle_timeout,
                    };
                    Poll::Ready(Some(Err(err.into())))
                } else {
                    Poll::Pending
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Request body wrapper that signals every frame it yields, and its end.
pub struct ProgressBody<B> {
    inner: B,
    progress: watch::Sender<()>,
}

/// Receiving side of a [`ProgressBody`]. Closed once the body is dropped.
pub type UploadProgress = watch::Receiver<()>;

impl<B> ProgressBody<B> {
    pub fn new(inner: B) -> (Self, UploadProgress) {
        let (progress, rx) = watch::channel(());
        (Self { inner, progress }, rx)
    }
}

impl<B> Body for ProgressBody<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        if matches!(polled, Poll::Ready(None) | Poll::Ready(Some(Ok(_)))) {
            this.progress.send_replace(());
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

/// Wait for `response`, failing with a `Connecting` timeout once `limit`
/// passes without either the response or any upload progress.
pub async fn await_response<F>(
    response: F,
    mut progress: UploadProgress,
    limit: Duration,
) -> Result<F::Output, ProxyError>
where
    F: Future,
{
    tokio::pin!(response);
    let deadline = sleep(limit);
    tokio::pin!(deadline);
    let mut uploading = true;

    loop {
        tokio::select! {
            biased;
            output = &mut response => return Ok(output),
            changed = progress.changed(), if uploading => match changed {
                Ok(()) => deadline.as_mut().reset(Instant::now() + limit),
                Err(_) => uploading = false,
            },
            () = &mut deadline => {
                return Err(ProxyError::Timeout {
                    phase: TimeoutPhase::Connecting,
                    after: limit,
                });
            }
        }
    }
}
