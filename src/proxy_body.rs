//! Body types used on both legs of the proxy.
//!
//! Response bodies are relayed frame by frame: a frame is pulled from the
//! target only when the caller's connection asks for the next one, so memory
//! per request stays bounded by hyper's buffers regardless of payload size.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use tracing::{debug, info, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type carried by [`crate::proxy_service::ProxyRequest`] and every
/// response the engine produces.
pub type ProxyBody = BoxBody<Bytes, BoxError>;

pub fn full(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Box any compatible body into a [`ProxyBody`].
pub fn boxed<B>(body: B) -> ProxyBody
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed()
}

/// How a relayed response body ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Every frame reached the caller.
    Completed,
    /// The caller went away before the end; the upstream connection is
    /// dropped with the body. Not an error.
    ClientDisconnected,
    /// The target failed or stalled mid-stream.
    UpstreamFailed,
}

impl fmt::Display for StreamOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamOutcome::Completed => f.write_str("completed"),
            StreamOutcome::ClientDisconnected => f.write_str("client_disconnected"),
            StreamOutcome::UpstreamFailed => f.write_str("upstream_failed"),
        }
    }
}

/// Response body wrapper that counts relayed bytes and reports how the
/// stream ended.
pub struct RelayBody<B> {
    inner: B,
    target: String,
    relayed: u64,
    outcome: Option<StreamOutcome>,
}

impl<B: Body> RelayBody<B> {
    pub fn new(inner: B, target: impl Into<String>) -> Self {
        // hyper never polls a body that is already at its end.
        let outcome = inner.is_end_stream().then_some(StreamOutcome::Completed);
        Self {
            inner,
            target: target.into(),
            relayed: 0,
            outcome,
        }
    }
}

impl<B> RelayBody<B> {
    /// Bytes handed to the caller so far.
    pub fn relayed(&self) -> u64 {
        self.relayed
    }

    fn finish(&mut self, outcome: StreamOutcome) {
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
        }
    }
}

impl<B> Body for RelayBody<B>
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
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.relayed += data.len() as u64;
                }
                // hyper stops polling once the body reports its end.
                if this.inner.is_end_stream() {
                    this.finish(StreamOutcome::Completed);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(err))) => {
                let err: BoxError = err.into();
                warn!(
                    target_url = %this.target,
                    bytes = this.relayed,
                    error = %err,
                    "Upstream body failed mid-stream"
                );
                this.finish(StreamOutcome::UpstreamFailed);
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.finish(StreamOutcome::Completed);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for RelayBody<B> {
    fn drop(&mut self) {
        match self.outcome {
            Some(StreamOutcome::Completed) => {
                debug!(
                    target_url = %self.target,
                    bytes = self.relayed,
                    outcome = %StreamOutcome::Completed,
                    "Response relayed"
                );
            }
            Some(StreamOutcome::UpstreamFailed) => {}
            Some(StreamOutcome::ClientDisconnected) | None => {
                info!(
                    target_url = %self.target,
                    bytes = self.relayed,
                    outcome = %StreamOutcome::ClientDisconnected,
                    "Client disconnected mid-stream, closing upstream connection"
                );
            }
        }
    }
}
