//! Response body tee.
//!
//! [`CaptureBody`] wraps the host's response body and forwards every frame
//! unchanged while copying data frames into a bounded buffer. The client sees
//! the exact byte stream the handler produced; the capture is a side effect of
//! the client reading it. A completion callback fires exactly once, at end of
//! stream, on stream error, or when the body is dropped mid-stream (client
//! disconnect), so a record is finalized on every exit path.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use http_body::{Body, Frame, SizeHint};

/// What the tee saw once the body finished.
pub struct CapturedBody {
    /// Captured bytes, at most the configured cap.
    pub body: Bytes,
    /// Total bytes forwarded to the client, counted past the cap.
    pub bytes_forwarded: u64,
    pub truncated: bool,
}

type CompleteFn = Box<dyn FnOnce(CapturedBody) + Send + 'static>;

pub struct CaptureBody<B> {
    inner: B,
    buffer: BytesMut,
    limit: usize,
    forwarded: u64,
    truncated: bool,
    on_complete: Option<CompleteFn>,
}

impl<B> CaptureBody<B> {
    pub fn new(
        inner: B,
        limit: usize,
        on_complete: impl FnOnce(CapturedBody) + Send + 'static,
    ) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
            limit,
            forwarded: 0,
            truncated: false,
            on_complete: Some(Box::new(on_complete)),
        }
    }

    fn observe(&mut self, data: &Bytes) {
        self.forwarded += data.len() as u64;
        let room = self.limit.saturating_sub(self.buffer.len());
        if data.len() > room {
            self.truncated = true;
        }
        self.buffer.extend_from_slice(&data[..room.min(data.len())]);
    }

    fn complete(&mut self) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(CapturedBody {
                body: std::mem::take(&mut self.buffer).freeze(),
                bytes_forwarded: self.forwarded,
                truncated: self.truncated,
            });
        }
    }
}

impl<B> Body for CaptureBody<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.observe(data);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.complete();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.complete();
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

impl<B> Drop for CaptureBody<B> {
    fn drop(&mut self) {
        // Client went away before the stream ended; finalize with what we saw.
        self.complete();
    }
}

/// Render captured bytes as snapshot text, cut at `limit`.
pub(crate) fn snapshot_text(bytes: &[u8], limit: usize) -> (String, bool) {
    let cut = limit.min(bytes.len());
    (
        String::from_utf8_lossy(&bytes[..cut]).into_owned(),
        cut < bytes.len(),
    )
}
