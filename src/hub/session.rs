use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::frame::SessionKind;

/// Consumer half of a streaming session.
///
/// Frames arrive already serialized. Dropping the session cancels its
/// sampling loop.
pub struct StreamSession {
    id: u64,
    kind: SessionKind,
    rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl StreamSession {
    pub(crate) fn new(
        id: u64,
        kind: SessionKind,
        rx: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) -> Self {
        let guard = cancel.clone().drop_guard();
        Self {
            id,
            kind,
            rx,
            cancel,
            _guard: guard,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// Next frame, or `None` once the session has closed.
    pub async fn next_frame(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Stop the sampling loop. Frames already buffered stay readable.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn into_stream(self) -> SessionStream {
        SessionStream {
            frames: ReceiverStream::new(self.rx),
            _guard: self._guard,
        }
    }
}

/// [`Stream`] adapter over a session, as consumed by the SSE surface.
pub struct SessionStream {
    frames: ReceiverStream<String>,
    _guard: DropGuard,
}

impl Stream for SessionStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.frames.poll_next_unpin(cx)
    }
}
