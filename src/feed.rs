//! Async frame feed for one stream source

use futures::Stream;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

use crate::driver::Driver;
use crate::provider::Provider;
use crate::providers::replay::{ReplayOptions, ReplayProvider};
use crate::{FramePacket, Result, Source};

/// Frames of one source, delivered by a background task.
///
/// Dropping the feed (or the stream made from it) stops the task.
///
/// ```rust,no_run
/// use futures::StreamExt;
/// use packetstream::{FrameFeed, ReplayOptions};
///
/// #[tokio::main]
/// async fn main() -> packetstream::Result<()> {
///     let feed = FrameFeed::open("capture.pango", 0, ReplayOptions::default()).await?;
///     let mut frames = feed.into_stream();
///     while let Some(frame) = frames.next().await {
///         println!("{} bytes at {}us", frame.data.len(), frame.time_us());
///     }
///     Ok(())
/// }
/// ```
pub struct FrameFeed {
    frames: mpsc::Receiver<Arc<FramePacket>>,
    source: Arc<Source>,
    cancel: CancellationToken,
    guard: DropGuard,
}

impl FrameFeed {
    /// Open `path` and start feeding frames of `source`.
    ///
    /// Fails if the stream cannot be opened or does not declare `source`.
    pub async fn open<P: AsRef<Path>>(path: P, source: usize, options: ReplayOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        info!("Opening frame feed on {} (source {})", path.display(), source);

        let capacity = options.channel_capacity;
        let provider = tokio::task::spawn_blocking(move || ReplayProvider::open(&path, source, options))
            .await
            .map_err(|e| crate::StreamError::io_error("feed open task", std::io::Error::other(e)))??;

        Ok(Self::spawn(provider, capacity))
    }

    /// Start feeding frames from an existing provider.
    pub fn spawn<P: Provider>(provider: P, capacity: usize) -> Self {
        let source = provider.source();
        let channels = Driver::spawn(provider, capacity);
        let guard = channels.cancel.clone().drop_guard();
        Self { frames: channels.frames, source, cancel: channels.cancel, guard }
    }

    pub fn source(&self) -> &Arc<Source> {
        &self.source
    }

    /// Receive the next frame, `None` once the feed has ended.
    pub async fn next(&mut self) -> Option<Arc<FramePacket>> {
        self.frames.recv().await
    }

    /// Stop the background task. Frames already buffered can still be received.
    pub fn cancel(&self) {
        debug!("Cancelling frame feed for source {}", self.source.id);
        self.cancel.cancel();
    }

    /// Convert into a [`Stream`] of frames.
    pub fn into_stream(self) -> FeedStream {
        let FrameFeed { frames, guard, .. } = self;
        FeedStream { inner: ReceiverStream::new(frames), _guard: guard }
    }
}

/// Stream of frames from a [`FrameFeed`]; dropping it stops the task.
pub struct FeedStream {
    inner: ReceiverStream<Arc<FramePacket>>,
    _guard: DropGuard,
}

impl Stream for FeedStream {
    type Item = Arc<FramePacket>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
