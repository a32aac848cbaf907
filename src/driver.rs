//! Driver spawns and manages the frame reader task

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::FramePacket;
use crate::provider::Provider;

const MAX_ERRORS: u32 = 10;

/// Result of spawning the driver task
pub struct FeedChannels {
    /// Receiver for frames, closed when the task ends
    pub frames: mpsc::Receiver<Arc<FramePacket>>,
    /// Cancellation token for graceful shutdown
    pub cancel: CancellationToken,
}

/// Driver spawns and manages the frame reader task
///
/// The task owns the provider and forwards its frames into a bounded channel,
/// so a slow consumer applies backpressure to the reader.
pub struct Driver;

impl Driver {
    /// Spawn the reader task for the given provider
    ///
    /// Returns the frame receiver plus a cancellation token for graceful
    /// shutdown. A capacity of zero is treated as one.
    pub fn spawn<P>(provider: P, capacity: usize) -> FeedChannels
    where
        P: Provider,
    {
        let (frame_tx, frame_rx) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        let cancel_task = cancel.clone();

        tokio::spawn(async move {
            Self::frame_reader_task(provider, frame_tx, cancel_task).await;
        });

        FeedChannels { frames: frame_rx, cancel }
    }

    /// Frame reader task - pulls frames until the provider ends, fails or is cancelled
    async fn frame_reader_task<P>(
        mut provider: P,
        frame_tx: mpsc::Sender<Arc<FramePacket>>,
        cancel: CancellationToken,
    ) where
        P: Provider,
    {
        let source = provider.source();
        info!("Frame reader task started for source {} ({})", source.id, source.driver);
        let mut frame_count = 0u64;
        let mut error_count = 0u32;

        loop {
            if cancel.is_cancelled() {
                info!("Frame reader cancelled");
                break;
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Frame reader cancelled during read");
                    break;
                }
                result = provider.next_frame() => result,
            };

            match result {
                Ok(Some(packet)) => {
                    frame_count += 1;
                    error_count = 0;
                    trace!("Frame {}: seq={}, t={}us", frame_count, packet.sequence_num(), packet.time_us());

                    let sent = tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("Frame reader cancelled while waiting for the consumer");
                            break;
                        }
                        sent = frame_tx.send(Arc::new(packet)) => sent,
                    };
                    if sent.is_err() {
                        debug!("Frame receiver dropped, shutting down");
                        break;
                    }
                }
                Ok(None) => {
                    info!("Provider stream ended after {} frames", frame_count);
                    break;
                }
                Err(e) if !e.is_retryable() => {
                    error!("Provider failed permanently: {}", e);
                    for hint in e.recovery_suggestions() {
                        debug!("  suggestion: {}", hint);
                    }
                    break;
                }
                Err(e) => {
                    error_count += 1;
                    error!("Provider error ({}/{}): {}", error_count, MAX_ERRORS, e);

                    if error_count >= MAX_ERRORS {
                        error!("Too many provider errors, shutting down");
                        break;
                    }

                    // Exponential backoff: 100ms, 200ms, 400ms, ... capped at 3.2s
                    let backoff = std::time::Duration::from_millis(50 * (1 << error_count.min(6)));
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        info!("Frame reader task ended (processed {} frames)", frame_count);
    }
}
