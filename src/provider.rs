//! Provider trait for frame sources

use std::sync::Arc;

use crate::{FramePacket, Result, Source};

/// Trait for asynchronous frame sources
///
/// A provider yields the frames of one stream source, handling its own
/// pacing and waiting internally. The driver owns the provider and polls it
/// from a single task.
#[async_trait::async_trait]
pub trait Provider: Send + 'static {
    /// Get the next frame
    ///
    /// Returns:
    /// - `Ok(Some(packet))` - New frame available
    /// - `Ok(None)` - Stream ended (normal termination)
    /// - `Err(e)` - Error occurred
    async fn next_frame(&mut self) -> Result<Option<FramePacket>>;

    /// The source whose frames this provider yields
    fn source(&self) -> Arc<Source>;
}
