//! Replay provider for packet stream files and pipes

use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace};

use crate::provider::Provider;
use crate::reader::{PacketStreamReader, ReaderOptions};
use crate::{FrameHeader, FramePacket, Result, Source, StreamError};

const MIN_SPEED: f64 = 0.1;
const MAX_SPEED: f64 = 100.0;

/// Replay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayOptions {
    /// Playback speed multiplier; `None` replays as fast as possible
    pub speed: Option<f64>,
    /// Keep polling for new frames once the stream is exhausted
    pub follow: bool,
    /// Wait between polls when following
    pub poll_interval: Duration,
    /// Frames buffered between the reader task and the consumer
    pub channel_capacity: usize,
    /// Options for the underlying reader
    pub reader: ReaderOptions,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            speed: None,
            follow: false,
            poll_interval: Duration::from_millis(50),
            channel_capacity: 64,
            reader: ReaderOptions::default(),
        }
    }
}

/// Provider that replays one source of a packet stream
pub struct ReplayProvider {
    /// Stream reader; absent only while a read is in progress
    reader: Option<PacketStreamReader>,

    /// Source being replayed
    source: Arc<Source>,

    /// Clamped playback speed
    speed: Option<f64>,

    follow: bool,
    poll_interval: Duration,

    /// Wall-clock instant and stream time of the first replayed frame
    anchor: Option<(Instant, i64)>,

    frames_read: u64,
}

impl ReplayProvider {
    /// Open `path` and replay frames of `source`.
    pub fn open<P: AsRef<Path>>(path: P, source: usize, options: ReplayOptions) -> Result<Self> {
        let reader = PacketStreamReader::with_options(path, options.reader.clone())?;
        Self::new(reader, source, options)
    }

    /// Replay frames of `source` from an open reader.
    ///
    /// The source must already be declared by the stream.
    pub fn new(reader: PacketStreamReader, source: usize, options: ReplayOptions) -> Result<Self> {
        let declared = reader.source(source).cloned().ok_or_else(|| {
            StreamError::usage_error(format!(
                "invalid frame source id {} ({} sources declared)",
                source,
                reader.sources().len()
            ))
        })?;

        let speed = options.speed.filter(|s| !s.is_nan()).map(|s| s.clamp(MIN_SPEED, MAX_SPEED));
        let follow = options.follow || reader.is_pipe();
        info!(
            "Replaying source {} ({}) at {}{}",
            declared.id,
            declared.driver,
            speed.map_or("full speed".to_string(), |s| format!("{}x", s)),
            if follow { ", following" } else { "" }
        );

        Ok(Self {
            reader: Some(reader),
            source: Arc::new(declared),
            speed,
            follow,
            poll_interval: options.poll_interval,
            anchor: None,
            frames_read: 0,
        })
    }

    /// Effective playback speed after clamping
    pub fn speed(&self) -> Option<f64> {
        self.speed
    }

    /// Whether exhaustion is followed by polling instead of ending
    pub fn is_following(&self) -> bool {
        self.follow
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Read one frame and its payload on the blocking pool.
    async fn read_next(&mut self) -> Result<Option<(FrameHeader, Vec<u8>)>> {
        let mut reader = self
            .reader
            .take()
            .ok_or_else(|| StreamError::usage_error("replay reader was lost by an interrupted read"))?;
        let source = self.source.id;

        let (reader, result) = tokio::task::spawn_blocking(move || {
            let result = read_frame(&mut reader, source);
            (reader, result)
        })
        .await
        .map_err(|e| StreamError::io_error("replay read task", io::Error::other(e)))?;

        self.reader = Some(reader);
        result
    }

    /// Instant at which a frame stamped `time_us` is due.
    fn deadline(&mut self, time_us: i64) -> Option<Instant> {
        let speed = self.speed?;
        let (start, first_us) = *self.anchor.get_or_insert_with(|| (Instant::now(), time_us));
        let delta_us = time_us.saturating_sub(first_us);
        if delta_us <= 0 {
            return None;
        }
        Some(start + Duration::from_secs_f64(delta_us as f64 / 1_000_000.0 / speed))
    }
}

fn read_frame(reader: &mut PacketStreamReader, source: usize) -> Result<Option<(FrameHeader, Vec<u8>)>> {
    let Some(header) = reader.next_frame(source)? else {
        return Ok(None);
    };
    let data = reader.read_payload()?;
    Ok(Some((header, data)))
}

#[async_trait::async_trait]
impl Provider for ReplayProvider {
    async fn next_frame(&mut self) -> Result<Option<FramePacket>> {
        loop {
            match self.read_next().await? {
                Some((header, data)) => {
                    if let Some(due) = self.deadline(header.time_us) {
                        tokio::time::sleep_until(due).await;
                    }
                    self.frames_read += 1;
                    trace!("Replay frame {}: t={}us, {} bytes", header.sequence_num, header.time_us, data.len());
                    return Ok(Some(FramePacket::new(header, data, Arc::clone(&self.source))));
                }
                None if self.follow => {
                    trace!("No new frames; polling again in {:?}", self.poll_interval);
                    tokio::time::sleep(self.poll_interval).await;
                }
                None => {
                    debug!("Reached end of replay after {} frames", self.frames_read);
                    return Ok(None);
                }
            }
        }
    }

    fn source(&self) -> Arc<Source> {
        Arc::clone(&self.source)
    }
}
