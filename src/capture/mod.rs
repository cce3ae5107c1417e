//! Capture sources - frame acquisition
//!
//! ## Responsibilities
//!
//! - One frame roughly once per poll interval, from either source
//! - RTSP: persistent ffmpeg stream reader, depth-1 buffering
//! - HA polling: periodic snapshot fetch with content-hash dedup
//!
//! Both variants keep an internal consecutive-failure counter: transient
//! errors surface as `Error::Capture` (the orchestrator retries and shows
//! `Reconnecting`), exhaustion surfaces as `Error::SourceUnavailable`
//! (the orchestrator stops the session).

mod ha_poll;
mod rtsp;

pub use ha_poll::HaPollSource;
pub use rtsp::RtspSource;

use crate::config_store::{CaptureMode, CaptureSettings};
use crate::error::Result;
use chrono::{DateTime, Utc};

/// Consecutive read failures tolerated before the source is declared gone
pub(crate) const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// A decoded capture: JPEG bytes plus the capture timestamp.
/// Consumed and discarded each cycle, never persisted.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            captured_at: Utc::now(),
        }
    }
}

/// Result of one read cycle
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(Frame),
    /// HA polling: snapshot identical to the previous one, skipped
    Unchanged,
}

/// Capture source, one variant per acquisition strategy.
/// Exactly one instance exists per capture session.
pub enum CaptureSource {
    Rtsp(RtspSource),
    HaPoll(HaPollSource),
}

impl CaptureSource {
    /// Construct the source for the configured mode
    pub fn open(settings: &CaptureSettings) -> Result<Self> {
        settings.validate()?;
        match settings.mode {
            CaptureMode::Rtsp => Ok(Self::Rtsp(RtspSource::open(settings)?)),
            CaptureMode::HaPolling => Ok(Self::HaPoll(HaPollSource::new(settings)?)),
        }
    }

    /// Read one frame, blocking up to roughly one poll interval
    pub async fn read_frame(&mut self) -> Result<ReadOutcome> {
        match self {
            Self::Rtsp(source) => source.read_frame().await,
            Self::HaPoll(source) => source.read_frame().await,
        }
    }

    /// Human-readable source descriptor, credentials redacted
    pub fn descriptor(&self) -> String {
        match self {
            Self::Rtsp(source) => source.descriptor(),
            Self::HaPoll(source) => source.descriptor(),
        }
    }

    /// Release the source handle
    pub async fn close(&mut self) {
        if let Self::Rtsp(source) = self {
            source.close().await;
        }
    }
}
