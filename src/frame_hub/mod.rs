//! FrameHub - Latest-frame distribution
//!
//! ## Responsibilities
//!
//! - Broadcast JPEG frames to MJPEG stream subscribers
//! - Hold the latest frame for the current-frame endpoint
//!
//! Lagging subscribers are dropped by the broadcast channel rather than
//! backpressuring the capture loop.

use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Broadcast capacity; a slow MJPEG client skips frames past this depth
const CHANNEL_CAPACITY: usize = 16;

/// JPEG frame bytes shared between subscribers
pub type JpegFrame = Arc<Vec<u8>>;

#[derive(Clone)]
pub struct FrameHub {
    tx: broadcast::Sender<JpegFrame>,
    latest: Arc<RwLock<Option<JpegFrame>>>,
}

impl FrameHub {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            latest: Arc::new(RwLock::new(None)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JpegFrame> {
        self.tx.subscribe()
    }

    pub async fn publish(&self, frame: Vec<u8>) {
        let frame = Arc::new(frame);
        *self.latest.write().await = Some(frame.clone());
        // no subscribers is not an error
        let _ = self.tx.send(frame);
    }

    pub async fn latest(&self) -> Option<JpegFrame> {
        self.latest.read().await.clone()
    }

    /// Drop the retained frame when a capture session ends
    pub async fn clear(&self) {
        *self.latest.write().await = None;
    }
}

impl Default for FrameHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_updates_latest() {
        let hub = FrameHub::new();
        assert!(hub.latest().await.is_none());

        hub.publish(vec![1, 2, 3]).await;
        assert_eq!(*hub.latest().await.unwrap(), vec![1, 2, 3]);

        hub.clear().await;
        assert!(hub.latest().await.is_none());
    }

    #[tokio::test]
    async fn test_subscriber_receives_frames() {
        let hub = FrameHub::new();
        let mut rx = hub.subscribe();

        hub.publish(vec![9]).await;
        let frame = rx.recv().await.unwrap();
        assert_eq!(*frame, vec![9]);
    }
}
