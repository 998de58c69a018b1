pub mod bus;
pub mod codec;

use tokio::sync::watch;
use uuid::Uuid;

use crate::error::PublishError;
use crate::frame::{
    now_millis, Frame, KEY_CHANNEL, KEY_ENCODING_LEVEL, KEY_ENCODING_TYPE, KEY_HEIGHT, KEY_IMG_HANDLE,
    KEY_RESOLUTION, KEY_TS_VI_ENCODE_END, KEY_TS_VI_ENCODE_START, KEY_TS_VI_EXIT, KEY_TS_VI_QUEUE_WAIT, KEY_WIDTH,
};
use crate::queue::FrameReceiver;

use bus::BusPublisher;

/// The outcome of a single per-record publish attempt. `Dropped` covers
/// resize/serialization failures local to this record — logged, the record
/// is skipped, and the loop continues. `Fatal` means the bus publisher's own
/// channel is unusable; the whole `Publisher` must exit so the error reaches
/// the Supervisor, per spec's "if the bus publisher's own channel is
/// unusable, the Publisher exits and the process terminates."
enum PublishOutcome {
    Dropped(String),
    Fatal(PublishError),
}

/// Drives the single-topic publish loop: dequeue, stamp, resize/encode,
/// finalize metadata, hand off to the bus. Frame order from the queue is
/// preserved exactly — no reordering or batching.
pub struct Publisher {
    topic: String,
    input: FrameReceiver,
    bus: Box<dyn BusPublisher>,
    stop_rx: watch::Receiver<bool>,
    profiling: bool,
}

impl Publisher {
    pub fn new(
        topic: String,
        input: FrameReceiver,
        bus: Box<dyn BusPublisher>,
        stop_rx: watch::Receiver<bool>,
        profiling: bool,
    ) -> Self {
        Self {
            topic,
            input,
            bus,
            stop_rx,
            profiling,
        }
    }

    /// Runs the publish loop until stopped, the input queue closes, or the
    /// bus channel itself becomes unusable. The latter propagates as
    /// `Err(PublishError)`, analogous to `Ingestor::run()` returning
    /// `Err(SourceError::Fatal(..))` — both are structural failures the
    /// Supervisor must react to, not per-frame errors to shrug off.
    pub async fn run(mut self) -> Result<(), PublishError> {
        loop {
            let mut frame = tokio::select! {
                biased;
                _ = self.stop_rx.changed() => {
                    if *self.stop_rx.borrow() {
                        let _ = self.bus.close().await;
                        return Ok(());
                    }
                    continue;
                }
                frame = self.input.recv() => match frame {
                    Some(frame) => frame,
                    None => {
                        let _ = self.bus.close().await;
                        return Ok(());
                    }
                },
            };

            if self.profiling {
                let entry = frame.metadata.get_i64(crate::frame::KEY_TS_VI_ENTRY);
                let wait = entry.map(|t| now_millis() - t).unwrap_or(0);
                frame.metadata.stamp(KEY_TS_VI_QUEUE_WAIT, wait);
            }

            match self.process_and_publish(&mut frame).await {
                Ok(()) => {}
                Err(PublishOutcome::Dropped(reason)) => {
                    log::error!("publisher dropped a frame due to error: {}", reason);
                }
                Err(PublishOutcome::Fatal(e)) => {
                    log::error!("bus publisher channel is unusable, stopping publisher: {}", e);
                    let _ = self.bus.close().await;
                    return Err(e);
                }
            }
        }
    }

    async fn process_and_publish(&mut self, frame: &mut Frame) -> Result<(), PublishOutcome> {
        let encoding_type = frame
            .metadata
            .get_str(KEY_ENCODING_TYPE)
            .map(|s| s.to_string());
        let encoding_level = frame.metadata.get_i64(KEY_ENCODING_LEVEL);

        if let Some((target_w, target_h)) = frame.metadata.get_str(KEY_RESOLUTION).and_then(parse_resolution) {
            let resized = codec::resize(&frame.buffer, target_h, target_w)
                .map_err(|e| PublishOutcome::Dropped(e.to_string()))?;
            frame.buffer = resized;
        }

        let (height, width, channel) = match frame.buffer.shape {
            Some((h, w, c)) => {
                // A two-dimensional buffer (no channel axis at all) is
                // treated as channel = 3; preserved from the original even
                // though it is semantically dubious for e.g. grayscale
                // sources.
                (h, w, c)
            }
            None => (0, 0, 3),
        };

        if self.profiling {
            frame.metadata.stamp(KEY_TS_VI_ENCODE_START, now_millis());
        }

        if let (Some(kind), Some(level)) = (encoding_type.as_deref(), encoding_level) {
            let buffer = std::mem::replace(&mut frame.buffer, crate::frame::FrameBuffer::encoded(Vec::new()));
            frame.buffer = codec::encode(buffer, kind, level);
        }

        if self.profiling {
            frame.metadata.stamp(KEY_TS_VI_ENCODE_END, now_millis());
        }

        frame.metadata.set(KEY_HEIGHT, height);
        frame.metadata.set(KEY_WIDTH, width);
        frame.metadata.set(KEY_CHANNEL, channel);

        let handle = Uuid::now_v1(&[0u8; 6]).simple().to_string();
        frame.metadata.set(KEY_IMG_HANDLE, handle[..8].to_string());

        if self.profiling {
            frame.metadata.stamp(KEY_TS_VI_EXIT, now_millis());
        }

        let metadata_json = frame
            .metadata
            .to_json()
            .map_err(|e| PublishOutcome::Dropped(e.to_string()))?
            .to_string()
            .into_bytes();

        self.bus
            .publish(&self.topic, &metadata_json, &frame.buffer.data)
            .await
            .map_err(PublishOutcome::Fatal)
    }
}

/// "WxH": width first, height second, matching the original's
/// `width, height = resolution.split("x")`.
fn parse_resolution(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.split_once('x')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::bus::test_double::RecordingBusPublisher;
    use super::*;
    use crate::frame::{FrameBuffer, Metadata};
    use crate::queue::bounded;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn publishes_frames_in_order() {
        let (tx, rx) = bounded(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (record_tx, mut record_rx) = mpsc::unbounded_channel();
        let bus = Box::new(RecordingBusPublisher { sender: record_tx });

        let publisher = Publisher::new("cam1".to_string(), rx, bus, stop_rx, false);
        let handle = tokio::spawn(publisher.run());

        for i in 0..3u8 {
            let mut metadata = Metadata::new();
            metadata.set("seq", i as i64);
            let buffer = FrameBuffer::raw(vec![i; 3], 1, 1, 3);
            tx.send(Frame::new(metadata, buffer)).await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            let (_, meta_json, _) = record_rx.recv().await.unwrap();
            let value: serde_json::Value = serde_json::from_slice(&meta_json).unwrap();
            seen.push(value["seq"].as_i64().unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2]);

        stop_tx.send(true).unwrap();
        drop(tx);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn profiling_timestamps_absent_when_disabled() {
        let (tx, rx) = bounded(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (record_tx, mut record_rx) = mpsc::unbounded_channel();
        let bus = Box::new(RecordingBusPublisher { sender: record_tx });

        let publisher = Publisher::new("cam1".to_string(), rx, bus, stop_rx, false);
        let handle = tokio::spawn(publisher.run());

        let buffer = FrameBuffer::raw(vec![0u8; 3], 1, 1, 3);
        tx.send(Frame::new(Metadata::new(), buffer)).await.unwrap();

        let (_, meta_json, _) = record_rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&meta_json).unwrap();
        assert!(value.get(KEY_TS_VI_QUEUE_WAIT).is_none());
        assert!(value.get(crate::frame::KEY_TS_VI_ENCODE_START).is_none());
        assert!(value.get(crate::frame::KEY_TS_VI_EXIT).is_none());
        assert_eq!(value[KEY_HEIGHT], 1);
        assert_eq!(value[KEY_WIDTH], 1);
        assert_eq!(value[KEY_CHANNEL], 3);
        assert_eq!(value[KEY_IMG_HANDLE].as_str().unwrap().len(), 8);

        stop_tx.send(true).unwrap();
        drop(tx);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn profiling_timestamps_present_when_enabled() {
        let (tx, rx) = bounded(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (record_tx, mut record_rx) = mpsc::unbounded_channel();
        let bus = Box::new(RecordingBusPublisher { sender: record_tx });

        let publisher = Publisher::new("cam1".to_string(), rx, bus, stop_rx, true);
        let handle = tokio::spawn(publisher.run());

        let mut metadata = Metadata::new();
        metadata.stamp(crate::frame::KEY_TS_VI_ENTRY, now_millis());
        let buffer = FrameBuffer::raw(vec![0u8; 3], 1, 1, 3);
        tx.send(Frame::new(metadata, buffer)).await.unwrap();

        let (_, meta_json, _) = record_rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&meta_json).unwrap();
        assert!(value.get(KEY_TS_VI_QUEUE_WAIT).is_some());
        assert!(value.get(crate::frame::KEY_TS_VI_ENCODE_START).is_some());
        assert!(value.get(crate::frame::KEY_TS_VI_EXIT).is_some());

        stop_tx.send(true).unwrap();
        drop(tx);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn resize_resolves_width_before_height() {
        let (tx, rx) = bounded(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (record_tx, mut record_rx) = mpsc::unbounded_channel();
        let bus = Box::new(RecordingBusPublisher { sender: record_tx });

        let publisher = Publisher::new("cam1".to_string(), rx, bus, stop_rx, false);
        let handle = tokio::spawn(publisher.run());

        let mut metadata = Metadata::new();
        metadata.set(KEY_RESOLUTION, "4x2");
        let buffer = FrameBuffer::raw(vec![0u8; 8 * 8 * 3], 8, 8, 3);
        tx.send(Frame::new(metadata, buffer)).await.unwrap();

        let (_, meta_json, payload) = record_rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&meta_json).unwrap();
        assert_eq!(value[KEY_WIDTH], 4);
        assert_eq!(value[KEY_HEIGHT], 2);
        assert_eq!(payload.len(), 4 * 2 * 3);

        stop_tx.send(true).unwrap();
        drop(tx);
        let _ = handle.await;
    }
}
