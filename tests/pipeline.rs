//! End-to-end tests driving the real Supervisor/Ingestor/Filter/Publisher
//! wiring against a scripted `SyntheticSource` and an in-memory bus double.
//! Covers the seed scenarios: plain pass-through, JPEG encoding, loop mode,
//! transient-failure recovery, fatal source failure, and PCB gating.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use video_ingestion::config::{EncodingDescriptor, FilterConfig, IngestorConfig, PipelineConfig};
use video_ingestion::error::PublishError;
use video_ingestion::frame::FrameBuffer;
use video_ingestion::ingestor::{Ingestor, Source, Step, SyntheticSource};
use video_ingestion::publisher::bus::{BusFactory, BusPublisher};
use video_ingestion::queue::bounded;
use video_ingestion::supervisor::{Supervisor, SourceFactory};

type Recorded = (String, Vec<u8>, Vec<u8>);

struct RecordingBusPublisher {
    sender: mpsc::UnboundedSender<Recorded>,
}

#[async_trait::async_trait]
impl BusPublisher for RecordingBusPublisher {
    async fn publish(&mut self, topic: &str, metadata_json: &[u8], payload: &[u8]) -> Result<(), PublishError> {
        self.sender
            .send((topic.to_string(), metadata_json.to_vec(), payload.to_vec()))
            .map_err(|e| PublishError::Send(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), PublishError> {
        Ok(())
    }
}

struct RecordingBusFactory {
    sender: mpsc::UnboundedSender<Recorded>,
}

#[async_trait::async_trait]
impl BusFactory for RecordingBusFactory {
    async fn build(&self, _address: &str) -> Result<Box<dyn BusPublisher>, PublishError> {
        Ok(Box::new(RecordingBusPublisher {
            sender: self.sender.clone(),
        }))
    }
}

fn synthetic_source_factory(steps: Vec<Step>) -> SourceFactory {
    Arc::new(move |_path: &str| -> Box<dyn Source> { Box::new(SyntheticSource::new(steps.clone())) })
}

fn base_ingestor_config() -> IngestorConfig {
    IngestorConfig {
        video_src: "synthetic".to_string(),
        poll_interval: None,
        loop_video: Some("false".to_string()),
        encoding: None,
        resolution: None,
    }
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Recorded>) -> Recorded {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a published frame")
        .expect("bus channel closed unexpectedly")
}

async fn assert_no_more(rx: &mut mpsc::UnboundedReceiver<Recorded>) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "unexpected extra publish");
}

#[tokio::test]
async fn pass_through_forwards_a_single_frame_unchanged() {
    let (record_tx, mut record_rx) = mpsc::unbounded_channel();
    let source_factory = synthetic_source_factory(vec![Step::Frame(FrameBuffer::raw(vec![1, 2, 3], 1, 1, 3))]);
    let supervisor = Supervisor::with_bus_factory(
        "unused".to_string(),
        source_factory,
        Arc::new(RecordingBusFactory { sender: record_tx }),
        false,
    );

    let config = PipelineConfig {
        ingestor: base_ingestor_config(),
        filter: None,
    };
    supervisor.start(config).await.unwrap();

    let (topic, metadata_json, payload) = recv(&mut record_rx).await;
    assert_eq!(topic, "frames");
    assert_eq!(payload, vec![1, 2, 3]);

    let value: serde_json::Value = serde_json::from_slice(&metadata_json).unwrap();
    assert_eq!(value["height"], 1);
    assert_eq!(value["width"], 1);
    assert_eq!(value["channel"], 3);
    assert_eq!(value["img_handle"].as_str().unwrap().len(), 8);

    supervisor.stop().await;
}

#[tokio::test]
async fn jpeg_encoding_compresses_the_published_payload() {
    let (record_tx, mut record_rx) = mpsc::unbounded_channel();
    let raw = vec![128u8; 8 * 8 * 3];
    let source_factory = synthetic_source_factory(vec![Step::Frame(FrameBuffer::raw(raw.clone(), 8, 8, 3))]);
    let supervisor = Supervisor::with_bus_factory(
        "unused".to_string(),
        source_factory,
        Arc::new(RecordingBusFactory { sender: record_tx }),
        false,
    );

    let mut ingestor_config = base_ingestor_config();
    ingestor_config.encoding = Some(EncodingDescriptor {
        kind: "jpg".to_string(),
        level: 90,
    });
    let config = PipelineConfig {
        ingestor: ingestor_config,
        filter: None,
    };
    supervisor.start(config).await.unwrap();

    let (_topic, metadata_json, payload) = recv(&mut record_rx).await;
    let value: serde_json::Value = serde_json::from_slice(&metadata_json).unwrap();
    assert_eq!(value["encoding_type"], "jpg");
    assert_ne!(payload, raw, "jpeg-encoded payload should differ from the raw buffer");
    assert!(!payload.is_empty());

    supervisor.stop().await;
}

#[tokio::test]
async fn loop_video_replays_the_source_from_the_start() {
    let (record_tx, mut record_rx) = mpsc::unbounded_channel();
    let buf_a = FrameBuffer::raw(vec![7, 7, 7], 1, 1, 3);
    let buf_b = FrameBuffer::raw(vec![8, 8, 8], 1, 1, 3);
    let source_factory = synthetic_source_factory(vec![Step::Frame(buf_a), Step::Frame(buf_b)]);
    let supervisor = Supervisor::with_bus_factory(
        "unused".to_string(),
        source_factory,
        Arc::new(RecordingBusFactory { sender: record_tx }),
        false,
    );

    let mut ingestor_config = base_ingestor_config();
    ingestor_config.loop_video = Some("true".to_string());
    let config = PipelineConfig {
        ingestor: ingestor_config,
        filter: None,
    };
    supervisor.start(config).await.unwrap();

    let expected = [
        vec![7, 7, 7],
        vec![8, 8, 8],
        vec![7, 7, 7],
        vec![8, 8, 8],
        vec![7, 7, 7],
    ];
    for want in expected {
        let (_, _, payload) = recv(&mut record_rx).await;
        assert_eq!(payload, want);
    }

    supervisor.stop().await;
}

#[tokio::test]
async fn transient_failures_recover_via_reconnect() {
    let (record_tx, mut record_rx) = mpsc::unbounded_channel();
    let mut steps = vec![Step::Frame(FrameBuffer::raw(vec![42, 42, 42], 1, 1, 3))];
    steps.extend(std::iter::repeat(Step::TransientFail).take(10));
    let source_factory = synthetic_source_factory(steps);
    let supervisor = Supervisor::with_bus_factory(
        "unused".to_string(),
        source_factory,
        Arc::new(RecordingBusFactory { sender: record_tx }),
        false,
    );

    let mut ingestor_config = base_ingestor_config();
    ingestor_config.loop_video = None;
    let config = PipelineConfig {
        ingestor: ingestor_config,
        filter: None,
    };
    supervisor.start(config).await.unwrap();

    // The source fails MAX_FAIL times after every successful frame, forcing
    // a reconnect (which resets it back to frame 0) before it can emit
    // again. Seeing the same frame twice proves the ingestor survived the
    // failure run instead of giving up.
    for _ in 0..2 {
        let (_, _, payload) = recv(&mut record_rx).await;
        assert_eq!(payload, vec![42, 42, 42]);
    }

    supervisor.stop().await;
}

#[tokio::test]
async fn fatal_source_failure_stops_the_ingestor_without_emitting() {
    let (out_tx, mut out_rx) = bounded(4);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let source: Box<dyn Source> = Box::new(SyntheticSource::new(vec![Step::FatalFail]));
    let ingestor = Ingestor::new(base_ingestor_config(), source, out_tx, stop_rx, false);

    let result = ingestor.run().await;
    assert!(result.is_err(), "a fatal source error must propagate out of run()");
    assert!(out_rx.recv().await.is_none(), "no frame should ever be emitted");
}

#[tokio::test]
async fn fatal_ingestor_failure_tears_down_pipeline_and_signals_exit() {
    let (record_tx, mut record_rx) = mpsc::unbounded_channel();
    let source_factory = synthetic_source_factory(vec![Step::FatalFail]);
    let supervisor = Supervisor::with_bus_factory(
        "unused".to_string(),
        source_factory,
        Arc::new(RecordingBusFactory { sender: record_tx }),
        false,
    );

    let mut exit_rx = supervisor.exit_signal();

    let config = PipelineConfig {
        ingestor: base_ingestor_config(),
        filter: None,
    };
    supervisor.start(config).await.unwrap();

    timeout(Duration::from_secs(5), exit_rx.changed())
        .await
        .expect("timed out waiting for the supervisor's fatal exit signal")
        .unwrap();
    let reason = exit_rx.borrow().clone();
    assert!(reason.is_some(), "expected a fatal exit reason to be recorded");
    assert!(reason.unwrap().contains("ingestor"));

    assert!(
        record_rx.try_recv().is_err(),
        "no frame should have been published before the fatal failure"
    );
}

#[tokio::test]
async fn pcb_filter_only_publishes_during_detected_anomalies() {
    let (record_tx, mut record_rx) = mpsc::unbounded_channel();

    const WIDTH: u32 = 100;
    const HEIGHT: u32 = 50;
    let solid = |value: u8| FrameBuffer::raw(vec![value; (HEIGHT * WIDTH * 3) as usize], HEIGHT, WIDTH, 3);
    let blob = |bg: u8, blob_value: u8| {
        let mut data = vec![bg; (HEIGHT * WIDTH * 3) as usize];
        for y in 10..40u32 {
            for x in 30..70u32 {
                let idx = ((y * WIDTH + x) * 3) as usize;
                data[idx] = blob_value;
                data[idx + 1] = blob_value;
                data[idx + 2] = blob_value;
            }
        }
        FrameBuffer::raw(data, HEIGHT, WIDTH, 3)
    };

    // Frame 1 seeds the background. Frames 2..=17 alternate blob/background
    // on an 8-frame period (1 emission + 7 suppressed cooldown frames):
    // anomalies land at positions 2 and 10.
    let mut steps = vec![Step::Frame(solid(50))];
    for i in 2..=17u32 {
        if (i - 2) % 8 == 0 {
            steps.push(Step::Frame(blob(50, 200)));
        } else {
            steps.push(Step::Frame(solid(50)));
        }
    }

    let source_factory = synthetic_source_factory(steps);
    let supervisor = Supervisor::with_bus_factory(
        "unused".to_string(),
        source_factory,
        Arc::new(RecordingBusFactory { sender: record_tx }),
        false,
    );

    let config = PipelineConfig {
        ingestor: base_ingestor_config(),
        filter: Some(FilterConfig {
            name: "pcb".to_string(),
            queue_size: 32,
            training_mode: false,
            profiling: false,
            params: HashMap::new(),
        }),
    };
    supervisor.start(config).await.unwrap();

    for _ in 0..2 {
        let (_, metadata_json, _) = recv(&mut record_rx).await;
        let value: serde_json::Value = serde_json::from_slice(&metadata_json).unwrap();
        assert_eq!(value["user_data"], 1);
    }
    assert_no_more(&mut record_rx).await;

    supervisor.stop().await;
}
