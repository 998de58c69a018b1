mod test_source;

pub use test_source::{Step, SyntheticSource};

use tokio::sync::watch;
use tokio::time::{sleep, Duration};

use crate::config::IngestorConfig;
use crate::error::SourceError;
use crate::frame::{Frame, FrameBuffer, Metadata, KEY_TS_VI_ENTRY};
use crate::queue::FrameSender;

const MAX_FAIL: u32 = 10;
const MAX_RETRY: u32 = 5;

/// A pluggable video source. One fallible read per call; `reopen` is invoked
/// by the Ingestor's reconnection sub-procedure after MAX_FAIL consecutive
/// failures.
pub trait Source: Send {
    /// Read the next frame. `Ok(None)` signals end-of-stream (used by
    /// file-backed sources with `loop_video == "false"`).
    fn read_frame(&mut self) -> Result<Option<FrameBuffer>, SourceError>;
    fn reopen(&mut self) -> Result<(), SourceError>;
}

/// Reads a sequence of raw frames from a flat directory of `.bin` files,
/// each holding an encoded height/width/channel-prefixed buffer. Used by the
/// seed tests and as a minimal reference `Source` impl — real deployments
/// supply their own `Source` (camera, RTSP, etc).
pub struct FileSource {
    path: String,
    frames: Vec<FrameBuffer>,
    cursor: usize,
}

impl FileSource {
    pub fn new(path: impl Into<String>, frames: Vec<FrameBuffer>) -> Self {
        Self {
            path: path.into(),
            frames,
            cursor: 0,
        }
    }
}

impl Source for FileSource {
    fn read_frame(&mut self) -> Result<Option<FrameBuffer>, SourceError> {
        if self.frames.is_empty() {
            return Err(SourceError::Transient(format!(
                "no frames available from {}",
                self.path
            )));
        }
        if self.cursor >= self.frames.len() {
            return Ok(None);
        }
        let frame = self.frames[self.cursor].clone();
        self.cursor += 1;
        Ok(Some(frame))
    }

    fn reopen(&mut self) -> Result<(), SourceError> {
        self.cursor = 0;
        Ok(())
    }
}

/// Drives a `Source`, applying the reconnection/backoff contract and
/// forwarding successfully read frames onto the filter-input queue.
pub struct Ingestor {
    config: IngestorConfig,
    source: Box<dyn Source>,
    out: FrameSender,
    stop_rx: watch::Receiver<bool>,
    profiling: bool,
}

impl Ingestor {
    pub fn new(
        config: IngestorConfig,
        source: Box<dyn Source>,
        out: FrameSender,
        stop_rx: watch::Receiver<bool>,
        profiling: bool,
    ) -> Self {
        Self {
            config,
            source,
            out,
            stop_rx,
            profiling,
        }
    }

    /// Runs the read loop until stopped or a fatal source error occurs.
    /// `poll_interval` is only applied after a successful read, never while
    /// reconnecting — matching the original's loop structure exactly.
    pub async fn run(mut self) -> Result<(), SourceError> {
        let mut fail_count: u32 = 0;
        let loop_video = self.config.loop_video.as_deref();

        loop {
            if *self.stop_rx.borrow() {
                return Ok(());
            }

            match self.source.read_frame() {
                Ok(Some(buffer)) => {
                    fail_count = 0;
                    self.emit(buffer).await;
                    if let Some(interval) = self.config.poll_interval {
                        if interval > 0.0 {
                            sleep(Duration::from_secs_f64(interval)).await;
                        }
                    }
                }
                Ok(None) => match loop_video {
                    Some("true") => {
                        self.source.reopen()?;
                        continue;
                    }
                    Some("false") => {
                        log::info!("source {} exhausted, stopping ingestor", self.config.video_src);
                        return Ok(());
                    }
                    _ => {
                        fail_count += 1;
                        log::warn!(
                            "end-of-stream {}/{} from {} with no loop_video setting",
                            fail_count,
                            MAX_FAIL,
                            self.config.video_src
                        );
                        if fail_count >= MAX_FAIL {
                            self.reconnect().await?;
                            fail_count = 0;
                        }
                    }
                },
                Err(SourceError::Fatal(reason)) => {
                    return Err(SourceError::Fatal(reason));
                }
                Err(SourceError::Transient(reason)) => {
                    if loop_video == Some("true") {
                        log::warn!("read failed, reopening looped source: {}", reason);
                        self.source.reopen()?;
                        continue;
                    }
                    if loop_video == Some("false") {
                        log::info!("read failed with loop_video=false, stopping: {}", reason);
                        return Ok(());
                    }

                    fail_count += 1;
                    log::warn!(
                        "read failure {}/{} from {}: {}",
                        fail_count,
                        MAX_FAIL,
                        self.config.video_src,
                        reason
                    );
                    if fail_count >= MAX_FAIL {
                        self.reconnect().await?;
                        fail_count = 0;
                    }
                }
            }
        }
    }

    /// MAX_RETRY reconnection attempts, no poll_interval sleep between
    /// attempts. Exhaustion is fatal and terminates the Ingestor.
    async fn reconnect(&mut self) -> Result<(), SourceError> {
        let mut attempts_left = MAX_RETRY;
        loop {
            match self.source.reopen() {
                Ok(()) => {
                    log::info!("reconnected to {}", self.config.video_src);
                    return Ok(());
                }
                Err(e) => {
                    attempts_left -= 1;
                    log::warn!(
                        "reconnect attempt failed ({} left) for {}: {}",
                        attempts_left,
                        self.config.video_src,
                        e
                    );
                    if attempts_left == 0 {
                        return Err(SourceError::Fatal(format!(
                            "maximum connection retry completed for {}",
                            self.config.video_src
                        )));
                    }
                }
            }
        }
    }

    async fn emit(&self, buffer: FrameBuffer) {
        let mut metadata = Metadata::new();
        if let Some(enc) = &self.config.encoding {
            metadata.set(crate::frame::KEY_ENCODING_TYPE, enc.kind.clone());
            metadata.set(crate::frame::KEY_ENCODING_LEVEL, enc.level);
        }
        if let Some(resolution) = &self.config.resolution {
            metadata.set(crate::frame::KEY_RESOLUTION, resolution.clone());
        }
        if self.profiling {
            metadata.stamp(KEY_TS_VI_ENTRY, crate::frame::now_millis());
        }

        let frame = Frame::new(metadata, buffer);
        if self.out.send(frame).await.is_err() {
            log::warn!("filter input queue closed, dropping ingestor output");
        }
    }
}
