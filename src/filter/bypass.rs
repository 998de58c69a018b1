use tokio::sync::watch;

use crate::config::FilterConfig;
use crate::error::FilterError;
use crate::frame::{now_millis, KEY_TS_VI_FILTER_ENTRY};
use crate::queue::{FrameReceiver, FrameSender};

use super::{write_training_frame, Filter};

const DEFAULT_TRAINING_DIR: &str = "./frames";

/// The reference pass-through filter: stamps a profiling entry time (when
/// profiling is enabled) and forwards every frame unchanged. In training
/// mode it persists the raw buffer to disk instead of emitting it.
pub struct BypassFilter {
    profiling: bool,
    training_mode: bool,
    training_dir: String,
    training_count: u64,
    input: FrameReceiver,
    output: FrameSender,
    stop_rx: watch::Receiver<bool>,
}

pub fn build(
    config: FilterConfig,
    input: FrameReceiver,
    output: FrameSender,
    stop_rx: watch::Receiver<bool>,
) -> Result<Box<dyn Filter>, FilterError> {
    let training_dir = config
        .params
        .get("training_dir")
        .and_then(|v| v.as_str())
        .unwrap_or(DEFAULT_TRAINING_DIR)
        .to_string();
    Ok(Box::new(BypassFilter {
        profiling: config.profiling,
        training_mode: config.training_mode,
        training_dir,
        training_count: 0,
        input,
        output,
        stop_rx,
    }))
}

#[async_trait::async_trait]
impl Filter for BypassFilter {
    async fn run(mut self: Box<Self>) {
        loop {
            let mut frame = tokio::select! {
                biased;
                _ = self.stop_rx.changed() => {
                    if *self.stop_rx.borrow() {
                        return;
                    }
                    continue;
                }
                frame = self.input.recv() => match frame {
                    Some(frame) => frame,
                    None => return,
                },
            };

            if self.profiling {
                frame.metadata.stamp(KEY_TS_VI_FILTER_ENTRY, now_millis());
            }

            if self.training_mode {
                self.training_count += 1;
                write_training_frame(&self.training_dir, self.training_count, &frame).await;
                continue;
            }

            if self.output.send(frame).await.is_err() {
                return;
            }
        }
    }
}
