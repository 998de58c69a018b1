pub mod bypass;
pub mod pcb;

use std::collections::HashMap;

use tokio::sync::watch;

use crate::config::FilterConfig;
use crate::error::FilterError;
use crate::frame::Frame;
use crate::queue::{FrameReceiver, FrameSender};

/// A pluggable filter stage. `run` owns the input/output queues and the
/// stop-watch channel for its own lifetime; it returns once stopped or once
/// its input queue is closed.
#[async_trait::async_trait]
pub trait Filter: Send {
    async fn run(self: Box<Self>);
}

/// Constructs a `Filter` from its config and the queues it should bridge.
pub type FilterFactory = fn(
    FilterConfig,
    FrameReceiver,
    FrameSender,
    watch::Receiver<bool>,
) -> Result<Box<dyn Filter>, FilterError>;

/// Name → constructor map for pluggable filters. Built once at startup and
/// extendable via `register`.
pub struct Registry {
    factories: HashMap<String, FilterFactory>,
}

impl Registry {
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("bypass", bypass::build);
        registry.register("pcb", pcb::build);
        registry
    }

    pub fn register(&mut self, name: &str, factory: FilterFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn build(
        &self,
        config: FilterConfig,
        input: FrameReceiver,
        output: FrameSender,
        stop_rx: watch::Receiver<bool>,
    ) -> Result<Box<dyn Filter>, FilterError> {
        let factory = self.factories.get(config.name.as_str()).ok_or_else(|| {
            FilterError::Processing {
                name: config.name.clone(),
                reason: "no filter registered under this name".to_string(),
            }
        })?;
        factory(config, input, output, stop_rx)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared training-mode behavior for reference filters: instead of emitting,
/// persist the raw buffer to `<dir>/<counter>.<ext>`. `ext` follows the
/// frame's encoding type metadata when present, falling back to `bin` for an
/// uncompressed buffer with no declared encoding.
pub async fn write_training_frame(dir: &str, counter: u64, frame: &Frame) {
    let ext = frame
        .metadata
        .get_str(crate::frame::KEY_ENCODING_TYPE)
        .unwrap_or("bin");
    let path = format!("{}/{}.{}", dir, counter, ext);

    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        log::warn!("failed creating training directory {}: {}", dir, e);
        return;
    }
    if let Err(e) = tokio::fs::write(&path, &frame.buffer.data).await {
        log::warn!("failed writing training frame to {}: {}", path, e);
    }
}
