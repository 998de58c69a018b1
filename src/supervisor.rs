use std::sync::{Arc, OnceLock, Weak};

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::{diff, ConfigDiff, PipelineConfig};
use crate::error::{PipelineError, PublishError, SourceError};
use crate::filter::Registry as FilterRegistry;
use crate::ingestor::{FileSource, Ingestor, Source};
use crate::publisher::bus::{BusFactory, ZmqBusFactory};
use crate::publisher::Publisher;
use crate::queue::{bounded, FrameSender};

/// A source factory so the Supervisor can build a fresh `Source` when
/// restarting the Ingestor, without itself knowing about concrete source
/// types.
pub type SourceFactory = Arc<dyn Fn(&str) -> Box<dyn Source> + Send + Sync>;

/// `(stage name, reason)` reported by a stage's supervising wrapper when that
/// stage exits with a structural (non-recoverable) error. Consumed by the
/// fatal-error monitor task spawned alongside each pipeline generation.
type FatalReport = (String, String);

struct Handles {
    ingestor: Option<JoinHandle<Result<(), SourceError>>>,
    filter: Option<JoinHandle<()>>,
    publisher: Option<JoinHandle<Result<(), PublishError>>>,
    ingestor_stop: Option<watch::Sender<bool>>,
    filter_stop: Option<watch::Sender<bool>>,
    publisher_stop: Option<watch::Sender<bool>>,
    /// A clone of the sender feeding the filter's input queue, kept around
    /// so an ingestor-only restart can wire a fresh Ingestor into the same
    /// queue the Filter is already reading from.
    filter_input_tx: Option<FrameSender>,
    /// A clone of the current generation's fatal-report sender, reused by an
    /// ingestor-only restart so the replacement Ingestor still reports to
    /// the same monitor task that is already watching this pipeline run.
    fatal_tx: Option<mpsc::UnboundedSender<FatalReport>>,
}

impl Handles {
    fn empty() -> Self {
        Self {
            ingestor: None,
            filter: None,
            publisher: None,
            ingestor_stop: None,
            filter_stop: None,
            publisher_stop: None,
            filter_input_tx: None,
            fatal_tx: None,
        }
    }
}

/// Owns the pipeline's lifecycle. Starts stages in reverse data-flow order
/// (Publisher, Filter, Ingestor) and stops them in data-flow order
/// (Ingestor, Filter, Publisher). Reacts to configuration-store watch
/// callbacks by deciding whether a config change needs a full restart, an
/// ingestor-only replace, or nothing.
pub struct Supervisor {
    publish_address: String,
    filter_registry: FilterRegistry,
    source_factory: SourceFactory,
    bus_factory: Arc<dyn BusFactory>,
    /// Process-wide profiling flag (from `PROFILING_MODE`), captured once at
    /// construction and passed by reference into every stage it builds,
    /// per spec.md §9's "module-level globals" note.
    profiling: bool,
    state: Mutex<SupervisorState>,
    /// Lets internally-spawned monitor tasks recover an `Arc<Supervisor>` to
    /// call back into `stop()`, without requiring every caller to hold the
    /// Supervisor behind an `Arc` themselves. Set once, immediately after
    /// construction.
    weak_self: OnceLock<Weak<Supervisor>>,
    /// Fires with `Some(reason)` when a structural error (Ingestor
    /// reconnection exhaustion, an unusable bus channel) tears the pipeline
    /// down outside of an explicit `stop()` call. `main.rs` selects on this
    /// to exit the process non-zero, per spec.md §7's "structural errors...
    /// propagate to the Supervisor which stops the process."
    exit_tx: watch::Sender<Option<String>>,
}

struct SupervisorState {
    config: Option<PipelineConfig>,
    handles: Handles,
}

impl Supervisor {
    pub fn new(publish_address: String, source_factory: SourceFactory, profiling: bool) -> Arc<Self> {
        Self::with_bus_factory(publish_address, source_factory, Arc::new(ZmqBusFactory), profiling)
    }

    /// Like `new`, but with an injectable `BusFactory` — used by integration
    /// tests to substitute an in-memory double for a bound ZMQ socket.
    pub fn with_bus_factory(
        publish_address: String,
        source_factory: SourceFactory,
        bus_factory: Arc<dyn BusFactory>,
        profiling: bool,
    ) -> Arc<Self> {
        let (exit_tx, _exit_rx) = watch::channel(None);
        let supervisor = Arc::new(Self {
            publish_address,
            filter_registry: FilterRegistry::new(),
            source_factory,
            bus_factory,
            profiling,
            state: Mutex::new(SupervisorState {
                config: None,
                handles: Handles::empty(),
            }),
            weak_self: OnceLock::new(),
            exit_tx,
        });
        let _ = supervisor.weak_self.set(Arc::downgrade(&supervisor));
        supervisor
    }

    /// A receiver that changes to `Some(reason)` exactly once, when a
    /// structural failure has torn the pipeline down. Still `None` during
    /// normal operation and after an explicit `stop()`.
    pub fn exit_signal(&self) -> watch::Receiver<Option<String>> {
        self.exit_tx.subscribe()
    }

    fn arc_self(&self) -> Arc<Supervisor> {
        self.weak_self
            .get()
            .and_then(Weak::upgrade)
            .expect("Supervisor must be constructed via Supervisor::new/with_bus_factory")
    }

    pub async fn start(&self, config: PipelineConfig) -> Result<(), PipelineError> {
        let mut state = self.state.lock().await;
        self.start_locked(&mut state, config).await
    }

    async fn start_locked(
        &self,
        state: &mut SupervisorState,
        config: PipelineConfig,
    ) -> Result<(), PipelineError> {
        let mut filter_config = config.filter();
        filter_config.profiling = self.profiling;
        let (ingestor_tx, filter_input) = bounded(filter_config.queue_size);
        let (filter_tx, publisher_input) = bounded(filter_config.queue_size);

        let bus = self
            .bus_factory
            .build(&self.publish_address)
            .await
            .map_err(PipelineError::Publish)?;

        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel::<FatalReport>();
        self.spawn_fatal_monitor(fatal_rx);

        let (publisher_stop_tx, publisher_stop_rx) = watch::channel(false);
        let publisher = Publisher::new(
            "frames".to_string(),
            publisher_input,
            bus,
            publisher_stop_rx,
            self.profiling,
        );
        let publisher_handle = Self::spawn_publisher(publisher, fatal_tx.clone());

        let (filter_stop_tx, filter_stop_rx) = watch::channel(false);
        let filter = self
            .filter_registry
            .build(filter_config, filter_input, filter_tx, filter_stop_rx)
            .map_err(|e| PipelineError::Config(crate::error::ConfigError::Invalid(e.to_string())))?;
        let filter_handle = tokio::spawn(filter.run());

        let (ingestor_stop_tx, ingestor_stop_rx) = watch::channel(false);
        let source = (self.source_factory)(&config.ingestor.video_src);
        let ingestor = Ingestor::new(
            config.ingestor.clone(),
            source,
            ingestor_tx.clone(),
            ingestor_stop_rx,
            self.profiling,
        );
        let ingestor_handle = Self::spawn_ingestor(ingestor, fatal_tx.clone());

        state.handles = Handles {
            ingestor: Some(ingestor_handle),
            filter: Some(filter_handle),
            publisher: Some(publisher_handle),
            ingestor_stop: Some(ingestor_stop_tx),
            filter_stop: Some(filter_stop_tx),
            publisher_stop: Some(publisher_stop_tx),
            filter_input_tx: Some(ingestor_tx),
            fatal_tx: Some(fatal_tx),
        };
        state.config = Some(config);

        Ok(())
    }

    /// Wraps an `Ingestor`'s run future so a `SourceError::Fatal` it returns
    /// is also reported to the pipeline's fatal-error monitor, in addition
    /// to being returned from the `JoinHandle` as before.
    fn spawn_ingestor(
        ingestor: Ingestor,
        fatal_tx: mpsc::UnboundedSender<FatalReport>,
    ) -> JoinHandle<Result<(), SourceError>> {
        tokio::spawn(async move {
            let result = ingestor.run().await;
            if let Err(SourceError::Fatal(reason)) = &result {
                let _ = fatal_tx.send(("ingestor".to_string(), reason.clone()));
            }
            result
        })
    }

    /// Wraps a `Publisher`'s run future the same way `spawn_ingestor` wraps
    /// the Ingestor's: any error it returns means the bus channel itself is
    /// unusable, so it is reported to the fatal-error monitor.
    fn spawn_publisher(
        publisher: Publisher,
        fatal_tx: mpsc::UnboundedSender<FatalReport>,
    ) -> JoinHandle<Result<(), PublishError>> {
        tokio::spawn(async move {
            let result = publisher.run().await;
            if let Err(e) = &result {
                let _ = fatal_tx.send(("publisher".to_string(), e.to_string()));
            }
            result
        })
    }

    /// Spawned once per pipeline generation. Watches for a fatal report from
    /// either stage wrapper; on one, tears the whole pipeline down and fires
    /// `exit_signal`. This task is distinct from the Ingestor/Publisher
    /// tasks it reacts to, so its call into `stop()` (which awaits their
    /// `JoinHandle`s) never waits on itself. If the channel closes without a
    /// report — the normal case, e.g. an explicit `stop()` or a config-change
    /// restart — it exits quietly.
    fn spawn_fatal_monitor(&self, mut fatal_rx: mpsc::UnboundedReceiver<FatalReport>) {
        let supervisor = self.arc_self();
        tokio::spawn(async move {
            if let Some((stage, reason)) = fatal_rx.recv().await {
                log::error!("{} exited with a fatal error, stopping the pipeline: {}", stage, reason);
                supervisor.stop().await;
                let _ = supervisor.exit_tx.send(Some(format!("{}: {}", stage, reason)));
            }
        });
    }

    /// Idempotent: stopping an already-stopped pipeline is a no-op.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        self.stop_locked(&mut state).await;
    }

    async fn stop_locked(&self, state: &mut SupervisorState) {
        if let Some(tx) = state.handles.ingestor_stop.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = state.handles.ingestor.take() {
            let _ = handle.await;
        }

        if let Some(tx) = state.handles.filter_stop.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = state.handles.filter.take() {
            let _ = handle.await;
        }

        if let Some(tx) = state.handles.publisher_stop.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = state.handles.publisher.take() {
            let _ = handle.await;
        }

        state.handles.filter_input_tx = None;
        state.handles.fatal_tx = None;
        state.config = None;
    }

    /// Reacts to a configuration-store watch callback. `value` is the raw
    /// JSON blob read from the changed key.
    pub async fn on_config_change(&self, _key: &str, value: &str) -> Result<(), PipelineError> {
        let new_config: PipelineConfig = serde_json::from_str(value)
            .map_err(crate::error::ConfigError::Parse)
            .map_err(PipelineError::Config)?;

        let mut state = self.state.lock().await;

        let Some(current) = state.config.clone() else {
            return self.start_locked(&mut state, new_config).await;
        };

        match diff(&current, &new_config) {
            ConfigDiff::Unchanged => Ok(()),
            ConfigDiff::FilterChanged => {
                log::info!("filter config changed, restarting full pipeline");
                self.stop_locked(&mut state).await;
                self.start_locked(&mut state, new_config).await
            }
            ConfigDiff::IngestorOnly => {
                log::info!("ingestor config changed, replacing ingestor only");
                self.replace_ingestor_locked(&mut state, new_config).await
            }
        }
    }

    /// Stops and replaces only the Ingestor, reusing the existing
    /// filter-input queue (and therefore the already-running Filter and
    /// Publisher untouched), per the config-change policy this crate fixes
    /// relative to the historical implementation's unconditional full
    /// restart on any change.
    async fn replace_ingestor_locked(
        &self,
        state: &mut SupervisorState,
        new_config: PipelineConfig,
    ) -> Result<(), PipelineError> {
        if let Some(tx) = state.handles.ingestor_stop.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = state.handles.ingestor.take() {
            let _ = handle.await;
        }

        let filter_input_tx = state
            .handles
            .filter_input_tx
            .clone()
            .expect("ingestor-only replace requires a running pipeline");
        let fatal_tx = state
            .handles
            .fatal_tx
            .clone()
            .expect("ingestor-only replace requires a running pipeline");

        let (ingestor_stop_tx, ingestor_stop_rx) = watch::channel(false);
        let source = (self.source_factory)(&new_config.ingestor.video_src);
        let ingestor = Ingestor::new(
            new_config.ingestor.clone(),
            source,
            filter_input_tx,
            ingestor_stop_rx,
            self.profiling,
        );
        let ingestor_handle = Self::spawn_ingestor(ingestor, fatal_tx);

        state.handles.ingestor = Some(ingestor_handle);
        state.handles.ingestor_stop = Some(ingestor_stop_tx);
        state.config = Some(new_config);
        Ok(())
    }
}

/// Default `SourceFactory` producing an empty `FileSource` — placeholder
/// until a real deployment supplies its own `Source` implementation (e.g. a
/// camera or RTSP reader) via `Supervisor::new`.
pub fn file_source_factory() -> SourceFactory {
    Arc::new(|path: &str| -> Box<dyn Source> { Box::new(FileSource::new(path.to_string(), Vec::new())) })
}
