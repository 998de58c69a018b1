use thiserror::Error;

/// Errors raised while reading or parsing pipeline configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required config key: {0}")]
    MissingKey(String),
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Errors surfaced by a `Source` while reading frames.
#[derive(Debug, Error)]
pub enum SourceError {
    /// A single read failed; the Ingestor should count this towards MAX_FAIL.
    #[error("transient source read failure: {0}")]
    Transient(String),
    /// Reconnection was exhausted (MAX_RETRY attempts); fatal to the Ingestor.
    #[error("source exhausted reconnection attempts: {0}")]
    Fatal(String),
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter '{name}' failed: {reason}")]
    Processing { name: String, reason: String },
}

/// Covers resize/encode backend failures only; out-of-range levels and
/// unsupported encoding types are handled inline in `codec::encode` (logged,
/// buffer left unchanged) and never surface as this error.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("encode failed: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to bind publisher socket at {0}: {1}")]
    Bind(String, String),
    #[error("failed to send frame: {0}")]
    Send(String),
    #[error("more than one publish topic configured: {0:?}")]
    TooManyTopics(Vec<String>),
}

/// Top-level error the Supervisor surfaces to `main`.
///
/// Structural failures (config, fatal source errors, publish bind failures)
/// propagate here and cause the process to stop; per-frame errors
/// (FilterError, EncodeError, per-record PublishError) are logged and
/// localized at their stage and never reach this type.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("exactly one publish topic is required, got {0}")]
    TopicCount(usize),
}
