use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::interval;

use crate::error::ConfigError;

/// Describes the video source an Ingestor should read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestorConfig {
    pub video_src: String,
    #[serde(default)]
    pub poll_interval: Option<f64>,
    /// "true" / "false" / absent, matching the original's three-way string.
    #[serde(default)]
    pub loop_video: Option<String>,
    #[serde(default)]
    pub encoding: Option<EncodingDescriptor>,
    /// "WxH" string, carried through to per-frame metadata untouched; the
    /// Publisher is the one that parses it to drive the resize contract.
    #[serde(default)]
    pub resolution: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodingDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    pub level: i64,
}

/// Describes which filter to run and its parameters. The `filter` key is
/// optional in the config blob; when absent, the pipeline still runs a
/// filter stage (the bypass filter), per spec.md's architecture where a
/// Filter stage is always present between Ingestor and Publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_filter_name")]
    pub name: String,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default)]
    pub training_mode: bool,
    #[serde(default)]
    pub profiling: bool,
    #[serde(flatten)]
    pub params: HashMap<String, Value>,
}

fn default_filter_name() -> String {
    "bypass".to_string()
}

fn default_queue_size() -> usize {
    10
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            name: default_filter_name(),
            queue_size: default_queue_size(),
            training_mode: false,
            profiling: false,
            params: HashMap::new(),
        }
    }
}

/// The full `{ingestor, filter}` config blob read from
/// `/<AppName>/config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub ingestor: IngestorConfig,
    #[serde(default)]
    pub filter: Option<FilterConfig>,
}

impl PipelineConfig {
    pub fn filter(&self) -> FilterConfig {
        self.filter.clone().unwrap_or_default()
    }

    pub fn from_json(value: &Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value.clone()).map_err(ConfigError::Parse)
    }
}

/// What changed between two successive `PipelineConfig`s, used by the
/// Supervisor to decide whether to do a full restart, an ingestor-only
/// replace, or nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigDiff {
    Unchanged,
    IngestorOnly,
    FilterChanged,
}

pub fn diff(old: &PipelineConfig, new: &PipelineConfig) -> ConfigDiff {
    let filter_changed = old.filter() != new.filter();
    let ingestor_changed = old.ingestor != new.ingestor;

    if filter_changed {
        ConfigDiff::FilterChanged
    } else if ingestor_changed {
        ConfigDiff::IngestorOnly
    } else {
        ConfigDiff::Unchanged
    }
}

/// Callback invoked with `(key, new_value)` when a watched key changes.
pub type WatchCallback = Box<dyn Fn(String, String) + Send + Sync>;

/// Abstraction over the external configuration store (etcd in the original
/// deployment). `get` performs a one-shot read; `watch_prefix` registers a
/// directory watch that invokes `cb` on change.
#[async_trait::async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<String, ConfigError>;
    async fn watch_prefix(&self, prefix: &str, cb: WatchCallback) -> Result<(), ConfigError>;
}

/// File-backed `ConfigStore`: reads `<base_dir>/<key>` files and polls their
/// contents on an interval, invoking the watch callback whenever the
/// contents change. Stands in for the etcd-backed store used in the
/// original deployment, behind the same trait.
pub struct FileConfigStore {
    base_dir: PathBuf,
    poll_period: Duration,
    last_seen: Arc<Mutex<HashMap<String, String>>>,
}

impl FileConfigStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            poll_period: Duration::from_millis(500),
            last_seen: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_poll_period(mut self, period: Duration) -> Self {
        self.poll_period = period;
        self
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let trimmed = key.trim_start_matches('/');
        self.base_dir.join(trimmed)
    }
}

#[async_trait::async_trait]
impl ConfigStore for FileConfigStore {
    async fn get(&self, key: &str) -> Result<String, ConfigError> {
        let path = self.path_for(key);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })
    }

    async fn watch_prefix(&self, prefix: &str, cb: WatchCallback) -> Result<(), ConfigError> {
        let dir = self.path_for(prefix);
        let last_seen = self.last_seen.clone();
        let poll_period = self.poll_period;

        tokio::spawn(async move {
            let mut ticker = interval(poll_period);
            loop {
                ticker.tick().await;
                if let Err(e) = poll_once(&dir, &last_seen, &cb).await {
                    log::warn!("config watch poll failed for {:?}: {}", dir, e);
                }
            }
        });

        Ok(())
    }
}

async fn poll_once(
    dir: &Path,
    last_seen: &Arc<Mutex<HashMap<String, String>>>,
    cb: &WatchCallback,
) -> Result<(), ConfigError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(source) => {
            return Err(ConfigError::Read {
                path: dir.display().to_string(),
                source,
            })
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let key = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => {
                log::warn!("failed reading watched file {:?}: {}", path, e);
                continue;
            }
        };

        let mut guard = last_seen.lock().await;
        let changed = guard.get(&key) != Some(&contents);
        if changed {
            guard.insert(key.clone(), contents.clone());
            drop(guard);
            cb(key, contents);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> PipelineConfig {
        PipelineConfig {
            ingestor: IngestorConfig {
                video_src: "test.mp4".to_string(),
                poll_interval: Some(0.1),
                loop_video: Some("false".to_string()),
                encoding: None,
                resolution: None,
            },
            filter: None,
        }
    }

    #[test]
    fn unchanged_configs_diff_to_unchanged() {
        let a = base_config();
        let b = base_config();
        assert_eq!(diff(&a, &b), ConfigDiff::Unchanged);
    }

    #[test]
    fn ingestor_only_change_is_detected() {
        let a = base_config();
        let mut b = base_config();
        b.ingestor.video_src = "other.mp4".to_string();
        assert_eq!(diff(&a, &b), ConfigDiff::IngestorOnly);
    }

    #[test]
    fn filter_change_takes_priority_over_ingestor_change() {
        let a = base_config();
        let mut b = base_config();
        b.ingestor.video_src = "other.mp4".to_string();
        b.filter = Some(FilterConfig {
            name: "pcb".to_string(),
            ..FilterConfig::default()
        });
        assert_eq!(diff(&a, &b), ConfigDiff::FilterChanged);
    }
} 