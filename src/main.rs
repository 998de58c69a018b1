use std::env;

use anyhow::{Context, Result};
use clap::Parser;

use video_ingestion::config::{ConfigStore, FileConfigStore, PipelineConfig};
use video_ingestion::supervisor::{file_source_factory, Supervisor};

#[derive(Parser, Debug)]
#[command(about = "Factory-floor video ingestion pipeline: source capture, pluggable filtering, and publish")]
struct Args {
    /// Application name; also read from the `AppName` env var when unset.
    #[arg(long)]
    app_name: Option<String>,

    /// Directory the file-backed config store polls for `<app-name>/config`.
    #[arg(long, default_value = ".")]
    config_dir: String,

    /// Log level, falls back to `PY_LOG_LEVEL` then `RUST_LOG`.
    #[arg(long)]
    log_level: Option<String>,
}

/// Parses a `"true"`/`"false"` environment variable case-insensitively.
/// Returns `None` when unset; an unset var is not the same as `false`.
fn parse_bool_env(key: &str) -> Option<bool> {
    env::var(key).ok().map(|v| v.eq_ignore_ascii_case("true"))
}

fn init_logging(args: &Args) {
    if env::var("RUST_LOG").is_err() {
        let level = args
            .log_level
            .clone()
            .or_else(|| env::var("PY_LOG_LEVEL").ok())
            .unwrap_or_else(|| "info".to_string());
        env::set_var("RUST_LOG", level);
    }
    env_logger::init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let app_name = args
        .app_name
        .clone()
        .or_else(|| env::var("AppName").ok())
        .context("AppName must be set via --app-name or the AppName environment variable")?;

    let pub_topics: Vec<String> = env::var("PubTopics")
        .context("PubTopics environment variable is required")?
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if pub_topics.len() != 1 {
        anyhow::bail!(
            "exactly one publish topic is supported, got {:?}",
            pub_topics
        );
    }

    let publish_address = env::var(format!("{}_cfg", pub_topics[0]))
        .unwrap_or_else(|_| "tcp://127.0.0.1:5563".to_string());

    let profiling = parse_bool_env("PROFILING_MODE").or_else(|| parse_bool_env("PROFILING")).unwrap_or(false);
    let dev_mode = parse_bool_env("DEV_MODE").unwrap_or(false);
    if dev_mode {
        log::info!("DEV_MODE set: skipping TLS material for the configuration store client");
    }
    if let Ok(clients) = env::var("Clients") {
        log::info!("configured bus subscriber identities: {}", clients);
    }

    log::info!(
        "starting video ingestion pipeline for {} (profiling={})",
        app_name,
        profiling
    );

    let store = FileConfigStore::new(&args.config_dir);
    let config_key = format!("{}/config", app_name);
    let raw = store
        .get(&config_key)
        .await
        .with_context(|| format!("failed to read initial config at {}", config_key))?;
    let config: PipelineConfig = serde_json::from_str(&raw).context("failed to parse initial config")?;

    let supervisor = Supervisor::new(publish_address, file_source_factory(), profiling);
    supervisor.start(config).await?;

    let watch_prefix = format!("{}/", app_name);
    let supervisor_cb = supervisor.clone();
    store
        .watch_prefix(
            &watch_prefix,
            Box::new(move |key, value| {
                let supervisor = supervisor_cb.clone();
                tokio::spawn(async move {
                    if let Err(e) = supervisor.on_config_change(&key, &value).await {
                        log::error!("failed to react to config change on {}: {}", key, e);
                    }
                });
            }),
        )
        .await
        .context("failed to register configuration watch")?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    let mut exit_rx = supervisor.exit_signal();

    let fatal_reason = tokio::select! {
        _ = sigterm.recv() => {
            log::info!("received SIGTERM, stopping pipeline");
            None
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("received interrupt, stopping pipeline");
            None
        }
        _ = exit_rx.changed() => {
            exit_rx.borrow().clone()
        }
    };

    supervisor.stop().await;

    if let Some(reason) = fatal_reason {
        anyhow::bail!("pipeline stopped due to a fatal structural error: {}", reason);
    }

    log::info!("pipeline stopped cleanly");
    Ok(())
}
