pub mod models {
    pub mod insights;
}

pub mod api;
pub mod client;
pub mod config;
pub mod db {
    #[cfg(test)]
    pub mod memory;
    pub mod models;
    pub mod postgres;
    pub mod store;
}
pub mod schema;
pub mod utils;
pub mod services {
    pub mod persistent;
    pub mod pipeline;
    pub mod scheduler;
    pub mod sync;
}
#[cfg(test)]
mod test_support;

use crate::api::AppState;
use crate::client::InsightsClient;
use crate::config::Config;
use crate::db::models::RunContext;
use crate::db::postgres::PgStorage;
use crate::services::scheduler::SyncScheduler;
use crate::services::sync::{SyncOptions, SyncService};
use axum::Router;
use clap::Parser;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Parser)]
#[command(version, about = "Sync a laundry fleet from SQ Insights into Postgres and serve it over REST")]
struct Cli {
    /// Load environment variables from this file instead of ./.env
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,
    /// Run one manual sync and exit without starting the scheduler or HTTP server
    #[arg(long)]
    once: bool,
}

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

/// Variables already set in the process environment win over the file.
fn load_env_file(cli: &Cli) -> Result<Option<LoadedEnvFile>, String> {
    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path).map_err(|e| format!("failed to load env file {}: {}", path.display(), e))?;
            Ok(Some(LoadedEnvFile {
                path: path.clone(),
                explicit: true,
            }))
        }
        None => {
            let cwd = std::env::current_dir().map_err(|e| format!("failed to resolve working directory: {}", e))?;
            load_default_env_file(&cwd)
        }
    }
}

/// Only `<dir>/.env`; parent directories are not searched.
fn load_default_env_file(dir: &Path) -> Result<Option<LoadedEnvFile>, String> {
    let path = dir.join(".env");
    match dotenvy::from_path(&path) {
        Ok(()) => Ok(Some(LoadedEnvFile { path, explicit: false })),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(format!("failed to load {}: {}", path.display(), e)),
    }
}

pub fn run(once: bool) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (base_url={}, api_key={}, sync_enabled={}, interval={}h, programs={}, error_lookback={}h, report_lookback={}h, bind={})",
        cfg.base_url,
        if cfg.api_key.is_some() { "set" } else { "-" },
        cfg.sync_enabled,
        cfg.sync_interval.as_secs() / 3600,
        cfg.sync_programs,
        cfg.error_lookback.num_hours(),
        cfg.report_lookback.num_hours(),
        cfg.http_bind
    );

    // 2) Connect DB
    let storage = Arc::new(
        PgStorage::connect(&cfg.database_url, cfg.db_pool_size).map_err(|e| format!("DB connection failed: {}", e))?,
    );
    info!("Connected to database (pool size {})", cfg.db_pool_size);

    // 3) Apply pending database migrations
    storage.apply_migrations()?;

    // 4) Sync service, only with a partner API key
    let sync = match &cfg.api_key {
        Some(key) => {
            let client = InsightsClient::new(&cfg.base_url, key, cfg.request_timeout);
            let options = SyncOptions {
                include_programs: cfg.sync_programs,
                error_lookback: cfg.error_lookback,
                report_lookback: cfg.report_lookback,
            };
            Some(Arc::new(SyncService::new(Arc::clone(&storage), client, options)))
        }
        None => {
            warn!("SQ_INSIGHTS_API_KEY is not set; scheduler will not start and sync routes answer 503");
            None
        }
    };

    if once {
        let sync = sync.ok_or_else(|| "--once requires SQ_INSIGHTS_API_KEY".to_string())?;
        let report = sync
            .sync_all(&RunContext::manual(None))
            .map_err(|e| format!("sync failed: {}", e))?;
        info!("One-off sync complete: {} skipped item(s)", report.skipped.len());
        return Ok(());
    }

    // 5) Scheduler
    let scheduler = sync
        .as_ref()
        .map(|s| Arc::new(Mutex::new(SyncScheduler::new(Arc::clone(s), cfg.sync_interval))));
    match &scheduler {
        Some(scheduler) if cfg.sync_enabled => {
            scheduler
                .lock()
                .map_err(|_| "scheduler lock poisoned".to_string())?
                .start()
                .map_err(|e| format!("failed to start scheduler: {}", e))?;
        }
        Some(_) => info!("Scheduler disabled via SYNC_ENABLED={}", cfg.sync_enabled),
        None => {}
    }

    // 6) REST surface until ctrl-c
    let state = AppState {
        storage,
        sync,
        scheduler: scheduler.clone(),
    };
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("failed to build tokio runtime: {}", e))?;
    let served = runtime.block_on(serve(&cfg.http_bind, api::router(state)));

    if let Some(scheduler) = scheduler
        && let Ok(mut scheduler) = scheduler.lock()
    {
        scheduler.stop();
    }
    served
}

async fn serve(bind: &str, app: Router) -> Result<(), String> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| format!("failed to bind {}: {}", bind, e))?;
    info!("Listening on {}", bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("HTTP server failed: {}", e))
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => {
            error!("Unable to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let loaded_env = match load_env_file(&cli) {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "laundry-fleet-sync {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(cli.once) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_env_file_is_not_searched_in_parent_directories() {
        let parent = std::env::temp_dir().join(format!("laundry-fleet-sync-env-{}", std::process::id()));
        let child = parent.join("child");
        std::fs::create_dir_all(&child).unwrap();
        std::fs::write(parent.join(".env"), "LAUNDRY_FLEET_SYNC_PARENT_MARKER=1\n").unwrap();

        assert!(load_default_env_file(&child).unwrap().is_none());
        assert!(std::env::var("LAUNDRY_FLEET_SYNC_PARENT_MARKER").is_err());

        std::fs::write(child.join(".env"), "LAUNDRY_FLEET_SYNC_CHILD_MARKER=1\n").unwrap();
        let loaded = load_default_env_file(&child).unwrap().unwrap();
        assert_eq!(loaded.path, child.join(".env"));
        assert!(!loaded.explicit);
        assert_eq!(std::env::var("LAUNDRY_FLEET_SYNC_CHILD_MARKER").as_deref(), Ok("1"));

        std::fs::remove_dir_all(&parent).unwrap();
    }

    #[test]
    fn cli_parses_flags() {
        let cli = Cli::try_parse_from(["laundry-fleet-sync", "--env-file", "prod.env", "--once"]).unwrap();
        assert_eq!(cli.env_file, Some(PathBuf::from("prod.env")));
        assert!(cli.once);

        let cli = Cli::try_parse_from(["laundry-fleet-sync"]).unwrap();
        assert_eq!(cli.env_file, None);
        assert!(!cli.once);
    }

    #[test]
    fn unknown_arguments_are_rejected() {
        assert!(Cli::try_parse_from(["laundry-fleet-sync", "--backfill"]).is_err());
    }
}
