// src/lib.rs

pub mod artifacts;
pub mod cleanup;
pub mod cli;
pub mod config;
pub mod errors;
pub mod events;
pub mod exec;
pub mod fs;
pub mod logging;
pub mod logs;
pub mod model;
pub mod pool;
pub mod retry;
pub mod shutdown;
pub mod types;
pub mod upload;
pub mod watch;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::artifacts::download_service::{serve, DownloadCoordinator};
use crate::artifacts::object_store::{HttpObjectStore, ObjectStore};
use crate::artifacts::store::ArtifactStore;
use crate::cleanup::live_tasks::{HttpLiveTaskSource, LiveTaskSource, UnconfiguredLiveTasks};
use crate::cleanup::reaper::{log_summary, CleanupReaper};
use crate::cli::{CliArgs, Command};
use crate::config::loader::{load_and_validate, load_layered};
use crate::config::model::ConfigFile;
use crate::config::validate::validate_config;
use crate::events::deploy::{DeployEventNotifier, DeploySink, LoggingDeploySink, WebhookDeploySink};
use crate::events::history::{JsonLinesHistorySink, TaskHistoryRecorder};
use crate::exec::daemon::ExecutorDaemon;
use crate::exec::idle::ActivityTracker;
use crate::exec::report::{HttpStatusReporter, LoggingStatusReporter, StatusReporter};
use crate::exec::supervisor::{SupervisorDeps, TaskSupervisor};
use crate::exec::RealProcessBackend;
use crate::fs::{FileSystem, RealFileSystem};
use crate::logs::rotation::LogRotationPlanner;
use crate::pool::WorkerPools;
use crate::upload::uploader::ArtifactUploader;
use crate::upload::watcher::MetadataUploader;

/// High-level entry point used by `main.rs`.
///
/// Loads and validates the layered configuration, initialises logging and
/// runs the selected daemon until it finishes or SIGTERM/SIGINT arrives.
pub async fn run(args: CliArgs) -> Result<()> {
    if let Command::CheckConfig = args.command {
        return check_config(&args.config);
    }

    let config = load_and_validate(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config))?;
    logging::init_logging(args.log_level, config.logging.level.as_deref())?;
    debug!(config = %config.redacted_summary()?, "effective configuration");

    let config = Arc::new(config);
    let cancel = shutdown::install_shutdown_handler()?;

    match args.command {
        Command::Executor { task_ids } => {
            let supervisor = TaskSupervisor::new(build_supervisor_deps(Arc::clone(&config))?);
            let exit = ExecutorDaemon::new(supervisor, task_ids).run(cancel).await?;
            info!(reason = ?exit, "executor exited");
        }
        Command::Cleanup { once } => {
            let reaper = CleanupReaper::new(
                Arc::new(RealFileSystem),
                live_task_source(&config)?,
                Arc::clone(&config),
            );
            if once {
                let report = reaper.sweep().await;
                log_summary(&report);
                if let Some(reason) = report.aborted {
                    bail!("cleanup sweep aborted: {reason}");
                }
            } else {
                reaper.run_periodic(cancel).await;
            }
        }
        Command::Uploader => {
            let pools = WorkerPools::from_config(&config);
            let uploader =
                ArtifactUploader::new(build_object_store(&config)?, Arc::clone(&config), pools.upload)?;
            MetadataUploader::new(Arc::new(RealFileSystem), uploader, config.s3.clone())
                .run(cancel)
                .await?;
        }
        Command::DownloadService => {
            let pools = WorkerPools::from_config(&config);
            let mut direct = config.artifacts.clone();
            direct.use_local_download_service = false;
            let store = ArtifactStore::from_config(&direct, build_object_store(&config)?, pools.download);
            let coordinator = Arc::new(
                DownloadCoordinator::new(
                    store,
                    &config.artifacts.local_download_service_staging_directory,
                )
                .with_retention(Duration::from_millis(
                    config.artifacts.local_download_service_retention_millis,
                )),
            );
            serve(&config.artifacts.local_download_service_socket, coordinator, cancel).await?;
        }
        Command::CheckConfig => {}
    }
    Ok(())
}

fn check_config(base: &str) -> Result<()> {
    let config = load_layered(base).with_context(|| format!("loading configuration from {base}"))?;
    println!("{}", config.redacted_summary()?);

    let violations = validate_config(&config);
    if violations.is_empty() {
        println!("configuration OK");
        return Ok(());
    }
    for v in &violations {
        println!("  - {v}");
    }
    bail!("{} configuration violation(s)", violations.len())
}

fn build_object_store(config: &ConfigFile) -> Result<Arc<dyn ObjectStore>> {
    let client = reqwest::Client::builder()
        .build()
        .context("building object store HTTP client")?;
    Ok(Arc::new(HttpObjectStore::new(client, config.s3.endpoint.clone())))
}

fn live_task_source(config: &ConfigFile) -> Result<Arc<dyn LiveTaskSource>> {
    let cleanup = &config.cleanup;
    Ok(match &cleanup.live_tasks_url {
        Some(url) => Arc::new(HttpLiveTaskSource::new(
            url.clone(),
            Duration::from_millis(cleanup.live_tasks_timeout_millis),
        )?),
        None => Arc::new(UnconfiguredLiveTasks),
    })
}

/// Production collaborators for the task supervisor.
pub fn build_supervisor_deps(config: Arc<ConfigFile>) -> Result<SupervisorDeps> {
    let pools = WorkerPools::from_config(&config);
    let object_store = build_object_store(&config)?;

    let history = match &config.history.path {
        Some(path) => TaskHistoryRecorder::new(Arc::new(JsonLinesHistorySink::new(path.clone())))
            .with_append_timeout(Duration::from_millis(config.history.timeout_millis)),
        None => TaskHistoryRecorder::disabled(),
    };

    let deploy_sink: Arc<dyn DeploySink> = if config.webhooks.urls.is_empty() {
        Arc::new(LoggingDeploySink)
    } else {
        Arc::new(WebhookDeploySink::new(
            config.webhooks.urls.clone(),
            Duration::from_millis(config.webhooks.timeout_millis),
        )?)
    };

    let reporter: Arc<dyn StatusReporter> = match &config.scheduler.status_url {
        Some(url) => Arc::new(HttpStatusReporter::new(
            url.clone(),
            Duration::from_millis(config.scheduler.timeout_millis),
        )?),
        None => Arc::new(LoggingStatusReporter),
    };

    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);

    Ok(SupervisorDeps {
        backend: Arc::new(RealProcessBackend),
        artifacts: ArtifactStore::from_config(
            &config.artifacts,
            Arc::clone(&object_store),
            pools.download.clone(),
        ),
        rotation: LogRotationPlanner::new(Arc::clone(&config)),
        uploader: ArtifactUploader::new(object_store, Arc::clone(&config), pools.upload.clone())?,
        reporter,
        deploys: DeployEventNotifier::new(deploy_sink, history.clone()),
        history,
        fs,
        pools,
        activity: Arc::new(ActivityTracker::new()),
        config,
    })
}
