// Worker daemon: claims jobs from the shared queue and executes them
// through the pooled browser stack until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use browsermill::captcha::audio::AudioPipeline;
use browsermill::captcha::detection::DetectionRegistry;
use browsermill::captcha::solver::{SolverOrchestrator, build_default_registry};
use browsermill::captcha::widget::WidgetInteractor;
use browsermill::config::MillConfig;
use browsermill::browser::BrowserPool;
use browsermill::events::JobEventBus;
use browsermill::processor::{ActionRegistry, JobProcessor};
use browsermill::scheduler::{JobStore, Scheduler};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = MillConfig::from_env();
    let worker_id = Uuid::new_v4();
    info!(worker_id = %worker_id, "Starting browsermill worker");

    let store = JobStore::open(&config.scheduler.database_path)
        .await
        .context("Failed to open job store")?;
    let events = Arc::new(JobEventBus::default());
    let scheduler = Arc::new(Scheduler::new(store, events, config.scheduler.clone()));

    let family = config.scheduler.default_browser_family;
    scheduler
        .register_worker(worker_id, family)
        .await
        .context("Failed to register worker")?;
    let heartbeat = scheduler.spawn_heartbeat(worker_id);
    let reaper = scheduler.spawn_reaper();

    let pool = BrowserPool::new(config.pool.clone());
    pool.start(family).await.context("Failed to prewarm browser pool")?;

    // Captcha stack: detection, widget interaction, audio transcription,
    // and the ranked solver registry (external adapters register only when
    // their keys are configured).
    let detection = Arc::new(DetectionRegistry::with_defaults(&config.captcha));
    let interactor = Arc::new(WidgetInteractor::new(config.input.clone(), &config.captcha));
    let audio = Arc::new(AudioPipeline::from_config(config.audio.clone()));
    let registry = build_default_registry(&config.captcha, interactor, audio);
    let orchestrator = Arc::new(SolverOrchestrator::new(registry, config.captcha.clone()));

    let actions = Arc::new(ActionRegistry::with_builtins(detection, orchestrator));
    let processor = JobProcessor::new(
        Arc::clone(&scheduler),
        Arc::clone(&pool),
        actions,
        config,
        worker_id,
    );
    let run = tokio::spawn(Arc::clone(&processor).run());

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    info!("Shutdown signal received, draining");

    run.abort();
    heartbeat.abort();
    reaper.abort();
    pool.cleanup().await;
    info!("Worker stopped");
    Ok(())
}
