//! Pipeline orchestration
//!
//! One watcher task feeds a bounded channel of stable spool paths; a small
//! fixed pool of workers drains it, each file processed start-to-finish by
//! a single worker so in-file ordering is preserved. The shipper and its
//! heartbeat run independently; timers drive window GC and store
//! compaction. SIGHUP swaps in a freshly compiled rule set. A single
//! cancellation token is honored at every suspension point.

use crate::baseline::BaselineProcessor;
use crate::config::{Config, ConfigError};
use crate::correlation::WindowManager;
use crate::engine::{load_rules, Engine, EngineError};
use crate::lineage::{LineageCache, LineageConfig};
use crate::shipper::{Shipper, ShipperError};
use crate::signal::{Generator, Signal};
use crate::spool::decoder::DecodeError;
use crate::spool::{Decoder, SpoolWatcher};
use crate::state::{StateStore, StorageError};
use crate::view::EventView;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Rules(#[from] EngineError),

    #[error(transparent)]
    Shipper(#[from] ShipperError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

type EngineSlot = Arc<RwLock<Arc<Engine>>>;

#[derive(Clone)]
struct WorkerCtx {
    engine_slot: EngineSlot,
    decoder: Arc<Decoder>,
    watcher: Arc<SpoolWatcher>,
    store: Arc<StateStore>,
    windows: Arc<WindowManager>,
    baselines: Arc<BaselineProcessor>,
    lineage: Arc<LineageCache>,
    generator: Arc<Generator>,
    shipper: Arc<Shipper>,
    cancel: CancellationToken,
}

/// Run the agent until the token is cancelled.
pub async fn run(cfg: Config, cancel: CancellationToken) -> Result<(), AgentError> {
    let start_time = Utc::now();

    let store = Arc::new(StateStore::open(
        &cfg.state.db_path,
        cfg.state.sync_writes,
        cfg.state.first_seen.max_entries,
    )?);
    store.meta_set("agent_start_time", &start_time.to_rfc3339())?;

    let ruleset = load_rules(&cfg.rules.path)?;
    let engine = Arc::new(Engine::compile(&ruleset, start_time)?);
    let (rules, correlations, baselines) = engine.rule_count();
    info!(rules, correlations, baselines, "rule set loaded");
    let engine_slot: EngineSlot = Arc::new(RwLock::new(engine));

    let shipper = Arc::new(Shipper::new(
        cfg.shipper.clone(),
        cfg.agent.id.clone(),
        store.clone(),
    )?);
    let lineage = Arc::new(LineageCache::new(LineageConfig::default()));
    let generator = Arc::new(Generator::new(cfg.agent.id.clone(), Some(lineage.clone())));
    let windows = Arc::new(WindowManager::new(
        store.clone(),
        cfg.state.windows.max_events,
    ));
    let baseline_processor = Arc::new(BaselineProcessor::new(store.clone()));
    let decoder = Arc::new(Decoder::new(&cfg.spool.decoder));
    let watcher = Arc::new(SpoolWatcher::new(&cfg.spool, store.clone())?);

    let (path_tx, path_rx) = mpsc::channel::<PathBuf>(cfg.spool.channel_buffer);
    let path_rx = Arc::new(tokio::sync::Mutex::new(path_rx));

    let mut tasks = Vec::new();

    {
        let watcher = watcher.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            watcher.run(path_tx, cancel).await;
        }));
    }

    {
        let shipper = shipper.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            shipper.run(cancel).await;
        }));
    }
    {
        let shipper = shipper.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            shipper.run_heartbeat(cancel).await;
        }));
    }

    let ctx = WorkerCtx {
        engine_slot: engine_slot.clone(),
        decoder,
        watcher,
        store: store.clone(),
        windows: windows.clone(),
        baselines: baseline_processor,
        lineage,
        generator,
        shipper,
        cancel: cancel.clone(),
    };

    for worker in 0..cfg.agent.workers.max(1) {
        let ctx = ctx.clone();
        let path_rx = path_rx.clone();
        tasks.push(tokio::spawn(async move {
            debug!(worker, "worker started");
            loop {
                let path = { path_rx.lock().await.recv().await };
                let Some(path) = path else { break };
                process_file(&ctx, path).await;
            }
            debug!(worker, "worker stopped");
        }));
    }

    // Window GC timer.
    {
        let windows = windows.clone();
        let engine_slot = engine_slot.clone();
        let cancel = cancel.clone();
        let interval = cfg.state.windows.gc_interval;
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let engine = engine_slot.read().unwrap_or_else(|e| e.into_inner()).clone();
                match windows.gc(engine.correlations()) {
                    Ok(0) => {}
                    Ok(dropped) => debug!(dropped, "window GC"),
                    Err(e) => warn!(error = %e, "window GC failed"),
                }
            }
        }));
    }

    // Store compaction timer.
    {
        let store = store.clone();
        let cancel = cancel.clone();
        let interval = cfg.state.compact_interval;
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so startup stays fast.
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                match store.compact() {
                    Ok(()) => info!("state store compacted"),
                    Err(e) => warn!(error = %e, "compaction failed"),
                }
            }
        }));
    }

    // Rule hot-reload on SIGHUP: compile first, then swap atomically. A
    // broken rule file keeps the previous set running.
    #[cfg(unix)]
    {
        let engine_slot = engine_slot.clone();
        let rules_path = cfg.rules.path.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut hup = match signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "SIGHUP handler unavailable, hot reload disabled");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = hup.recv() => {
                        if received.is_none() {
                            break;
                        }
                    }
                }
                let result =
                    load_rules(&rules_path).and_then(|rs| Engine::compile(&rs, start_time));
                match result {
                    Ok(engine) => {
                        let (rules, correlations, baselines) = engine.rule_count();
                        info!(rules, correlations, baselines, "rule set reloaded");
                        *engine_slot.write().unwrap_or_else(|e| e.into_inner()) =
                            Arc::new(engine);
                    }
                    Err(e) => {
                        warn!(error = %e, "rule reload failed, keeping previous rule set");
                    }
                }
            }
        }));
    }

    for task in tasks {
        let _ = task.await;
    }

    info!("agent stopped");
    Ok(())
}

/// Decode one spool file and run every record through the detection
/// stages. Decode failures archive the file and continue; storage failures
/// are logged and never fatal for the process.
async fn process_file(ctx: &WorkerCtx, path: PathBuf) {
    let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

    let records = match ctx.decoder.decode_file_cancellable(&path, &ctx.cancel) {
        Ok(records) => records,
        Err(DecodeError::Cancelled) => return,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to decode spool file");
            finish_file(ctx, &path, size);
            return;
        }
    };

    debug!(path = %path.display(), records = records.len(), "decoded spool file");
    let engine = ctx
        .engine_slot
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone();

    for record in &records {
        let view = EventView::new(record);

        if view.is_execution() {
            ctx.lineage.upsert_from_execution(record);
        }

        for m in engine.evaluate(&view) {
            emit(ctx, ctx.generator.from_rule_match(&m, &view));
        }

        match ctx.windows.process(&view, engine.correlations()) {
            Ok(matches) => {
                for m in matches {
                    emit(ctx, ctx.generator.from_window_match(&m));
                }
            }
            Err(e) => warn!(error = %e, "correlation processing failed"),
        }

        match ctx.baselines.process(&view, engine.baselines(), &engine) {
            Ok(matches) => {
                for m in matches {
                    emit(ctx, ctx.generator.from_baseline_match(&m, &view));
                }
            }
            Err(e) => warn!(error = %e, "baseline processing failed"),
        }
    }

    finish_file(ctx, &path, size);
}

fn finish_file(ctx: &WorkerCtx, path: &std::path::Path, size: u64) {
    if let Err(e) = ctx.watcher.archive_file(path) {
        warn!(path = %path.display(), error = %e, "failed to archive spool file");
    }
    if let Err(e) = ctx.store.mark_processed(path, size) {
        warn!(path = %path.display(), error = %e, "failed to journal spool file");
    }
}

fn emit(ctx: &WorkerCtx, signal: Signal) {
    info!(
        rule_id = %signal.rule_id,
        severity = %signal.severity,
        title = %signal.title,
        signal_id = %signal.id,
        "signal"
    );
    if let Err(e) = ctx.shipper.enqueue(&signal) {
        warn!(signal_id = %signal.id, error = %e, "failed to enqueue signal");
    }
}
