//! Bounded concurrent mode: several workers share one manifest.
//!
//! Workers claim runnable features through [`SharedManifest`], run one attempt
//! each and settle it exactly like the single-shot loop. Every state change is
//! persisted through one [`ManifestStore`], whose save lock keeps concurrent
//! snapshots from interleaving on disk. The run ends once nothing is runnable
//! and no attempt is in flight.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use anyhow::{Context, Result, anyhow};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::attempt::{
    AttemptEnv, archive_if_complete, log_settlement, log_started, run_attempt, settle,
};
use crate::core::escalation::{EscalationConfig, TrackerRegistry};
use crate::core::feature::Feature;
use crate::core::retry::AdjustmentRegistry;
use crate::core::selector::{NoWorkReport, classify_no_work};
use crate::core::shared::SharedManifest;
use crate::core::types::FeatureStatus;
use crate::exit_codes;
use crate::io::adjustments::{load_registry, save_registry};
use crate::io::config::AutopilotConfig;
use crate::io::executor::Executor;
use crate::io::init::ProjectPaths;
use crate::io::manifest_store::ManifestStore;
use crate::io::timeline::Timeline;

/// How a supervised run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct SuperviseReport {
    /// Attempts started across all workers.
    pub attempts: usize,
    /// Why nothing was left to run.
    pub finished: NoWorkReport,
    /// Features that ended failed.
    pub failed: Vec<String>,
    pub archived: Option<PathBuf>,
}

impl SuperviseReport {
    pub fn exit_code(&self) -> i32 {
        if self.failed.is_empty() {
            exit_codes::OK
        } else {
            exit_codes::FAILURE
        }
    }
}

struct Supervisor<'a, E: Executor> {
    paths: &'a ProjectPaths,
    executor: &'a E,
    store: ManifestStore,
    shared: SharedManifest,
    registry: AdjustmentRegistry,
    registry_save: Mutex<()>,
    timeline: Timeline,
    trackers: TrackerRegistry,
    escalation: EscalationConfig,
    config: &'a AutopilotConfig,
    in_flight: AtomicUsize,
    attempts: AtomicUsize,
    abort: AtomicBool,
}

impl<E: Executor + Sync> Supervisor<'_, E> {
    fn persist(&self) -> Result<()> {
        self.store.save_from(|| self.shared.snapshot())
    }

    fn worker(&self, worker: usize) -> Result<()> {
        loop {
            if self.abort.load(Ordering::SeqCst) {
                return Ok(());
            }
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let Some(feature) = self.shared.claim_next_runnable() else {
                if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                    debug!(worker, "nothing runnable and nothing in flight");
                    return Ok(());
                }
                thread::sleep(self.config.poll_interval());
                continue;
            };

            let handled = self.handle(worker, &feature);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if let Err(err) = handled {
                self.abort.store(true, Ordering::SeqCst);
                return Err(err);
            }
        }
    }

    fn handle(&self, worker: usize, feature: &Feature) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        info!(worker, feature_id = %feature.id, attempt = feature.attempts, model = %feature.model, "feature claimed");
        if let Err(err) = self.persist() {
            self.shared.update(&feature.id, |claimed| {
                claimed.status = FeatureStatus::Pending;
            })?;
            return Err(err);
        }
        log_started(&self.timeline, feature);

        let env = AttemptEnv {
            paths: self.paths,
            executor: self.executor,
            timeline: &self.timeline,
            trackers: &self.trackers,
            escalation: self.escalation.clone(),
            poll_interval: self.config.poll_interval(),
        };
        let result = run_attempt(&env, feature);
        let settlement = settle(feature, &result, &self.registry);
        let registry_saved = {
            let _guard = self.registry_save.lock();
            save_registry(&self.paths.adjustments_path, &self.registry)
        };

        self.shared
            .update(&feature.id, |persisted| settlement.apply(persisted))?;
        self.persist()?;
        log_settlement(&self.timeline, &feature.id, &settlement);
        info!(worker, feature_id = %feature.id, status = %settlement.status, "feature settled");
        registry_saved
    }
}

/// Run workers until nothing is runnable and nothing is in flight.
#[instrument(skip_all, fields(root = %paths.root.display(), max_parallel = config.max_parallel))]
pub fn run_supervise<E: Executor + Sync>(
    paths: &ProjectPaths,
    config: &AutopilotConfig,
    executor: &E,
) -> Result<SuperviseReport> {
    let store = ManifestStore::new(&paths.manifest_path);
    let manifest = store
        .load()
        .with_context(|| format!("load {}", paths.manifest_path.display()))?;
    let escalation = config.escalation_for(&manifest);
    let registry = load_registry(&paths.adjustments_path, config.retry.clone())?;

    let supervisor = Supervisor {
        paths,
        executor,
        store,
        shared: SharedManifest::new(manifest),
        registry,
        registry_save: Mutex::new(()),
        timeline: Timeline::new(&paths.timeline_path),
        trackers: TrackerRegistry::new(),
        escalation,
        config,
        in_flight: AtomicUsize::new(0),
        attempts: AtomicUsize::new(0),
        abort: AtomicBool::new(false),
    };

    let workers = config.max_parallel.max(1);
    let results: Vec<Result<()>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let supervisor = &supervisor;
                scope.spawn(move || supervisor.worker(worker))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("supervise worker panicked")))
            })
            .collect()
    });
    for result in results {
        result?;
    }

    let manifest = supervisor.shared.snapshot();
    let finished = classify_no_work(&manifest.features);
    let failed: Vec<String> = manifest
        .features
        .iter()
        .filter(|feature| feature.status == FeatureStatus::Failed)
        .map(|feature| feature.id.clone())
        .collect();
    if !failed.is_empty() {
        warn!(failed = ?failed, "supervise finished with failed features");
    }

    let archived = archive_if_complete(paths, &supervisor.timeline, &manifest)?;

    let attempts = supervisor.attempts.load(Ordering::SeqCst);
    info!(attempts, status = %finished.status, "supervise finished");
    Ok(SuperviseReport {
        attempts,
        finished,
        failed,
        archived,
    })
}
