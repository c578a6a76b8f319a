//! Pipeline orchestrator.
//!
//! Owns one pipeline per project, lazily created and debounced. All queries
//! for one project are serialized by a per-pipeline lock; unrelated
//! projects proceed concurrently. The external-build signal arrives as a
//! message on a channel consumed by a dedicated thread, which fans the
//! reset out to every pipeline without ever invoking callbacks under a
//! pipeline lock.

use crate::change::{self, ChangeKind, ChangeSet};
use crate::error::{PipelineError, Result};
use crate::handshake::{bump_mtime, BuildHandshake, HandshakeEvent};
use crate::result_cache::{split_aggregate, InvalidationPlan, PerUnitResult, ResultCache};
use crate::state::{ConfigurationOutcome, PipelineState, PipelineStatus};
use crate::unit::{CompilationSnapshot, ProjectId, UnitId};
use crate::weaver::{
    CancellationToken, ConfigurationBuilder, Diagnostic, TransformationDescriptor, Weaver,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Delay held under the creation lock so the burst of near-simultaneous
    /// queries issued when an IDE opens a solution collapses into a single
    /// pipeline initialization. Trades first-query latency for avoiding
    /// redundant configuration builds.
    pub creation_debounce: Duration,
    /// Well-known path of the external build tool's touch artifact. The
    /// handshake is disabled when unset.
    pub touch_artifact: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            creation_debounce: Duration::from_secs(5),
            touch_artifact: None,
        }
    }
}

/// Per-query options.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Explicit reset: run even while the pipeline needs an external build.
    pub ignore_needs_external_build: bool,
    pub cancel: CancellationToken,
}

/// How the query was answered. `Blocked` and `ConfigurationFailed` are
/// normal signals, not errors: cached results are still served.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Fresh,
    Blocked,
    ConfigurationFailed(Vec<Diagnostic>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryMetrics {
    pub units_requested: usize,
    pub dirty_units: usize,
    pub served_from_cache: usize,
    pub weaver_invocations: usize,
    pub duration_ms: u64,
}

/// Result of one query: the requested units' cached entries (absent keys
/// were never processed or no longer exist) plus the stale-unit annotation.
#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub outcome: QueryOutcome,
    pub results: BTreeMap<UnitId, Arc<PerUnitResult>>,
    /// Relevant units whose content is out of date ("unsaved compile-time
    /// changes").
    pub stale_units: Vec<UnitId>,
    pub metrics: QueryMetrics,
}

struct PipelineInner {
    state: PipelineState,
    previous_snapshot: Option<CompilationSnapshot>,
    cache: ResultCache,
    /// Invalidation that could not be applied yet because the query that
    /// observed the change was blocked or failed to build a configuration.
    /// Applied by the next query that actually recomputes.
    pending_invalidation: InvalidationPlan,
}

/// One project's pipeline: the functional state plus its result cache,
/// guarded by a single query lock.
pub struct ProjectPipeline {
    project: ProjectId,
    inner: Mutex<PipelineInner>,
    /// Published copy of the current state for lock-free introspection.
    published: RwLock<PipelineState>,
}

impl ProjectPipeline {
    fn new(project: ProjectId) -> Self {
        Self {
            project,
            inner: Mutex::new(PipelineInner {
                state: PipelineState::new(),
                previous_snapshot: None,
                cache: ResultCache::new(),
                pending_invalidation: InvalidationPlan::Keep,
            }),
            published: RwLock::new(PipelineState::new()),
        }
    }

    pub fn project(&self) -> &ProjectId {
        &self.project
    }

    pub fn status(&self) -> PipelineStatus {
        self.published.read().status()
    }

    fn publish(&self, state: &PipelineState) {
        *self.published.write() = state.clone();
    }

    /// Reset after a completed external build: the rebuild produced a
    /// consistent new configuration that invalidates everything cached
    /// under the stale one. Stale units get their mtime bumped first so the
    /// IDE re-requests analysis for them.
    fn reset_after_external_build(&self) {
        let mut inner = self.inner.lock();
        for id in inner.state.stale_units() {
            let path = Path::new(id.as_str());
            if path.exists() {
                bump_mtime(path);
            }
        }
        inner.state = inner.state.reset();
        inner.cache.clear();
        inner.pending_invalidation = InvalidationPlan::Keep;
        let state = inner.state.clone();
        drop(inner);
        self.publish(&state);
        info!(project = %self.project, "pipeline reset after external build");
    }
}

struct OrchestratorShared {
    config: OrchestratorConfig,
    builder: Arc<dyn ConfigurationBuilder>,
    weaver: Arc<dyn Weaver>,
    pipelines: RwLock<HashMap<ProjectId, Arc<ProjectPipeline>>>,
    handshake: Option<BuildHandshake>,
}

impl OrchestratorShared {
    fn reset_all_pipelines(&self) {
        let pipelines: Vec<_> = self.pipelines.read().values().cloned().collect();
        info!(pipelines = pipelines.len(), "external build signal: resetting pipelines");
        for pipeline in pipelines {
            pipeline.reset_after_external_build();
        }
    }
}

/// The cache layer's entry point. Tests construct their own instance; there
/// are no ambient singletons.
pub struct WeaveOrchestrator {
    shared: Arc<OrchestratorShared>,
    // Detached consumer of the external-build channel; exits when the
    // watcher (and with it the channel sender) is dropped.
    _listener: Option<JoinHandle<()>>,
}

impl WeaveOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        builder: Arc<dyn ConfigurationBuilder>,
        weaver: Arc<dyn Weaver>,
    ) -> Self {
        let handshake = config.touch_artifact.clone().map(BuildHandshake::new);
        let shared = Arc::new(OrchestratorShared {
            config,
            builder,
            weaver,
            pipelines: RwLock::new(HashMap::new()),
            handshake,
        });

        let listener = shared.handshake.as_ref().and_then(|handshake| {
            let (tx, rx) = mpsc::channel();
            match handshake.watch(tx) {
                Ok(()) => Some(Self::spawn_build_listener(Arc::downgrade(&shared), rx)),
                // Degradation already reported by the handshake; the
                // project stays recoverable through override queries.
                Err(_) => None,
            }
        });

        Self {
            shared,
            _listener: listener,
        }
    }

    fn spawn_build_listener(
        shared: Weak<OrchestratorShared>,
        rx: mpsc::Receiver<HandshakeEvent>,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            while let Ok(HandshakeEvent::BuildCompleted) = rx.recv() {
                match shared.upgrade() {
                    Some(shared) => shared.reset_all_pipelines(),
                    None => break,
                }
            }
        })
    }

    /// Locate or create the project's pipeline. Creation is double-checked
    /// under the registry lock so concurrent first-queries collapse into a
    /// single instance; the creating thread sleeps the configured debounce
    /// while holding the lock, threads observing an existing pipeline
    /// proceed immediately.
    pub fn get_or_create(&self, project: &ProjectId) -> Arc<ProjectPipeline> {
        if let Some(pipeline) = self.shared.pipelines.read().get(project) {
            return pipeline.clone();
        }

        let mut pipelines = self.shared.pipelines.write();
        if let Some(pipeline) = pipelines.get(project) {
            return pipeline.clone();
        }

        if !self.shared.config.creation_debounce.is_zero() {
            debug!(
                project = %project,
                delay_ms = self.shared.config.creation_debounce.as_millis() as u64,
                "debouncing pipeline creation"
            );
            thread::sleep(self.shared.config.creation_debounce);
        }

        let pipeline = Arc::new(ProjectPipeline::new(project.clone()));
        pipelines.insert(project.clone(), pipeline.clone());
        info!(project = %project, "pipeline created");
        pipeline
    }

    /// Current status of a project's pipeline, read lock-free from the
    /// published state. `None` for unknown projects.
    pub fn status(&self, project: &ProjectId) -> Option<PipelineStatus> {
        self.shared
            .pipelines
            .read()
            .get(project)
            .map(|p| p.status())
    }

    /// Transformations a declaration is eligible for under the current
    /// configuration; empty unless the pipeline is `Ready`.
    pub fn eligible_transformations(
        &self,
        project: &ProjectId,
        declaration: &str,
    ) -> Vec<TransformationDescriptor> {
        let pipeline = match self.shared.pipelines.read().get(project) {
            Some(pipeline) => pipeline.clone(),
            None => return vec![],
        };
        let state = pipeline.published.read();
        if state.status() != PipelineStatus::Ready {
            return vec![];
        }
        state
            .configuration()
            .map(|c| c.eligible_transformations(declaration))
            .unwrap_or_default()
    }

    /// Broadcast "an external rebuild completed" to every tracked pipeline.
    /// Also reachable from the filesystem handshake.
    pub fn notify_external_build_started(&self) {
        self.shared.reset_all_pipelines();
    }

    pub fn handshake_available(&self) -> bool {
        self.shared
            .handshake
            .as_ref()
            .map_or(false, |h| h.is_available())
    }

    /// Run one query: classify the edit, transition the pipeline state,
    /// re-weave the dirty subset and read the requested units back from the
    /// cache. Holds the per-pipeline lock for the full duration.
    ///
    /// State and cache writes are committed only after the corresponding
    /// computation fully succeeds; cancellation leaves both untouched.
    pub fn run_query(
        &self,
        project: &ProjectId,
        snapshot: &CompilationSnapshot,
        requested: &[UnitId],
        options: &QueryOptions,
    ) -> Result<QueryResponse> {
        let start = Instant::now();
        let query_id = Uuid::new_v4();
        let cancel = &options.cancel;

        let pipeline = self.get_or_create(project);
        let mut inner = pipeline.inner.lock();

        debug!(%query_id, project = %project, units = requested.len(), "query started");

        let change_set = change::diff(inner.previous_snapshot.as_ref(), snapshot, cancel)?;
        check_tracked_units(&inner.state, snapshot, &change_set)?;

        let applied = inner.state.apply_change(&change_set, snapshot)?;
        let plan = inner
            .pending_invalidation
            .clone()
            .merge(InvalidationPlan::from_change_set(&change_set));
        let dirty = inner.cache.dirty_set(requested, snapshot, &plan);

        let (next_state, configuration_outcome) = applied.next.get_or_build_configuration(
            snapshot,
            &*self.shared.builder,
            cancel,
            options.ignore_needs_external_build,
        )?;

        let mut weaver_invocations = 0;
        let outcome = match configuration_outcome {
            ConfigurationOutcome::Blocked => {
                // Serve the cached view unchanged; the invalidation stays
                // pending until a query can actually recompute.
                inner.pending_invalidation = plan.clone();
                warn!(%query_id, project = %project, "query blocked: external build required");
                QueryOutcome::Blocked
            }
            ConfigurationOutcome::Failed(diagnostics) => {
                inner.pending_invalidation = plan.clone();
                warn!(
                    %query_id,
                    diagnostics = diagnostics.len(),
                    "configuration build failed"
                );
                QueryOutcome::ConfigurationFailed(diagnostics)
            }
            ConfigurationOutcome::Ready(configuration) => {
                let mut merged: BTreeMap<UnitId, PerUnitResult> = BTreeMap::new();
                if !dirty.is_empty() {
                    cancel.check()?;
                    weaver_invocations = 1;
                    match self
                        .shared
                        .weaver
                        .execute(snapshot, &dirty, &configuration, cancel)
                    {
                        Ok(aggregate) => merged = split_aggregate(&dirty, aggregate),
                        Err(failure) => {
                            // Surfaced per affected unit; units without
                            // diagnostics stay uncached and are retried.
                            warn!(
                                %query_id,
                                diagnostics = failure.diagnostics.len(),
                                "weaver execution failed"
                            );
                            for diagnostic in failure.diagnostics {
                                merged
                                    .entry(diagnostic.origin.clone())
                                    .or_default()
                                    .diagnostics
                                    .push(diagnostic);
                            }
                        }
                    }
                }
                inner.cache.invalidate(&plan);
                inner.cache.set_many(merged);
                inner.pending_invalidation = InvalidationPlan::Keep;
                QueryOutcome::Fresh
            }
        };

        // Commit point: everything below is bookkeeping, no fallible
        // computation remains.
        if applied.clear_build_signal {
            if let Some(handshake) = &self.shared.handshake {
                handshake.clear_signal();
            }
        }
        inner.state = next_state;
        inner.previous_snapshot = Some(snapshot.clone());

        let results: BTreeMap<UnitId, Arc<PerUnitResult>> = requested
            .iter()
            .filter_map(|id| inner.cache.get(id).map(|r| (id.clone(), r)))
            .collect();
        let stale_units = inner.state.stale_units();
        let published = inner.state.clone();
        drop(inner);
        pipeline.publish(&published);

        let served_from_cache = results.keys().filter(|id| !dirty.contains(id)).count();
        let metrics = QueryMetrics {
            units_requested: requested.len(),
            dirty_units: dirty.len(),
            served_from_cache,
            weaver_invocations,
            duration_ms: start.elapsed().as_millis() as u64,
        };

        info!(
            %query_id,
            project = %project,
            outcome = outcome_name(&outcome),
            dirty = metrics.dirty_units,
            cached = metrics.served_from_cache,
            duration_ms = metrics.duration_ms,
            "query finished"
        );

        Ok(QueryResponse {
            outcome,
            results,
            stale_units,
            metrics,
        })
    }
}

fn outcome_name(outcome: &QueryOutcome) -> &'static str {
    match outcome {
        QueryOutcome::Fresh => "fresh",
        QueryOutcome::Blocked => "blocked",
        QueryOutcome::ConfigurationFailed(_) => "configuration_failed",
    }
}

/// A tracked relevant unit vanishing from the snapshot without a deletion
/// record means the classifier and the state drifted apart: a programming
/// error, not a recoverable condition.
fn check_tracked_units(
    state: &PipelineState,
    snapshot: &CompilationSnapshot,
    change_set: &ChangeSet,
) -> Result<()> {
    for id in state.relevant_units().keys() {
        if !snapshot.contains(id)
            && !change_set
                .records
                .iter()
                .any(|r| &r.id == id && r.kind == ChangeKind::Deleted)
        {
            return Err(PipelineError::invariant(format!(
                "tracked relevant unit {} vanished without a deletion record",
                id
            )));
        }
    }
    Ok(())
}
