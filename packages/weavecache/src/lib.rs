/*
 * Weavecache - Incremental Cache for Source Weaving Pipelines
 *
 * Per-project incremental caching and invalidation for an IDE-driven
 * source-to-source weaving pipeline.
 *
 * Architecture:
 * - Functional Pipeline State Machine (Default / Ready / NeedsExternalBuild)
 * - Snapshot Diffing + Change Classification
 * - Per-Unit Result Cache (targeted and global invalidation)
 * - External Build Handshake (touch artifact + filesystem watch)
 * - Query Orchestration (per-project serialization, cancellation-safe)
 */

// Public modules
pub mod change;
pub mod error;
pub mod handshake;
pub mod orchestrator;
pub mod result_cache;
pub mod state;
pub mod unit;
pub mod weaver;

// Re-exports
pub use change::{diff, ChangeKind, ChangeRecord, ChangeSet, RelevanceTransition};
pub use error::{PipelineError, Result};
pub use handshake::{BuildHandshake, HandshakeEvent};
pub use orchestrator::{
    OrchestratorConfig, ProjectPipeline, QueryMetrics, QueryOptions, QueryOutcome, QueryResponse,
    WeaveOrchestrator,
};
pub use result_cache::{InvalidationPlan, PerUnitResult, ResultCache};
pub use state::{AppliedChange, ConfigurationOutcome, PipelineState, PipelineStatus};
pub use unit::{
    Classification, CompilationSnapshot, ProjectId, RelevantSource, SourceUnit, UnitId,
};
pub use weaver::{
    AggregateWeaveResult, CancellationToken, Configuration, ConfigurationBuilder, Diagnostic,
    IntroducedArtifact, MarkerClassifier, RelevanceClassifier, Severity, Suppression,
    TransformationDescriptor, WeaveFailure, WeaveItem, Weaver,
};
