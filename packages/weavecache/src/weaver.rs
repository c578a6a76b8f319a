//! Collaborator interfaces consumed by the cache layer.
//!
//! The weaver itself, the configuration builder and the relevance pre-check
//! live outside this crate; only their contracts are fixed here. Tests plug
//! in counting doubles through the same traits.

use crate::error::{PipelineError, Result};
use crate::unit::{CompilationSnapshot, RelevantSource, UnitId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Severity of a diagnostic produced by the weaver or the configuration
/// builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// A diagnostic tagged with the unit it originates from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub origin: UnitId,
    pub severity: Severity,
    pub code: String,
    pub message: String,
}

impl Diagnostic {
    pub fn error<C: Into<String>, M: Into<String>>(origin: UnitId, code: C, message: M) -> Self {
        Self {
            origin,
            severity: Severity::Error,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn warning<C: Into<String>, M: Into<String>>(origin: UnitId, code: C, message: M) -> Self {
        Self {
            origin,
            severity: Severity::Warning,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn info<C: Into<String>, M: Into<String>>(origin: UnitId, code: C, message: M) -> Self {
        Self {
            origin,
            severity: Severity::Info,
            code: code.into(),
            message: message.into(),
        }
    }
}

/// A diagnostic suppression declared in (or generated for) a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suppression {
    pub origin: UnitId,
    pub suppressed_code: String,
}

/// Generated/introduced code attributed to the unit that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntroducedArtifact {
    pub origin: UnitId,
    /// Identity under which the artifact would appear as a source unit.
    /// Units matching an introduced identity are excluded from dirty sets
    /// so generated output is never fed back as new input.
    pub artifact_id: UnitId,
    pub contents: String,
}

/// One item of an aggregate weaver result. Each variant carries the
/// originating unit explicitly; splitting into per-unit entries is a plain
/// grouping over this tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeaveItem {
    Diagnostic(Diagnostic),
    Suppression(Suppression),
    Introduced(IntroducedArtifact),
}

impl WeaveItem {
    pub fn origin(&self) -> &UnitId {
        match self {
            WeaveItem::Diagnostic(d) => &d.origin,
            WeaveItem::Suppression(s) => &s.origin,
            WeaveItem::Introduced(a) => &a.origin,
        }
    }
}

/// Aggregate output of one weaver execution over a batch of units.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateWeaveResult {
    pub items: Vec<WeaveItem>,
    /// (unit, depends-on) pairs observed while weaving the batch.
    pub dependencies: Vec<(UnitId, UnitId)>,
}

/// Weaver execution failure; surfaced per affected unit, never thrown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeaveFailure {
    pub diagnostics: Vec<Diagnostic>,
}

/// One transformation a declaration is eligible for under the current
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformationDescriptor {
    pub name: String,
    pub provider_unit: UnitId,
}

/// The derived configuration artifact. Opaque and expensive to build; the
/// cache layer tracks it by reference identity only (`Arc::ptr_eq`), never
/// by content.
pub trait Configuration: Send + Sync {
    fn eligible_transformations(&self, declaration: &str) -> Vec<TransformationDescriptor>;
}

/// Builds the configuration from the full relevant-unit set. Failure
/// returns ordinary diagnostics, not an error.
pub trait ConfigurationBuilder: Send + Sync {
    fn build(
        &self,
        relevant_units: &BTreeMap<UnitId, RelevantSource>,
        cancel: &CancellationToken,
    ) -> std::result::Result<Arc<dyn Configuration>, Vec<Diagnostic>>;
}

/// The external transformation engine. Must be a function of its inputs
/// only; may report partial diagnostics alongside success.
pub trait Weaver: Send + Sync {
    fn execute(
        &self,
        snapshot: &CompilationSnapshot,
        dirty_units: &BTreeSet<UnitId>,
        configuration: &Arc<dyn Configuration>,
        cancel: &CancellationToken,
    ) -> std::result::Result<AggregateWeaveResult, WeaveFailure>;
}

/// Cheap syntactic pre-check deciding whether a unit's content participates
/// in the derived configuration.
///
/// Hard contract: never under-approximate. Content that is actually
/// relevant must never be reported as irrelevant; false positives only cost
/// extra recomputation.
pub trait RelevanceClassifier: Send + Sync {
    fn is_relevant(&self, content: &str) -> bool;
}

/// Default over-approximating pre-check: a unit is relevant when its
/// content contains any of the configured marker tokens.
#[derive(Debug, Clone)]
pub struct MarkerClassifier {
    markers: Vec<String>,
}

impl MarkerClassifier {
    pub fn new(markers: Vec<String>) -> Self {
        Self { markers }
    }
}

impl Default for MarkerClassifier {
    fn default() -> Self {
        Self::new(vec!["[CompileTime]".to_string(), "[Transformer]".to_string()])
    }
}

impl RelevanceClassifier for MarkerClassifier {
    fn is_relevant(&self, content: &str) -> bool {
        self.markers.iter().any(|m| content.contains(m))
    }
}

/// Cooperative cancellation signal checked between per-unit steps.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}
