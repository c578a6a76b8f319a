//! Pipeline state machine.
//!
//! `PipelineState` is an immutable value: every transition is a pure
//! function producing a new state, published by the orchestrator under its
//! per-pipeline lock. Readers snapshot by cloning; the `Arc`-held
//! configuration and contents make that cheap.
//!
//! Status semantics: the configuration is compiled from the full
//! relevant-unit set into a derived module loaded into the running process.
//! A loaded module cannot be hot-modified, so editing the *content* of an
//! already-relevant unit forces a real out-of-process rebuild
//! (`NeedsExternalBuild`). A unit merely starting or stopping to be
//! relevant only needs a fresh in-process build: state resets to `Default`
//! and the next configuration request rebuilds from scratch.

use crate::change::{ChangeKind, ChangeSet, RelevanceTransition};
use crate::error::{PipelineError, Result};
use crate::unit::{Classification, CompilationSnapshot, RelevantSource, UnitId};
use crate::weaver::{CancellationToken, Configuration, ConfigurationBuilder, Diagnostic};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStatus {
    /// No valid configuration; the next request builds one in-process.
    Default,
    /// Configuration built and consistent with the last-seen relevant-unit
    /// set.
    Ready,
    /// Relevant content changed under a loaded configuration; only an
    /// out-of-process rebuild can produce a safe new one.
    NeedsExternalBuild,
}

/// Result of `apply_change`: the successor state plus whether the touch
/// artifact's stale "already built" signal must be cleared (set exactly on
/// the `Ready -> NeedsExternalBuild` edge).
#[derive(Clone)]
pub struct AppliedChange {
    pub next: PipelineState,
    pub clear_build_signal: bool,
}

/// Outcome of a configuration request.
pub enum ConfigurationOutcome {
    Ready(Arc<dyn Configuration>),
    /// Status is `NeedsExternalBuild` and the caller did not override.
    /// Normal signal, not an error: serve cached results and prompt for a
    /// rebuild.
    Blocked,
    /// The builder failed; state stays `Default` and the build is retried
    /// on the next query.
    Failed(Vec<Diagnostic>),
}

#[derive(Clone, Default)]
pub struct PipelineState {
    relevant_units: BTreeMap<UnitId, RelevantSource>,
    configuration: Option<Arc<dyn Configuration>>,
    status: PipelineStatus,
}

impl Default for PipelineStatus {
    fn default() -> Self {
        PipelineStatus::Default
    }
}

impl fmt::Debug for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineState")
            .field("relevant_units", &self.relevant_units.keys())
            .field("configuration", &self.configuration.is_some())
            .field("status", &self.status)
            .finish()
    }
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> PipelineStatus {
        self.status
    }

    pub fn configuration(&self) -> Option<&Arc<dyn Configuration>> {
        self.configuration.as_ref()
    }

    pub fn relevant_units(&self) -> &BTreeMap<UnitId, RelevantSource> {
        &self.relevant_units
    }

    /// Units whose cached relevant content is out of date.
    pub fn stale_units(&self) -> Vec<UnitId> {
        self.relevant_units
            .iter()
            .filter(|(_, src)| src.is_stale())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Apply one edit's change set, producing the successor state.
    ///
    /// A quiet change set returns the state untouched. Otherwise:
    /// - content edit of a tracked relevant unit marks it stale and, from
    ///   `Ready`, moves to `NeedsExternalBuild` (requesting a signal clear);
    /// - a relevance flip inserts/removes the unit and, from `Ready`, drops
    ///   the configuration and resets to `Default`.
    pub fn apply_change(
        &self,
        change_set: &ChangeSet,
        snapshot: &CompilationSnapshot,
    ) -> Result<AppliedChange> {
        if change_set.is_quiet() {
            return Ok(AppliedChange {
                next: self.clone(),
                clear_build_signal: false,
            });
        }

        let mut next = self.clone();
        let mut clear_build_signal = false;

        for record in &change_set.records {
            match record.transition {
                RelevanceTransition::None => {
                    if record.kind == ChangeKind::Modified
                        && next.relevant_units.contains_key(&record.id)
                    {
                        next.relevant_units
                            .insert(record.id.clone(), RelevantSource::Stale);
                        if next.status == PipelineStatus::Ready {
                            next.status = PipelineStatus::NeedsExternalBuild;
                            clear_build_signal = true;
                        }
                    }
                }
                RelevanceTransition::BecameRelevant => {
                    let source = match snapshot.get(&record.id).map(|u| &u.classification) {
                        Some(Classification::Relevant(content)) => {
                            RelevantSource::Fresh(content.clone())
                        }
                        Some(Classification::RelevantButStale) => RelevantSource::Stale,
                        Some(Classification::NotRelevant) | None => {
                            return Err(PipelineError::invariant(format!(
                                "unit {} became relevant but the snapshot disagrees",
                                record.id
                            )));
                        }
                    };
                    next.relevant_units.insert(record.id.clone(), source);
                    next.reset_for_reconfiguration();
                }
                RelevanceTransition::StoppedBeingRelevant => {
                    next.relevant_units.remove(&record.id);
                    next.reset_for_reconfiguration();
                }
            }
        }

        Ok(AppliedChange {
            next,
            clear_build_signal,
        })
    }

    // Ready -> Default on a relevance flip: nothing loaded needs to change,
    // a fresh in-process build from the updated relevant set is safe.
    fn reset_for_reconfiguration(&mut self) {
        if self.status == PipelineStatus::Ready {
            self.status = PipelineStatus::Default;
            self.configuration = None;
        }
    }

    /// Full reset: used for the explicit ignore-status override and when an
    /// external build completes. Stale marks are kept until the next
    /// successful query refreshes them from a snapshot.
    pub fn reset(&self) -> Self {
        let mut next = self.clone();
        next.status = PipelineStatus::Default;
        next.configuration = None;
        next
    }

    /// Upgrade stale relevant-content entries from the snapshot where fresh
    /// content is available.
    fn refresh_from_snapshot(&mut self, snapshot: &CompilationSnapshot) {
        for (id, source) in self.relevant_units.iter_mut() {
            if source.is_stale() {
                if let Some(Classification::Relevant(content)) =
                    snapshot.get(id).map(|u| &u.classification)
                {
                    *source = RelevantSource::Fresh(content.clone());
                }
            }
        }
    }

    /// Return the cached configuration (reference-identical across calls,
    /// the property that makes repeated queries cheap) or build it from the
    /// full relevant-unit set.
    ///
    /// `allow_when_needs_external_build` is the explicit override: it
    /// resets the state to `Default` first instead of blocking.
    pub fn get_or_build_configuration(
        &self,
        snapshot: &CompilationSnapshot,
        builder: &dyn ConfigurationBuilder,
        cancel: &CancellationToken,
        allow_when_needs_external_build: bool,
    ) -> Result<(PipelineState, ConfigurationOutcome)> {
        if self.status == PipelineStatus::NeedsExternalBuild {
            if !allow_when_needs_external_build {
                return Ok((self.clone(), ConfigurationOutcome::Blocked));
            }
            tracing::info!("ignore-status override: resetting pipeline state");
        }

        let mut next = if self.status == PipelineStatus::NeedsExternalBuild {
            self.reset()
        } else {
            self.clone()
        };
        next.refresh_from_snapshot(snapshot);

        if let Some(configuration) = &next.configuration {
            let configuration = configuration.clone();
            return Ok((next, ConfigurationOutcome::Ready(configuration)));
        }

        cancel.check()?;
        match builder.build(&next.relevant_units, cancel) {
            Ok(configuration) => {
                next.configuration = Some(configuration.clone());
                next.status = PipelineStatus::Ready;
                Ok((next, ConfigurationOutcome::Ready(configuration)))
            }
            // Build failure leaves the state untouched; diagnostics go back
            // to the caller and the build is retried on the next query.
            Err(diagnostics) => Ok((self.clone(), ConfigurationOutcome::Failed(diagnostics))),
        }
    }
}
