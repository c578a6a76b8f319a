//! Change classification between two snapshots of the source graph.
//!
//! `diff` compares the previous snapshot (if any) with the next one and
//! produces a per-unit change list plus the aggregate
//! `has_relevant_content_change` flag that drives cache invalidation and
//! the external-build transition.

use crate::error::Result;
use crate::unit::{Classification, CompilationSnapshot, UnitId};
use crate::weaver::CancellationToken;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Deleted,
    Modified,
    Unchanged,
}

/// Relevance flip of one unit between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelevanceTransition {
    None,
    BecameRelevant,
    StoppedBeingRelevant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: UnitId,
    pub kind: ChangeKind,
    pub transition: RelevanceTransition,
}

impl ChangeRecord {
    fn new(id: UnitId, kind: ChangeKind, transition: RelevanceTransition) -> Self {
        Self {
            id,
            kind,
            transition,
        }
    }
}

/// Aggregate diff of one edit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    pub records: Vec<ChangeRecord>,
    /// True iff an already-tracked relevant unit's content changed while
    /// the unit stayed relevant: someone edited code that was part of the
    /// derived configuration's input.
    pub has_relevant_content_change: bool,
}

impl ChangeSet {
    pub fn has_transitions(&self) -> bool {
        self.records
            .iter()
            .any(|r| r.transition != RelevanceTransition::None)
    }

    /// Nothing that affects the configuration or the cached outputs of
    /// relevant code happened in this edit.
    pub fn is_quiet(&self) -> bool {
        !self.has_relevant_content_change && !self.has_transitions()
    }

    pub fn record_for(&self, id: &UnitId) -> Option<&ChangeRecord> {
        self.records.iter().find(|r| &r.id == id)
    }
}

/// Diff two snapshots into a `ChangeSet`.
///
/// With no previous snapshot every unit is `Added` and relevance comes from
/// the classification computed when the snapshot was built. A unit whose
/// version is unchanged but whose classification is `RelevantButStale` is
/// reported as `Modified`: its content changed even though the snapshot
/// does not carry the new text.
pub fn diff(
    previous: Option<&CompilationSnapshot>,
    next: &CompilationSnapshot,
    cancel: &CancellationToken,
) -> Result<ChangeSet> {
    let mut records = Vec::with_capacity(next.len());
    let mut has_relevant_content_change = false;

    for unit in next.units() {
        cancel.check()?;

        let prev = previous.and_then(|p| p.get(&unit.id));
        match prev {
            None => {
                let transition = if unit.is_relevant() {
                    RelevanceTransition::BecameRelevant
                } else {
                    RelevanceTransition::None
                };
                records.push(ChangeRecord::new(unit.id.clone(), ChangeKind::Added, transition));
            }
            Some(prev) => {
                let was_relevant = prev.is_relevant();
                let is_relevant = unit.is_relevant();

                let content_changed = unit.version != prev.version
                    || unit.classification == Classification::RelevantButStale;
                let kind = if content_changed {
                    ChangeKind::Modified
                } else {
                    ChangeKind::Unchanged
                };

                let transition = match (was_relevant, is_relevant) {
                    (false, true) => RelevanceTransition::BecameRelevant,
                    (true, false) => RelevanceTransition::StoppedBeingRelevant,
                    _ => RelevanceTransition::None,
                };

                if kind == ChangeKind::Modified && was_relevant && is_relevant {
                    has_relevant_content_change = true;
                }

                records.push(ChangeRecord::new(unit.id.clone(), kind, transition));
            }
        }
    }

    if let Some(previous) = previous {
        for prev in previous.units() {
            cancel.check()?;
            if !next.contains(&prev.id) {
                let transition = if prev.is_relevant() {
                    RelevanceTransition::StoppedBeingRelevant
                } else {
                    RelevanceTransition::None
                };
                records.push(ChangeRecord::new(
                    prev.id.clone(),
                    ChangeKind::Deleted,
                    transition,
                ));
            }
        }
    }

    Ok(ChangeSet {
        records,
        has_relevant_content_change,
    })
}
