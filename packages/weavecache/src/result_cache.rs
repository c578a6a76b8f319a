//! Concurrent per-unit result cache and selective invalidation.
//!
//! Entries are `Arc`-held so repeated queries hand back reference-identical
//! results. Individual key updates are atomic (DashMap); cross-key
//! atomicity is provided by the orchestrator's per-pipeline lock, which
//! also defers invalidation until a query can actually recompute (see
//! `InvalidationPlan`).

use crate::change::{ChangeKind, ChangeSet};
use crate::unit::{CompilationSnapshot, UnitId};
use crate::weaver::{AggregateWeaveResult, Diagnostic, IntroducedArtifact, Suppression, WeaveItem};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Finalized weaver output for one unit.
///
/// Present for every unit ever submitted to the weaver, including units
/// that produced nothing: an explicit empty record distinguishes
/// "processed, nothing to report" from "not yet processed".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerUnitResult {
    pub diagnostics: Vec<Diagnostic>,
    pub suppressions: Vec<Suppression>,
    pub introduced_artifacts: Vec<IntroducedArtifact>,
    pub dependencies: Vec<UnitId>,
}

impl PerUnitResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
            && self.suppressions.is_empty()
            && self.introduced_artifacts.is_empty()
            && self.dependencies.is_empty()
    }
}

/// What a change set means for the cache. Computed up front so the actual
/// mutation can be deferred to commit time (cancellation must never leave
/// the cache partially updated, and a blocked query serves the old view).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationPlan {
    Keep,
    Remove(BTreeSet<UnitId>),
    /// Weaving semantics are global: a change to relevant code can alter
    /// the output of every unit.
    ClearAll,
}

impl InvalidationPlan {
    pub fn from_change_set(change_set: &ChangeSet) -> Self {
        if change_set.has_relevant_content_change || change_set.has_transitions() {
            return InvalidationPlan::ClearAll;
        }
        let removed: BTreeSet<UnitId> = change_set
            .records
            .iter()
            .filter(|r| matches!(r.kind, ChangeKind::Deleted | ChangeKind::Modified))
            .map(|r| r.id.clone())
            .collect();
        if removed.is_empty() {
            InvalidationPlan::Keep
        } else {
            InvalidationPlan::Remove(removed)
        }
    }

    /// Combine a plan that could not be applied yet with the next one.
    pub fn merge(self, other: InvalidationPlan) -> Self {
        match (self, other) {
            (InvalidationPlan::ClearAll, _) | (_, InvalidationPlan::ClearAll) => {
                InvalidationPlan::ClearAll
            }
            (InvalidationPlan::Keep, other) => other,
            (plan, InvalidationPlan::Keep) => plan,
            (InvalidationPlan::Remove(mut a), InvalidationPlan::Remove(b)) => {
                a.extend(b);
                InvalidationPlan::Remove(a)
            }
        }
    }

    /// Would a cache entry for `id` survive this plan?
    fn survives(&self, id: &UnitId) -> bool {
        match self {
            InvalidationPlan::Keep => true,
            InvalidationPlan::Remove(ids) => !ids.contains(id),
            InvalidationPlan::ClearAll => false,
        }
    }
}

/// Concurrent map from unit identity to finalized output.
#[derive(Debug, Default)]
pub struct ResultCache {
    results: DashMap<UnitId, Arc<PerUnitResult>>,
    /// Identities of weaver-introduced artifacts. Units matching one are
    /// excluded from dirty sets to avoid feedback loops where generated
    /// code is treated as new input.
    introduced: DashSet<UnitId>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &UnitId) -> Option<Arc<PerUnitResult>> {
        self.results.get(id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Merge freshly split per-unit entries, replacing any previous ones.
    pub fn set_many(&self, results: BTreeMap<UnitId, PerUnitResult>) {
        for (id, result) in results {
            for artifact in &result.introduced_artifacts {
                self.introduced.insert(artifact.artifact_id.clone());
            }
            self.results.insert(id, Arc::new(result));
        }
    }

    /// Apply a previously computed invalidation plan.
    pub fn invalidate(&self, plan: &InvalidationPlan) {
        match plan {
            InvalidationPlan::Keep => {}
            InvalidationPlan::Remove(ids) => {
                for id in ids {
                    self.results.remove(id);
                }
            }
            InvalidationPlan::ClearAll => self.clear(),
        }
    }

    pub fn clear(&self) {
        self.results.clear();
        self.introduced.clear();
    }

    /// The subset of `requested` that must be re-submitted to the weaver:
    /// units present in the snapshot whose entry does not survive `plan`,
    /// excluding self-generated weaver output.
    pub fn dirty_set(
        &self,
        requested: &[UnitId],
        snapshot: &CompilationSnapshot,
        plan: &InvalidationPlan,
    ) -> BTreeSet<UnitId> {
        requested
            .iter()
            .filter(|id| snapshot.contains(id))
            .filter(|id| !self.introduced.contains(*id))
            .filter(|id| !(plan.survives(id) && self.results.contains_key(*id)))
            .cloned()
            .collect()
    }
}

/// Split an aggregate weaver result into per-unit entries.
///
/// Every unit in `processed` receives an entry even when it produced
/// nothing; items whose origin lies outside the processed set (weaving is
/// global) are grouped under their origin as well.
pub fn split_aggregate(
    processed: &BTreeSet<UnitId>,
    aggregate: AggregateWeaveResult,
) -> BTreeMap<UnitId, PerUnitResult> {
    let mut by_unit: BTreeMap<UnitId, PerUnitResult> = processed
        .iter()
        .map(|id| (id.clone(), PerUnitResult::empty()))
        .collect();

    for item in aggregate.items {
        let entry = by_unit.entry(item.origin().clone()).or_default();
        match item {
            WeaveItem::Diagnostic(d) => entry.diagnostics.push(d),
            WeaveItem::Suppression(s) => entry.suppressions.push(s),
            WeaveItem::Introduced(a) => entry.introduced_artifacts.push(a),
        }
    }

    for (unit, depends_on) in aggregate.dependencies {
        by_unit.entry(unit).or_default().dependencies.push(depends_on);
    }

    by_unit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ChangeRecord, RelevanceTransition};
    use crate::unit::{Classification, SourceUnit};

    fn record(id: &str, kind: ChangeKind) -> ChangeRecord {
        ChangeRecord {
            id: UnitId::from(id),
            kind,
            transition: RelevanceTransition::None,
        }
    }

    fn snapshot(ids: &[&str]) -> CompilationSnapshot {
        CompilationSnapshot::new(
            ids.iter()
                .map(|id| SourceUnit::new(UnitId::from(*id), 1, Classification::NotRelevant)),
        )
    }

    fn seeded_cache(ids: &[&str]) -> ResultCache {
        let cache = ResultCache::new();
        cache.set_many(
            ids.iter()
                .map(|id| (UnitId::from(*id), PerUnitResult::empty()))
                .collect(),
        );
        cache
    }

    #[test]
    fn test_plan_keep_for_quiet_changes() {
        let cs = ChangeSet {
            records: vec![record("a.src", ChangeKind::Unchanged)],
            has_relevant_content_change: false,
        };
        assert_eq!(InvalidationPlan::from_change_set(&cs), InvalidationPlan::Keep);
    }

    #[test]
    fn test_plan_clears_all_on_relevant_content_change() {
        let cs = ChangeSet {
            records: vec![record("a.src", ChangeKind::Modified)],
            has_relevant_content_change: true,
        };
        assert_eq!(
            InvalidationPlan::from_change_set(&cs),
            InvalidationPlan::ClearAll
        );
    }

    #[test]
    fn test_plan_clears_all_on_transition() {
        let cs = ChangeSet {
            records: vec![ChangeRecord {
                id: UnitId::from("b.src"),
                kind: ChangeKind::Modified,
                transition: RelevanceTransition::BecameRelevant,
            }],
            has_relevant_content_change: false,
        };
        assert_eq!(
            InvalidationPlan::from_change_set(&cs),
            InvalidationPlan::ClearAll
        );
    }

    #[test]
    fn test_plan_removes_modified_and_deleted_only() {
        let cs = ChangeSet {
            records: vec![
                record("a.src", ChangeKind::Unchanged),
                record("b.src", ChangeKind::Modified),
                record("c.src", ChangeKind::Deleted),
                record("d.src", ChangeKind::Added),
            ],
            has_relevant_content_change: false,
        };
        match InvalidationPlan::from_change_set(&cs) {
            InvalidationPlan::Remove(ids) => {
                assert_eq!(ids.len(), 2);
                assert!(ids.contains(&UnitId::from("b.src")));
                assert!(ids.contains(&UnitId::from("c.src")));
            }
            other => panic!("expected Remove, got {:?}", other),
        }
    }

    #[test]
    fn test_plan_merge_clear_all_dominates() {
        let remove = InvalidationPlan::Remove([UnitId::from("a.src")].into());
        assert_eq!(
            remove.merge(InvalidationPlan::ClearAll),
            InvalidationPlan::ClearAll
        );
    }

    #[test]
    fn test_invalidate_removes_entries() {
        let cache = seeded_cache(&["a.src", "b.src"]);
        cache.invalidate(&InvalidationPlan::Remove([UnitId::from("a.src")].into()));
        assert!(cache.get(&UnitId::from("a.src")).is_none());
        assert!(cache.get(&UnitId::from("b.src")).is_some());
    }

    #[test]
    fn test_dirty_set_skips_cached_entries() {
        let cache = seeded_cache(&["a.src"]);
        let requested = vec![UnitId::from("a.src"), UnitId::from("b.src")];
        let dirty = cache.dirty_set(
            &requested,
            &snapshot(&["a.src", "b.src"]),
            &InvalidationPlan::Keep,
        );
        assert_eq!(dirty, [UnitId::from("b.src")].into());
    }

    #[test]
    fn test_dirty_set_respects_pending_plan() {
        let cache = seeded_cache(&["a.src", "b.src"]);
        let requested = vec![UnitId::from("a.src"), UnitId::from("b.src")];
        let dirty = cache.dirty_set(
            &requested,
            &snapshot(&["a.src", "b.src"]),
            &InvalidationPlan::Remove([UnitId::from("b.src")].into()),
        );
        assert_eq!(dirty, [UnitId::from("b.src")].into());
    }

    #[test]
    fn test_dirty_set_excludes_units_missing_from_snapshot() {
        let cache = ResultCache::new();
        let requested = vec![UnitId::from("a.src"), UnitId::from("gone.src")];
        let dirty = cache.dirty_set(&requested, &snapshot(&["a.src"]), &InvalidationPlan::Keep);
        assert_eq!(dirty, [UnitId::from("a.src")].into());
    }

    #[test]
    fn test_dirty_set_excludes_introduced_output() {
        let cache = ResultCache::new();
        let mut result = PerUnitResult::empty();
        result.introduced_artifacts.push(IntroducedArtifact {
            origin: UnitId::from("a.src"),
            artifact_id: UnitId::from("a.generated.src"),
            contents: "generated".to_string(),
        });
        cache.set_many([(UnitId::from("a.src"), result)].into());

        let requested = vec![UnitId::from("a.generated.src")];
        let dirty = cache.dirty_set(
            &requested,
            &snapshot(&["a.generated.src"]),
            &InvalidationPlan::Keep,
        );
        assert!(dirty.is_empty());
    }

    #[test]
    fn test_split_aggregate_groups_by_origin() {
        let a = UnitId::from("a.src");
        let b = UnitId::from("b.src");
        let processed: BTreeSet<UnitId> = [a.clone(), b.clone()].into();

        let aggregate = AggregateWeaveResult {
            items: vec![
                WeaveItem::Diagnostic(Diagnostic::warning(a.clone(), "W01", "check this")),
                WeaveItem::Suppression(Suppression {
                    origin: a.clone(),
                    suppressed_code: "W02".to_string(),
                }),
            ],
            dependencies: vec![(a.clone(), b.clone())],
        };

        let split = split_aggregate(&processed, aggregate);
        assert_eq!(split.len(), 2);

        let for_a = &split[&a];
        assert_eq!(for_a.diagnostics.len(), 1);
        assert_eq!(for_a.suppressions.len(), 1);
        assert_eq!(for_a.dependencies, vec![b.clone()]);

        // b produced nothing but still gets an explicit empty record.
        assert!(split[&b].is_empty());
    }

    #[test]
    fn test_set_many_replaces_entry() {
        let cache = seeded_cache(&["a.src"]);
        let before = cache.get(&UnitId::from("a.src")).unwrap();

        let mut replacement = PerUnitResult::empty();
        replacement
            .diagnostics
            .push(Diagnostic::error(UnitId::from("a.src"), "E01", "broken"));
        cache.set_many([(UnitId::from("a.src"), replacement)].into());

        let after = cache.get(&UnitId::from("a.src")).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.diagnostics.len(), 1);
    }
}
