//! Data model for source units and edit snapshots.
//!
//! A `SourceUnit` is one file/module-sized piece of the program with a
//! content version and a relevance classification. A `CompilationSnapshot`
//! is the immutable view of the whole program after one edit; the caller
//! owns it and the cache layer borrows it for the duration of one query.

use crate::weaver::RelevanceClassifier;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Stable identity of one source unit (path or module name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId(String);

impl UnitId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UnitId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Project identity used to key pipelines in the orchestrator registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Relevance classification of one unit's current content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// The unit does not participate in the derived configuration.
    NotRelevant,
    /// Relevant; carries the relevant-content snapshot.
    Relevant(Arc<str>),
    /// Known relevant, but the relevant-content snapshot is out of date
    /// (e.g. unsaved editor buffer). Lets the layer report "you have
    /// unsaved compile-time changes" without having the content.
    RelevantButStale,
}

impl Classification {
    pub fn is_relevant(&self) -> bool {
        !matches!(self, Classification::NotRelevant)
    }
}

/// One source unit as seen by a single snapshot.
#[derive(Debug, Clone)]
pub struct SourceUnit {
    pub id: UnitId,
    /// Monotonic content version (editor text version or content hash).
    pub version: u64,
    pub classification: Classification,
}

impl SourceUnit {
    pub fn new(id: UnitId, version: u64, classification: Classification) -> Self {
        Self {
            id,
            version,
            classification,
        }
    }

    /// Classify `content` with the pluggable relevance pre-check and build
    /// the unit. The pre-check over-approximates; it must never report a
    /// genuinely relevant unit as `NotRelevant`.
    pub fn classified(
        id: UnitId,
        version: u64,
        content: &str,
        classifier: &dyn RelevanceClassifier,
    ) -> Self {
        let classification = if classifier.is_relevant(content) {
            Classification::Relevant(Arc::from(content))
        } else {
            Classification::NotRelevant
        };
        Self::new(id, version, classification)
    }

    /// A unit known to be relevant whose fresh content is unavailable.
    pub fn stale(id: UnitId, version: u64) -> Self {
        Self::new(id, version, Classification::RelevantButStale)
    }

    pub fn is_relevant(&self) -> bool {
        self.classification.is_relevant()
    }
}

/// Immutable collection of source units representing one edit of the whole
/// program. Constructed once per edit and discarded when the query ends.
#[derive(Debug, Clone, Default)]
pub struct CompilationSnapshot {
    units: BTreeMap<UnitId, SourceUnit>,
}

impl CompilationSnapshot {
    pub fn new<I: IntoIterator<Item = SourceUnit>>(units: I) -> Self {
        Self {
            units: units.into_iter().map(|u| (u.id.clone(), u)).collect(),
        }
    }

    pub fn get(&self, id: &UnitId) -> Option<&SourceUnit> {
        self.units.get(id)
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.units.contains_key(id)
    }

    pub fn units(&self) -> impl Iterator<Item = &SourceUnit> {
        self.units.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &UnitId> {
        self.units.keys()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Cached relevant-content entry tracked by the pipeline state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelevantSource {
    /// Content matching what the current configuration was built from.
    Fresh(Arc<str>),
    /// The unit's content changed after the configuration was built.
    Stale,
}

impl RelevantSource {
    pub fn is_stale(&self) -> bool {
        matches!(self, RelevantSource::Stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weaver::MarkerClassifier;

    #[test]
    fn test_classified_relevant() {
        let classifier = MarkerClassifier::new(vec!["[CompileTime]".to_string()]);
        let unit = SourceUnit::classified(
            UnitId::from("a.src"),
            1,
            "[CompileTime] struct A;",
            &classifier,
        );
        assert!(unit.is_relevant());
        match unit.classification {
            Classification::Relevant(content) => {
                assert_eq!(&*content, "[CompileTime] struct A;")
            }
            other => panic!("expected Relevant, got {:?}", other),
        }
    }

    #[test]
    fn test_classified_not_relevant() {
        let classifier = MarkerClassifier::new(vec!["[CompileTime]".to_string()]);
        let unit = SourceUnit::classified(UnitId::from("b.src"), 1, "struct B;", &classifier);
        assert!(!unit.is_relevant());
    }

    #[test]
    fn test_stale_unit_is_relevant() {
        let unit = SourceUnit::stale(UnitId::from("a.src"), 2);
        assert!(unit.is_relevant());
        assert_eq!(unit.classification, Classification::RelevantButStale);
    }

    #[test]
    fn test_snapshot_lookup() {
        let snapshot = CompilationSnapshot::new(vec![
            SourceUnit::new(UnitId::from("a.src"), 1, Classification::NotRelevant),
            SourceUnit::new(UnitId::from("b.src"), 3, Classification::NotRelevant),
        ]);
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains(&UnitId::from("a.src")));
        assert_eq!(snapshot.get(&UnitId::from("b.src")).unwrap().version, 3);
        assert!(snapshot.get(&UnitId::from("c.src")).is_none());
    }
}
