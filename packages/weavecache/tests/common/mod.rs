//! Shared test doubles: a counting configuration builder and a counting
//! weaver so tests can assert exactly how much work a query performed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use weavecache::{
    AggregateWeaveResult, CancellationToken, CompilationSnapshot, Configuration,
    ConfigurationBuilder, Diagnostic, MarkerClassifier, OrchestratorConfig, RelevantSource,
    SourceUnit, TransformationDescriptor, UnitId, WeaveFailure, WeaveItem, WeaveOrchestrator,
    Weaver,
};

pub const MARKER: &str = "[CompileTime]";

pub struct TestConfiguration {
    transformations: Vec<TransformationDescriptor>,
}

impl Configuration for TestConfiguration {
    fn eligible_transformations(&self, _declaration: &str) -> Vec<TransformationDescriptor> {
        self.transformations.clone()
    }
}

/// Builder double counting how many real configuration builds happened.
pub struct CountingBuilder {
    pub builds: AtomicUsize,
}

impl CountingBuilder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            builds: AtomicUsize::new(0),
        })
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl ConfigurationBuilder for CountingBuilder {
    fn build(
        &self,
        relevant_units: &BTreeMap<UnitId, RelevantSource>,
        _cancel: &CancellationToken,
    ) -> Result<Arc<dyn Configuration>, Vec<Diagnostic>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let transformations = relevant_units
            .keys()
            .map(|id| TransformationDescriptor {
                name: format!("transform:{}", id),
                provider_unit: id.clone(),
            })
            .collect();
        Ok(Arc::new(TestConfiguration { transformations }))
    }
}

/// Weaver double recording every dirty set it was invoked with and emitting
/// one info diagnostic per dirty unit.
pub struct CountingWeaver {
    pub invocations: AtomicUsize,
    pub last_dirty: Mutex<Option<BTreeSet<UnitId>>>,
}

impl CountingWeaver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            invocations: AtomicUsize::new(0),
            last_dirty: Mutex::new(None),
        })
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn last_dirty(&self) -> Option<BTreeSet<UnitId>> {
        self.last_dirty.lock().clone()
    }
}

impl Weaver for CountingWeaver {
    fn execute(
        &self,
        _snapshot: &CompilationSnapshot,
        dirty_units: &BTreeSet<UnitId>,
        _configuration: &Arc<dyn Configuration>,
        _cancel: &CancellationToken,
    ) -> Result<AggregateWeaveResult, WeaveFailure> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        *self.last_dirty.lock() = Some(dirty_units.clone());
        Ok(AggregateWeaveResult {
            items: dirty_units
                .iter()
                .map(|id| WeaveItem::Diagnostic(Diagnostic::info(id.clone(), "WEV001", "woven")))
                .collect(),
            dependencies: vec![],
        })
    }
}

pub fn classifier() -> MarkerClassifier {
    MarkerClassifier::new(vec![MARKER.to_string()])
}

pub fn relevant_unit(id: &str, version: u64) -> SourceUnit {
    SourceUnit::classified(
        UnitId::from(id),
        version,
        &format!("{} transformer body", MARKER),
        &classifier(),
    )
}

pub fn plain_unit(id: &str, version: u64) -> SourceUnit {
    SourceUnit::classified(UnitId::from(id), version, "plain body", &classifier())
}

pub fn unit_ids(names: &[&str]) -> Vec<UnitId> {
    names.iter().map(|n| UnitId::from(*n)).collect()
}

pub fn orchestrator(
    touch_artifact: Option<std::path::PathBuf>,
) -> (WeaveOrchestrator, Arc<CountingBuilder>, Arc<CountingWeaver>) {
    let builder = CountingBuilder::new();
    let weaver = CountingWeaver::new();
    let config = OrchestratorConfig {
        creation_debounce: Duration::ZERO,
        touch_artifact,
    };
    (
        WeaveOrchestrator::new(config, builder.clone(), weaver.clone()),
        builder,
        weaver,
    )
}
