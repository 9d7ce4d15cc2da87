//! End-to-end engine behavior against the in-memory source and backend.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use history_migrate::{
    EntityFilter, EntityType, Fault, InMemorySource, InMemoryStore, LegacyRecord, MappingStore,
    Orchestrator, RecordState, RunMode, SkipLedger, SkipReason, TargetFilter, TargetStore,
};

fn ts(h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, h, 0, 0).unwrap()
}

struct Harness {
    source: Arc<InMemorySource>,
    store: InMemoryStore,
}

impl Harness {
    fn new() -> Self {
        Self {
            source: Arc::new(InMemorySource::new()),
            store: InMemoryStore::new(),
        }
    }

    fn orchestrator(&self, cutover: DateTime<Utc>) -> Orchestrator {
        Orchestrator::new(self.source.clone(), Arc::new(self.store.clone()))
            .unwrap()
            .with_cutover(cutover)
            .with_page_size(2)
    }

    fn add(&self, record: LegacyRecord) {
        self.source.add(record).unwrap();
    }

    async fn mapped(&self, entity_type: EntityType) -> u64 {
        self.store.count_by_type(entity_type).await.unwrap()
    }

    async fn skipped(&self, entity_type: EntityType) -> Vec<String> {
        self.store.skipped_ids(entity_type).await.unwrap()
    }

    /// Every (type, id) is either mapped, skipped or neither; never both.
    async fn assert_mutually_exclusive(&self) {
        for entity_type in EntityType::ALL {
            for id in self.skipped(entity_type).await {
                assert!(
                    !self.store.exists(entity_type, &id).await.unwrap(),
                    "{} {} is both mapped and skipped",
                    entity_type,
                    id
                );
            }
        }
    }
}

fn definition(id: &str, h: u32) -> LegacyRecord {
    LegacyRecord::new(EntityType::ProcessDefinition, id, ts(h)).with_field("key", id)
}

fn instance(id: &str, def: &str, h: u32) -> LegacyRecord {
    LegacyRecord::new(EntityType::ProcessInstance, id, ts(h))
        .with_reference("process_definition", def)
        .with_field("state", "ACTIVE")
}

fn flow_node(id: &str, inst: &str, def: &str, h: u32) -> LegacyRecord {
    LegacyRecord::new(EntityType::FlowNode, id, ts(h))
        .with_reference("process_instance", inst)
        .with_reference("process_definition", def)
        .with_field("activity_id", id)
        .with_field("activity_type", "serviceTask")
}

fn variable(id: &str, inst: &str, h: u32) -> LegacyRecord {
    LegacyRecord::new(EntityType::Variable, id, ts(h))
        .with_reference("process_instance", inst)
        .with_field("name", id)
        .with_field("value", 1)
}

fn only(entity_type: EntityType) -> EntityFilter {
    EntityFilter::only([entity_type])
}

fn populate(h: &Harness) {
    h.add(definition("def-1", 1));
    h.add(definition("def-2", 1));
    h.add(instance("pi-1", "def-1", 2));
    h.add(instance("pi-2", "def-2", 2));
    h.add(instance("pi-3", "def-missing", 3));
    h.add(flow_node("fn-1", "pi-1", "def-1", 3));
    h.add(flow_node("fn-2", "pi-3", "def-missing", 4));
    h.add(variable("v-1", "pi-1", 4));
    h.add(variable("v-2", "pi-2", 5));
    h.add(
        variable("v-3", "pi-2", 5)
            .with_field("serializer", "java_serialized"),
    );
}

#[tokio::test]
async fn test_second_migrate_is_a_no_op() {
    let h = Harness::new();
    populate(&h);
    let orchestrator = h.orchestrator(ts(20));

    let first = orchestrator
        .run(RunMode::Migrate, &EntityFilter::all())
        .await
        .unwrap();
    assert_eq!(first.total_migrated(), 7);
    assert_eq!(first.total_skipped(), 3);

    let records = h.store.record_count().unwrap();
    let second = orchestrator
        .run(RunMode::Migrate, &EntityFilter::all())
        .await
        .unwrap();

    assert_eq!(second.total_migrated(), 0);
    assert_eq!(second.total_skipped(), 0);
    assert_eq!(h.store.record_count().unwrap(), records);
    h.assert_mutually_exclusive().await;
}

#[tokio::test]
async fn test_exactly_once_across_repeated_runs() {
    let h = Harness::new();
    populate(&h);
    let orchestrator = h.orchestrator(ts(20));

    for mode in [
        RunMode::Migrate,
        RunMode::RetrySkipped,
        RunMode::Migrate,
        RunMode::RetrySkipped,
    ] {
        orchestrator.run(mode, &EntityFilter::all()).await.unwrap();
    }

    // One target record per mapping, one mapping per legacy id.
    let mut mapped = 0;
    for entity_type in EntityType::ALL {
        let entries = h.store.list_by_type(entity_type, 0, 100).await.unwrap();
        let mut ids: Vec<&str> = entries.iter().map(|e| e.legacy_id.as_str()).collect();
        ids.dedup();
        assert_eq!(ids.len(), entries.len());

        let stored = h
            .store
            .search(&TargetFilter::by_type(entity_type))
            .await
            .unwrap();
        assert_eq!(stored.len(), entries.len());
        mapped += entries.len();
    }
    assert_eq!(mapped, 7);
    h.assert_mutually_exclusive().await;
}

#[tokio::test]
async fn test_skip_reasons_are_recorded() {
    let h = Harness::new();
    populate(&h);
    h.orchestrator(ts(20))
        .run(RunMode::Migrate, &EntityFilter::all())
        .await
        .unwrap();

    let instances = h
        .store
        .skipped_entries(EntityType::ProcessInstance)
        .await
        .unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].legacy_id, "pi-3");
    assert_eq!(instances[0].reason.to_string(), "missing process definition");

    let nodes = h.store.skipped_entries(EntityType::FlowNode).await.unwrap();
    assert_eq!(
        nodes[0].reason,
        SkipReason::MissingDependency(EntityType::ProcessInstance)
    );

    let variables = h.store.skipped_entries(EntityType::Variable).await.unwrap();
    assert_eq!(variables.len(), 1);
    assert!(matches!(
        variables[0].reason,
        SkipReason::UnsupportedFeature(_)
    ));
}

#[tokio::test]
async fn test_failed_write_leaves_nothing_and_next_run_migrates_once() {
    for fault in [
        Fault::FailInsert("def-2".into()),
        Fault::FailMapping("def-2".into()),
        Fault::FailCommit("def-2".into()),
    ] {
        let h = Harness::new();
        h.add(definition("def-1", 1));
        h.add(definition("def-2", 2));
        h.add(definition("def-3", 3));
        h.store.inject(fault.clone()).unwrap();
        let orchestrator = h.orchestrator(ts(20));

        let result = orchestrator
            .run(RunMode::Migrate, &only(EntityType::ProcessDefinition))
            .await;
        assert!(result.is_err(), "{:?} should abort the pass", fault);

        // Work before the failure stays; the failed record left no trace.
        assert!(h
            .store
            .exists(EntityType::ProcessDefinition, "def-1")
            .await
            .unwrap());
        assert!(!h
            .store
            .exists(EntityType::ProcessDefinition, "def-2")
            .await
            .unwrap());
        assert!(h.skipped(EntityType::ProcessDefinition).await.is_empty());
        let legacy_ids: Vec<String> = h
            .store
            .search(&TargetFilter::by_type(EntityType::ProcessDefinition))
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.record.legacy_id)
            .collect();
        assert_eq!(legacy_ids, vec!["def-1".to_string()]);

        h.store.clear_faults().unwrap();
        let report = orchestrator
            .run(RunMode::Migrate, &only(EntityType::ProcessDefinition))
            .await
            .unwrap();
        assert_eq!(report.total_migrated(), 2);
        assert_eq!(h.mapped(EntityType::ProcessDefinition).await, 3);
        assert_eq!(h.store.record_count().unwrap(), 3);
    }
}

#[tokio::test]
async fn test_child_before_parent_then_retry() {
    let h = Harness::new();
    h.add(definition("def-1", 1));
    h.add(instance("pi-1", "def-1", 2));
    h.add(variable("v-1", "pi-1", 3));
    let orchestrator = h.orchestrator(ts(20));

    let report = orchestrator
        .run(RunMode::Migrate, &only(EntityType::Variable))
        .await
        .unwrap();
    assert_eq!(report.total_skipped(), 1);
    assert_eq!(
        h.store.skipped_entries(EntityType::Variable).await.unwrap()[0].reason,
        SkipReason::MissingDependency(EntityType::ProcessInstance)
    );

    orchestrator
        .run(
            RunMode::Migrate,
            &EntityFilter::only([EntityType::ProcessDefinition, EntityType::ProcessInstance]),
        )
        .await
        .unwrap();

    // A plain migrate never touches skipped records.
    let again = orchestrator
        .run(RunMode::Migrate, &only(EntityType::Variable))
        .await
        .unwrap();
    assert_eq!(again.total_migrated(), 0);
    assert_eq!(h.skipped(EntityType::Variable).await, vec!["v-1".to_string()]);

    let retry = orchestrator
        .run(RunMode::RetrySkipped, &only(EntityType::Variable))
        .await
        .unwrap();
    assert_eq!(retry.total_migrated(), 1);
    assert_eq!(retry.total_skipped(), 0);
    assert_eq!(h.mapped(EntityType::Variable).await, 1);
    assert!(h.skipped(EntityType::Variable).await.is_empty());
}

#[tokio::test]
async fn test_auto_closure_cascades_to_open_dependents() {
    let h = Harness::new();
    let t1 = ts(5);
    let t2 = ts(20);
    h.add(definition("def-1", 1));
    h.add(instance("pi-1", "def-1", 2));
    h.add(
        flow_node("fn-done", "pi-1", "def-1", 3)
            .with_field("state", "COMPLETED")
            .with_field("end_time", t1.to_rfc3339()),
    );
    h.add(flow_node("fn-open", "pi-1", "def-1", 4).with_field("state", "ACTIVE"));

    h.orchestrator(t2)
        .run(RunMode::Migrate, &EntityFilter::all())
        .await
        .unwrap();

    let lifecycle = |entity_type: EntityType, id: &'static str| {
        let store = h.store.clone();
        async move {
            let key = store.resolve(entity_type, id).await.unwrap().unwrap();
            store
                .get(entity_type, key)
                .await
                .unwrap()
                .unwrap()
                .lifecycle
                .unwrap()
        }
    };

    let inst = lifecycle(EntityType::ProcessInstance, "pi-1").await;
    assert_eq!(inst.state, RecordState::Canceled);
    assert_eq!(inst.end_time, Some(t2));

    let done = lifecycle(EntityType::FlowNode, "fn-done").await;
    assert_eq!(done.state, RecordState::Completed);
    assert_eq!(done.end_time, Some(t1));

    let open = lifecycle(EntityType::FlowNode, "fn-open").await;
    assert_eq!(open.state, RecordState::Canceled);
    assert_eq!(open.end_time, Some(t2));
}

#[tokio::test]
async fn test_dependent_adopts_cutover_of_earlier_run() {
    let h = Harness::new();
    h.add(definition("def-1", 1));
    h.add(instance("pi-1", "def-1", 2));
    h.orchestrator(ts(10))
        .run(RunMode::Migrate, &EntityFilter::all())
        .await
        .unwrap();

    // A node arrives after its instance was closed out in the first run.
    h.add(flow_node("fn-late", "pi-1", "def-1", 3).with_field("state", "ACTIVE"));
    h.orchestrator(ts(22))
        .run(RunMode::Migrate, &EntityFilter::all())
        .await
        .unwrap();

    let key = h
        .store
        .resolve(EntityType::FlowNode, "fn-late")
        .await
        .unwrap()
        .unwrap();
    let node = h
        .store
        .get(EntityType::FlowNode, key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(node.lifecycle.unwrap().end_time, Some(ts(10)));
}

#[tokio::test]
async fn test_late_dependent_never_ends_before_it_starts() {
    let h = Harness::new();
    h.add(definition("def-1", 1));
    h.add(instance("pi-1", "def-1", 2));
    h.orchestrator(ts(10))
        .run(RunMode::Migrate, &EntityFilter::all())
        .await
        .unwrap();

    // Created after the instance was closed at 10:00.
    h.add(flow_node("fn-after", "pi-1", "def-1", 15).with_field("state", "ACTIVE"));
    let report = h
        .orchestrator(ts(22))
        .run(RunMode::Migrate, &EntityFilter::all())
        .await
        .unwrap();
    assert_eq!(report.total_migrated(), 1);

    let key = h
        .store
        .resolve(EntityType::FlowNode, "fn-after")
        .await
        .unwrap()
        .unwrap();
    let lifecycle = h
        .store
        .get(EntityType::FlowNode, key)
        .await
        .unwrap()
        .unwrap()
        .lifecycle
        .unwrap();
    assert_eq!(lifecycle.state, RecordState::Canceled);
    assert_eq!(lifecycle.start_time, Some(ts(15)));
    assert_eq!(lifecycle.end_time, Some(ts(15)));
}

#[tokio::test]
async fn test_malformed_record_does_not_block_later_records() {
    let h = Harness::new();
    h.add(LegacyRecord::new(EntityType::ProcessDefinition, "def-bad", ts(1)));
    h.add(definition("def-ok", 2));
    h.add(instance("pi-1", "def-ok", 3));

    for _ in 0..3 {
        h.orchestrator(ts(20))
            .run(RunMode::Migrate, &EntityFilter::all())
            .await
            .unwrap();
    }

    assert!(h
        .store
        .exists(EntityType::ProcessDefinition, "def-ok")
        .await
        .unwrap());
    assert_eq!(h.mapped(EntityType::ProcessInstance).await, 1);

    let entries = h
        .store
        .skipped_entries(EntityType::ProcessDefinition)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].legacy_id, "def-bad");
    assert_eq!(
        entries[0].reason,
        SkipReason::InvalidRecord("required field 'key' is missing".into())
    );
    h.assert_mutually_exclusive().await;
}

#[tokio::test]
async fn test_retry_touches_exactly_the_skip_set() {
    let h = Harness::new();
    h.add(definition("def-1", 1));
    h.add(instance("pi-ok", "def-1", 1));
    let orchestrator = h.orchestrator(ts(20));
    orchestrator
        .run(RunMode::Migrate, &EntityFilter::all())
        .await
        .unwrap();

    // Three orphans skipped in one pass...
    for (i, id) in ["v-1", "v-2", "v-3"].iter().enumerate() {
        h.add(variable(id, "pi-late", 2 + i as u32));
    }
    orchestrator
        .run(RunMode::Migrate, &only(EntityType::Variable))
        .await
        .unwrap();
    // ...two more in a later pass.
    for (i, id) in ["v-4", "v-5"].iter().enumerate() {
        h.add(variable(id, "pi-late", 6 + i as u32));
    }
    orchestrator
        .run(RunMode::Migrate, &only(EntityType::Variable))
        .await
        .unwrap();
    assert_eq!(h.skipped(EntityType::Variable).await.len(), 5);

    // A migrated variable and a never-attempted one must stay out of retry.
    h.add(variable("v-ok", "pi-ok", 8));
    orchestrator
        .run(RunMode::Migrate, &only(EntityType::Variable))
        .await
        .unwrap();
    h.add(variable("v-new", "pi-ok", 9));

    h.add(instance("pi-late", "def-1", 1));
    orchestrator
        .run(RunMode::Migrate, &only(EntityType::ProcessInstance))
        .await
        .unwrap();

    let before = h.store.record_count().unwrap();
    let retry = orchestrator
        .run(RunMode::RetrySkipped, &only(EntityType::Variable))
        .await
        .unwrap();

    assert_eq!(retry.total_migrated() + retry.total_skipped(), 5);
    assert_eq!(retry.total_migrated(), 5);
    assert_eq!(h.store.record_count().unwrap(), before + 5);
    assert!(!h
        .store
        .exists(EntityType::Variable, "v-new")
        .await
        .unwrap());
    assert!(!h
        .store
        .is_skipped(EntityType::Variable, "v-new")
        .await
        .unwrap());
    h.assert_mutually_exclusive().await;
}

#[tokio::test]
async fn test_retry_of_vanished_record_stays_skipped() {
    let h = Harness::new();
    h.store
        .mark_skipped(
            EntityType::Incident,
            "inc-gone",
            &SkipReason::MissingDependency(EntityType::ProcessInstance),
        )
        .await
        .unwrap();

    let report = h
        .orchestrator(ts(20))
        .run(RunMode::RetrySkipped, &only(EntityType::Incident))
        .await
        .unwrap();

    assert_eq!(report.total_skipped(), 1);
    assert_eq!(h.skipped(EntityType::Incident).await, vec!["inc-gone".to_string()]);
}

#[tokio::test]
async fn test_definition_instance_scenario() {
    let h = Harness::new();
    h.add(definition("def-1", 1));
    h.add(instance("inst-1", "def-1", 2));
    let orchestrator = h.orchestrator(ts(20));

    let pass1 = orchestrator
        .run(RunMode::Migrate, &only(EntityType::ProcessInstance))
        .await
        .unwrap();
    let inst = pass1.entity(EntityType::ProcessInstance).unwrap();
    assert_eq!((inst.migrated, inst.skipped), (0, 1));
    let listing = orchestrator
        .run(RunMode::ListSkipped, &only(EntityType::ProcessInstance))
        .await
        .unwrap()
        .listing
        .unwrap();
    assert_eq!(
        listing.to_string(),
        "process_instance:\n  inst-1: missing process definition\n"
    );

    let defs = orchestrator
        .run(RunMode::Migrate, &only(EntityType::ProcessDefinition))
        .await
        .unwrap();
    assert_eq!(defs.total_migrated(), 1);

    let retry = orchestrator
        .run(RunMode::RetrySkipped, &only(EntityType::ProcessInstance))
        .await
        .unwrap();
    let inst = retry.entity(EntityType::ProcessInstance).unwrap();
    assert_eq!((inst.migrated, inst.skipped), (1, 0));

    assert_eq!(h.mapped(EntityType::ProcessDefinition).await, 1);
    assert_eq!(h.mapped(EntityType::ProcessInstance).await, 1);
    for entity_type in EntityType::ALL {
        assert!(h.skipped(entity_type).await.is_empty());
    }
}

#[tokio::test]
async fn test_listings_report_empty_types() {
    let h = Harness::new();
    h.add(definition("def-1", 1));
    let orchestrator = h.orchestrator(ts(20));
    orchestrator
        .run(RunMode::Migrate, &EntityFilter::all())
        .await
        .unwrap();

    let mappings = orchestrator
        .run(RunMode::ListMappings, &EntityFilter::all())
        .await
        .unwrap()
        .listing
        .unwrap()
        .to_string();
    assert!(mappings.starts_with("process_definition:\n  def-1 -> 1\n"));
    assert_eq!(mappings.matches("  (none)\n").count(), 7);

    let skipped = orchestrator
        .run(RunMode::ListSkipped, &EntityFilter::all())
        .await
        .unwrap()
        .listing
        .unwrap()
        .to_string();
    assert_eq!(skipped.matches("  (none)\n").count(), 8);
}
