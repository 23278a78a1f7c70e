//! Multi-member scenarios over a shared in-memory topic

mod common;

use cohort_federation::prelude::*;
use common::{TestCohort, asset_type, named};
use std::time::{Duration, Instant};

// ============================================================================
// Type definitions
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_type_def_patch_and_incompatible_replacement() {
    let cohort = TestCohort::start(&["a", "b"]).await;
    let a = cohort.server("a");
    let b = cohort.server("b");

    let v1 = TypeDef::new("Dataset", TypeDefCategory::Entity)
        .with_property(PropertyDef::new("name", PropertyType::String));
    a.add_type_def(v1.clone()).await.unwrap();

    let patch = TypeDefPatch::new(&v1).add_property(PropertyDef::new("owner", PropertyType::String));
    let v2 = a.patch_type_def(&patch).await.unwrap();
    assert_eq!(v2.version, 2);
    assert!(v2.property("name").is_some());
    assert!(v2.property("owner").is_some());

    // Dropping `name` at version 3 is not a strict extension
    let mut narrowed = v1
        .clone()
        .with_version(3)
        .with_property(PropertyDef::new("owner", PropertyType::String));
    narrowed.properties.retain(|p| p.name != "name");
    let err = a.add_type_def(narrowed).await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(err.kind(), ErrorKind::TypeDefConflict);

    cohort.settle().await;
    let replicated = b.find_type_def_by_name("Dataset").unwrap();
    assert_eq!(replicated.version, 2);
    assert_eq!(replicated.guid, v1.guid);

    let reports = a
        .audit()
        .reports_matching(|r| matches!(r, AuditReport::TypeDefConflict { .. }));
    assert_eq!(reports.len(), 1);

    cohort.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_local_patches_race_remote_type_defs() {
    let cohort = TestCohort::start(&["a"]).await;
    let a = cohort.server("a").clone();

    let v1 = TypeDef::new("Dataset", TypeDefCategory::Entity)
        .with_property(PropertyDef::new("name", PropertyType::String));
    a.add_type_def(v1.clone()).await.unwrap();

    let local_names: Vec<String> = (0..20).map(|i| format!("local_{}", i)).collect();

    // Every remote version carries every local property, so it always
    // extends whatever the local patches produced before it
    let mut remote = Vec::new();
    let mut def = v1.clone();
    for name in &local_names {
        def = def.with_property(PropertyDef::new(name.as_str(), PropertyType::String));
    }
    for i in 0..20u64 {
        def = def
            .with_property(PropertyDef::new(format!("remote_{}", i).as_str(), PropertyType::String))
            .with_version(100 + i);
        remote.push(def.clone());
    }

    let guid = v1.guid;
    let writer = {
        let a = a.clone();
        tokio::spawn(async move {
            let mut refused = Vec::new();
            for name in local_names {
                let current = a.get_type_def(guid).unwrap();
                let patch = TypeDefPatch::new(&current)
                    .add_property(PropertyDef::new(name.as_str(), PropertyType::String));
                if let Err(e) = a.patch_type_def(&patch).await {
                    refused.push(e.to_string());
                }
                tokio::task::yield_now().await;
            }
            refused
        })
    };

    for def in remote {
        cohort
            .topic
            .publish(ReplicationEvent::type_def(
                TestCohort::collection("x"),
                TypeDefAction::Patched,
                def,
            ))
            .await
            .unwrap();
        tokio::task::yield_now().await;
    }
    let refused = writer.await.unwrap();
    cohort.settle().await;

    // A refusal only ever comes from the TypeDef Store, never from the
    // repository after the store already accepted the patch
    assert!(
        refused.iter().all(|reason| !reason.contains("does not replace stored version")),
        "{:?}",
        refused
    );
    let stored = a.get_type_def(guid).unwrap();
    let persisted = a.repository().get_type_def(guid).await.unwrap();
    assert_eq!(stored, persisted);
    assert_eq!(stored.version, 119);

    cohort.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_conflicting_remote_type_def_is_refused() {
    let cohort = TestCohort::start(&["a", "b"]).await;
    let a = cohort.server("a");
    let b = cohort.server("b");

    a.add_type_def(asset_type()).await.unwrap();
    cohort.settle().await;
    let adopted = b.find_type_def_by_name("Asset").unwrap();

    // Same name under a different guid cannot replace the adopted one
    let rival = TypeDef::new("Asset", TypeDefCategory::Entity).with_version(2);
    cohort
        .topic
        .publish(ReplicationEvent::type_def(
            TestCohort::collection("c"),
            TypeDefAction::Added,
            rival,
        ))
        .await
        .unwrap();
    cohort.settle().await;

    assert_eq!(b.find_type_def_by_name("Asset").unwrap(), adopted);
    assert!(b.statistics().conflicts >= 1);
    let reports = b
        .audit()
        .reports_matching(|r| matches!(r, AuditReport::TypeDefConflict { origin: Some(_), .. }));
    assert!(!reports.is_empty());

    cohort.shutdown().await;
}

// ============================================================================
// Replication
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_update_replicates_to_reference_copy() {
    let cohort = TestCohort::start(&["a", "b"]).await;
    cohort.define_types("a").await;
    let a = cohort.server("a");
    let b = cohort.server("b");
    let guid = Guid::from_u128(42);

    a.create_entity_with_guid(guid, "Asset", named("orders"))
        .await
        .unwrap();
    cohort.settle().await;
    let copy = b.copies().get_entity(&guid).unwrap();
    assert_eq!(copy.header.version, 1);
    assert!(copy.header.replicated_at.is_some());

    a.update_entity(guid, 1, named("orders").with_string("owner", "finance"))
        .await
        .unwrap();
    cohort.settle().await;

    let copy = b.copies().get_entity(&guid).unwrap();
    assert_eq!(copy.header.version, 2);
    assert_eq!(copy.header.home, TestCohort::collection("a"));
    assert_eq!(
        copy.properties.get("owner"),
        Some(&PropertyValue::String("finance".into()))
    );

    let found = b.find_entity_by_guid(guid).await.unwrap();
    assert!(found.complete);
    assert_eq!(found.value.instance.header.version, 2);
    assert_eq!(found.value.home, TestCohort::collection("a"));
    assert!(found.value.authoritative);

    cohort.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reference_copy_is_read_only() {
    let cohort = TestCohort::start(&["a", "b"]).await;
    cohort.define_types("a").await;
    let a = cohort.server("a");
    let b = cohort.server("b");

    let entity = a.create_entity("Asset", named("orders")).await.unwrap();
    let guid = entity.header.guid;
    cohort.settle().await;

    let err = b.update_entity(guid, 1, named("renamed")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InstanceNotOwned);
    assert_eq!(
        b.delete_entity(guid, 1).await.unwrap_err().kind(),
        ErrorKind::InstanceNotOwned
    );

    // Reusing the guid on another member is refused as well
    let err = b
        .create_entity_with_guid(guid, "Asset", named("copy"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HomeCollectionConflict);

    assert_eq!(b.copies().get_entity(&guid).unwrap().header.version, 1);
    cohort.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_restore_and_purge_replicate() {
    let cohort = TestCohort::start(&["a", "b"]).await;
    cohort.define_types("a").await;
    let a = cohort.server("a");
    let b = cohort.server("b");

    let entity = a.create_entity("Asset", named("orders")).await.unwrap();
    let guid = entity.header.guid;
    a.delete_entity(guid, 1).await.unwrap();
    cohort.settle().await;
    let copy = b.copies().get_entity(&guid).unwrap();
    assert_eq!(copy.header.status, InstanceStatus::Deleted);

    let restored = a.restore_entity(guid).await.unwrap();
    cohort.settle().await;
    let copy = b.copies().get_entity(&guid).unwrap();
    assert_eq!(copy.header.status, InstanceStatus::Active);
    assert_eq!(copy.header.version, restored.header.version);

    a.purge_entity(guid).await.unwrap();
    cohort.settle().await;
    assert!(b.copies().get_entity(&guid).is_none());
    assert!(b.copies().entities().is_purged(&guid));
    let err = b.find_entity_by_guid(guid).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EntityNotKnown);

    cohort.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_relationships_replicate() {
    let cohort = TestCohort::start(&["a", "b"]).await;
    cohort.define_types("a").await;
    let a = cohort.server("a");
    let b = cohort.server("b");

    let source = a.create_entity("Asset", named("raw")).await.unwrap();
    let target = a.create_entity("Asset", named("curated")).await.unwrap();
    let lineage = a
        .create_relationship(
            "Lineage",
            source.header.guid,
            target.header.guid,
            InstanceProperties::new().with_string("process", "nightly"),
        )
        .await
        .unwrap();
    cohort.settle().await;

    let copy = b.copies().get_relationship(&lineage.header.guid).unwrap();
    assert_eq!(copy.end_one, source.header.guid);
    assert_eq!(copy.end_two, target.header.guid);

    let found = b
        .find_relationship_by_guid(lineage.header.guid)
        .await
        .unwrap();
    assert_eq!(found.value.home, TestCohort::collection("a"));

    // B may relate A's entities through its reference copies
    let local = b
        .create_relationship(
            "Lineage",
            target.header.guid,
            source.header.guid,
            InstanceProperties::new(),
        )
        .await
        .unwrap();
    assert_eq!(local.header.home, TestCohort::collection("b"));

    cohort.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_search_merges_local_and_remote() {
    let cohort = TestCohort::start(&["a", "b", "c"]).await;
    cohort.define_types("a").await;

    cohort
        .server("a")
        .create_entity("Asset", named("orders"))
        .await
        .unwrap();
    cohort
        .server("b")
        .create_entity("Asset", named("orders_archive"))
        .await
        .unwrap();
    cohort
        .server("c")
        .create_entity("Asset", named("customers"))
        .await
        .unwrap();
    cohort.settle().await;

    let criteria = SearchCriteria::new()
        .with_property("name", PropertyValue::String("orders".into()))
        .contains();
    let found = cohort.server("b").search_entities(&criteria).await.unwrap();
    assert!(found.complete);
    assert_eq!(found.value.len(), 2);
    for result in &found.value {
        assert!(result.authoritative);
    }

    let none = cohort
        .server("b")
        .search_entities(&SearchCriteria::new().of_type("Unknown"))
        .await
        .unwrap();
    assert!(none.value.is_empty());

    cohort.shutdown().await;
}

// ============================================================================
// Membership
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_late_joiner_learns_existing_members() {
    let mut cohort = TestCohort::start(&["a"]).await;
    cohort.join("b");
    cohort.settle().await;

    let a = cohort.server("a");
    let b = cohort.server("b");
    assert!(a.registry().contains(&TestCohort::collection("b")));
    assert!(b.registry().contains(&TestCohort::collection("a")));
    assert_eq!(a.registry().len(), 1);
    assert_eq!(b.registry().len(), 1);

    cohort.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_departure_purges_reference_copies() {
    let cohort = TestCohort::start(&["a", "b"]).await;
    cohort.define_types("a").await;
    let a = cohort.server("a");
    let b = cohort.server("b");
    let guid = Guid::from_u128(42);

    a.create_entity_with_guid(guid, "Asset", named("orders"))
        .await
        .unwrap();
    cohort.settle().await;
    assert!(b.copies().get_entity(&guid).is_some());

    a.shutdown().await.unwrap();
    cohort.settle().await;

    assert!(!b.registry().contains(&TestCohort::collection("a")));
    assert!(b.copies().get_entity(&guid).is_none());
    let err = b.find_entity_by_guid(guid).await.unwrap_err();
    assert!(err.is_not_found());

    cohort.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_administrative_deregistration() {
    let cohort = TestCohort::start(&["a", "b"]).await;
    cohort.define_types("a").await;
    let a = cohort.server("a");
    let b = cohort.server("b");

    let entity = a.create_entity("Asset", named("orders")).await.unwrap();
    cohort.settle().await;
    assert_eq!(b.copies().entities().len(), 1);

    let removed = b.deregister_member(&TestCohort::collection("a")).unwrap();
    assert_eq!(removed.server_name, TestCohort::endpoint("a"));
    assert!(b.copies().get_entity(&entity.header.guid).is_none());

    let err = b
        .deregister_member(&TestCohort::collection("a"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);

    // A keeps running; its later changes must not bring the copy back
    a.update_entity(entity.header.guid, 1, named("orders-v2"))
        .await
        .unwrap();
    cohort.settle().await;

    assert!(b.copies().get_entity(&entity.header.guid).is_none());
    assert!(!b.registry().contains(&TestCohort::collection("a")));
    assert!(b.statistics().rejected >= 1);
    let found = b
        .search_entities(&SearchCriteria::new().of_type("Asset"))
        .await
        .unwrap();
    assert!(found.value.is_empty());

    cohort.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_forged_registration_is_rejected() {
    let cohort = TestCohort::start(&["b"]).await;
    let b = cohort.server("b");

    let mut member = CohortMember::new(
        TestCohort::collection("x"),
        "server-x",
        ConnectionDescriptor::in_process("server-x"),
    );
    cohort
        .topic
        .publish(ReplicationEvent::registration(
            TestCohort::collection("y"),
            RegistrationAction::Register,
            member.clone(),
        ))
        .await
        .unwrap();

    member.protocol_version = ProtocolVersion::new(ProtocolVersion::CURRENT.major + 1, 0);
    cohort
        .topic
        .publish(ReplicationEvent::registration(
            TestCohort::collection("x"),
            RegistrationAction::Register,
            member,
        ))
        .await
        .unwrap();
    cohort.settle().await;

    assert!(b.registry().is_empty());
    assert_eq!(b.statistics().rejected, 2);
    let reports = b
        .audit()
        .reports_matching(|r| matches!(r, AuditReport::RegistrationRejected { .. }));
    assert_eq!(reports.len(), 2);

    cohort.shutdown().await;
}

// ============================================================================
// Conflicts
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_homes_for_one_guid() {
    let mut cohort = TestCohort::start(&["a", "b"]).await;
    cohort.define_types("a").await;
    let guid = Guid::from_u128(42);

    cohort
        .server("a")
        .create_entity_with_guid(guid, "Asset", named("from-a"))
        .await
        .unwrap();
    cohort.settle().await;

    // C creates the same guid before it has heard of A's entity
    let c = cohort.add("c");
    let asset = cohort.server("a").find_type_def_by_name("Asset").unwrap();
    c.add_type_def(asset).await.unwrap();
    c.create_entity_with_guid(guid, "Asset", named("from-c"))
        .await
        .unwrap();
    c.start().unwrap();
    cohort.settle().await;

    let b = cohort.server("b");
    let copy = b.copies().get_entity(&guid).unwrap();
    assert_eq!(copy.header.home, TestCohort::collection("a"));
    assert!(!b.copies().entities().quarantined(&guid).is_empty());

    let conflicts = b.audit().reports_matching(|r| {
        matches!(r, AuditReport::HomeCollectionConflict { guid: g, .. } if *g == guid)
    });
    assert!(!conflicts.is_empty());

    // A keeps its own instance and reports the claim from C
    let a = cohort.server("a");
    assert_eq!(
        a.repository().get_entity(guid).await.unwrap().header.home,
        TestCohort::collection("a")
    );
    assert!(a.statistics().conflicts >= 1);

    cohort.shutdown().await;
}

// ============================================================================
// Degraded operation
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_member_gives_partial_result() {
    let cohort = TestCohort::start(&["a", "b", "c"]).await;
    cohort.define_types("a").await;
    let b = cohort.server("b");

    let local = b.create_entity("Asset", named("orders")).await.unwrap();
    cohort.settle().await;
    cohort
        .directory
        .set_reachable(&TestCohort::endpoint("c"), false);

    let found = b.find_entity_by_guid(local.header.guid).await.unwrap();
    assert!(found.is_partial());
    assert_eq!(found.value.provenance, Provenance::Local);
    assert_eq!(
        found.member_status[&TestCohort::collection("a")],
        MemberOutcome::Success
    );
    assert!(matches!(
        found.member_status[&TestCohort::collection("c")],
        MemberOutcome::Error(_)
    ));

    cohort.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_member_times_out_within_deadline() {
    let cohort = TestCohort::start(&["a", "b"]).await;
    cohort.define_types("a").await;
    let b = cohort.server("b");

    let entity = cohort
        .server("a")
        .create_entity("Asset", named("orders"))
        .await
        .unwrap();
    cohort.settle().await;
    cohort
        .directory
        .set_latency(&TestCohort::endpoint("a"), Duration::from_secs(5));

    let started = Instant::now();
    let found = b.find_entity_by_guid(entity.header.guid).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(1_500));

    assert!(found.is_partial());
    assert_eq!(
        found.member_status[&TestCohort::collection("a")],
        MemberOutcome::Timeout
    );
    // The reference copy still answers
    assert_eq!(found.value.provenance, Provenance::ReferenceCopy);
    assert!(!found.value.authoritative);

    cohort
        .directory
        .set_latency(&TestCohort::endpoint("a"), Duration::ZERO);
    cohort.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeated_failures_mark_member_degraded() {
    let cohort = TestCohort::start(&["a", "b"]).await;
    let b = cohort.server("b");
    cohort
        .directory
        .set_reachable(&TestCohort::endpoint("a"), false);

    for _ in 0..3 {
        let _ = b.find_entity_by_guid(Guid::new()).await;
    }

    let status = b.registry().get(&TestCohort::collection("a")).unwrap();
    assert!(status.degraded);
    assert!(status.consecutive_failures >= 3);
    let degraded = b
        .audit()
        .reports_matching(|r| matches!(r, AuditReport::DegradedMember { .. }));
    assert_eq!(degraded.len(), 1);

    cohort
        .directory
        .set_reachable(&TestCohort::endpoint("a"), true);
    let _ = b.find_entity_by_guid(Guid::new()).await;
    assert!(!b.registry().get(&TestCohort::collection("a")).unwrap().degraded);

    cohort.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_topic_outage_abandons_then_recovers() {
    let cohort = TestCohort::start(&["a", "b"]).await;
    cohort.define_types("a").await;
    let a = cohort.server("a");
    let b = cohort.server("b");

    cohort.topic.set_available(false);
    let entity = a.create_entity("Asset", named("orders")).await.unwrap();
    let guid = entity.header.guid;
    a.wait_idle().await;

    let stats = a.statistics();
    assert_eq!(stats.abandoned, 1);
    assert!(stats.publish_retries >= 1);
    let abandoned = a
        .audit()
        .reports_matching(|r| matches!(r, AuditReport::PublicationAbandoned { .. }));
    assert_eq!(abandoned.len(), 1);

    // The local write stands even though nobody heard about it
    assert!(a.repository().get_entity(guid).await.is_ok());

    cohort.topic.set_available(true);
    cohort.settle().await;
    assert!(b.copies().get_entity(&guid).is_none());

    // The next change carries the full state, so B catches up
    a.update_entity(guid, 1, named("orders").with_string("owner", "ops"))
        .await
        .unwrap();
    cohort.settle().await;
    assert_eq!(b.copies().get_entity(&guid).unwrap().header.version, 2);

    cohort.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_status_and_server_instances() {
    let cohort = TestCohort::start(&["a", "b"]).await;
    cohort.define_types("a").await;
    cohort
        .server("a")
        .create_entity("Asset", named("orders"))
        .await
        .unwrap();
    cohort.settle().await;

    let status = cohort.server("b").status();
    assert!(status.running);
    assert_eq!(status.members, 1);
    assert_eq!(status.type_defs, 2);
    assert_eq!(status.entity_copies, 1);
    assert_eq!(status.local_entities, 0);

    let instances = ServerInstances::new();
    instances.insert(cohort.server("a").clone()).unwrap();
    instances.insert(cohort.server("b").clone()).unwrap();
    assert!(instances.insert(cohort.server("a").clone()).is_err());
    assert_eq!(instances.len(), 2);

    instances.shutdown_all().await.unwrap();
    assert!(!cohort.server("a").is_running());
    assert!(!cohort.server("b").is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_inserts_admit_one_server_per_name() {
    let mut cohort = TestCohort::new();
    let a = cohort.add("a");
    let instances = std::sync::Arc::new(ServerInstances::new());

    let attempts: Vec<_> = (0..16)
        .map(|_| {
            let instances = instances.clone();
            let a = a.clone();
            tokio::spawn(async move { instances.insert(a).is_ok() })
        })
        .collect();

    let mut admitted = 0;
    for attempt in attempts {
        if attempt.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(instances.names(), vec![TestCohort::endpoint("a")]);
}
