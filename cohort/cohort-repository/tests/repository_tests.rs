//! Integration tests for the in-memory repository through the connector trait

use cohort_core::prelude::*;
use cohort_repository::InMemoryRepository;
use std::sync::Arc;

// ============================================================================
// Helpers
// ============================================================================

fn asset_type() -> TypeDef {
    TypeDef::new("Asset", TypeDefCategory::Entity)
        .with_property(PropertyDef::new("name", PropertyType::String).required())
        .with_property(PropertyDef::new("owner", PropertyType::String))
}

fn connector(id: &str) -> Arc<dyn MetadataCollection> {
    Arc::new(InMemoryRepository::new(id.into()))
}

async fn seed(repo: &Arc<dyn MetadataCollection>, names: &[&str]) -> Vec<EntityDetail> {
    let def = asset_type();
    let mut created = Vec::new();
    for name in names {
        let entity = EntityDetail::new(&def, repo.metadata_collection_id().clone())
            .with_properties(InstanceProperties::new().with_string("name", *name));
        created.push(repo.create_entity(entity).await.unwrap());
    }
    created
}

// ============================================================================
// Search
// ============================================================================

#[tokio::test]
async fn test_search_by_property() {
    let repo = connector("repo-a");
    seed(&repo, &["orders", "customers", "orders_archive"]).await;

    let exact = SearchCriteria::new().with_property("name", PropertyValue::String("orders".into()));
    let found = repo.find_entities_by_property(&exact).await.unwrap();
    assert_eq!(found.len(), 1);

    let fuzzy = SearchCriteria::new()
        .with_property("name", PropertyValue::String("order".into()))
        .contains();
    assert_eq!(repo.find_entities_by_property(&fuzzy).await.unwrap().len(), 2);

    let limited = SearchCriteria::new().of_type("Asset").limit(2);
    assert_eq!(repo.find_entities_by_property(&limited).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_search_skips_deleted_unless_asked() {
    let repo = connector("repo-a");
    let created = seed(&repo, &["orders"]).await;
    let guid = created[0].header.guid;
    repo.delete_entity(guid, 1).await.unwrap();

    let criteria = SearchCriteria::new().of_type("Asset");
    assert!(repo.find_entities_by_property(&criteria).await.unwrap().is_empty());
    assert_eq!(
        repo.find_entities_by_property(&criteria.including_deleted())
            .await
            .unwrap()
            .len(),
        1
    );
}

// ============================================================================
// Relationships
// ============================================================================

#[tokio::test]
async fn test_relationship_lifecycle() {
    let repo = connector("repo-a");
    let created = seed(&repo, &["orders", "customers"]).await;
    let link = TypeDef::new("AssetLink", TypeDefCategory::Relationship);

    let relationship = Relationship::new(
        &link,
        "repo-a".into(),
        created[0].header.guid,
        created[1].header.guid,
    );
    let stored = repo.create_relationship(relationship).await.unwrap();
    let guid = stored.header.guid;

    let updated = repo
        .update_relationship(guid, 1, InstanceProperties::new().with_string("label", "feeds"))
        .await
        .unwrap();
    assert_eq!(updated.header.version, 2);

    repo.delete_relationship(guid, 2).await.unwrap();
    let purged = repo.purge_relationship(guid).await.unwrap();
    assert_eq!(purged.header.status, InstanceStatus::Purged);
    assert!(matches!(
        repo.get_relationship(guid).await.unwrap_err(),
        CohortError::RelationshipNotKnown { .. }
    ));
}

#[tokio::test]
async fn test_relationship_requires_both_ends() {
    let repo = connector("repo-a");
    let link = TypeDef::new("AssetLink", TypeDefCategory::Relationship);
    let relationship = Relationship::new(&link, "repo-a".into(), Guid::new(), Guid::from_u128(0));
    let err = repo.create_relationship(relationship).await.unwrap_err();
    assert!(matches!(err, CohortError::InvalidParameter { .. }));
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_single_winner() {
    let repo = connector("repo-a");
    let created = seed(&repo, &["orders"]).await;
    let guid = created[0].header.guid;

    let mut handles = Vec::new();
    for i in 0..8 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            repo.update_entity(guid, 1, InstanceProperties::new().with_int("writer", i))
                .await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(repo.get_entity(guid).await.unwrap().header.version, 2);
}
