//! Shared harness: several federation servers on one in-memory topic

#![allow(dead_code)]

use cohort_federation::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const SETTLE_DEADLINE: Duration = Duration::from_secs(10);
const SETTLE_POLL: Duration = Duration::from_millis(10);

pub fn config(server: &str, collection: &str) -> CohortConfig {
    let mut config = CohortConfig::default();
    config.general.server_name = server.to_string();
    config.general.metadata_collection_id = collection.to_string();
    config.general.cohort_name = "test-cohort".to_string();
    config.query.member_timeout_ms = 200;
    config.query.global_timeout_ms = 1_000;
    config.exchange.reconciliation_timeout_ms = 200;
    config.retry.max_attempts = 3;
    config.retry.initial_backoff_ms = 10;
    config.retry.max_backoff_ms = 50;
    config
}

pub fn asset_type() -> TypeDef {
    TypeDef::new("Asset", TypeDefCategory::Entity)
        .with_property(PropertyDef::new("name", PropertyType::String).required())
        .with_property(PropertyDef::new("owner", PropertyType::String))
}

pub fn lineage_type() -> TypeDef {
    TypeDef::new("Lineage", TypeDefCategory::Relationship)
        .with_property(PropertyDef::new("process", PropertyType::String))
}

pub fn named(name: &str) -> InstanceProperties {
    InstanceProperties::new().with_string("name", name)
}

pub struct TestCohort {
    pub topic: Arc<InMemoryTopic>,
    pub directory: Arc<InProcessDirectory>,
    servers: BTreeMap<String, Arc<FederationServer>>,
}

impl TestCohort {
    pub fn new() -> Self {
        Self {
            topic: Arc::new(InMemoryTopic::new("test-cohort")),
            directory: Arc::new(InProcessDirectory::new()),
            servers: BTreeMap::new(),
        }
    }

    /// Start one server per id; server `x` owns collection `repo-x`
    pub async fn start(ids: &[&str]) -> Self {
        let mut cohort = Self::new();
        for id in ids {
            cohort.join(id);
        }
        cohort.settle().await;
        cohort
    }

    /// Add and start one more server
    pub fn join(&mut self, id: &str) -> Arc<FederationServer> {
        let server = self.add(id);
        server.start().unwrap();
        server
    }

    /// Add a server without starting it; its events queue until `start`
    pub fn add(&mut self, id: &str) -> Arc<FederationServer> {
        let server = FederationServer::in_process(
            config(&Self::endpoint(id), &format!("repo-{}", id)),
            self.topic.clone(),
            &self.directory,
        )
        .unwrap();
        let server = Arc::new(server);
        self.servers.insert(id.to_string(), server.clone());
        server
    }

    pub fn server(&self, id: &str) -> &Arc<FederationServer> {
        &self.servers[id]
    }

    pub fn endpoint(id: &str) -> String {
        format!("server-{}", id)
    }

    pub fn collection(id: &str) -> MetadataCollectionId {
        MetadataCollectionId::from(format!("repo-{}", id).as_str())
    }

    /// Wait until every running server has drained its queues and the topic is quiet
    pub async fn settle(&self) {
        let deadline = tokio::time::Instant::now() + SETTLE_DEADLINE;
        let mut last_published = u64::MAX;
        let mut quiet_rounds = 0;

        while quiet_rounds < 2 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "cohort did not settle"
            );
            let running: Vec<_> = self.servers.values().filter(|s| s.is_running()).collect();
            for server in &running {
                server.wait_idle().await;
            }
            let in_flight: usize = running.iter().map(|s| s.in_flight()).sum();
            let published = self.topic.published_count();

            if in_flight == 0 && published == last_published {
                quiet_rounds += 1;
            } else {
                quiet_rounds = 0;
            }
            last_published = published;
            tokio::time::sleep(SETTLE_POLL).await;
        }
    }

    /// Define the shared types on `id` and let them replicate
    pub async fn define_types(&self, id: &str) {
        let server = self.server(id);
        server.add_type_def(asset_type()).await.unwrap();
        server.add_type_def(lineage_type()).await.unwrap();
        self.settle().await;
    }

    pub async fn shutdown(&self) {
        for server in self.servers.values() {
            server.shutdown().await.unwrap();
        }
    }
}
