//! In-process cohort simulation.
//!
//! Starts several federation servers on one in-memory topic, defines a
//! shared type, lets every member create entities, optionally cuts some
//! members off and then runs an enterprise search from the first member.

use crate::output::{self, OutputFormat, TableBuilder};
use anyhow::{Context, Result, bail};
use cohort_core::config::CohortConfig;
use cohort_core::id::MetadataCollectionId;
use cohort_core::types::{
    InstanceProperties, PropertyDef, PropertyType, SearchCriteria, TypeDef, TypeDefCategory,
};
use cohort_federation::prelude::{
    FederationServer, InMemoryTopic, InProcessDirectory, MemberOutcome, ServerInstances, ServerStatus,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const SETTLE_DEADLINE: Duration = Duration::from_secs(30);
const SETTLE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub members: usize,
    /// Entities each member creates
    pub entities: usize,
    /// Members made unreachable before the query, counted from the last
    pub unreachable: usize,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            members: 3,
            entities: 5,
            unreachable: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuerySummary {
    pub queried_from: String,
    pub results: usize,
    pub complete: bool,
    pub member_status: BTreeMap<MetadataCollectionId, MemberOutcome>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub members: Vec<ServerStatus>,
    pub query: QuerySummary,
    pub replication_ms: u64,
}

fn member_config(base: &CohortConfig, index: usize) -> CohortConfig {
    let mut config = base.clone();
    config.general.server_name = format!("member-{}", index);
    config.general.metadata_collection_id = format!("repo-{}", index);
    config
}

fn asset_type() -> TypeDef {
    TypeDef::new("Asset", TypeDefCategory::Entity)
        .with_description("Simulated data asset")
        .with_property(PropertyDef::new("name", PropertyType::String).required())
        .with_property(PropertyDef::new("sequence", PropertyType::Int))
}

/// Wait until every server is idle and the topic has stopped moving
async fn settle(servers: &[Arc<FederationServer>], topic: &InMemoryTopic) -> Result<()> {
    let deadline = Instant::now() + SETTLE_DEADLINE;
    let mut last_published = u64::MAX;
    let mut quiet_rounds = 0;

    while quiet_rounds < 2 {
        if Instant::now() > deadline {
            bail!("cohort did not settle within {:?}", SETTLE_DEADLINE);
        }
        for server in servers {
            server.wait_idle().await;
        }
        let in_flight: usize = servers.iter().map(|s| s.in_flight()).sum();
        let published = topic.published_count();
        if in_flight == 0 && published == last_published {
            quiet_rounds += 1;
        } else {
            quiet_rounds = 0;
        }
        last_published = published;
        tokio::time::sleep(SETTLE_POLL).await;
    }
    Ok(())
}

pub async fn run_simulation(base: &CohortConfig, options: &SimulationOptions) -> Result<SimulationReport> {
    if options.members == 0 {
        bail!("a simulation needs at least one member");
    }
    if options.unreachable >= options.members {
        bail!(
            "{} unreachable members leaves nobody to query from among {}",
            options.unreachable,
            options.members
        );
    }

    let topic = Arc::new(InMemoryTopic::new(base.general.cohort_name.clone()));
    let directory = Arc::new(InProcessDirectory::new());
    let instances = ServerInstances::new();
    let mut servers = Vec::with_capacity(options.members);

    for index in 1..=options.members {
        let server = Arc::new(
            FederationServer::in_process(member_config(base, index), topic.clone(), &directory)
                .with_context(|| format!("Failed to build member {}", index))?,
        );
        server.start()?;
        instances.insert(server.clone())?;
        servers.push(server);
    }
    settle(&servers, &topic).await?;
    info!(members = servers.len(), "Cohort formed");

    let started = Instant::now();
    servers[0].add_type_def(asset_type()).await?;
    settle(&servers, &topic).await?;

    for (index, server) in servers.iter().enumerate() {
        for n in 0..options.entities {
            let properties = InstanceProperties::new()
                .with_string("name", format!("asset-{}-{}", index + 1, n))
                .with_int("sequence", n as i64);
            server.create_entity("Asset", properties).await?;
        }
    }
    settle(&servers, &topic).await?;
    let replication_ms = started.elapsed().as_millis() as u64;
    debug!(replication_ms, "Replication settled");

    for server in servers.iter().rev().take(options.unreachable) {
        directory.set_reachable(server.server_name(), false);
    }

    let origin = &servers[0];
    let started = Instant::now();
    let found = origin
        .search_entities(&SearchCriteria::new().of_type("Asset"))
        .await?;
    let query = QuerySummary {
        queried_from: origin.server_name().to_string(),
        results: found.value.len(),
        complete: found.complete,
        member_status: found.member_status,
        elapsed_ms: started.elapsed().as_millis() as u64,
    };

    let members = servers.iter().map(|s| s.status()).collect();
    instances.shutdown_all().await?;

    Ok(SimulationReport {
        members,
        query,
        replication_ms,
    })
}

fn describe(outcome: &MemberOutcome) -> String {
    match outcome {
        MemberOutcome::Success => "success".to_string(),
        MemberOutcome::Timeout => "timeout".to_string(),
        MemberOutcome::Error(reason) => format!("error: {}", reason),
    }
}

pub async fn simulate(base: &CohortConfig, options: &SimulationOptions, format: OutputFormat) -> Result<()> {
    let report = run_simulation(base, options).await?;
    if format == OutputFormat::Json {
        return output::json(&report);
    }

    output::header("Members");
    let mut table = TableBuilder::new().header(vec![
        "Server",
        "Collection",
        "Local",
        "Copies",
        "Peers",
        "Published",
        "Applied",
        "Conflicts",
    ]);
    for member in &report.members {
        table = table.row(vec![
            member.server_name.clone(),
            member.metadata_collection_id.to_string(),
            member.local_entities.to_string(),
            member.entity_copies.to_string(),
            member.members.to_string(),
            member.exchange.published.to_string(),
            member.exchange.applied.to_string(),
            member.exchange.conflicts.to_string(),
        ]);
    }
    table.print();
    output::kv(
        "Replication settled in",
        output::format_duration(Duration::from_millis(report.replication_ms)),
    );

    output::header(format!("Enterprise search from {}", report.query.queried_from));
    output::kv("Results", report.query.results);
    output::kv(
        "Elapsed",
        output::format_duration(Duration::from_millis(report.query.elapsed_ms)),
    );
    let mut table = TableBuilder::new().header(vec!["Member", "Outcome"]);
    for (member, outcome) in &report.query.member_status {
        table = table.row(vec![member.to_string(), describe(outcome)]);
    }
    table.print();

    if report.query.complete {
        output::success("Every member answered");
    } else {
        output::warning("Partial result: some members did not answer");
    }
    Ok(())
}
