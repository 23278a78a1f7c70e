//! Configuration and type definition commands.

use crate::output::{self, OutputFormat, TableBuilder};
use anyhow::{Context, Result, bail};
use cohort_core::config::CohortConfig;
use cohort_core::types::TypeDef;
use cohort_federation::audit::{AuditLog, DEFAULT_AUDIT_CAPACITY};
use cohort_federation::typedef_store::{TypeDefApplied, TypeDefStore};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

// ============================================================================
// Config
// ============================================================================

/// Resolve the config file a command operates on
pub fn config_target(path: Option<&Path>) -> Result<PathBuf> {
    match path {
        Some(path) => Ok(path.to_path_buf()),
        None => CohortConfig::config_path().context("Failed to locate configuration directory"),
    }
}

/// Write a default configuration, refusing to overwrite unless `force` is set
pub async fn init_config(path: Option<&Path>, force: bool) -> Result<PathBuf> {
    let target = config_target(path)?;
    if target.exists() && !force {
        bail!(
            "Configuration already exists at {} (use --force to overwrite)",
            target.display()
        );
    }

    CohortConfig::default()
        .save_to_path(&target)
        .await
        .with_context(|| format!("Failed to write {}", target.display()))?;
    info!(path = %target.display(), "Wrote default configuration");
    Ok(target)
}

pub async fn config_init(path: Option<&Path>, force: bool, format: OutputFormat) -> Result<()> {
    let target = init_config(path, force).await?;
    match format {
        OutputFormat::Json => output::json(&serde_json::json!({ "path": target })),
        OutputFormat::Human => {
            output::success(format!("Configuration written to {}", target.display()));
            Ok(())
        }
    }
}

pub async fn config_show(path: Option<&Path>, format: OutputFormat) -> Result<()> {
    let config = CohortConfig::load_or_default(path).await?;
    match format {
        OutputFormat::Json => output::json(&config),
        OutputFormat::Human => {
            print!("{}", config.export_toml()?);
            Ok(())
        }
    }
}

pub async fn config_validate(path: Option<&Path>, format: OutputFormat) -> Result<()> {
    let target = config_target(path)?;
    let config = CohortConfig::load_from_path(&target)
        .await
        .with_context(|| format!("Invalid configuration in {}", target.display()))?;

    match format {
        OutputFormat::Json => output::json(&serde_json::json!({
            "path": target,
            "valid": true,
            "server_name": config.general.server_name,
        })),
        OutputFormat::Human => {
            output::success(format!("{} is valid", target.display()));
            output::kv("Server", &config.general.server_name);
            output::kv("Cohort", &config.general.cohort_name);
            Ok(())
        }
    }
}

// ============================================================================
// Type definitions
// ============================================================================

/// How one definition in a file fared
#[derive(Debug, Clone, Serialize)]
pub struct TypeDefCheck {
    pub name: String,
    pub version: u64,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TypeDefCheckReport {
    pub file: PathBuf,
    pub checks: Vec<TypeDefCheck>,
    pub accepted: usize,
    pub rejected: usize,
}

impl TypeDefCheckReport {
    pub fn is_clean(&self) -> bool {
        self.rejected == 0
    }
}

/// Load a JSON array of type definitions, in order, into an empty store
pub async fn check_type_defs(path: &Path) -> Result<TypeDefCheckReport> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let defs: Vec<TypeDef> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse type definitions in {}", path.display()))?;
    debug!(file = %path.display(), count = defs.len(), "Checking type definitions");

    let audit = Arc::new(AuditLog::new("cohort-cli", DEFAULT_AUDIT_CAPACITY));
    let store = TypeDefStore::new("cohort-cli".into(), audit);

    let mut checks = Vec::with_capacity(defs.len());
    for def in defs {
        let (name, version) = (def.name.clone(), def.version);
        let (outcome, reason) = match store.add_type_def(def) {
            Ok(TypeDefApplied::Added) => ("added", None),
            Ok(TypeDefApplied::Replaced) => ("replaced", None),
            Ok(TypeDefApplied::Duplicate) => ("duplicate", None),
            Err(e) => ("rejected", Some(e.to_string())),
        };
        checks.push(TypeDefCheck {
            name,
            version,
            outcome: outcome.to_string(),
            reason,
        });
    }

    let rejected = checks.iter().filter(|c| c.reason.is_some()).count();
    Ok(TypeDefCheckReport {
        file: path.to_path_buf(),
        accepted: checks.len() - rejected,
        rejected,
        checks,
    })
}

pub async fn typedefs_check(path: &Path, format: OutputFormat) -> Result<()> {
    let report = check_type_defs(path).await?;

    match format {
        OutputFormat::Json => output::json(&report)?,
        OutputFormat::Human => {
            output::header(format!("Type definitions in {}", report.file.display()));
            let mut table = TableBuilder::new().header(vec!["Name", "Version", "Outcome", "Reason"]);
            for check in &report.checks {
                table = table.row(vec![
                    check.name.clone(),
                    check.version.to_string(),
                    check.outcome.clone(),
                    check.reason.clone().unwrap_or_default(),
                ]);
            }
            table.print();
        }
    }

    if !report.is_clean() {
        bail!("{} of {} type definitions rejected", report.rejected, report.checks.len());
    }
    if format == OutputFormat::Human {
        output::success(format!("{} type definitions accepted", report.accepted));
    }
    Ok(())
}
