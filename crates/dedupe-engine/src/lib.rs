//! Dedupe orchestration: configuration, per-organization runs and the run summary.

pub mod batches;
pub mod deduper;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dedupe_catalog::{CatalogClient, CkanCatalog, CkanConfig};
use dedupe_storage::{
    default_duplicate_log_path, default_removed_log_path, DuplicatePackageLog, RemovedPackageLog,
};
use serde::Serialize;
use tracing::{error, info, warn};

pub use batches::{DatasetBatches, DEFAULT_BATCH_ROWS};
pub use dedupe_core::RunId;
pub use deduper::{DedupeError, Deduper, StopHandle};

pub const CRATE_NAME: &str = "dedupe-engine";

#[derive(Debug, Clone)]
pub struct DedupeConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Without commit the run is a dry run: audit logs are written, the catalog is not changed.
    pub commit: bool,
    pub run_id: RunId,
    pub batch_rows: usize,
    pub removed_package_log: Option<PathBuf>,
    pub duplicate_package_log: Option<PathBuf>,
}

impl DedupeConfig {
    pub fn from_env() -> Self {
        Self {
            api_url: std::env::var("CKAN_API_URL")
                .unwrap_or_else(|_| "https://catalog.data.gov".to_string()),
            api_key: std::env::var("CKAN_API_KEY").ok().filter(|v| !v.is_empty()),
            user_agent: std::env::var("DEDUPE_USER_AGENT")
                .unwrap_or_else(|_| "datagov-dedupe/0.1".to_string()),
            http_timeout_secs: std::env::var("DEDUPE_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            commit: std::env::var("DEDUPE_COMMIT")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            run_id: std::env::var("DEDUPE_RUN_ID")
                .ok()
                .filter(|v| !v.is_empty())
                .map(RunId::new)
                .unwrap_or_else(RunId::generate),
            batch_rows: std::env::var("DEDUPE_BATCH_ROWS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BATCH_ROWS),
            removed_package_log: std::env::var("DEDUPE_REMOVED_PACKAGE_LOG")
                .ok()
                .map(PathBuf::from),
            duplicate_package_log: std::env::var("DEDUPE_DUPLICATE_PACKAGE_LOG")
                .ok()
                .map(PathBuf::from),
        }
    }

    pub fn removed_log_path(&self) -> PathBuf {
        self.removed_package_log
            .clone()
            .unwrap_or_else(|| default_removed_log_path(&self.run_id))
    }

    pub fn duplicate_log_path(&self) -> PathBuf {
        self.duplicate_package_log
            .clone()
            .unwrap_or_else(|| default_duplicate_log_path(&self.run_id))
    }

    pub fn ckan_config(&self) -> CkanConfig {
        CkanConfig {
            api_url: self.api_url.clone(),
            api_key: self.api_key.clone(),
            user_agent: Some(self.user_agent.clone()),
            timeout: Duration::from_secs(self.http_timeout_secs),
            commit: self.commit,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupeRunSummary {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub organizations: usize,
    pub failed_organizations: usize,
    pub duplicates_removed: usize,
    pub commit: bool,
    pub stopped: bool,
    pub removed_package_log: String,
    pub duplicate_package_log: String,
}

/// Dedupes `organizations` (or every organization when empty) against CKAN.
pub async fn run_dedupe(
    config: &DedupeConfig,
    organizations: Vec<String>,
    stop: StopHandle,
) -> Result<DedupeRunSummary> {
    let catalog = CkanCatalog::new(config.ckan_config())?;
    if catalog.is_dry_run() {
        warn!("Running in dry-run mode, no datasets will be changed (pass --commit to apply)");
    }
    run_dedupe_with_catalog(config, Arc::new(catalog), organizations, stop).await
}

pub async fn run_dedupe_with_catalog(
    config: &DedupeConfig,
    catalog: Arc<dyn CatalogClient>,
    organizations: Vec<String>,
    stop: StopHandle,
) -> Result<DedupeRunSummary> {
    let started_at = Utc::now();
    let organizations = if organizations.is_empty() {
        info!("No organizations given, fetching all organizations");
        catalog
            .get_organizations()
            .await
            .context("listing organizations")?
    } else {
        organizations
    };

    let removed_path = config.removed_log_path();
    let duplicate_path = config.duplicate_log_path();
    let removed_log = RemovedPackageLog::open(&removed_path)
        .await
        .context("opening removed package log")?;
    let duplicate_log = DuplicatePackageLog::open(&duplicate_path, config.api_url.clone())
        .await
        .context("opening duplicate package log")?;

    let mut deduper = Deduper::new(catalog)
        .with_run_id(config.run_id.clone())
        .with_audit_logs(Some(removed_log), Some(duplicate_log))
        .with_batch_rows(config.batch_rows)
        .with_stop_handle(stop.clone());

    let mut duplicates_removed = 0usize;
    let mut failed_organizations = 0usize;
    for organization in &organizations {
        if stop.is_stopped() {
            warn!("Stop requested, skipping remaining organizations");
            break;
        }
        match deduper.process_organization(organization).await {
            Ok(count) => duplicates_removed += count,
            Err(err) => {
                failed_organizations += 1;
                error!(organization = %organization, error = %err, "Failed to dedupe organization");
            }
        }
    }

    Ok(DedupeRunSummary {
        run_id: deduper.run_id().clone(),
        started_at,
        finished_at: Utc::now(),
        organizations: organizations.len(),
        failed_organizations,
        duplicates_removed,
        commit: config.commit,
        stopped: stop.is_stopped(),
        removed_package_log: removed_path.display().to_string(),
        duplicate_package_log: duplicate_path.display().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(run_id: &str) -> DedupeConfig {
        DedupeConfig {
            api_url: "https://catalog.example.gov".into(),
            api_key: None,
            user_agent: "test".into(),
            http_timeout_secs: 5,
            commit: false,
            run_id: RunId::new(run_id),
            batch_rows: 10,
            removed_package_log: None,
            duplicate_package_log: None,
        }
    }

    #[test]
    fn log_paths_default_to_run_id() {
        let config = config("20260224120000");
        assert_eq!(
            config.removed_log_path(),
            PathBuf::from("removed-packages-20260224120000.log")
        );
        assert_eq!(
            config.duplicate_log_path(),
            PathBuf::from("duplicate-packages-20260224120000.csv")
        );
    }

    #[test]
    fn explicit_log_paths_win() {
        let mut config = config("20260224120000");
        config.removed_package_log = Some(PathBuf::from("/tmp/removed.log"));
        assert_eq!(config.removed_log_path(), PathBuf::from("/tmp/removed.log"));
    }

    #[test]
    fn ckan_config_carries_commit_flag_and_timeout() {
        let mut config = config("r");
        config.commit = true;
        let ckan = config.ckan_config();
        assert!(ckan.commit);
        assert_eq!(ckan.timeout, Duration::from_secs(5));
        assert_eq!(ckan.user_agent.as_deref(), Some("test"));
    }
}
