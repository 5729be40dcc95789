//! Per-organization scan and per-identifier removal of duplicate datasets.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dedupe_catalog::{CatalogClient, CatalogError};
use dedupe_core::{mark_in_progress, mark_retained, Dataset, RunId};
use dedupe_storage::{DuplicatePackageLog, RemovedPackageLog};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::batches::{DatasetBatches, DEFAULT_BATCH_ROWS};

#[derive(Debug, Error)]
pub enum DedupeError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("audit log write failed: {0:#}")]
    Audit(anyhow::Error),
}

impl DedupeError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Catalog(err) => err.status_code(),
            Self::Audit(_) => None,
        }
    }
}

/// Cooperative stop flag shared between a running [`Deduper`] and its caller.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Removes datasets that share a harvest identifier within an organization,
/// keeping the oldest one.
///
/// Not meant to be shared across concurrent organization runs.
pub struct Deduper {
    catalog: Arc<dyn CatalogClient>,
    removed_log: Option<RemovedPackageLog>,
    duplicate_log: Option<DuplicatePackageLog>,
    run_id: RunId,
    batch_rows: usize,
    stop: StopHandle,
}

impl Deduper {
    pub fn new(catalog: Arc<dyn CatalogClient>) -> Self {
        Self {
            catalog,
            removed_log: None,
            duplicate_log: None,
            run_id: RunId::generate(),
            batch_rows: DEFAULT_BATCH_ROWS,
            stop: StopHandle::new(),
        }
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn with_audit_logs(
        mut self,
        removed_log: Option<RemovedPackageLog>,
        duplicate_log: Option<DuplicatePackageLog>,
    ) -> Self {
        self.removed_log = removed_log;
        self.duplicate_log = duplicate_log;
        self
    }

    pub fn with_batch_rows(mut self, rows: usize) -> Self {
        self.batch_rows = rows.max(1);
        self
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Tells the deduper to stop processing any more datasets.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Dedupes every identifier with duplicates in `organization`.
    ///
    /// Only a failure to list the identifiers is returned as an error; failures
    /// for a single identifier are logged and the scan moves on.
    pub async fn process_organization(&mut self, organization: &str) -> Result<usize, DedupeError> {
        let span = info_span!("dedupe_organization", organization);
        self.scan_organization(organization).instrument(span).await
    }

    async fn scan_organization(&mut self, organization: &str) -> Result<usize, DedupeError> {
        debug!("Fetching dataset identifiers with duplicates");
        let dataset_identifiers = self
            .catalog
            .get_duplicate_identifiers(organization)
            .await
            .inspect_err(|err| {
                error!(error = %err, "Failed to fetch dataset identifiers for organization")
            })?;
        info!(
            count = dataset_identifiers.len(),
            "Found dataset identifiers with duplicates"
        );

        debug!("Fetching collection identifiers with duplicates");
        let collection_identifiers = self
            .catalog
            .get_duplicate_collection_identifiers(organization)
            .await
            .inspect_err(|err| {
                error!(error = %err, "Failed to fetch collection identifiers for organization")
            })?;
        info!(
            count = collection_identifiers.len(),
            "Found collection identifiers with duplicates"
        );

        let identifiers: BTreeSet<String> = dataset_identifiers
            .into_iter()
            .chain(collection_identifiers)
            .map(|facet| facet.name)
            .collect();

        let total = identifiers.len();
        let mut duplicate_count = 0usize;
        for (index, identifier) in identifiers.iter().enumerate() {
            if self.stop.is_stopped() {
                info!(duplicate_count, "Deduper is stopped, skipping remaining identifiers");
                return Ok(duplicate_count);
            }

            info!(
                identifier = %identifier,
                progress = ?(index + 1, total),
                "Deduplicating identifier"
            );
            match self.process_identifier(organization, identifier).await {
                Ok(count) => duplicate_count += count,
                Err(DedupeError::Catalog(err @ CatalogError::Count { .. })) => {
                    error!(
                        identifier = %identifier,
                        error = %err,
                        "Got an invalid count, this may not be a duplicate or there could be index corruption"
                    );
                }
                Err(err) => {
                    error!(
                        identifier = %identifier,
                        status_code = ?err.status_code(),
                        error = %err,
                        "Failed to dedupe harvest identifier"
                    );
                }
            }
        }

        info!(duplicate_count, "Summary");
        Ok(duplicate_count)
    }

    /// Removes the duplicates of `identifier`, returning how many were found.
    ///
    /// The retained dataset is marked before the first removal and committed
    /// after the last, so an interrupted run can be resumed by calling this
    /// again with the same identifier.
    pub async fn process_identifier(
        &mut self,
        organization: &str,
        identifier: &str,
    ) -> Result<usize, DedupeError> {
        let span = info_span!("dedupe_identifier", organization, identifier);
        self.dedupe_identifier(organization, identifier)
            .instrument(span)
            .await
    }

    async fn dedupe_identifier(
        &mut self,
        organization: &str,
        identifier: &str,
    ) -> Result<usize, DedupeError> {
        debug!("Fetching number of datasets for unique identifier");
        let dataset_count = self
            .catalog
            .get_dataset_count(organization, identifier)
            .await?;
        info!(count = dataset_count, "Found packages");

        if dataset_count <= 1 {
            debug!("No duplicates found for harvest identifier");
            return Ok(0);
        }

        debug!("Fetching oldest dataset for harvest identifier");
        let mut retained = self.catalog.get_oldest_dataset(identifier).await?;

        // Already marked means a previous run was interrupted; resume it.
        if !retained.marker_state().is_in_progress() {
            self.mark_retained_dataset(&mut retained).await?;
        }

        let catalog = Arc::clone(&self.catalog);
        let mut batches =
            DatasetBatches::new(catalog.as_ref(), organization, identifier, dataset_count)
                .with_rows(self.batch_rows);

        let mut duplicate_count = 0usize;
        while let Some(dataset) = batches.next_dataset().await? {
            if self.stop.is_stopped() {
                debug!(duplicate_count, "Deduper is stopped, cleaning up");
                return Ok(duplicate_count);
            }

            let dataset_organization = dataset.organization_name().unwrap_or_default();
            if dataset_organization != organization {
                warn!(
                    pkg_org_name = dataset_organization,
                    package = %dataset.id,
                    name = %dataset.name,
                    "Dataset harvested by organization but not part of organization"
                );
                continue;
            }

            if dataset.id == retained.id {
                debug!(package = %dataset.id, "This package is the retained dataset, not removing");
                continue;
            }

            duplicate_count += 1;
            self.remove_duplicate(&dataset, &retained).await?;
        }

        if batches.is_inconsistent() {
            warn!(
                offset = batches.offset(),
                total = dataset_count,
                "Enumeration ended before the reported count was reached, \
                 re-run this identifier to pick up any skipped duplicates"
            );
        }

        info!(package = %retained.id, name = %retained.name, "Committing retained package");
        self.commit_retained_dataset(&mut retained).await?;

        Ok(duplicate_count)
    }

    /// Writes both audit entries, then asks the catalog to remove `duplicate`.
    ///
    /// A failed removal is logged and swallowed; a failed audit write is not.
    async fn remove_duplicate(
        &mut self,
        duplicate: &Dataset,
        retained: &Dataset,
    ) -> Result<(), DedupeError> {
        info!(package = %duplicate.id, name = %duplicate.name, "Removing duplicate package");
        if let Some(log) = self.removed_log.as_mut() {
            log.add(duplicate).await.map_err(DedupeError::Audit)?;
        }
        if let Some(log) = self.duplicate_log.as_mut() {
            log.add(duplicate, retained).await.map_err(DedupeError::Audit)?;
        }

        if let Err(err) = self.catalog.remove_package(&duplicate.id).await {
            error!(
                status_code = ?err.status_code(),
                package = %duplicate.id,
                name = %duplicate.name,
                error = %err,
                "Failed to remove dataset"
            );
        }
        Ok(())
    }

    async fn mark_retained_dataset(&self, retained: &mut Dataset) -> Result<(), DedupeError> {
        info!(
            package = %retained.id,
            name = %retained.name,
            "Marking retained dataset for idempotency"
        );
        mark_in_progress(retained, &self.run_id);

        debug!(package = %retained.id, "Mark retained package in API");
        self.catalog.update_package(retained).await?;
        Ok(())
    }

    async fn commit_retained_dataset(&self, retained: &mut Dataset) -> Result<(), DedupeError> {
        mark_retained(retained, &self.run_id);

        debug!(package = %retained.id, "Commit retained package in API");
        self.catalog.update_package(retained).await?;
        Ok(())
    }
}
