//! Paginated enumeration of the datasets sharing one identifier.

use std::collections::VecDeque;

use dedupe_catalog::{CatalogClient, CatalogError};
use dedupe_core::Dataset;
use tracing::{debug, warn};

pub const DEFAULT_BATCH_ROWS: usize = 1000;

/// Forward-only cursor over `(organization, identifier)` datasets.
///
/// Pages are fetched lazily. The offset advances by what the server actually
/// returned, and an empty page before `total` is reached ends the sequence.
/// Build a fresh cursor for every attempt at an identifier.
pub struct DatasetBatches<'a> {
    catalog: &'a dyn CatalogClient,
    organization: &'a str,
    identifier: &'a str,
    total: u64,
    rows: usize,
    offset: u64,
    page: VecDeque<Dataset>,
    exhausted: bool,
    inconsistent: bool,
}

impl<'a> DatasetBatches<'a> {
    pub fn new(
        catalog: &'a dyn CatalogClient,
        organization: &'a str,
        identifier: &'a str,
        total: u64,
    ) -> Self {
        Self {
            catalog,
            organization,
            identifier,
            total,
            rows: DEFAULT_BATCH_ROWS,
            offset: 0,
            page: VecDeque::new(),
            exhausted: false,
            inconsistent: false,
        }
    }

    pub fn with_rows(mut self, rows: usize) -> Self {
        self.rows = rows.max(1);
        self
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// True once the server returned an empty page short of the expected total.
    pub fn is_inconsistent(&self) -> bool {
        self.inconsistent
    }

    pub async fn next_dataset(&mut self) -> Result<Option<Dataset>, CatalogError> {
        loop {
            if let Some(dataset) = self.page.pop_front() {
                return Ok(Some(dataset));
            }
            if self.exhausted || self.offset >= self.total {
                return Ok(None);
            }

            debug!(
                offset = self.offset,
                rows = self.rows,
                total = self.total,
                "Batch fetching datasets for harvest"
            );
            let page = self
                .catalog
                .get_datasets(self.organization, self.identifier, self.offset, self.rows)
                .await?;

            if page.is_empty() {
                warn!(
                    offset = self.offset,
                    total = self.total,
                    "Got zero datasets from API"
                );
                self.exhausted = true;
                self.inconsistent = true;
                return Ok(None);
            }

            self.offset += page.len() as u64;
            self.page.extend(page);
        }
    }
}
