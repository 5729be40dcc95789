//! Catalog client contract + CKAN action API implementation.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dedupe_core::Dataset;
use dedupe_storage::{BackoffPolicy, FetchError, HttpClientConfig, HttpTransport};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "dedupe-catalog";

/// Facet bucket for an identifier shared by several datasets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierFacet {
    pub name: String,
    #[serde(default)]
    pub count: u64,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    /// The remote call failed (network, HTTP status, auth, or an unsuccessful envelope).
    #[error("catalog {operation} failed: {message}")]
    Failure {
        operation: &'static str,
        status: Option<u16>,
        message: String,
    },
    /// The server reported a count that disagrees with what it returns.
    #[error("invalid count organization={organization} identifier={identifier}: {message}")]
    Count {
        organization: String,
        identifier: String,
        message: String,
    },
}

impl CatalogError {
    pub fn failure(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Failure {
            operation,
            status: None,
            message: message.into(),
        }
    }

    pub fn from_fetch(operation: &'static str, err: FetchError) -> Self {
        Self::Failure {
            operation,
            status: err.status_code(),
            message: err.to_string(),
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Failure { status, .. } => *status,
            Self::Count { .. } => None,
        }
    }
}

/// Remote operations dedupe needs from the catalog.
///
/// Calls are issued one at a time; implementations own transport, auth and retries.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Dataset identifiers (outside collections) shared by two or more datasets.
    async fn get_duplicate_identifiers(
        &self,
        organization: &str,
    ) -> Result<Vec<IdentifierFacet>, CatalogError>;

    /// Collection member identifiers shared by two or more datasets.
    async fn get_duplicate_collection_identifiers(
        &self,
        organization: &str,
    ) -> Result<Vec<IdentifierFacet>, CatalogError>;

    async fn get_dataset_count(
        &self,
        organization: &str,
        identifier: &str,
    ) -> Result<u64, CatalogError>;

    /// The earliest-created dataset carrying `identifier`, in any organization.
    async fn get_oldest_dataset(&self, identifier: &str) -> Result<Dataset, CatalogError>;

    async fn get_datasets(
        &self,
        organization: &str,
        identifier: &str,
        offset: u64,
        rows: usize,
    ) -> Result<Vec<Dataset>, CatalogError>;

    async fn update_package(&self, dataset: &Dataset) -> Result<(), CatalogError>;

    async fn remove_package(&self, id: &str) -> Result<(), CatalogError>;

    /// Names of every organization in the catalog.
    async fn get_organizations(&self) -> Result<Vec<String>, CatalogError>;
}

#[derive(Debug, Clone)]
pub struct CkanConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub user_agent: Option<String>,
    pub timeout: Duration,
    /// When false, updates and removals are logged but not sent.
    pub commit: bool,
}

#[derive(Debug, Deserialize)]
struct ActionEnvelope<T> {
    success: bool,
    result: Option<T>,
    #[serde(default)]
    error: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct PackageSearchResult {
    #[serde(default)]
    count: JsonValue,
    #[serde(default)]
    results: Vec<Dataset>,
    #[serde(default)]
    search_facets: Map<String, JsonValue>,
}

#[derive(Debug, Deserialize)]
struct FacetField {
    #[serde(default)]
    items: Vec<IdentifierFacet>,
}

/// Quote a value for use inside a Solr filter query.
pub fn solr_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

pub fn duplicate_identifiers_filter(organization: &str, collection: bool) -> String {
    let collection_clause = if collection {
        "collection_package_id:*"
    } else {
        "-collection_package_id:*"
    };
    format!(
        "organization:{} AND type:dataset AND {collection_clause}",
        solr_quote(organization)
    )
}

pub fn identifier_filter(organization: &str, identifier: &str) -> String {
    format!(
        "organization:{} AND type:dataset AND identifier:{}",
        solr_quote(organization),
        solr_quote(identifier)
    )
}

fn parse_envelope<T: DeserializeOwned>(
    operation: &'static str,
    body: &[u8],
) -> Result<T, CatalogError> {
    let envelope: ActionEnvelope<T> = serde_json::from_slice(body)
        .map_err(|err| CatalogError::failure(operation, format!("malformed response: {err}")))?;
    if !envelope.success {
        let detail = envelope
            .error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unsuccessful response".to_string());
        return Err(CatalogError::failure(operation, detail));
    }
    envelope
        .result
        .ok_or_else(|| CatalogError::failure(operation, "response is missing result"))
}

/// Checks the envelope of an action whose result may legitimately be null.
fn parse_ack(operation: &'static str, body: &[u8]) -> Result<(), CatalogError> {
    let envelope: ActionEnvelope<JsonValue> = serde_json::from_slice(body)
        .map_err(|err| CatalogError::failure(operation, format!("malformed response: {err}")))?;
    if envelope.success {
        return Ok(());
    }
    let detail = envelope
        .error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "unsuccessful response".to_string());
    Err(CatalogError::failure(operation, detail))
}

/// A purge answered with 404 means the dataset is gone, e.g. when an earlier
/// attempt succeeded server-side but its response was lost and retried.
fn already_purged_is_success(
    id: &str,
    result: Result<(), CatalogError>,
) -> Result<(), CatalogError> {
    match result {
        Err(err) if err.status_code() == Some(404) => {
            info!(package = %id, "Package already purged");
            Ok(())
        }
        other => other,
    }
}

fn identifier_facets(
    operation: &'static str,
    result: PackageSearchResult,
) -> Result<Vec<IdentifierFacet>, CatalogError> {
    let Some(field) = result.search_facets.get("identifier") else {
        return Ok(Vec::new());
    };
    let field: FacetField = serde_json::from_value(field.clone())
        .map_err(|err| {
            CatalogError::failure(operation, format!("malformed identifier facet: {err}"))
        })?;
    Ok(field.items)
}

/// CKAN-backed catalog client.
#[derive(Debug)]
pub struct CkanCatalog {
    http: HttpTransport,
    api_url: String,
    commit: bool,
}

impl CkanCatalog {
    pub fn new(config: CkanConfig) -> anyhow::Result<Self> {
        let http = HttpTransport::new(HttpClientConfig {
            timeout: config.timeout,
            user_agent: config.user_agent.clone(),
            api_key: config.api_key.clone(),
            backoff: BackoffPolicy::default(),
        })
        .context("building catalog transport")?;
        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            commit: config.commit,
        })
    }

    pub fn is_dry_run(&self) -> bool {
        !self.commit
    }

    fn action_url(&self, action: &str) -> String {
        format!("{}/api/action/{action}", self.api_url)
    }

    async fn get_action<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        action: &str,
        query: &[(&str, String)],
    ) -> Result<T, CatalogError> {
        let response = self
            .http
            .get(&self.action_url(action), query)
            .await
            .map_err(|err| CatalogError::from_fetch(operation, err))?;
        parse_envelope(operation, &response.body)
    }

    async fn post_action(
        &self,
        operation: &'static str,
        action: &str,
        body: &JsonValue,
    ) -> Result<(), CatalogError> {
        let response = self
            .http
            .post_json(&self.action_url(action), body)
            .await
            .map_err(|err| CatalogError::from_fetch(operation, err))?;
        parse_ack(operation, &response.body)
    }

    async fn search_duplicate_identifiers(
        &self,
        operation: &'static str,
        organization: &str,
        collection: bool,
    ) -> Result<Vec<IdentifierFacet>, CatalogError> {
        let result: PackageSearchResult = self
            .get_action(
                operation,
                "package_search",
                &[
                    ("fq", duplicate_identifiers_filter(organization, collection)),
                    ("facet.field", "[\"identifier\"]".to_string()),
                    ("facet.mincount", "2".to_string()),
                    ("facet.limit", "-1".to_string()),
                    ("rows", "0".to_string()),
                ],
            )
            .await?;
        identifier_facets(operation, result)
    }
}

#[async_trait]
impl CatalogClient for CkanCatalog {
    async fn get_duplicate_identifiers(
        &self,
        organization: &str,
    ) -> Result<Vec<IdentifierFacet>, CatalogError> {
        self.search_duplicate_identifiers("get_duplicate_identifiers", organization, false)
            .await
    }

    async fn get_duplicate_collection_identifiers(
        &self,
        organization: &str,
    ) -> Result<Vec<IdentifierFacet>, CatalogError> {
        self.search_duplicate_identifiers(
            "get_duplicate_collection_identifiers",
            organization,
            true,
        )
        .await
    }

    async fn get_dataset_count(
        &self,
        organization: &str,
        identifier: &str,
    ) -> Result<u64, CatalogError> {
        let result: PackageSearchResult = self
            .get_action(
                "get_dataset_count",
                "package_search",
                &[
                    ("fq", identifier_filter(organization, identifier)),
                    ("rows", "0".to_string()),
                ],
            )
            .await?;
        result.count.as_u64().ok_or_else(|| CatalogError::Count {
            organization: organization.to_string(),
            identifier: identifier.to_string(),
            message: format!("count is not a non-negative integer: {}", result.count),
        })
    }

    async fn get_oldest_dataset(&self, identifier: &str) -> Result<Dataset, CatalogError> {
        let result: PackageSearchResult = self
            .get_action(
                "get_oldest_dataset",
                "package_search",
                &[
                    ("fq", format!("type:dataset AND identifier:{}", solr_quote(identifier))),
                    ("sort", "metadata_created asc".to_string()),
                    ("rows", "1".to_string()),
                ],
            )
            .await?;
        result
            .results
            .into_iter()
            .next()
            .ok_or_else(|| CatalogError::Count {
                organization: String::new(),
                identifier: identifier.to_string(),
                message: "no dataset returned for identifier".to_string(),
            })
    }

    async fn get_datasets(
        &self,
        organization: &str,
        identifier: &str,
        offset: u64,
        rows: usize,
    ) -> Result<Vec<Dataset>, CatalogError> {
        let result: PackageSearchResult = self
            .get_action(
                "get_datasets",
                "package_search",
                &[
                    ("fq", identifier_filter(organization, identifier)),
                    ("sort", "metadata_created asc".to_string()),
                    ("start", offset.to_string()),
                    ("rows", rows.to_string()),
                ],
            )
            .await?;
        Ok(result.results)
    }

    async fn update_package(&self, dataset: &Dataset) -> Result<(), CatalogError> {
        if !self.commit {
            info!(package = %dataset.id, "Dry run, skipping package_update");
            return Ok(());
        }
        debug!(package = %dataset.id, "Updating package");
        let body = serde_json::to_value(dataset)
            .map_err(|err| CatalogError::failure("update_package", err.to_string()))?;
        self.post_action("update_package", "package_update", &body)
            .await
    }

    async fn remove_package(&self, id: &str) -> Result<(), CatalogError> {
        if !self.commit {
            info!(package = %id, "Dry run, skipping dataset_purge");
            return Ok(());
        }
        debug!(package = %id, "Purging package");
        let result = self
            .post_action("remove_package", "dataset_purge", &json!({ "id": id }))
            .await;
        already_purged_is_success(id, result)
    }

    async fn get_organizations(&self) -> Result<Vec<String>, CatalogError> {
        self.get_action("get_organizations", "organization_list", &[])
            .await
    }
}
