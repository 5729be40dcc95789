//! Durable audit logs + retrying HTTP transport for dedupe.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use dedupe_core::{Dataset, RunId, IDENTIFIER_KEY, SOURCE_HASH_KEY};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "dedupe-storage";

pub fn default_removed_log_path(run_id: &RunId) -> PathBuf {
    PathBuf::from(format!("removed-packages-{run_id}.log"))
}

pub fn default_duplicate_log_path(run_id: &RunId) -> PathBuf {
    PathBuf::from(format!("duplicate-packages-{run_id}.csv"))
}

async fn open_truncated(path: &Path) -> anyhow::Result<fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating log directory {}", parent.display()))?;
    }
    fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))
}

/// Write, flush and fsync so the entry survives a crash right after `add` returns.
async fn append_durably(file: &mut fs::File, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing {}", path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing {}", path.display()))?;
    Ok(())
}

/// Append-only log of removed datasets, one JSON document per line.
#[derive(Debug)]
pub struct RemovedPackageLog {
    path: PathBuf,
    file: fs::File,
}

impl RemovedPackageLog {
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        info!(filename = %path.display(), "Opening removed packages log for writing");
        let file = open_truncated(&path).await?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn add(&mut self, dataset: &Dataset) -> anyhow::Result<()> {
        debug!(package = %dataset.id, "Saving package to removed package log");
        let mut line = serde_json::to_vec(dataset)
            .with_context(|| format!("serializing removed package {}", dataset.id))?;
        line.push(b'\n');
        append_durably(&mut self.file, &self.path, &line).await
    }
}

pub const DUPLICATE_LOG_COLUMNS: [&str; 11] = [
    "organization",
    "duplicate_id",
    "duplicate_title",
    "duplicate_name",
    "duplicate_url",
    "duplicate_metadata_created",
    "duplicate_identifier",
    "duplicate_source_hash",
    "retained_id",
    "retained_url",
    "retained_metadata_created",
];

/// CSV report pairing each removed duplicate with the dataset that was kept.
#[derive(Debug)]
pub struct DuplicatePackageLog {
    path: PathBuf,
    api_url: String,
    file: fs::File,
}

impl DuplicatePackageLog {
    pub async fn open(
        path: impl Into<PathBuf>,
        api_url: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let path = path.into();
        info!(filename = %path.display(), "Opening duplicate package report for writing");
        let mut file = open_truncated(&path).await?;
        let header = csv_row(DUPLICATE_LOG_COLUMNS)?;
        append_durably(&mut file, &path, &header).await?;
        Ok(Self {
            path,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dataset_url(&self, dataset: &Dataset) -> String {
        format!("{}/dataset/{}", self.api_url, dataset.name)
    }

    pub async fn add(&mut self, duplicate: &Dataset, retained: &Dataset) -> anyhow::Result<()> {
        debug!(package = %duplicate.id, "Recording duplicate package to report");
        let duplicate_url = self.dataset_url(duplicate);
        let retained_url = self.dataset_url(retained);
        let row = csv_row([
            duplicate.organization_name().unwrap_or_default(),
            duplicate.id.as_str(),
            duplicate.title.as_str(),
            duplicate.name.as_str(),
            duplicate_url.as_str(),
            duplicate.metadata_created.as_str(),
            duplicate.extra(IDENTIFIER_KEY).unwrap_or_default(),
            duplicate.extra(SOURCE_HASH_KEY).unwrap_or_default(),
            retained.id.as_str(),
            retained_url.as_str(),
            retained.metadata_created.as_str(),
        ])?;
        append_durably(&mut self.file, &self.path, &row).await
    }
}

/// Encodes one CSV record; the caller owns flushing it to disk.
fn csv_row<'a>(fields: impl IntoIterator<Item = &'a str>) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::CRLF)
        .from_writer(Vec::new());
    writer
        .write_record(fields)
        .context("encoding duplicate report row")?;
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("finishing duplicate report row: {}", err.error()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Sent verbatim in the `Authorization` header.
    pub api_key: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            api_key: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
}

impl FetchError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            Self::HttpStatus { status, .. } => Some(*status),
        }
    }
}

/// Sequential HTTP transport; each request is retried with capped backoff.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpTransport {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        if let Some(api_key) = &config.api_key {
            let mut value = HeaderValue::from_str(api_key)
                .context("api key is not a valid header value")?;
            value.set_sensitive(true);
            let mut headers = HeaderMap::new();
            headers.insert(AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<HttpResponse, FetchError> {
        self.send_with_retry(url, || self.client.get(url).query(query))
            .await
    }

    pub async fn post_json(&self, url: &str, body: &JsonValue) -> Result<HttpResponse, FetchError> {
        self.send_with_retry(url, || self.client.post(url).json(body))
            .await
    }

    async fn send_with_retry<F>(&self, url: &str, build: F) -> Result<HttpResponse, FetchError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(HttpResponse { status, body });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%url, status = status.as_u16(), attempt, "Retrying catalog request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%url, error = %err, attempt, "Retrying catalog request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dedupe_core::{Extra, OrganizationRef};
    use serde_json::Map;
    use tempfile::tempdir;

    fn dataset(id: &str, name: &str, title: &str, created: &str) -> Dataset {
        Dataset {
            id: id.into(),
            name: name.into(),
            title: title.into(),
            organization: Some(OrganizationRef {
                name: "acme".into(),
                other: Map::new(),
            }),
            metadata_created: created.into(),
            extras: vec![
                Extra {
                    key: IDENTIFIER_KEY.into(),
                    value: "abc".into(),
                },
                Extra {
                    key: SOURCE_HASH_KEY.into(),
                    value: "hash-1".into(),
                },
            ],
            other: Map::new(),
        }
    }

    #[test]
    fn default_paths_embed_run_id() {
        let run = RunId::new("20260224120000");
        assert_eq!(
            default_removed_log_path(&run),
            PathBuf::from("removed-packages-20260224120000.log")
        );
        assert_eq!(
            default_duplicate_log_path(&run),
            PathBuf::from("duplicate-packages-20260224120000.csv")
        );
    }

    #[test]
    fn csv_rows_quote_only_fields_that_need_it() {
        let row = csv_row(["plain", "a, b", "say \"hi\"", ""]).expect("row");
        assert_eq!(
            String::from_utf8(row).expect("utf8"),
            "plain,\"a, b\",\"say \"\"hi\"\"\",\r\n"
        );
    }

    #[tokio::test]
    async fn removed_log_appends_one_json_line_per_dataset() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("logs").join("removed.log");
        let mut log = RemovedPackageLog::open(&path).await.expect("open");

        log.add(&dataset("d1", "one", "One", "2017-01-01T00:00:00"))
            .await
            .expect("add d1");
        log.add(&dataset("d2", "two", "Two", "2017-01-02T00:00:00"))
            .await
            .expect("add d2");

        let text = std::fs::read_to_string(&path).expect("read log");
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Dataset = serde_json::from_str(lines[0]).expect("parse line");
        assert_eq!(first.id, "d1");
    }

    #[tokio::test]
    async fn duplicate_log_writes_header_once_and_fixed_rows() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("duplicates.csv");
        let mut log = DuplicatePackageLog::open(&path, "https://catalog.example.gov/")
            .await
            .expect("open");

        let retained = dataset("r1", "kept", "Kept", "2017-01-01T00:00:00");
        let duplicate = dataset("d1", "dupe", "Dupe, Again", "2018-01-01T00:00:00");
        log.add(&duplicate, &retained).await.expect("add");

        let text = std::fs::read_to_string(&path).expect("read csv");
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], DUPLICATE_LOG_COLUMNS.join(","));
        assert_eq!(
            lines[1],
            "acme,d1,\"Dupe, Again\",dupe,https://catalog.example.gov/dataset/dupe,\
             2018-01-01T00:00:00,abc,hash-1,r1,https://catalog.example.gov/dataset/kept,\
             2017-01-01T00:00:00"
        );
    }

    #[test]
    fn retry_classification_matches_server_side_failures() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
