//! Core catalog model and retention marker helpers for dedupe.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "dedupe-core";

/// Extra set on the retained dataset while its duplicates are being removed.
pub const DEDUPE_MARKER_KEY: &str = "datagov_dedupe";

/// Extra set on the retained dataset once every duplicate has been handled.
pub const RETAINED_MARKER_KEY: &str = "datagov_dedupe_retained";

/// Harvest identifier extra.
pub const IDENTIFIER_KEY: &str = "identifier";

/// Harvest source hash extra.
pub const SOURCE_HASH_KEY: &str = "source_hash";

/// Token distinguishing one dedupe execution from another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Timestamp-style id, e.g. `20260224120000`.
    pub fn generate() -> Self {
        Self::from_timestamp(Utc::now())
    }

    pub fn from_timestamp(at: DateTime<Utc>) -> Self {
        Self(at.format("%Y%m%d%H%M%S").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationRef {
    pub name: String,
    #[serde(flatten)]
    pub other: Map<String, JsonValue>,
}

/// One key/value pair of a dataset's extension metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extra {
    pub key: String,
    pub value: String,
}

/// A catalog dataset (CKAN package).
///
/// Only the fields dedupe reads are typed; everything else the server sends is
/// kept in `other` so that an update round-trips the full package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub organization: Option<OrganizationRef>,
    #[serde(default)]
    pub metadata_created: String,
    #[serde(default)]
    pub extras: Vec<Extra>,
    #[serde(flatten)]
    pub other: Map<String, JsonValue>,
}

impl Dataset {
    pub fn organization_name(&self) -> Option<&str> {
        self.organization.as_ref().map(|org| org.name.as_str())
    }

    pub fn extra(&self, key: &str) -> Option<&str> {
        get_extra(self, key)
    }

    pub fn marker_state(&self) -> MarkerState {
        MarkerState::of(self)
    }
}

/// Returns the value of the first extra named `key`.
pub fn get_extra<'a>(dataset: &'a Dataset, key: &str) -> Option<&'a str> {
    dataset
        .extras
        .iter()
        .find(|extra| extra.key == key)
        .map(|extra| extra.value.as_str())
}

/// Sets `key` to `value`, or removes it when `value` is `None`.
///
/// Existing entries keep their position; new entries are appended.
pub fn set_extra(dataset: &mut Dataset, key: &str, value: Option<&str>) {
    match value {
        Some(value) => {
            if let Some(extra) = dataset.extras.iter_mut().find(|extra| extra.key == key) {
                extra.value = value.to_string();
            } else {
                dataset.extras.push(Extra {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
        }
        None => dataset.extras.retain(|extra| extra.key != key),
    }
}

/// Dedupe progress recorded on a retained dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerState {
    Unmarked,
    /// Duplicates are being removed; safe to resume.
    InProgress(RunId),
    /// Dedupe finished for the named run.
    Retained(RunId),
}

impl MarkerState {
    pub fn of(dataset: &Dataset) -> Self {
        // An in-progress marker takes precedence: the commit always clears it.
        if let Some(run) = non_empty(get_extra(dataset, DEDUPE_MARKER_KEY)) {
            return Self::InProgress(RunId::new(run));
        }
        if let Some(run) = non_empty(get_extra(dataset, RETAINED_MARKER_KEY)) {
            return Self::Retained(RunId::new(run));
        }
        Self::Unmarked
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::InProgress(_))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Stamps the in-progress marker before any duplicate is removed.
///
/// A retained marker from an earlier run is dropped so only one marker is present.
pub fn mark_in_progress(dataset: &mut Dataset, run_id: &RunId) {
    set_extra(dataset, RETAINED_MARKER_KEY, None);
    set_extra(dataset, DEDUPE_MARKER_KEY, Some(run_id.as_str()));
}

/// Replaces the in-progress marker with the retained marker.
pub fn mark_retained(dataset: &mut Dataset, run_id: &RunId) {
    set_extra(dataset, DEDUPE_MARKER_KEY, None);
    set_extra(dataset, RETAINED_MARKER_KEY, Some(run_id.as_str()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn dataset(extras: &[(&str, &str)]) -> Dataset {
        Dataset {
            id: "pkg-1".into(),
            name: "pkg-one".into(),
            title: "Package One".into(),
            organization: Some(OrganizationRef {
                name: "acme".into(),
                other: Map::new(),
            }),
            metadata_created: "2017-01-01T00:00:00".into(),
            extras: extras
                .iter()
                .map(|(k, v)| Extra {
                    key: k.to_string(),
                    value: v.to_string(),
                })
                .collect(),
            other: Map::new(),
        }
    }

    #[test]
    fn run_id_uses_compact_timestamp() {
        let at = Utc.with_ymd_and_hms(2026, 2, 24, 12, 5, 9).single().unwrap();
        assert_eq!(RunId::from_timestamp(at).as_str(), "20260224120509");
    }

    #[test]
    fn set_extra_replaces_in_place_and_removes() {
        let mut ds = dataset(&[("identifier", "abc"), ("source_hash", "h1")]);
        set_extra(&mut ds, "identifier", Some("xyz"));
        assert_eq!(ds.extras[0].key, "identifier");
        assert_eq!(get_extra(&ds, "identifier"), Some("xyz"));

        set_extra(&mut ds, "new_key", Some("v"));
        assert_eq!(ds.extras.last().map(|e| e.key.as_str()), Some("new_key"));

        set_extra(&mut ds, "identifier", None);
        assert_eq!(get_extra(&ds, "identifier"), None);
        assert_eq!(ds.extras.len(), 2);
    }

    #[test]
    fn marker_transitions_hold_one_marker_at_a_time() {
        let run = RunId::new("20260101000000");
        let mut ds = dataset(&[]);
        assert_eq!(ds.marker_state(), MarkerState::Unmarked);

        mark_in_progress(&mut ds, &run);
        assert_eq!(ds.marker_state(), MarkerState::InProgress(run.clone()));

        mark_retained(&mut ds, &run);
        assert_eq!(ds.marker_state(), MarkerState::Retained(run));
        assert_eq!(ds.extra(DEDUPE_MARKER_KEY), None);
    }

    #[test]
    fn remarking_a_previously_retained_dataset_clears_old_marker() {
        let mut ds = dataset(&[(RETAINED_MARKER_KEY, "20250101000000")]);
        let run = RunId::new("20260101000000");
        mark_in_progress(&mut ds, &run);
        assert_eq!(ds.extra(RETAINED_MARKER_KEY), None);
        assert_eq!(ds.marker_state(), MarkerState::InProgress(run));
    }

    #[test]
    fn empty_marker_value_counts_as_unmarked() {
        let ds = dataset(&[(DEDUPE_MARKER_KEY, "")]);
        assert_eq!(ds.marker_state(), MarkerState::Unmarked);
    }

    #[test]
    fn unknown_package_fields_survive_round_trip() {
        let raw = json!({
            "id": "pkg-1",
            "name": "pkg-one",
            "title": "Package One",
            "organization": {"name": "acme", "title": "ACME"},
            "metadata_created": "2017-01-01T00:00:00",
            "extras": [{"key": "identifier", "value": "abc"}],
            "resources": [{"url": "https://example.com/data.csv"}],
            "state": "active"
        });
        let ds: Dataset = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(ds.organization_name(), Some("acme"));
        assert_eq!(ds.extra(IDENTIFIER_KEY), Some("abc"));
        assert_eq!(serde_json::to_value(&ds).unwrap(), raw);
    }
}
