//! Core job model shared by the fetch, normalize and sink stages.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "jobsync-core";

pub const REMOTEOK_ORIGIN: &str = "https://remoteok.com";
pub const REMOTEOK_API_URL: &str = "https://remoteok.com/api";

pub const DEFAULT_JOB_TITLE: &str = "Unknown Title";
pub const DEFAULT_COMPANY: &str = "Unknown Company";
pub const DEFAULT_SALARY: &str = "Not specified";
pub const DEFAULT_JOB_TYPE: &str = "Not specified";
pub const DEFAULT_DESCRIPTION: &str = "No description";

/// Separator used whenever a tag list is rendered as text.
pub const TAG_SEPARATOR: &str = ", ";

/// Tags as the API sends them: usually a list, sometimes one bare string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RawTags {
    List(Vec<String>),
    Single(String),
}

impl RawTags {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            RawTags::List(tags) => tags,
            RawTags::Single(tag) => vec![tag],
        }
    }

    pub fn display(&self) -> String {
        match self {
            RawTags::List(tags) => tags.join(TAG_SEPARATOR),
            RawTags::Single(tag) => tag.clone(),
        }
    }
}

impl<'de> Deserialize<'de> for RawTags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match JsonValue::deserialize(deserializer)? {
            JsonValue::Array(items) => {
                RawTags::List(items.into_iter().filter_map(scalar_to_string).collect())
            }
            other => RawTags::Single(scalar_to_string(other).unwrap_or_default()),
        })
    }
}

/// One job object from the listings API. Every field is optional and scalar
/// fields tolerate numbers and booleans in place of strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawJobRecord {
    #[serde(default, deserialize_with = "lenient_string")]
    pub position: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub company: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub location: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub salary: Option<String>,
    #[serde(default)]
    pub tags: Option<RawTags>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub date: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub job_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub description: Option<String>,
}

/// Fixed-schema listing produced by normalization. Built once per fetch pass
/// and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedJobRecord {
    pub job_title: String,
    pub company: String,
    pub location: String,
    pub salary: String,
    pub tags: Vec<String>,
    pub job_type: String,
    pub description: String,
    pub date_posted: Option<String>,
    pub url: String,
}

impl NormalizedJobRecord {
    pub fn tags_display(&self) -> String {
        self.tags.join(TAG_SEPARATOR)
    }

    /// Projection onto the columns of the `jobs` table.
    pub fn to_row(&self) -> JobRow {
        JobRow {
            job_title: self.job_title.clone(),
            company: self.company.clone(),
            tags: self.tags.clone(),
            date_posted: self.date_posted.clone(),
            url: self.url.clone(),
        }
    }
}

/// Column values of a `jobs` row, without the store-assigned id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRow {
    pub job_title: String,
    pub company: String,
    #[serde(default, deserialize_with = "nullable_tags")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub date_posted: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredJob {
    pub id: i64,
    #[serde(flatten)]
    pub row: JobRow,
}

pub fn has_http_scheme(url: &str) -> bool {
    let bytes = url.as_bytes();
    let starts_with = |prefix: &[u8]| {
        bytes
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    };
    starts_with(b"http://") || starts_with(b"https://")
}

/// Prefix `origin` onto a relative listing path. Absolute and empty inputs
/// come back unchanged, so applying this twice is the same as applying it once.
pub fn absolutize_url(url: &str, origin: &str) -> String {
    if url.is_empty() || has_http_scheme(url) {
        return url.to_string();
    }
    let origin = origin.trim_end_matches('/');
    if url.starts_with('/') {
        format!("{origin}{url}")
    } else {
        format!("{origin}/{url}")
    }
}

fn scalar_to_string(value: JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<JsonValue>::deserialize(deserializer)?.and_then(scalar_to_string))
}

fn nullable_tags<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}
