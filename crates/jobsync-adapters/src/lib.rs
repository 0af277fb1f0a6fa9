//! Job source contracts, the RemoteOK source, and raw-to-normalized mapping.

use async_trait::async_trait;
use jobsync_core::{
    absolutize_url, NormalizedJobRecord, RawJobRecord, DEFAULT_COMPANY, DEFAULT_DESCRIPTION,
    DEFAULT_JOB_TITLE, DEFAULT_JOB_TYPE, DEFAULT_SALARY, REMOTEOK_API_URL, REMOTEOK_ORIGIN,
};
use jobsync_storage::{FetchError, HttpFetcher};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobsync-adapters";

pub const REMOTEOK_SOURCE_ID: &str = "remoteok";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("error fetching listings: {0}")]
    Fetch(#[from] FetchError),
    #[error("error parsing listings response as JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

#[async_trait]
pub trait JobSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    fn listing_url(&self) -> &str;

    /// Origin that relative listing URLs are resolved against.
    fn origin(&self) -> &str;

    fn parse_listing(&self, body: &[u8]) -> Result<Vec<RawJobRecord>, AdapterError>;

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawJobRecord>, AdapterError> {
        info!(source_id = self.source_id(), url = self.listing_url(), "fetching jobs");
        let resp = http
            .fetch_bytes(ctx.run_id, self.source_id(), self.listing_url())
            .await?;
        let jobs = self.parse_listing(&resp.body)?;
        info!(source_id = self.source_id(), jobs = jobs.len(), "found jobs");
        Ok(jobs)
    }

    fn normalize(&self, raw: RawJobRecord) -> NormalizedJobRecord {
        normalize_job(raw, self.origin())
    }
}

/// The RemoteOK public API: a JSON array whose first element is a legal
/// notice rather than a job.
#[derive(Debug, Clone)]
pub struct RemoteOkSource {
    api_url: String,
    origin: String,
}

impl RemoteOkSource {
    pub fn new(api_url: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            origin: origin.into(),
        }
    }
}

impl Default for RemoteOkSource {
    fn default() -> Self {
        Self::new(REMOTEOK_API_URL, REMOTEOK_ORIGIN)
    }
}

#[async_trait]
impl JobSource for RemoteOkSource {
    fn source_id(&self) -> &'static str {
        REMOTEOK_SOURCE_ID
    }

    fn listing_url(&self) -> &str {
        &self.api_url
    }

    fn origin(&self) -> &str {
        &self.origin
    }

    fn parse_listing(&self, body: &[u8]) -> Result<Vec<RawJobRecord>, AdapterError> {
        let items: Vec<JsonValue> = serde_json::from_slice(body)?;
        let jobs = items
            .into_iter()
            .skip(1)
            .map(serde_json::from_value)
            .collect::<Result<Vec<RawJobRecord>, _>>()?;
        Ok(jobs)
    }
}

pub fn source_for(source_id: &str, api_url: &str, origin: &str) -> Option<Box<dyn JobSource>> {
    match source_id {
        REMOTEOK_SOURCE_ID => Some(Box::new(RemoteOkSource::new(api_url, origin))),
        _ => None,
    }
}

/// Map a raw listing onto the fixed schema. Never fails: every missing field
/// takes its default, and `date_posted` is the only field left optional.
pub fn normalize_job(raw: RawJobRecord, origin: &str) -> NormalizedJobRecord {
    NormalizedJobRecord {
        job_title: raw.position.unwrap_or_else(|| DEFAULT_JOB_TITLE.to_string()),
        company: raw.company.unwrap_or_else(|| DEFAULT_COMPANY.to_string()),
        location: raw.location.unwrap_or_default(),
        salary: raw.salary.unwrap_or_else(|| DEFAULT_SALARY.to_string()),
        tags: raw.tags.map(|t| t.into_vec()).unwrap_or_default(),
        job_type: raw.job_type.unwrap_or_else(|| DEFAULT_JOB_TYPE.to_string()),
        description: raw
            .description
            .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
        date_posted: raw.date,
        url: raw
            .url
            .map(|url| absolutize_url(&url, origin))
            .unwrap_or_default(),
    }
}
