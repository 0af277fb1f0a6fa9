//! HTTP fetch, CSV sink and `jobs` table backends for jobsync.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone};
use jobsync_core::{absolutize_url, JobRow, NormalizedJobRecord, StoredJob};
use reqwest::header::{HeaderMap, CONTENT_RANGE};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobsync-storage";

pub const JOBS_TABLE: &str = "jobs";

/// Rows requested per PostgREST page when listing the whole table.
pub const LIST_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Single-shot HTTP GET client. No retries: a failed request is final.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = tracing::info_span!("http_fetch", %run_id, source_id, url);
        async move {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), "fetched response body");
            Ok(FetchedResponse { body })
        }
        .instrument(span)
        .await
    }
}

/// Column order of the CSV export.
pub const CSV_COLUMNS: [&str; 9] = [
    "position",
    "company",
    "location",
    "salary",
    "tags",
    "date",
    "url",
    "job_type",
    "description",
];

#[derive(Debug, Serialize)]
struct CsvJobRow<'a> {
    position: &'a str,
    company: &'a str,
    location: &'a str,
    salary: &'a str,
    tags: String,
    date: &'a str,
    url: String,
    job_type: &'a str,
    description: &'a str,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("creating directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("creating {path}: {source}")]
    CreateFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("writing csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("flushing csv: {0}")]
    Flush(#[from] std::io::Error),
}

pub fn timestamped_csv_path<Tz>(dir: &Path, at: DateTime<Tz>) -> PathBuf
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    dir.join(format!("remote_jobs_{}.csv", at.format("%Y%m%d_%H%M%S")))
}

/// Write every record, in order, under a fixed header. Returns the number of
/// data rows written.
pub fn write_jobs_csv(
    records: &[NormalizedJobRecord],
    path: &Path,
    origin: &str,
) -> Result<usize, SinkError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| SinkError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let file = File::create(path).map_err(|source| SinkError::CreateFile {
        path: path.to_path_buf(),
        source,
    })?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);

    writer.write_record(CSV_COLUMNS)?;
    for record in records {
        writer.serialize(CsvJobRow {
            position: &record.job_title,
            company: &record.company,
            location: &record.location,
            salary: &record.salary,
            tags: record.tags_display(),
            date: record.date_posted.as_deref().unwrap_or_default(),
            url: absolutize_url(&record.url, origin),
            job_type: &record.job_type,
            description: &record.description,
        })?;
    }
    writer.flush()?;
    Ok(records.len())
}

/// Boolean wrapper over [`write_jobs_csv`]; failures are logged, never raised.
pub fn save_jobs_csv(records: &[NormalizedJobRecord], path: &Path, origin: &str) -> bool {
    match write_jobs_csv(records, path, origin) {
        Ok(rows) => {
            info!(rows, path = %path.display(), "saved jobs to csv");
            true
        }
        Err(err) => {
            error!(error = %err, path = %path.display(), "error saving jobs to csv");
            false
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store returned http {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0}")]
    Message(String),
}

/// Operations the sinks and the verifier need from the `jobs` table.
#[async_trait]
pub trait JobStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Cheap one-row read that proves the table is reachable.
    async fn probe(&self) -> Result<(), StoreError>;

    /// Ids of rows whose `url` equals `url` exactly, lowest id first.
    async fn find_ids_by_url(&self, url: &str) -> Result<Vec<i64>, StoreError>;

    async fn insert(&self, row: &JobRow) -> Result<StoredJob, StoreError>;

    async fn update(&self, id: i64, row: &JobRow) -> Result<Option<StoredJob>, StoreError>;

    async fn delete(&self, id: i64) -> Result<bool, StoreError>;

    async fn get(&self, id: i64) -> Result<Option<StoredJob>, StoreError>;

    async fn list(&self) -> Result<Vec<StoredJob>, StoreError>;
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: i64,
}

/// `jobs` table behind a PostgREST endpoint (`{base}/rest/v1/jobs`).
#[derive(Debug, Clone)]
pub struct PostgrestJobStore {
    client: reqwest::Client,
    table_url: String,
    api_key: String,
}

impl PostgrestJobStore {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building store client")?;
        Ok(Self {
            client,
            table_url: format!("{}/rest/v1/{JOBS_TABLE}", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
        })
    }

    fn request(&self, method: Method) -> RequestBuilder {
        self.client
            .request(method, &self.table_url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    fn returning(&self, method: Method) -> RequestBuilder {
        self.request(method)
            .header("Prefer", "return=representation")
    }

    async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, StoreError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json::<T>().await?)
    }
}

#[async_trait]
impl JobStore for PostgrestJobStore {
    fn backend(&self) -> &'static str {
        "postgrest"
    }

    async fn probe(&self) -> Result<(), StoreError> {
        let resp = self
            .request(Method::GET)
            .query(&[("select", "id"), ("limit", "1")])
            .send()
            .await?;
        let _: Vec<IdOnly> = Self::read_json(resp).await?;
        Ok(())
    }

    async fn find_ids_by_url(&self, url: &str) -> Result<Vec<i64>, StoreError> {
        let resp = self
            .request(Method::GET)
            .query(&[
                ("select", "id".to_string()),
                ("url", format!("eq.{url}")),
                ("order", "id.asc".to_string()),
            ])
            .send()
            .await?;
        let rows: Vec<IdOnly> = Self::read_json(resp).await?;
        Ok(rows.into_iter().map(|r| r.id).collect())
    }

    async fn insert(&self, row: &JobRow) -> Result<StoredJob, StoreError> {
        let resp = self.returning(Method::POST).json(row).send().await?;
        let rows: Vec<StoredJob> = Self::read_json(resp).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::Message("insert returned no rows".to_string()))
    }

    async fn update(&self, id: i64, row: &JobRow) -> Result<Option<StoredJob>, StoreError> {
        let resp = self
            .returning(Method::PATCH)
            .query(&[("id", format!("eq.{id}"))])
            .json(row)
            .send()
            .await?;
        let rows: Vec<StoredJob> = Self::read_json(resp).await?;
        Ok(rows.into_iter().next())
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let resp = self
            .returning(Method::DELETE)
            .query(&[("id", format!("eq.{id}"))])
            .send()
            .await?;
        let rows: Vec<StoredJob> = Self::read_json(resp).await?;
        Ok(!rows.is_empty())
    }

    async fn get(&self, id: i64) -> Result<Option<StoredJob>, StoreError> {
        let resp = self
            .request(Method::GET)
            .query(&[("select", "*".to_string()), ("id", format!("eq.{id}"))])
            .send()
            .await?;
        let rows: Vec<StoredJob> = Self::read_json(resp).await?;
        Ok(rows.into_iter().next())
    }

    /// Walks the table with `limit`/`offset` so server-side row caps never
    /// truncate the result. The exact count from `Content-Range` decides when
    /// to stop; without it a short page ends the walk.
    async fn list(&self) -> Result<Vec<StoredJob>, StoreError> {
        let mut out = Vec::new();
        loop {
            let resp = self
                .request(Method::GET)
                .header("Prefer", "count=exact")
                .query(&[
                    ("select", "*".to_string()),
                    ("order", "id.asc".to_string()),
                    ("limit", LIST_PAGE_SIZE.to_string()),
                    ("offset", out.len().to_string()),
                ])
                .send()
                .await?;
            let total = content_range_total(resp.headers());
            let page: Vec<StoredJob> = Self::read_json(resp).await?;
            let fetched = page.len();
            out.extend(page);

            let done = match total {
                Some(total) => fetched == 0 || out.len() >= total,
                None => fetched < LIST_PAGE_SIZE,
            };
            if done {
                debug!(rows = out.len(), "listed jobs");
                return Ok(out);
            }
        }
    }
}

/// Total row count from a `Content-Range: 0-999/1500` header; `*` means unknown.
fn content_range_total(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(CONTENT_RANGE)?
        .to_str()
        .ok()?
        .rsplit_once('/')?
        .1
        .trim()
        .parse()
        .ok()
}

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// `jobs` table over a direct Postgres connection.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

fn stored_job_from_row(row: &PgRow) -> Result<StoredJob, sqlx::Error> {
    Ok(StoredJob {
        id: row.try_get("id")?,
        row: JobRow {
            job_title: row.try_get("job_title")?,
            company: row.try_get("company")?,
            tags: row
                .try_get::<Option<Vec<String>>, _>("tags")?
                .unwrap_or_default(),
            date_posted: row.try_get("date_posted")?,
            url: row.try_get("url")?,
        },
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn probe(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT id FROM jobs LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_ids_by_url(&self, url: &str) -> Result<Vec<i64>, StoreError> {
        let rows = sqlx::query("SELECT id FROM jobs WHERE url = $1 ORDER BY id ASC")
            .bind(url)
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.try_get("id")?);
        }
        Ok(out)
    }

    async fn insert(&self, row: &JobRow) -> Result<StoredJob, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (job_title, company, tags, date_posted, url)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, job_title, company, tags, date_posted, url
            "#,
        )
        .bind(&row.job_title)
        .bind(&row.company)
        .bind(&row.tags)
        .bind(&row.date_posted)
        .bind(&row.url)
        .fetch_one(&self.pool)
        .await?;
        Ok(stored_job_from_row(&inserted)?)
    }

    async fn update(&self, id: i64, row: &JobRow) -> Result<Option<StoredJob>, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
               SET job_title = $2, company = $3, tags = $4, date_posted = $5, url = $6
             WHERE id = $1
            RETURNING id, job_title, company, tags, date_posted, url
            "#,
        )
        .bind(id)
        .bind(&row.job_title)
        .bind(&row.company)
        .bind(&row.tags)
        .bind(&row.date_posted)
        .bind(&row.url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(updated.as_ref().map(stored_job_from_row).transpose()?)
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: i64) -> Result<Option<StoredJob>, StoreError> {
        let row = sqlx::query(
            "SELECT id, job_title, company, tags, date_posted, url FROM jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(stored_job_from_row).transpose()?)
    }

    async fn list(&self) -> Result<Vec<StoredJob>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, job_title, company, tags, date_posted, url FROM jobs ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(stored_job_from_row(row)?);
        }
        Ok(out)
    }
}

/// Process-local `jobs` table. Ids start at 1 and are never reused.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    last_id: i64,
    rows: BTreeMap<i64, JobRow>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn probe(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn find_ids_by_url(&self, url: &str) -> Result<Vec<i64>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .iter()
            .filter(|(_, row)| row.url == url)
            .map(|(id, _)| *id)
            .collect())
    }

    async fn insert(&self, row: &JobRow) -> Result<StoredJob, StoreError> {
        let mut state = self.state.lock().await;
        state.last_id += 1;
        let id = state.last_id;
        state.rows.insert(id, row.clone());
        Ok(StoredJob {
            id,
            row: row.clone(),
        })
    }

    async fn update(&self, id: i64, row: &JobRow) -> Result<Option<StoredJob>, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.rows.get_mut(&id).map(|existing| {
            *existing = row.clone();
            StoredJob {
                id,
                row: row.clone(),
            }
        }))
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.rows.remove(&id).is_some())
    }

    async fn get(&self, id: i64) -> Result<Option<StoredJob>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.rows.get(&id).map(|row| StoredJob {
            id,
            row: row.clone(),
        }))
    }

    async fn list(&self) -> Result<Vec<StoredJob>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .iter()
            .map(|(id, row)| StoredJob {
                id: *id,
                row: row.clone(),
            })
            .collect())
    }
}
