//! Fetch-normalize-store pipeline orchestration for jobsync.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, Utc};
use jobsync_adapters::{source_for, AdapterContext, JobSource, REMOTEOK_SOURCE_ID};
use jobsync_core::{
    has_http_scheme, JobRow, NormalizedJobRecord, StoredJob, REMOTEOK_API_URL, REMOTEOK_ORIGIN,
};
use jobsync_storage::{
    save_jobs_csv, timestamped_csv_path, HttpClientConfig, HttpFetcher, JobStore, PgJobStore,
    PostgrestJobStore, StoreError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobsync-sync";

pub const DEFAULT_DISPLAY_LIMIT: usize = 10;
pub const DESCRIPTION_PREVIEW_CHARS: usize = 100;
pub const DEFAULT_PAGE_SIZE: usize = 10;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_url: String,
    pub origin: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub output_dir: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            api_url: std::env::var("JOBSYNC_API_URL")
                .unwrap_or_else(|_| REMOTEOK_API_URL.to_string()),
            origin: std::env::var("JOBSYNC_ORIGIN").unwrap_or_else(|_| REMOTEOK_ORIGIN.to_string()),
            user_agent: std::env::var("JOBSYNC_USER_AGENT")
                .unwrap_or_else(|_| "Mozilla/5.0".to_string()),
            http_timeout_secs: std::env::var("JOBSYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            output_dir: std::env::var("JOBSYNC_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing {0}; set it in the environment or a .env file")]
    Missing(&'static str),
    #[error("{name} does not look like an http(s) URL: {value}")]
    InvalidUrl { name: &'static str, value: String },
    #[error("unknown store backend {0:?} (expected \"postgrest\" or \"postgres\")")]
    UnknownBackend(String),
}

/// Where the `jobs` table lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    Postgrest { base_url: String, api_key: String },
    Postgres { database_url: String },
}

impl StoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |key: &'static str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(key))
        };

        match lookup("JOBSYNC_STORE").as_deref().map(str::trim) {
            None | Some("") | Some("postgrest") => {
                let base_url = required("SUPABASE_URL")?;
                let api_key = required("SUPABASE_KEY")?;
                if !has_http_scheme(&base_url) {
                    return Err(ConfigError::InvalidUrl {
                        name: "SUPABASE_URL",
                        value: base_url,
                    });
                }
                Ok(Self::Postgrest { base_url, api_key })
            }
            Some("postgres") => Ok(Self::Postgres {
                database_url: required("DATABASE_URL")?,
            }),
            Some(other) => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

pub async fn connect_store(config: &StoreConfig, timeout: Duration) -> Result<Box<dyn JobStore>> {
    match config {
        StoreConfig::Postgrest { base_url, api_key } => {
            Ok(Box::new(PostgrestJobStore::new(base_url, api_key, timeout)?))
        }
        StoreConfig::Postgres { database_url } => Ok(Box::new(
            PgJobStore::connect(database_url)
                .await
                .context("connecting to postgres")?,
        )),
    }
}

fn preview_description(description: &str) -> String {
    let head = description
        .chars()
        .take(DESCRIPTION_PREVIEW_CHARS)
        .collect::<String>();
    format!("{head}...")
}

/// Console preview of at most `limit` records.
pub fn format_job_preview(records: &[NormalizedJobRecord], limit: usize) -> String {
    let mut out = String::new();
    for (idx, job) in records.iter().take(limit).enumerate() {
        let _ = writeln!(out, "\n--- Job {} ---", idx + 1);
        let _ = writeln!(out, "Title: {}", job.job_title);
        let _ = writeln!(out, "Company: {}", job.company);
        let _ = writeln!(out, "Location: {}", job.location);
        let _ = writeln!(out, "Salary: {}", job.salary);
        let _ = writeln!(out, "Tags: {}", job.tags_display());
        let _ = writeln!(out, "Job Type: {}", job.job_type);
        let _ = writeln!(out, "Description: {}", preview_description(&job.description));
        let _ = writeln!(out, "Posted: {}", job.date_posted.as_deref().unwrap_or("n/a"));
        let _ = writeln!(out, "URL: {}", job.url);
    }
    if records.len() > limit {
        let _ = writeln!(
            out,
            "\nShowing {limit} of {} jobs. Run with --all to see all jobs.",
            records.len()
        );
    }
    out
}

pub fn display_jobs(records: &[NormalizedJobRecord], limit: usize) {
    print!("{}", format_job_preview(records, limit));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpsertOutcome {
    Inserted { id: i64 },
    Updated { id: i64 },
}

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("looking up existing job: {0}")]
    Lookup(#[source] StoreError),
    #[error("inserting job: {0}")]
    Insert(#[source] StoreError),
    #[error("updating job {id}: {source}")]
    Update {
        id: i64,
        #[source]
        source: StoreError,
    },
    #[error("job {id} matched by url was gone before the update")]
    Vanished { id: i64 },
}

impl UpsertError {
    pub fn reason(&self) -> &'static str {
        match self {
            UpsertError::Lookup(_) => "lookup",
            UpsertError::Insert(_) => "insert",
            UpsertError::Update { .. } => "update",
            UpsertError::Vanished { .. } => "vanished",
        }
    }
}

/// Insert-or-update keyed on `row.url`. Always reads, then always writes;
/// when several rows share the url only the lowest id is updated.
pub async fn upsert_job(store: &dyn JobStore, row: &JobRow) -> Result<UpsertOutcome, UpsertError> {
    let existing = store
        .find_ids_by_url(&row.url)
        .await
        .map_err(UpsertError::Lookup)?;

    if let Some(&id) = existing.first() {
        info!(id, job_title = %row.job_title, company = %row.company, "updating existing job");
        return match store.update(id, row).await {
            Ok(Some(_)) => Ok(UpsertOutcome::Updated { id }),
            Ok(None) => Err(UpsertError::Vanished { id }),
            Err(source) => Err(UpsertError::Update { id, source }),
        };
    }

    let stored = store.insert(row).await.map_err(UpsertError::Insert)?;
    info!(id = stored.id, job_title = %row.job_title, company = %row.company, "inserted job");
    Ok(UpsertOutcome::Inserted { id: stored.id })
}

#[derive(Debug, Clone, Serialize)]
pub struct UpsertFailure {
    pub url: String,
    pub reason: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UpsertSummary {
    pub total: usize,
    pub inserted: usize,
    pub updated: usize,
    pub failures: Vec<UpsertFailure>,
}

impl UpsertSummary {
    pub fn succeeded(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Upsert records one at a time. A failed record is logged and counted; the
/// rest of the batch still runs and nothing already written is rolled back.
pub async fn upsert_all(store: &dyn JobStore, records: &[NormalizedJobRecord]) -> UpsertSummary {
    let mut summary = UpsertSummary {
        total: records.len(),
        ..Default::default()
    };

    for record in records {
        let row = record.to_row();
        match upsert_job(store, &row).await {
            Ok(UpsertOutcome::Inserted { .. }) => summary.inserted += 1,
            Ok(UpsertOutcome::Updated { .. }) => summary.updated += 1,
            Err(err) => {
                error!(url = %row.url, reason = err.reason(), error = %err, "error upserting job");
                summary.failures.push(UpsertFailure {
                    url: row.url.clone(),
                    reason: err.reason(),
                    message: err.to_string(),
                });
            }
        }
    }

    summary
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched_jobs: usize,
    pub csv_path: String,
    pub saved: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreSyncSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub backend: &'static str,
    pub fetched_jobs: usize,
    pub upsert: UpsertSummary,
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: HttpFetcher,
    source: Box<dyn JobSource>,
    display_limit: usize,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let source = source_for(REMOTEOK_SOURCE_ID, &config.api_url, &config.origin)
            .with_context(|| format!("no source registered for {REMOTEOK_SOURCE_ID}"))?;
        Ok(Self {
            config,
            http,
            source,
            display_limit: DEFAULT_DISPLAY_LIMIT,
        })
    }

    /// `None` previews every fetched job.
    pub fn with_display_limit(mut self, limit: Option<usize>) -> Self {
        self.display_limit = limit.unwrap_or(usize::MAX);
        self
    }

    /// One GET against the source, then normalization of every record.
    pub async fn fetch_normalized(&self, run_id: Uuid) -> Result<Vec<NormalizedJobRecord>> {
        let raw = self
            .source
            .fetch_listing(&self.http, &AdapterContext { run_id })
            .await
            .with_context(|| format!("fetching {}", self.source.listing_url()))?;
        Ok(raw
            .into_iter()
            .map(|job| self.source.normalize(job))
            .collect())
    }

    pub async fn run_scrape(&self) -> Result<ScrapeRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("scrape_run", %run_id);

        async move {
            let jobs = self.fetch_normalized(run_id).await?;
            display_jobs(&jobs, self.display_limit);

            let path = timestamped_csv_path(&self.config.output_dir, Local::now());
            let fetched_jobs = jobs.len();
            let origin = self.config.origin.clone();
            let csv_path = path.clone();
            let saved =
                tokio::task::spawn_blocking(move || save_jobs_csv(&jobs, &csv_path, &origin))
                    .await
                    .context("joining csv writer")?;

            Ok::<_, anyhow::Error>(ScrapeRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                fetched_jobs,
                csv_path: path.display().to_string(),
                saved,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn run_store_sync(&self, store: &dyn JobStore) -> Result<StoreSyncSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("store_sync_run", %run_id, backend = store.backend());

        async move {
            let jobs = self.fetch_normalized(run_id).await?;
            display_jobs(&jobs, self.display_limit);

            let upsert = upsert_all(store, &jobs).await;
            if !upsert.failures.is_empty() {
                warn!(
                    failed = upsert.failures.len(),
                    total = upsert.total,
                    "some jobs were not stored"
                );
            }

            Ok::<_, anyhow::Error>(StoreSyncSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                backend: store.backend(),
                fetched_jobs: jobs.len(),
                upsert,
            })
        }
        .instrument(span)
        .await
    }
}

pub async fn run_scrape_once_from_env(display_limit: Option<usize>) -> Result<ScrapeRunSummary> {
    let config = SyncConfig::from_env();
    SyncPipeline::new(config)?
        .with_display_limit(display_limit)
        .run_scrape()
        .await
}

/// Store credentials are resolved before the source is contacted.
pub async fn run_sync_once_from_env(display_limit: Option<usize>) -> Result<StoreSyncSummary> {
    let config = SyncConfig::from_env();
    let store_config = StoreConfig::from_env()?;
    let store = connect_store(&store_config, config.http_timeout()).await?;
    SyncPipeline::new(config)?
        .with_display_limit(display_limit)
        .run_store_sync(store.as_ref())
        .await
}

pub async fn migrate_from_env() -> Result<()> {
    match StoreConfig::from_env()? {
        StoreConfig::Postgres { database_url } => {
            let store = PgJobStore::connect(&database_url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            Ok(())
        }
        StoreConfig::Postgrest { .. } => anyhow::bail!(
            "migrations run against a direct connection; set JOBSYNC_STORE=postgres and DATABASE_URL"
        ),
    }
}

pub const VERIFY_JOB_TITLE: &str = "Test Job (Verification Script)";
pub const VERIFY_UPDATED_TITLE: &str = "Updated Test Job";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyCheck {
    pub ok: bool,
    pub message: String,
}

impl VerifyCheck {
    pub fn render(&self) -> String {
        format!("[{}] {}", if self.ok { "✓" } else { "✗" }, self.message)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerificationReport {
    pub checks: Vec<VerifyCheck>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        !self.checks.is_empty() && self.checks.iter().all(|c| c.ok)
    }

    fn pass(&mut self, message: impl Into<String>) {
        self.checks.push(VerifyCheck {
            ok: true,
            message: message.into(),
        });
    }

    fn fail(mut self, message: impl Into<String>) -> Self {
        self.checks.push(VerifyCheck {
            ok: false,
            message: message.into(),
        });
        self
    }
}

pub fn verification_job(now: DateTime<Utc>) -> JobRow {
    JobRow {
        job_title: VERIFY_JOB_TITLE.to_string(),
        company: "Test Company".to_string(),
        tags: vec!["test".to_string(), "verification".to_string()],
        date_posted: Some(now.format("%Y-%m-%d").to_string()),
        url: format!("https://test-verification-{}.com", now.format("%Y%m%d%H%M%S")),
    }
}

/// Connectivity probe followed by a create/read/update/delete round trip.
/// Stops at the first failing step; the test row is removed on success.
pub async fn verify_store(store: &dyn JobStore, now: DateTime<Utc>) -> VerificationReport {
    let mut report = VerificationReport::default();

    if let Err(err) = store.probe().await {
        return report.fail(format!("Failed to connect to the jobs store: {err}"));
    }
    report.pass(format!("Connected to the jobs store ({})", store.backend()));

    let test_job = verification_job(now);
    let inserted = match store.insert(&test_job).await {
        Ok(job) => job,
        Err(err) => return report.fail(format!("Failed to insert test job: {err}")),
    };
    report.pass(format!("Inserted test job with ID: {}", inserted.id));

    match store.get(inserted.id).await {
        Ok(Some(_)) => report.pass("Read test job"),
        Ok(None) => return report.fail("Failed to read test job after insertion"),
        Err(err) => return report.fail(format!("Failed to read test job: {err}")),
    }

    let updated_row = JobRow {
        job_title: VERIFY_UPDATED_TITLE.to_string(),
        ..test_job
    };
    match store.update(inserted.id, &updated_row).await {
        Ok(Some(job)) if job.row.job_title == VERIFY_UPDATED_TITLE => {
            report.pass("Updated test job")
        }
        Ok(_) => return report.fail("Failed to update test job"),
        Err(err) => return report.fail(format!("Failed to update test job: {err}")),
    }

    match store.delete(inserted.id).await {
        Ok(true) => report.pass("Deleted test job"),
        Ok(false) => return report.fail("Failed to delete test job"),
        Err(err) => return report.fail(format!("Failed to delete test job: {err}")),
    }

    report
}

pub async fn run_verify_from_env() -> Result<VerificationReport> {
    let report = VerificationReport::default();
    let store_config = match StoreConfig::from_env() {
        Ok(config) => config,
        Err(err) => return Ok(report.fail(err.to_string())),
    };
    let config = SyncConfig::from_env();
    let store = match connect_store(&store_config, config.http_timeout()).await {
        Ok(store) => store,
        Err(err) => return Ok(report.fail(format!("Failed to connect to the jobs store: {err:#}"))),
    };

    let mut checked = verify_store(store.as_ref(), Utc::now()).await;
    checked.checks.insert(
        0,
        VerifyCheck {
            ok: true,
            message: "Environment variables found".to_string(),
        },
    );
    Ok(checked)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateWindow {
    Today,
    Week,
    Month,
}

impl DateWindow {
    /// Earliest posting time still inside the window.
    pub fn cutoff(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            DateWindow::Today => now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map(|midnight| midnight.and_utc())
                .unwrap_or(now),
            DateWindow::Week => now - chrono::Duration::days(7),
            DateWindow::Month => now - chrono::Duration::days(30),
        }
    }
}

impl FromStr for DateWindow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "today" => Ok(DateWindow::Today),
            "week" => Ok(DateWindow::Week),
            "month" => Ok(DateWindow::Month),
            other => Err(format!("unknown date window {other:?} (expected today, week or month)")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub search: Option<String>,
    pub tags: Vec<String>,
    pub posted_within: Option<DateWindow>,
}

pub fn parse_posted_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%#z") {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn matches_query(job: &StoredJob, query: &JobQuery, now: DateTime<Utc>) -> bool {
    let matches_search = match query.search.as_deref().map(str::trim) {
        None | Some("") => true,
        Some(term) => {
            let needle = term.to_lowercase();
            job.row.job_title.to_lowercase().contains(&needle)
                || job.row.company.to_lowercase().contains(&needle)
        }
    };

    let matches_tags = query.tags.iter().all(|tag| job.row.tags.contains(tag));

    let matches_date = match (query.posted_within, job.row.date_posted.as_deref()) {
        (Some(window), Some(posted)) => {
            parse_posted_date(posted).is_some_and(|at| at >= window.cutoff(now))
        }
        _ => true,
    };

    matches_search && matches_tags && matches_date
}

/// Apply the query and order newest first; undated jobs sort last.
pub fn filter_jobs(jobs: &[StoredJob], query: &JobQuery, now: DateTime<Utc>) -> Vec<StoredJob> {
    let mut out = jobs
        .iter()
        .filter(|job| matches_query(job, query, now))
        .cloned()
        .collect::<Vec<_>>();
    out.sort_by_cached_key(|job| {
        std::cmp::Reverse(job.row.date_posted.as_deref().and_then(parse_posted_date))
    });
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobPage {
    pub jobs: Vec<StoredJob>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
    pub total_pages: usize,
}

pub fn paginate(jobs: Vec<StoredJob>, page: usize, per_page: usize) -> JobPage {
    let per_page = per_page.max(1);
    let total = jobs.len();
    let total_pages = total.div_ceil(per_page);
    let page = page.clamp(1, total_pages.max(1));
    let start = (page - 1) * per_page;
    JobPage {
        jobs: jobs.into_iter().skip(start).take(per_page).collect(),
        total,
        page,
        per_page,
        total_pages,
    }
}

pub fn collect_tags(jobs: &[StoredJob]) -> Vec<String> {
    jobs.iter()
        .flat_map(|job| job.row.tags.iter().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub async fn browse_jobs(
    store: &dyn JobStore,
    query: &JobQuery,
    page: usize,
    per_page: usize,
    now: DateTime<Utc>,
) -> Result<JobPage, StoreError> {
    let all = store.list().await?;
    Ok(paginate(filter_jobs(&all, query, now), page, per_page))
}

pub async fn store_tags(store: &dyn JobStore) -> Result<Vec<String>, StoreError> {
    Ok(collect_tags(&store.list().await?))
}

pub async fn find_job(store: &dyn JobStore, id: i64) -> Result<Option<StoredJob>, StoreError> {
    store.get(id).await
}

/// Detail view of one stored job, or `Job not found` when the id is unknown.
pub fn format_job_detail(job: Option<&StoredJob>) -> String {
    let Some(job) = job else {
        return "Job not found\n".to_string();
    };
    let mut out = String::new();
    let _ = writeln!(out, "{}", job.row.job_title);
    let _ = writeln!(out, "Company: {}", job.row.company);
    if !job.row.tags.is_empty() {
        let _ = writeln!(out, "Tags: {}", job.row.tags.join(", "));
    }
    let _ = writeln!(
        out,
        "Posted: {}",
        job.row.date_posted.as_deref().unwrap_or("Not specified")
    );
    let _ = writeln!(out, "Apply: {}", job.row.url);
    out
}

pub fn format_job_page(page: &JobPage) -> String {
    let mut out = String::new();
    for job in &page.jobs {
        let _ = writeln!(
            out,
            "#{} {} at {} [{}]",
            job.id,
            job.row.job_title,
            job.row.company,
            job.row.date_posted.as_deref().unwrap_or("n/a")
        );
        if !job.row.tags.is_empty() {
            let _ = writeln!(out, "    tags: {}", job.row.tags.join(", "));
        }
        let _ = writeln!(out, "    {}", job.row.url);
    }
    let _ = writeln!(
        out,
        "Page {} of {} ({} jobs)",
        page.page,
        page.total_pages.max(1),
        page.total
    );
    out
}

pub async fn open_store_from_env() -> Result<Box<dyn JobStore>> {
    let config = SyncConfig::from_env();
    let store_config = StoreConfig::from_env()?;
    connect_store(&store_config, config.http_timeout()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use jobsync_storage::MemoryJobStore;
    use std::collections::HashMap;

    fn record(n: usize) -> NormalizedJobRecord {
        NormalizedJobRecord {
            job_title: format!("Job {n}"),
            company: "Acme".to_string(),
            location: "Worldwide".to_string(),
            salary: "Not specified".to_string(),
            tags: vec!["rust".to_string(), "remote".to_string()],
            job_type: "Not specified".to_string(),
            description: "x".repeat(250),
            date_posted: Some("2026-02-24T08:00:00+00:00".to_string()),
            url: format!("https://remoteok.com/remote-jobs/{n}"),
        }
    }

    fn stored(id: i64, title: &str, company: &str, tags: &[&str], date: Option<&str>) -> StoredJob {
        StoredJob {
            id,
            row: JobRow {
                job_title: title.to_string(),
                company: company.to_string(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                date_posted: date.map(ToString::to_string),
                url: format!("https://remoteok.com/remote-jobs/{id}"),
            },
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }

    /// Store that rejects inserts for selected urls.
    struct RejectingStore {
        inner: MemoryJobStore,
        reject: HashMap<String, &'static str>,
    }

    #[async_trait]
    impl JobStore for RejectingStore {
        fn backend(&self) -> &'static str {
            "rejecting"
        }

        async fn probe(&self) -> Result<(), StoreError> {
            self.inner.probe().await
        }

        async fn find_ids_by_url(&self, url: &str) -> Result<Vec<i64>, StoreError> {
            self.inner.find_ids_by_url(url).await
        }

        async fn insert(&self, row: &JobRow) -> Result<StoredJob, StoreError> {
            if let Some(msg) = self.reject.get(&row.url) {
                return Err(StoreError::Message(msg.to_string()));
            }
            self.inner.insert(row).await
        }

        async fn update(&self, id: i64, row: &JobRow) -> Result<Option<StoredJob>, StoreError> {
            self.inner.update(id, row).await
        }

        async fn delete(&self, _id: i64) -> Result<bool, StoreError> {
            Err(StoreError::Message("delete not permitted".to_string()))
        }

        async fn get(&self, id: i64) -> Result<Option<StoredJob>, StoreError> {
            self.inner.get(id).await
        }

        async fn list(&self) -> Result<Vec<StoredJob>, StoreError> {
            self.inner.list().await
        }
    }

    #[test]
    fn preview_is_capped_at_limit_with_notice() {
        let records = (1..=15).map(record).collect::<Vec<_>>();
        let text = format_job_preview(&records, DEFAULT_DISPLAY_LIMIT);
        assert_eq!(text.matches("--- Job ").count(), 10);
        assert!(text.contains("--- Job 10 ---"));
        assert!(!text.contains("--- Job 11 ---"));
        assert!(text.contains("Showing 10 of 15 jobs. Run with --all to see all jobs."));
        assert!(text.contains("Tags: rust, remote"));
    }

    #[test]
    fn preview_truncates_description_and_always_appends_ellipsis() {
        let mut long = record(1);
        long.description = "é".repeat(150);
        let mut short = record(2);
        short.description = "Short.".to_string();
        short.date_posted = None;

        let text = format_job_preview(&[long, short], DEFAULT_DISPLAY_LIMIT);
        assert!(text.contains(&format!("Description: {}...\n", "é".repeat(100))));
        assert!(text.contains("Description: Short....\n"));
        assert!(text.contains("Posted: n/a"));
        assert!(!text.contains("Showing"));
    }

    #[tokio::test]
    async fn upsert_inserts_new_url_once() {
        let store = MemoryJobStore::new();
        let row = record(1).to_row();
        let outcome = upsert_job(&store, &row).await.unwrap();
        assert!(matches!(outcome, UpsertOutcome::Inserted { .. }));
        assert_eq!(store.find_ids_by_url(&row.url).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upsert_updates_existing_row_in_place() {
        let store = MemoryJobStore::new();
        let original = record(1).to_row();
        let UpsertOutcome::Inserted { id } = upsert_job(&store, &original).await.unwrap() else {
            panic!("expected insert");
        };

        let changed = JobRow {
            job_title: "Staff Engineer".to_string(),
            tags: vec!["go".to_string()],
            ..original.clone()
        };
        let outcome = upsert_job(&store, &changed).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated { id });

        let ids = store.find_ids_by_url(&original.url).await.unwrap();
        assert_eq!(ids, vec![id]);
        assert_eq!(store.get(id).await.unwrap().unwrap().row, changed);
    }

    #[tokio::test]
    async fn repeated_upsert_is_idempotent_in_result() {
        let store = MemoryJobStore::new();
        let row = record(3).to_row();
        upsert_job(&store, &row).await.unwrap();
        let after_first = store.list().await.unwrap();
        let second = upsert_job(&store, &row).await.unwrap();
        assert!(matches!(second, UpsertOutcome::Updated { .. }));
        assert_eq!(store.list().await.unwrap(), after_first);
    }

    #[tokio::test]
    async fn upsert_updates_lowest_id_when_url_is_duplicated() {
        let store = MemoryJobStore::new();
        let row = record(5).to_row();
        let first = store.insert(&row).await.unwrap();
        let second = store.insert(&row).await.unwrap();
        let changed = JobRow {
            company: "Globex".to_string(),
            ..row
        };
        let outcome = upsert_job(&store, &changed).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated { id: first.id });
        assert_eq!(store.get(second.id).await.unwrap().unwrap().row.company, "Acme");
    }

    #[tokio::test]
    async fn batch_continues_past_failures() {
        let records = (1..=4).map(record).collect::<Vec<_>>();
        let store = RejectingStore {
            inner: MemoryJobStore::new(),
            reject: HashMap::from([(records[1].url.clone(), "permission denied")]),
        };

        let summary = upsert_all(&store, &records).await;
        assert_eq!(summary.total, 4);
        assert_eq!(summary.inserted, 3);
        assert_eq!(summary.succeeded(), 3);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].reason, "insert");
        assert_eq!(summary.failures[0].url, records[1].url);
        assert_eq!(store.inner.len().await, 3);

        let again = upsert_all(&store, &records).await;
        assert_eq!(again.updated, 3);
        assert_eq!(again.failures.len(), 1);
        assert_eq!(store.inner.len().await, 3);
    }

    fn env(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn store_config_requires_credentials() {
        assert_eq!(
            StoreConfig::from_lookup(env(&[("SUPABASE_KEY", "k")])),
            Err(ConfigError::Missing("SUPABASE_URL"))
        );
        assert_eq!(
            StoreConfig::from_lookup(env(&[
                ("SUPABASE_URL", "https://x.supabase.co"),
                ("SUPABASE_KEY", " "),
            ])),
            Err(ConfigError::Missing("SUPABASE_KEY"))
        );
        assert!(matches!(
            StoreConfig::from_lookup(env(&[
                ("SUPABASE_URL", "x.supabase.co"),
                ("SUPABASE_KEY", "k"),
            ])),
            Err(ConfigError::InvalidUrl { .. })
        ));
        assert_eq!(
            StoreConfig::from_lookup(env(&[
                ("SUPABASE_URL", "https://x.supabase.co"),
                ("SUPABASE_KEY", "k"),
            ])),
            Ok(StoreConfig::Postgrest {
                base_url: "https://x.supabase.co".to_string(),
                api_key: "k".to_string(),
            })
        );
        assert_eq!(
            StoreConfig::from_lookup(env(&[("JOBSYNC_STORE", "postgres")])),
            Err(ConfigError::Missing("DATABASE_URL"))
        );
        assert_eq!(
            StoreConfig::from_lookup(env(&[("JOBSYNC_STORE", "mongo")])),
            Err(ConfigError::UnknownBackend("mongo".to_string()))
        );
    }

    #[tokio::test]
    async fn verification_round_trip_leaves_store_clean() {
        let store = MemoryJobStore::new();
        let report = verify_store(&store, now()).await;
        assert!(report.passed(), "{:?}", report.checks);
        assert_eq!(report.checks.len(), 5);
        assert!(report.checks[1].render().starts_with("[✓] Inserted test job with ID: 1"));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn verification_stops_at_first_failure() {
        let store = RejectingStore {
            inner: MemoryJobStore::new(),
            reject: HashMap::new(),
        };
        let report = verify_store(&store, now()).await;
        assert!(!report.passed());
        let last = report.checks.last().unwrap();
        assert!(last.render().starts_with("[✗] Failed to delete test job"));
        assert_eq!(report.checks.len(), 5);
    }

    #[test]
    fn verification_job_uses_unique_url_and_today() {
        let job = verification_job(now());
        assert_eq!(job.url, "https://test-verification-20260224120000.com");
        assert_eq!(job.date_posted.as_deref(), Some("2026-02-24"));
    }

    #[test]
    fn query_filters_by_search_tags_and_window() {
        let jobs = vec![
            stored(
                1,
                "Rust Engineer",
                "Acme",
                &["rust", "backend"],
                Some("2026-02-24T08:00:00+00:00"),
            ),
            stored(2, "Designer", "Rustic Studio", &["design"], Some("2026-02-20")),
            stored(3, "Go Engineer", "Globex", &["go", "backend"], Some("2026-01-01T00:00:00Z")),
            stored(4, "Support", "Initech", &[], None),
            stored(5, "Writer", "Acme", &[], Some("not a date")),
        ];

        let search = JobQuery {
            search: Some("RUST".to_string()),
            ..Default::default()
        };
        let ids = filter_jobs(&jobs, &search, now()).iter().map(|j| j.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2]);

        let tags = JobQuery {
            tags: vec!["backend".to_string(), "rust".to_string()],
            ..Default::default()
        };
        let ids = filter_jobs(&jobs, &tags, now()).iter().map(|j| j.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![1]);

        let today = JobQuery {
            posted_within: Some(DateWindow::Today),
            ..Default::default()
        };
        let ids = filter_jobs(&jobs, &today, now()).iter().map(|j| j.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 4]);

        let week = JobQuery {
            posted_within: Some(DateWindow::Week),
            ..Default::default()
        };
        let ids = filter_jobs(&jobs, &week, now()).iter().map(|j| j.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2, 4]);
    }

    #[test]
    fn unfiltered_results_sort_newest_first_with_undated_last() {
        let jobs = vec![
            stored(1, "A", "X", &[], None),
            stored(2, "B", "X", &[], Some("2026-01-01")),
            stored(3, "C", "X", &[], Some("2026-02-01T10:00:00Z")),
        ];
        let ids = filter_jobs(&jobs, &JobQuery::default(), now())
            .iter()
            .map(|j| j.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn pagination_clamps_page_and_counts_pages() {
        let jobs = (1..=25)
            .map(|id| stored(id, "T", "C", &[], None))
            .collect::<Vec<_>>();

        let page = paginate(jobs.clone(), 3, 10);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.jobs.len(), 5);
        assert_eq!(page.jobs[0].id, 21);

        let clamped = paginate(jobs, 99, 0);
        assert_eq!(clamped.per_page, 1);
        assert_eq!(clamped.page, 25);

        let empty = paginate(Vec::new(), 2, 10);
        assert_eq!(empty.total_pages, 0);
        assert_eq!(empty.page, 1);
        assert!(empty.jobs.is_empty());
        assert!(format_job_page(&empty).contains("Page 1 of 1 (0 jobs)"));
    }

    #[tokio::test]
    async fn detail_view_shows_stored_job() {
        let store = MemoryJobStore::new();
        let inserted = store
            .insert(&JobRow {
                job_title: "Rust Engineer".to_string(),
                company: "Acme".to_string(),
                tags: vec!["rust".to_string(), "backend".to_string()],
                date_posted: None,
                url: "https://remoteok.com/remote-jobs/7".to_string(),
            })
            .await
            .unwrap();

        let job = find_job(&store, inserted.id).await.unwrap();
        assert_eq!(
            format_job_detail(job.as_ref()),
            "Rust Engineer\n\
             Company: Acme\n\
             Tags: rust, backend\n\
             Posted: Not specified\n\
             Apply: https://remoteok.com/remote-jobs/7\n"
        );
    }

    #[tokio::test]
    async fn detail_view_reports_missing_id() {
        let store = MemoryJobStore::new();
        store.insert(&record(1).to_row()).await.unwrap();

        let job = find_job(&store, 42).await.unwrap();
        assert!(job.is_none());
        assert_eq!(format_job_detail(job.as_ref()), "Job not found\n");
    }

    #[test]
    fn tags_are_distinct_and_sorted() {
        let jobs = vec![
            stored(1, "A", "X", &["rust", "backend"], None),
            stored(2, "B", "X", &["backend", "api"], None),
        ];
        assert_eq!(collect_tags(&jobs), vec!["api", "backend", "rust"]);
    }

    #[test]
    fn date_window_parses_and_computes_cutoffs() {
        assert_eq!("Week".parse::<DateWindow>(), Ok(DateWindow::Week));
        assert!("year".parse::<DateWindow>().is_err());
        assert_eq!(
            DateWindow::Today.cutoff(now()),
            Utc.with_ymd_and_hms(2026, 2, 24, 0, 0, 0).single().unwrap()
        );
        assert_eq!(
            DateWindow::Month.cutoff(now()),
            Utc.with_ymd_and_hms(2026, 1, 25, 12, 0, 0).single().unwrap()
        );
    }

    #[test]
    fn posted_dates_parse_in_common_shapes() {
        let expected = Utc.with_ymd_and_hms(2026, 2, 24, 8, 0, 0).single().unwrap();
        assert_eq!(parse_posted_date("2026-02-24T08:00:00+00:00"), Some(expected));
        assert_eq!(parse_posted_date("2026-02-24 08:00:00+00"), Some(expected));
        assert_eq!(parse_posted_date("2026-02-24T08:00:00"), Some(expected));
        assert!(parse_posted_date("2026-02-24").is_some());
        assert_eq!(parse_posted_date("yesterday"), None);
    }
}
