use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobsync_sync::{
    browse_jobs, find_job, format_job_detail, format_job_page, open_store_from_env, store_tags,
    DateWindow, JobQuery, DEFAULT_PAGE_SIZE,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobsync")]
#[command(about = "Fetch remote job listings and keep a jobs table in sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch listings and upsert them into the jobs table.
    Sync {
        /// Preview every fetched job instead of the first ten.
        #[arg(long)]
        all: bool,
    },
    /// Fetch listings and write them to a timestamped CSV file.
    Scrape {
        /// Preview every fetched job instead of the first ten.
        #[arg(long)]
        all: bool,
    },
    /// Check store credentials and run a create/read/update/delete round trip.
    Verify,
    /// Apply the bundled migrations (postgres backend only).
    Migrate,
    /// Search stored jobs.
    List {
        /// Case-insensitive match on title or company.
        #[arg(long)]
        search: Option<String>,
        /// Require this tag; repeat to require several.
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// today, week or month
        #[arg(long)]
        since: Option<DateWindow>,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        per_page: usize,
    },
    /// Show one stored job by id.
    Show { id: i64 },
    /// Print every distinct tag in the store.
    Tags,
}

fn display_limit(all: bool) -> Option<usize> {
    if all {
        None
    } else {
        Some(jobsync_sync::DEFAULT_DISPLAY_LIMIT)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Sync { all: false });
    tracing::debug!(?command, "running jobsync");

    match command {
        Commands::Sync { all } => {
            let summary = jobsync_sync::run_sync_once_from_env(display_limit(all)).await?;
            println!(
                "\nInserted/updated {} of {} jobs ({} new, {} updated, {} failed) via {}",
                summary.upsert.succeeded(),
                summary.upsert.total,
                summary.upsert.inserted,
                summary.upsert.updated,
                summary.upsert.failures.len(),
                summary.backend
            );
        }
        Commands::Scrape { all } => {
            let summary = jobsync_sync::run_scrape_once_from_env(display_limit(all)).await?;
            if summary.saved {
                println!("\nSaved {} jobs to {}", summary.fetched_jobs, summary.csv_path);
            } else {
                anyhow::bail!("could not write {}", summary.csv_path);
            }
        }
        Commands::Verify => {
            let report = jobsync_sync::run_verify_from_env().await?;
            for check in &report.checks {
                println!("{}", check.render());
            }
            if report.passed() {
                println!("\nAll checks passed. The jobs store is ready.");
            } else {
                anyhow::bail!("verification failed");
            }
        }
        Commands::Migrate => {
            jobsync_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
        Commands::List {
            search,
            tags,
            since,
            page,
            per_page,
        } => {
            let store = open_store_from_env().await?;
            let query = JobQuery {
                search,
                tags,
                posted_within: since,
            };
            let page = browse_jobs(store.as_ref(), &query, page, per_page, chrono::Utc::now())
                .await
                .context("loading jobs")?;
            print!("{}", format_job_page(&page));
        }
        Commands::Show { id } => {
            let store = open_store_from_env().await?;
            let job = find_job(store.as_ref(), id)
                .await
                .with_context(|| format!("loading job {id}"))?;
            print!("{}", format_job_detail(job.as_ref()));
        }
        Commands::Tags => {
            let store = open_store_from_env().await?;
            let tags = store_tags(store.as_ref()).await.context("loading tags")?;
            for tag in tags {
                println!("{tag}");
            }
        }
    }

    Ok(())
}
