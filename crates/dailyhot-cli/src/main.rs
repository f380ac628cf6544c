use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use dailyhot_core::HotItem;
use dailyhot_storage::{DigestQuery, HotItemStore, PgHotItemStore};
use dailyhot_sync::{HotPipeline, JobRun, SyncConfig};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "dailyhot")]
#[command(about = "Collect daily hot lists and enrich them with summaries", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every category once and upsert its items.
    Collect,
    /// Run one enrichment pass over rows without a summary.
    Enrich {
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        max_failures: Option<u32>,
    },
    /// Collect, then enrich.
    Run,
    /// Run both jobs on their cron schedules until interrupted.
    Schedule,
    /// Apply database migrations.
    Migrate,
    /// Print the top enriched items for a digest.
    Top {
        #[arg(long, default_value_t = 12)]
        limit: usize,
        #[arg(long = "category")]
        categories: Vec<String>,
        /// Only items collected in the last 24 hours.
        #[arg(long)]
        today: bool,
    },
    /// Exclude a row from enrichment, or re-admit it with --clear.
    Skip {
        category: String,
        title: String,
        #[arg(long)]
        clear: bool,
    },
    /// Drop a row's summary and retry history so it is analyzed again.
    Reset { category: String, title: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Collect => {
            let pipeline = HotPipeline::connect(config).await?;
            match pipeline.collect_job().await {
                JobRun::Completed(summary) => println!("{}", serde_json::to_string(&summary)?),
                other => report_incomplete("collect", other)?,
            }
        }
        Commands::Enrich {
            batch_size,
            max_failures,
        } => {
            if let Some(batch_size) = batch_size {
                config.enrichment.batch_size = batch_size;
            }
            if let Some(max_failures) = max_failures {
                config.enrichment.max_failures = max_failures;
            }
            let pipeline = HotPipeline::connect(config).await?;
            match pipeline.enrich_job().await {
                JobRun::Completed(summary) => println!("{}", serde_json::to_string(&summary)?),
                other => report_incomplete("enrich", other)?,
            }
        }
        Commands::Run => {
            let pipeline = HotPipeline::connect(config).await?;
            let summary = pipeline.run_once().await;
            println!("{}", serde_json::to_string(&summary)?);
        }
        Commands::Schedule => {
            let pipeline = HotPipeline::connect(config).await?;
            Arc::new(pipeline).serve_until_shutdown().await?;
        }
        Commands::Migrate => {
            let store =
                PgHotItemStore::connect(&config.database_url, config.database_max_connections)
                    .await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Top {
            limit,
            categories,
            today,
        } => {
            let store = dailyhot_sync::connect_store(&config).await?;
            let query = DigestQuery {
                categories,
                collected_since: today.then(|| Utc::now() - Duration::hours(24)),
                limit,
            };
            for item in store.digest_candidates(&query).await? {
                print_item(&item);
            }
        }
        Commands::Skip {
            category,
            title,
            clear,
        } => {
            let store = dailyhot_sync::connect_store(&config).await?;
            if !store.set_skip(&category, &title, !clear).await? {
                bail!("no item titled {title:?} in {category}");
            }
            println!("{category}/{title}: skip={}", !clear);
        }
        Commands::Reset { category, title } => {
            let store = dailyhot_sync::connect_store(&config).await?;
            if !store.reset_enrichment(&category, &title).await? {
                bail!("no item titled {title:?} in {category}");
            }
            println!("{category}/{title}: queued for enrichment");
        }
    }

    Ok(())
}

fn report_incomplete<T>(job: &str, run: JobRun<T>) -> Result<()> {
    match run {
        JobRun::Completed(_) => Ok(()),
        JobRun::Skipped(reason) => {
            eprintln!("{job} skipped: {reason:?}");
            Ok(())
        }
        JobRun::Failed(message) => bail!("{job} failed: {message}"),
    }
}

fn print_item(item: &HotItem) {
    let tags = item.ai_tags.as_deref().unwrap_or_default().join(", ");
    println!(
        "[{}] {} (hot {})",
        item.category,
        item.title,
        item.hot_score.unwrap_or_default()
    );
    if let Some(url) = &item.url {
        println!("  {url}");
    }
    if let Some(summary) = &item.ai_summary {
        println!("  {summary}");
    }
    if !tags.is_empty() {
        println!("  tags: {tags}");
    }
}
