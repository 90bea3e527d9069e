//! Batch-maintenance entry point for the character store.
//!
//! Run by the scheduler for score recomputation and duplicate cleanup, and by
//! operators for imports, exports and statistics.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use charvault_core::character::RawCharacter;
use charvault_db::config::{DbConfig, RepoConfig};
use charvault_db::repositories::CharacterRepo;
use charvault_db::store::PgCharacterStore;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "charvault-worker", version, about = "Character store maintenance")]
struct Cli {
    /// Apply pending database migrations before running the command.
    #[arg(long, global = true)]
    migrate: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Recompute every stored quality score, writing only changed ones.
    RecomputeScores,
    /// Keep the earliest-scraped record of each identity key, delete the rest.
    CleanupDuplicates,
    /// Print collection statistics as JSON.
    Stats,
    /// Save raw records from a JSON-lines file (`-` for stdin).
    Import {
        input: PathBuf,
    },
    /// Write stored records as JSON lines.
    Export {
        /// Restrict to one collection (case-insensitive).
        #[arg(long)]
        collection: Option<String>,
        #[arg(long, default_value_t = 0.0)]
        min_quality: f64,
        /// Output file; stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "charvault_worker=info,charvault_db=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();

    let db_config = DbConfig::from_env()?;
    let repo_config = RepoConfig::from_env()?;

    let pool = charvault_db::create_pool(&db_config)
        .await
        .context("failed to connect to the database")?;
    charvault_db::health_check(&pool)
        .await
        .context("database health check failed")?;
    if cli.migrate {
        charvault_db::run_migrations(&pool).await?;
        tracing::info!("Migrations applied");
    }

    let repo = CharacterRepo::new(Arc::new(PgCharacterStore::new(pool)), repo_config);

    match cli.command {
        Commands::RecomputeScores => {
            let updated = repo.recompute_all_quality_scores().await?;
            println!("{updated} quality scores updated");
        }
        Commands::CleanupDuplicates => {
            let removed = repo.cleanup_duplicates().await?;
            println!("{removed} duplicate records removed");
        }
        Commands::Stats => {
            let stats = repo.statistics().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Import { input } => import(&repo, &input).await?,
        Commands::Export {
            collection,
            min_quality,
            out,
        } => export(&repo, collection.as_deref(), min_quality, out).await?,
    }

    Ok(())
}

async fn import(repo: &CharacterRepo, input: &Path) -> Result<()> {
    let reader: Box<dyn BufRead> = if input.as_os_str() == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file = File::open(input).with_context(|| format!("cannot open {}", input.display()))?;
        Box::new(BufReader::new(file))
    };

    let chunk_size = usize::try_from(repo.config().batch_chunk_size).unwrap_or(1).max(1);
    let mut batch: Vec<RawCharacter> = Vec::with_capacity(chunk_size);
    let mut saved = 0usize;
    let mut rejected = 0usize;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(Value::Object(map)) => batch.push(map),
            Ok(_) => {
                tracing::warn!(line = line_no + 1, "Skipping non-object line");
                rejected += 1;
            }
            Err(e) => {
                tracing::warn!(line = line_no + 1, error = %e, "Skipping malformed JSON line");
                rejected += 1;
            }
        }

        if batch.len() >= chunk_size {
            save_chunk(repo, &batch, &mut saved, &mut rejected).await?;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        save_chunk(repo, &batch, &mut saved, &mut rejected).await?;
    }

    tracing::info!(saved, rejected, "Import finished");
    println!("{saved} records saved, {rejected} rejected");
    Ok(())
}

async fn save_chunk(
    repo: &CharacterRepo,
    batch: &[RawCharacter],
    saved: &mut usize,
    rejected: &mut usize,
) -> Result<()> {
    match repo.save_many(batch).await {
        Ok(report) => {
            *saved += report.saved_ids.len();
            *rejected += report.failures.len();
            Ok(())
        }
        Err(e) => {
            *saved += e.report.saved_ids.len();
            *rejected += e.report.failures.len();
            println!("{saved} records saved, {rejected} rejected before the store failed");
            Err(e).context("import aborted")
        }
    }
}

async fn export(
    repo: &CharacterRepo,
    collection: Option<&str>,
    min_quality: f64,
    out: Option<PathBuf>,
) -> Result<()> {
    if !(0.0..=1.0).contains(&min_quality) {
        bail!("--min-quality must be between 0 and 1, got {min_quality}");
    }

    let characters = repo.export(collection, min_quality).await?;

    let mut writer: Box<dyn Write> = match &out {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("cannot create {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };
    for character in &characters {
        serde_json::to_writer(&mut writer, character)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;

    tracing::info!(exported = characters.len(), "Export finished");
    Ok(())
}
