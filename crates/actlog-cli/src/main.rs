use std::path::PathBuf;

use actlog_core::RepairField;
use actlog_storage::PgStore;
use actlog_sync::{Engine, EngineConfig};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "actlog-cli")]
#[command(about = "Learning activity ledger: ingestion, reconciliation and repair")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP server (webhooks, triggers, activity query).
    Serve,
    /// Replay LMS history for one or more groups.
    Backfill {
        #[arg(long = "group", required = true)]
        groups: Vec<String>,
    },
    /// Reconcile a results spreadsheet.
    Import {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value = "lms_results")]
        variant: String,
    },
    #[command(subcommand)]
    Repair(RepairCommand),
    /// Apply database migrations.
    Migrate,
    /// Write a Parquet snapshot of the activity log.
    Export {
        #[arg(long, default_value = "./snapshots")]
        out: PathBuf,
    },
    /// Run scheduled backfills until interrupted.
    Schedule,
}

#[derive(Debug, Subcommand)]
enum RepairCommand {
    /// Refill null fields from each record's stored payload.
    RawPayload {
        /// Comma-separated field names; all repairable fields when omitted.
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,
    },
    /// Refill null fields from a correction spreadsheet.
    Corrections {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value = "quiz_corrections")]
        variant: String,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn parse_fields(raw: &[String]) -> Result<Vec<RepairField>> {
    raw.iter()
        .map(|name| RepairField::parse(name).with_context(|| format!("unknown repair field {name:?}")))
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::from_env();
    init_tracing(cli.log_json || config.log_json);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let engine = Engine::from_config(config).await?;
            let scheduler = engine.maybe_build_scheduler().await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
            }
            actlog_web::serve(engine).await?;
        }
        Commands::Backfill { groups } => {
            let engine = Engine::from_config(config).await?;
            for group in groups {
                let report = engine.run_backfill(&group).await?;
                println!(
                    "backfill complete: run_id={} group={} subjects={} inserted={} skipped_exact={} skipped_soft={} rejected={} failed_pages={}",
                    report.run_id,
                    group,
                    report.subjects,
                    report.inserted,
                    report.skipped_exact,
                    report.skipped_soft,
                    report.rejected,
                    report.failed_pages
                );
            }
        }
        Commands::Import { file, variant } => {
            let engine = Engine::from_config(config).await?;
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let report = engine.import_csv(&variant, &bytes).await?;
            println!(
                "import complete: run_id={} rows={} inserted={} skipped_exact={} skipped_soft={} rejected={}",
                report.run_id, report.total, report.inserted, report.skipped_exact, report.skipped_soft, report.rejected
            );
        }
        Commands::Repair(RepairCommand::RawPayload { fields }) => {
            let fields = parse_fields(&fields)?;
            let engine = Engine::from_config(config).await?;
            let report = engine.repair_raw_payloads(&fields).await?;
            println!(
                "repair complete: run_id={} scanned={} repaired={} errors={}",
                report.run_id, report.scanned, report.repaired, report.errors.total
            );
        }
        Commands::Repair(RepairCommand::Corrections { file, variant }) => {
            let engine = Engine::from_config(config).await?;
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let report = engine.repair_from_corrections(&variant, &bytes).await?;
            println!(
                "repair complete: run_id={} rows={} repaired={} unmatched={} ambiguous={}",
                report.run_id,
                report.scanned,
                report.repaired,
                report.unmatched,
                report.ambiguous.len()
            );
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let store = PgStore::connect(url).await.context("connecting to postgres")?;
            store.migrate().await?;
            info!("migrations applied");
        }
        Commands::Export { out } => {
            let engine = Engine::from_config(config).await?;
            let manifest = engine.export_snapshot(&out).await?;
            println!("export complete: rows={} dir={}", manifest.rows, out.display());
        }
        Commands::Schedule => {
            let engine = Engine::from_config(EngineConfig {
                scheduler_enabled: true,
                ..config
            })
            .await?;
            let Some(sched) = engine.maybe_build_scheduler().await? else {
                bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %engine.config.backfill_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_repair_fields() {
        let cli = Cli::parse_from(["actlog-cli", "repair", "raw-payload", "--fields", "score_percent,content_title"]);
        let Some(Commands::Repair(RepairCommand::RawPayload { fields })) = cli.command else {
            panic!("wrong command");
        };
        assert_eq!(
            parse_fields(&fields).unwrap(),
            vec![RepairField::ScorePercent, RepairField::ContentTitle]
        );
        assert!(parse_fields(&["course_id".to_string()]).is_err());
    }

    #[test]
    fn backfill_accepts_repeated_groups() {
        let cli = Cli::parse_from(["actlog-cli", "backfill", "--group", "a", "--group", "b"]);
        assert!(matches!(cli.command, Some(Commands::Backfill { groups }) if groups == ["a", "b"]));
    }
}
