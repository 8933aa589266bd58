use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use kinvault::config::{self, Settings};
use kinvault::db::models::{RunFilter, RunKind, RunStatus, RunTrigger};
use kinvault::db::repos::{apps, runs};
use kinvault::error::AppError;
use kinvault::{db, logging, AppContext};

#[derive(Parser)]
#[command(
    name = "kinvault",
    version,
    about = "Backup and restore engine for kintone apps"
)]
struct Cli {
    /// Headless scheduled-backup mode: differential backup of every active
    /// tracked app, then exit. Exit code 0 as long as the sweep itself ran,
    /// even if individual app backups failed.
    #[arg(long)]
    scheduled: bool,

    /// Path to config.toml (default: <data dir>/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Back up one app (differential by default).
    Backup {
        app_id: u64,
        /// Capture every record instead of changes since the last backup.
        #[arg(long)]
        full: bool,
    },
    /// Replay records from a backup run's archive into the live app.
    Restore {
        run_id: String,
        /// Restore only these records, by business key (comma-separated).
        #[arg(long, value_delimiter = ',')]
        records: Option<Vec<String>>,
    },
    /// List backup runs, newest first.
    History {
        #[arg(long)]
        app: Option<u64>,
        #[arg(long)]
        kind: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// List tracked apps (active by default).
    Apps {
        /// Include inactive apps.
        #[arg(long)]
        all: bool,
        /// List apps on the kintone tenant instead of tracked apps.
        #[arg(long, conflicts_with = "all")]
        remote: bool,
        /// Re-enable a tracked app for scheduled sweeps.
        #[arg(long, value_name = "APP_ID", conflicts_with_all = ["all", "remote", "deactivate"])]
        activate: Option<u64>,
        /// Exclude a tracked app from scheduled sweeps (history is kept).
        #[arg(long, value_name = "APP_ID", conflicts_with_all = ["all", "remote"])]
        deactivate: Option<u64>,
    },
    /// Delete a backup run, its markers and its archive file.
    Delete { run_id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // `.env` must be in the environment before the data dir is picked, or a
    // KINVAULT_DATA_DIR set only there would apply to archives but not to
    // the database and logs.
    config::load_env();

    let data_dir = match config::data_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("kinvault: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Scheduled runs also log to a rolling file; the guard must outlive the
    // sweep so the writer flushes.
    let _log_guard = if cli.scheduled {
        match logging::init_scheduled(&data_dir) {
            Ok(guard) => Some(guard),
            Err(e) => {
                eprintln!("kinvault: cannot set up logging: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        logging::init();
        None
    };

    match run(cli, data_dir).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "kinvault exiting with error");
            eprintln!("kinvault: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, data_dir: PathBuf) -> Result<ExitCode, AppError> {
    let settings = Settings::load(cli.config.as_deref())?;
    let pool = db::init_db(&data_dir)?;

    let stale = runs::fail_stale_running(&pool)?;
    if stale > 0 {
        tracing::warn!(count = stale, "Marked interrupted runs from a previous process as failed");
    }

    let ctx = AppContext::new(settings, pool)?;

    if cli.scheduled {
        return run_scheduled(&ctx).await;
    }

    match cli.command {
        Some(Command::Backup { app_id, full }) => {
            let kind = if full {
                RunKind::Full
            } else {
                RunKind::Differential
            };
            let run = ctx
                .orchestrator()
                .backup_app(app_id, kind, RunTrigger::Manual)
                .await?;
            println!(
                "run {}: {} — {} records, {} ms, archive: {}",
                run.id,
                run.status.as_str(),
                run.record_count,
                run.duration_ms.unwrap_or(0),
                run.archive_path.as_deref().unwrap_or("none"),
            );
            Ok(ExitCode::SUCCESS)
        }
        Some(Command::Restore { run_id, records }) => {
            let outcome = ctx
                .reconciler()
                .restore(&run_id, records.as_deref())
                .await?;
            println!(
                "restore {}: {} — {} updated, {} added (of {})",
                outcome.run_id,
                outcome.status.as_str(),
                outcome.updated,
                outcome.added,
                outcome.attempted,
            );
            for warning in &outcome.warnings {
                println!("warning: {warning}");
            }
            if let Some(detail) = &outcome.error_detail {
                println!("errors: {detail}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Some(Command::History {
            app,
            kind,
            status,
            limit,
        }) => {
            let filter = RunFilter {
                app_id: app,
                kind: parse_enum::<RunKind>(kind.as_deref(), "kind")?,
                status: parse_enum::<RunStatus>(status.as_deref(), "status")?,
                limit: Some(limit),
                ..Default::default()
            };
            for run in runs::history(&ctx.db, &filter)? {
                println!(
                    "{}  {:>6}  {:<12}  {:<15}  {:>6} records  {}",
                    run.started_at,
                    run.app_id,
                    run.kind.as_str(),
                    run.status.as_str(),
                    run.record_count,
                    run.id,
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Some(Command::Apps {
            all,
            remote,
            activate,
            deactivate,
        }) => {
            if let Some((app_id, active)) = activate
                .map(|id| (id, true))
                .or(deactivate.map(|id| (id, false)))
            {
                if !apps::set_active(&ctx.db, app_id, active)? {
                    return Err(AppError::NotFound(format!("tracked app {app_id}")));
                }
                println!(
                    "app {app_id} {}",
                    if active { "activated" } else { "deactivated" }
                );
                return Ok(ExitCode::SUCCESS);
            }
            if remote {
                for app in ctx.client.list_apps().await? {
                    println!("{:>6}  {}", app.app_id, app.name);
                }
                return Ok(ExitCode::SUCCESS);
            }
            for app in apps::list(&ctx.db, !all)? {
                println!(
                    "{:>6}  {:<30}  {}  last backup: {}",
                    app.app_id,
                    app.name,
                    if app.active { "active" } else { "inactive" },
                    app.last_backup_at.as_deref().unwrap_or("never"),
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Some(Command::Delete { run_id }) => {
            let archive_path = runs::delete(&ctx.db, &run_id)?;
            if let Some(path) = archive_path {
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!(path, error = %e, "Archive file not removed");
                }
                // Attachment sidecar directory, when one was downloaded.
                let files_dir = PathBuf::from(&path).with_extension("files");
                if files_dir.is_dir() {
                    let _ = std::fs::remove_dir_all(files_dir);
                }
            }
            println!("deleted run {run_id}");
            Ok(ExitCode::SUCCESS)
        }
        None => Err(AppError::Validation(
            "no command given; use --scheduled or a subcommand (see --help)".into(),
        )),
    }
}

/// Scheduled sweep. Individual app failures are reported but never change
/// the exit code; only a startup failure does.
async fn run_scheduled(ctx: &AppContext) -> Result<ExitCode, AppError> {
    let outcomes = ctx.orchestrator().backup_all_active().await?;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(run) => println!(
                "{} ({}): {} — {} records",
                outcome.app_name,
                outcome.app_id,
                run.status.as_str(),
                run.record_count,
            ),
            Err(e) => println!("{} ({}): failed — {e}", outcome.app_name, outcome.app_id),
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn parse_enum<T: std::str::FromStr>(raw: Option<&str>, what: &str) -> Result<Option<T>, AppError> {
    match raw {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|_| AppError::Validation(format!("invalid {what}: {s}"))),
    }
}
