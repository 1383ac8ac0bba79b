use clap::{Parser, Subcommand};
use roadsync_lib::commands::{log, settings, sync};
use roadsync_lib::config::ConfigSection;
use roadsync_lib::core::FileStatus;
use roadsync_lib::logging::{get_log_dir, LogConfig, SizeRotatingWriter};
use roadsync_lib::{AppState, SyncEvent};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "roadsync", version, about = "Upload tachograph files and archive them")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Verify and save credentials
    Connect {
        #[arg(long)]
        company_id: String,
        #[arg(long)]
        api_key: String,
    },
    /// Set the folder to sync
    Folder { path: PathBuf },
    /// Set the sync schedule: manual, application_start, 1H, 12H or 24H
    Schedule { trigger: String },
    /// List the files a sync would upload (archives are unpacked)
    Scan { path: Option<PathBuf> },
    /// Run one sync now and wait for every upload
    Sync,
    /// Show saved settings
    Status,
    /// Resume the saved schedule and keep running until Ctrl-C
    Run,
    /// Show or change log settings
    Log {
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long)]
        max_size_mb: Option<u32>,
        #[arg(long)]
        level: Option<String>,
    },
}

/// 初始化日志系统
fn init_logging() -> Option<WorkerGuard> {
    let log_dir = get_log_dir();
    let _ = std::fs::create_dir_all(&log_dir);

    let config = LogConfig::load(&log_dir);

    if !config.enabled {
        // 日志已禁用，只初始化一个空的 subscriber
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return None;
    }

    let level = config.tracing_level();
    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("reqwest=warn".parse().unwrap())
        .add_directive("sqlx=warn".parse().unwrap());

    match SizeRotatingWriter::new(&log_dir, config.max_size_mb) {
        Ok(file_writer) => {
            let (writer, guard) = tracing_appender::non_blocking(file_writer);

            // 文件日志层 - 始终输出到文件
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false);

            // 在 debug 模式下也输出到控制台（stderr，stdout 留给命令输出）
            let console_layer = cfg!(debug_assertions).then(|| {
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
            });

            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(console_layer);
            let _ = tracing::subscriber::set_global_default(subscriber);
            Some(guard)
        }
        Err(e) => {
            // 文件日志创建失败，回退到控制台
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .try_init();
            tracing::warn!("无法创建日志文件: {}", e);
            None
        }
    }
}

/// 把同步事件打印到终端
fn print_event(event: SyncEvent) {
    match event {
        SyncEvent::FilesRefreshed(rows) => println!("Found {} file(s)", rows.len()),
        SyncEvent::StatusChanged(row) if row.status != FileStatus::Synchronizing => {
            println!("{:<12} {}", row.status.to_string(), row.relative_path.display())
        }
        SyncEvent::StatusChanged(_) => {}
        SyncEvent::LastSync(at) => println!("Last sync: {}", at),
        SyncEvent::Log(message) => println!("{}", message),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging();

    let (tx, mut rx) = mpsc::channel(256);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(event);
        }
    });

    let state = AppState::new(Some(tx)).await?;
    let result = execute(&state, cli.command).await;

    state.cleanup().await;
    drop(state);
    let _ = tokio::time::timeout(Duration::from_secs(2), printer).await;

    result.map_err(anyhow::Error::msg)
}

async fn execute(state: &AppState, command: Command) -> Result<(), String> {
    match command {
        Command::Connect {
            company_id,
            api_key,
        } => {
            settings::connect(state, &company_id, &api_key).await?;
            println!("Connected.");
        }
        Command::Folder { path } => {
            settings::set_folder_path(state, &path.to_string_lossy()).await?;
            println!("Folder set to {}", path.display());
        }
        Command::Schedule { trigger } => {
            let applied = settings::set_schedule(state, &trigger).await?;
            println!(
                "Schedule saved: {}",
                schedule_label(&applied.trigger.to_string())
            );
            if let Some(report) = applied.startup {
                println!(
                    "Synced {}, failed {}",
                    report.files_synced, report.files_failed
                );
            }
        }
        Command::Scan { path } => {
            let rows = sync::scan_folder(state, path.as_deref()).await?;
            for row in &rows {
                println!("{:<12} {}", row.status.to_string(), row.relative_path.display());
            }
            println!("{} file(s)", rows.len());
        }
        Command::Sync => {
            let report = sync::sync_now(state).await?;
            println!(
                "Synced {}, failed {}",
                report.files_synced, report.files_failed
            );
        }
        Command::Status => {
            let preset = settings::get_preset(state).await?;
            println!("Company:   {}", preset.companyId);
            println!(
                "API key:   {}",
                if preset.apiKey.is_empty() { "" } else { "********" }
            );
            println!("Folder:    {}", preset.folderPath);
            println!("Schedule:  {}", schedule_label(&preset.syncSchedule));
            println!("Last sync: {}", preset.lastSync);
        }
        Command::Run => {
            match settings::resume_previous_schedule(state).await? {
                Some(trigger) => println!("Running with schedule {}", trigger),
                None => {
                    state.ensure_scheduler().await;
                    println!("No schedule to resume, waiting");
                }
            }
            tokio::signal::ctrl_c().await.map_err(|e| e.to_string())?;
            println!("Stopping...");
        }
        Command::Log {
            enabled,
            max_size_mb,
            level,
        } => {
            let config = if enabled.is_none() && max_size_mb.is_none() && level.is_none() {
                log::get_log_config(state)
            } else {
                log::set_log_config(state, enabled, max_size_mb, level)?
            };
            println!(
                "enabled={} maxSizeMb={} level={}",
                config.enabled, config.max_size_mb, config.level
            );
        }
    }
    Ok(())
}

fn schedule_label(value: &str) -> &str {
    if value.is_empty() {
        "manual"
    } else {
        value
    }
}
