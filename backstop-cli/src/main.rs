/*!
Backstop CLI - Command-line interface for the backstop backup engine.

Creates, restores, inspects and prunes backups of the application database
and file tree, manages recurring schedules, and checks the offsite target.
Backup records and schedules are kept in a JSON document next to the
artifacts.
*/

use anyhow::{bail, Context};
use backstop_core::{
    detect::BackupInfo,
    metadata::{BackupRecord, BackupSchedule, BackupStatus, BackupType, Frequency},
    orchestrator::CleanupOptions,
    strategy::OverwriteMode,
    BackupFilter, BackupOrchestrator, BackupRequest, EngineConfig, JsonFileStore,
    RestoreOptions, RestoreRequest, ScheduleRequest, Scheduler, StaticSettings, TracingAuditSink,
};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabled::{Table, Tabled};
use tracing::{info, warn};

/// Actor recorded on audit events raised from the command line
const CLI_ACTOR: &str = "cli";

#[derive(Parser)]
#[command(name = "backstop")]
#[command(about = "Backup and restore for application databases and file trees")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Directory holding backup artifacts
    #[arg(long, global = true, env = "BACKSTOP_BACKUP_DIR")]
    backup_dir: Option<PathBuf>,

    /// Application root; relative include and config paths resolve here
    #[arg(long, global = true, env = "BACKSTOP_APP_ROOT")]
    app_root: Option<PathBuf>,

    /// Settings document (encryption, offsite, advanced)
    #[arg(long, global = true, env = "BACKSTOP_SETTINGS")]
    settings: Option<PathBuf>,

    /// Metadata document for backup records and schedules
    #[arg(long, global = true, env = "BACKSTOP_STORE")]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, list, restore and inspect backups
    #[command(subcommand)]
    Backup(BackupCommand),
    /// Manage recurring backup schedules
    #[command(subcommand)]
    Schedule(ScheduleCommand),
    /// Check the offsite target
    #[command(subcommand)]
    Offsite(OffsiteCommand),
    /// Generate or check encryption keys
    #[command(subcommand)]
    Key(KeyCommand),
    /// Counts and sizes of recorded backups
    Stats,
    /// Disk space used by artifacts
    Storage,
    /// Health summary of the backup service
    Status,
    /// Print collected metrics in Prometheus text format
    Metrics,
}

#[derive(Subcommand)]
enum BackupCommand {
    /// Create a new backup
    Create(CreateArgs),
    /// List backup records
    List {
        #[arg(short = 't', long = "type", value_enum)]
        backup_type: Option<TypeArg>,
        #[arg(short, long, value_enum)]
        status: Option<StatusArg>,
        /// Include pre-restore snapshots
        #[arg(short, long)]
        all: bool,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Show one backup record
    Show { backup_id: String },
    /// Delete a backup record and its artifact
    Delete {
        backup_id: String,
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
    /// Verify a backup's checksum and structure
    Validate { backup_id: String },
    /// Restore application state from a backup
    Restore(RestoreArgs),
    /// Detect the type of an artifact and list its contents
    Info {
        path: PathBuf,
        #[arg(short, long, env = "BACKSTOP_ENCRYPTION_KEY")]
        key: Option<String>,
    },
    /// Describe what restoring an artifact would change
    Preview {
        path: PathBuf,
        #[arg(short, long, env = "BACKSTOP_ENCRYPTION_KEY")]
        key: Option<String>,
        #[arg(long)]
        target: Option<PathBuf>,
    },
    /// Delete completed backups past the age or count limit
    Cleanup {
        /// Days to keep; 0 disables the age limit
        #[arg(long)]
        retention_days: Option<u32>,
        /// Newest backups to keep; 0 disables the count limit
        #[arg(long)]
        max_backups: Option<u32>,
        #[arg(short = 't', long = "type", value_enum)]
        backup_type: Option<TypeArg>,
    },
}

#[derive(Args)]
struct CreateArgs {
    #[arg(short = 't', long = "type", value_enum)]
    backup_type: TypeArg,
    #[arg(short, long)]
    description: Option<String>,
    /// Encrypt the artifact (overrides the settings policy)
    #[arg(long, conflicts_with = "no_encrypt")]
    encrypt: bool,
    /// Store the artifact unencrypted (overrides the settings policy)
    #[arg(long)]
    no_encrypt: bool,
    /// Secret to encrypt with; implies --encrypt
    #[arg(short, long, env = "BACKSTOP_ENCRYPTION_KEY")]
    key: Option<String>,
    /// Paths to archive instead of the configured defaults
    #[arg(short, long = "include")]
    include: Vec<PathBuf>,
    /// Extra exclusion patterns
    #[arg(short, long = "exclude")]
    exclude: Vec<String>,
}

#[derive(Args)]
struct RestoreArgs {
    backup_id: String,
    /// Override the key stored on the record
    #[arg(short, long, env = "BACKSTOP_ENCRYPTION_KEY")]
    key: Option<String>,
    /// Drop and recreate database objects before replaying the dump
    #[arg(long)]
    drop_existing: bool,
    /// Extract files here instead of the application root
    #[arg(long)]
    target: Option<PathBuf>,
    /// Keep existing files that are newer than the archived copy
    #[arg(long)]
    keep_newer: bool,
    /// Skip the full-system snapshot taken before restoring
    #[arg(long)]
    no_snapshot: bool,
    #[arg(long)]
    skip_database: bool,
    #[arg(long)]
    skip_files: bool,
    #[arg(long)]
    skip_config: bool,
}

#[derive(Subcommand)]
enum ScheduleCommand {
    /// List schedules
    List,
    /// Create a schedule
    Create {
        #[arg(short, long)]
        name: String,
        #[arg(short = 't', long = "type", value_enum)]
        backup_type: TypeArg,
        #[arg(short, long, value_enum)]
        frequency: FrequencyArg,
        /// Time of day, HH:mm UTC
        #[arg(long)]
        time: String,
        /// 0 = Sunday ... 6 = Saturday
        #[arg(long)]
        day_of_week: Option<u8>,
        /// 1-31
        #[arg(long)]
        day_of_month: Option<u8>,
        #[arg(long, default_value_t = 30)]
        retention_days: u32,
        #[arg(long, default_value_t = 10)]
        max_backups: u32,
        #[arg(long)]
        encrypt: Option<bool>,
        #[arg(long)]
        disabled: bool,
        #[arg(short, long)]
        description: Option<String>,
    },
    /// Enable or disable a schedule
    Toggle {
        schedule_id: String,
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        #[arg(long)]
        disable: bool,
    },
    /// Delete a schedule
    Delete { schedule_id: String },
    /// Run a schedule immediately
    Run { schedule_id: String },
    /// Liveness and punctuality of every schedule
    Health,
    /// Run the scheduler in the foreground until interrupted
    Daemon {
        /// Seconds between maintenance passes
        #[arg(long, default_value_t = 86_400)]
        maintenance_interval: u64,
    },
}

#[derive(Subcommand)]
enum OffsiteCommand {
    /// Step through connectivity, permission and disk-space checks
    Test,
    /// List artifacts on the remote host
    List,
}

#[derive(Subcommand)]
enum KeyCommand {
    /// Print a fresh random key
    Generate,
    /// Check a key against the strength rules
    Validate { key: String },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TypeArg {
    Database,
    Files,
    FullSystem,
}

impl From<TypeArg> for BackupType {
    fn from(value: TypeArg) -> Self {
        match value {
            TypeArg::Database => BackupType::Database,
            TypeArg::Files => BackupType::Files,
            TypeArg::FullSystem => BackupType::FullSystem,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StatusArg {
    InProgress,
    Completed,
    Failed,
}

impl From<StatusArg> for BackupStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::InProgress => BackupStatus::InProgress,
            StatusArg::Completed => BackupStatus::Completed,
            StatusArg::Failed => BackupStatus::Failed,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FrequencyArg {
    Daily,
    Weekly,
    Monthly,
}

impl From<FrequencyArg> for Frequency {
    fn from(value: FrequencyArg) -> Self {
        match value {
            FrequencyArg::Daily => Frequency::Daily,
            FrequencyArg::Weekly => Frequency::Weekly,
            FrequencyArg::Monthly => Frequency::Monthly,
        }
    }
}

#[derive(Tabled)]
struct BackupRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Type")]
    backup_type: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Started")]
    started: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Encrypted")]
    encrypted: bool,
    #[tabled(rename = "Description")]
    description: String,
}

impl From<&BackupRecord> for BackupRow {
    fn from(record: &BackupRecord) -> Self {
        Self {
            id: record.backup_id.clone(),
            backup_type: record.backup_type.to_string(),
            status: record.status.to_string(),
            started: format_timestamp(record.started_at),
            size: format_size(record.size),
            encrypted: record.encrypted,
            description: record.description.clone().unwrap_or_default(),
        }
    }
}

#[derive(Tabled)]
struct ScheduleRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    backup_type: String,
    #[tabled(rename = "When")]
    when: String,
    #[tabled(rename = "Enabled")]
    enabled: bool,
    #[tabled(rename = "Next run")]
    next_run: String,
    #[tabled(rename = "Last status")]
    last_status: String,
}

impl From<&BackupSchedule> for ScheduleRow {
    fn from(schedule: &BackupSchedule) -> Self {
        let when = match (schedule.frequency, schedule.day_of_week, schedule.day_of_month) {
            (Frequency::Weekly, Some(day), _) => {
                format!("weekly on day {day} at {}", schedule.time)
            }
            (Frequency::Monthly, _, Some(day)) => {
                format!("monthly on the {day} at {}", schedule.time)
            }
            _ => format!("daily at {}", schedule.time),
        };
        Self {
            id: schedule.id.clone(),
            name: schedule.name.clone(),
            backup_type: schedule.backup_type.to_string(),
            when,
            enabled: schedule.enabled,
            next_run: schedule.next_run.map(format_timestamp).unwrap_or_else(|| "-".into()),
            last_status: schedule
                .last_status
                .map(|s| format!("{s:?}"))
                .unwrap_or_else(|| "-".into()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.json_logs)?;

    match &cli.command {
        Commands::Key(command) => return run_key(command),
        Commands::Metrics => {
            println!("{}", backstop_core::gather_metrics()?);
            return Ok(());
        }
        _ => {}
    }

    let orchestrator = Arc::new(build_orchestrator(&cli).await?);

    match cli.command {
        Commands::Backup(command) => run_backup(&orchestrator, command).await?,
        Commands::Schedule(command) => run_schedule(orchestrator, command).await?,
        Commands::Offsite(command) => run_offsite(&orchestrator, command).await?,
        Commands::Stats => print_json(&orchestrator.get_backup_stats().await?)?,
        Commands::Storage => print_json(&orchestrator.get_storage_usage().await?)?,
        Commands::Status => print_json(&orchestrator.get_service_status().await?)?,
        Commands::Key(_) | Commands::Metrics => {}
    }

    Ok(())
}

fn init_logging(verbose: bool, json: bool) -> Result<(), anyhow::Error> {
    if verbose && std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "backstop=debug");
    }
    backstop_core::init_observability(json)?;
    Ok(())
}

async fn build_orchestrator(cli: &Cli) -> Result<BackupOrchestrator, anyhow::Error> {
    let mut config = EngineConfig::from_env().context("Invalid environment configuration")?;
    if let Some(dir) = &cli.backup_dir {
        config.backup_dir = dir.clone();
    }
    if let Some(root) = &cli.app_root {
        config.app_root = root.clone();
    }

    let store_path = cli
        .store
        .clone()
        .unwrap_or_else(|| config.backup_dir.join("backstop.json"));
    let settings_path = cli
        .settings
        .clone()
        .unwrap_or_else(|| config.backup_dir.join("settings.json"));

    let store = JsonFileStore::open(&store_path)
        .await
        .with_context(|| format!("Failed to open metadata store {}", store_path.display()))?;
    let settings = StaticSettings::from_file(&settings_path)
        .with_context(|| format!("Failed to load settings {}", settings_path.display()))?;

    info!(
        backup_dir = %config.backup_dir.display(),
        store = %store_path.display(),
        "Using backup directory"
    );
    Ok(BackupOrchestrator::new(
        config,
        Arc::new(store),
        Arc::new(TracingAuditSink),
        Arc::new(settings),
    )?)
}

async fn run_backup(
    orchestrator: &BackupOrchestrator,
    command: BackupCommand,
) -> Result<(), anyhow::Error> {
    match command {
        BackupCommand::Create(args) => {
            let mut request = BackupRequest::new(args.backup_type.into())
                .with_include_paths(args.include);
            request.exclude_patterns = args.exclude;
            if let Some(description) = args.description {
                request = request.with_description(description);
            }
            if args.encrypt {
                request = request.with_encryption(true);
            } else if args.no_encrypt {
                request = request.with_encryption(false);
            }
            if let Some(key) = args.key {
                request = request.with_key(key);
            }

            let record = orchestrator.create_backup(request, Some(CLI_ACTOR)).await?;
            println!("✓ Backup {} completed", record.backup_id);
            println!("  Location: {}", record.location.display());
            println!("  Size: {}", format_size(record.size));
            if record.encrypted {
                println!("  Encrypted: yes (key retained on the record)");
            }
            if let Some(error) = record.metadata["offsite"]["error"].as_str() {
                warn!("Offsite transfer failed: {}", error);
            }
        }
        BackupCommand::List {
            backup_type,
            status,
            all,
            limit,
        } => {
            let mut filter = if all {
                BackupFilter::all()
            } else {
                BackupFilter::default()
            };
            filter.backup_type = backup_type.map(Into::into);
            filter.status = status.map(Into::into);
            if let Some(limit) = limit {
                filter = filter.paged(limit, 0);
            }

            let records = orchestrator.list_backups(&filter).await?;
            if records.is_empty() {
                println!("No backups found");
            } else {
                let rows: Vec<BackupRow> = records.iter().map(BackupRow::from).collect();
                println!("{}", Table::new(rows));
            }
        }
        BackupCommand::Show { backup_id } => {
            let mut record = orchestrator.get_backup(&backup_id).await?;
            if record.encryption_key.is_some() {
                record.encryption_key = Some("<redacted>".into());
            }
            print_json(&record)?;
        }
        BackupCommand::Delete { backup_id, force } => {
            if !force && !confirm(&format!("Delete backup '{backup_id}' and its artifact?"))? {
                println!("Deletion cancelled");
                return Ok(());
            }
            orchestrator.delete_backup(&backup_id, Some(CLI_ACTOR)).await?;
            println!("✓ Backup deleted successfully");
        }
        BackupCommand::Validate { backup_id } => {
            let report = orchestrator.validate_backup(&backup_id).await?;
            if report.valid {
                println!("✓ Backup is valid");
            } else {
                for error in &report.errors {
                    eprintln!("✗ {error}");
                }
            }
            print_json(&report.details)?;
            if !report.valid {
                bail!("Backup {backup_id} failed validation");
            }
        }
        BackupCommand::Restore(args) => restore(orchestrator, args).await?,
        BackupCommand::Info { path, key } => {
            let info = orchestrator
                .detector()
                .get_backup_info(&path, key.as_deref())
                .await?;
            print_info(&info);
        }
        BackupCommand::Preview { path, key, target } => {
            let options = RestoreOptions {
                encryption_key: key,
                target_dir: target,
                ..RestoreOptions::default()
            };
            let preview = orchestrator
                .detector()
                .get_restore_preview(&path, &options)
                .await?;
            print_json(&preview)?;
        }
        BackupCommand::Cleanup {
            retention_days,
            max_backups,
            backup_type,
        } => {
            let defaults = orchestrator.config().retention;
            let mut options = CleanupOptions::new(
                retention_days.unwrap_or(defaults.retention_days),
                max_backups.unwrap_or(defaults.max_backups),
            );
            options.backup_type = backup_type.map(Into::into);

            let report = orchestrator.cleanup_old_backups(&options).await?;
            println!("✓ Deleted {} backup(s)", report.deleted_count());
            for failure in &report.errors {
                eprintln!("✗ {}: {}", failure.backup_id, failure.error);
            }
        }
    }
    Ok(())
}

async fn restore(
    orchestrator: &BackupOrchestrator,
    args: RestoreArgs,
) -> Result<(), anyhow::Error> {
    let request = RestoreRequest {
        options: RestoreOptions {
            encryption_key: args.key,
            drop_existing: args.drop_existing,
            target_dir: args.target,
            overwrite: if args.keep_newer {
                OverwriteMode::KeepNewer
            } else {
                OverwriteMode::Overwrite
            },
            restore_database: !args.skip_database,
            restore_files: !args.skip_files,
            restore_config: !args.skip_config,
        },
        create_pre_restore_snapshot: !args.no_snapshot,
    };

    let outcome = orchestrator
        .restore_from_backup(&args.backup_id, request, Some(CLI_ACTOR))
        .await?;
    println!("✓ Restored {}", outcome.report.components.join(", "));
    if let Some(snapshot) = outcome.pre_restore_snapshot_id {
        println!("  Pre-restore snapshot: {snapshot}");
    }
    println!("  Operation: {}", outcome.operation_id);
    Ok(())
}

async fn run_schedule(
    orchestrator: Arc<BackupOrchestrator>,
    command: ScheduleCommand,
) -> Result<(), anyhow::Error> {
    let scheduler = Scheduler::new(orchestrator.clone());
    match command {
        ScheduleCommand::List => {
            let schedules = scheduler.list_schedules().await?;
            if schedules.is_empty() {
                println!("No schedules found");
            } else {
                let rows: Vec<ScheduleRow> = schedules.iter().map(ScheduleRow::from).collect();
                println!("{}", Table::new(rows));
            }
        }
        ScheduleCommand::Create {
            name,
            backup_type,
            frequency,
            time,
            day_of_week,
            day_of_month,
            retention_days,
            max_backups,
            encrypt,
            disabled,
            description,
        } => {
            let mut request =
                ScheduleRequest::new(name, backup_type.into(), frequency.into(), time);
            request.day_of_week = day_of_week;
            request.day_of_month = day_of_month;
            request.retention_days = retention_days;
            request.max_backups = max_backups;
            request.encrypt = encrypt;
            request.enabled = !disabled;
            request.description = description;

            let schedule = scheduler.create_schedule(request, Some(CLI_ACTOR)).await?;
            println!("✓ Schedule {} created", schedule.id);
            if let Some(next) = schedule.next_run {
                println!("  Next run: {}", format_timestamp(next));
            }
        }
        ScheduleCommand::Toggle {
            schedule_id,
            enable,
            disable,
        } => {
            if !enable && !disable {
                bail!("Pass --enable or --disable");
            }
            let schedule = scheduler
                .toggle_schedule(&schedule_id, enable, Some(CLI_ACTOR))
                .await?;
            let state = if schedule.enabled { "enabled" } else { "disabled" };
            println!("✓ Schedule {schedule_id} {state}");
        }
        ScheduleCommand::Delete { schedule_id } => {
            scheduler.delete_schedule(&schedule_id, Some(CLI_ACTOR)).await?;
            println!("✓ Schedule deleted successfully");
        }
        ScheduleCommand::Run { schedule_id } => {
            let outcome = scheduler.run_schedule_now(&schedule_id, Some(CLI_ACTOR)).await?;
            print_json(&outcome)?;
        }
        ScheduleCommand::Health => {
            let health = scheduler.get_schedule_health().await?;
            print_json(&health)?;
            if !health.healthy {
                bail!("Scheduler is unhealthy");
            }
        }
        ScheduleCommand::Daemon {
            maintenance_interval,
        } => {
            let jobs = scheduler.start().await?;
            scheduler.spawn_maintenance(Duration::from_secs(maintenance_interval.max(60)));
            let janitor = orchestrator.progress().spawn_janitor(Duration::from_secs(300));
            println!("Scheduler running with {jobs} job(s); press Ctrl-C to stop");

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            scheduler.shutdown();
            orchestrator.progress().shutdown();
            janitor.abort();
            println!("Scheduler stopped");
        }
    }
    Ok(())
}

async fn run_offsite(
    orchestrator: &BackupOrchestrator,
    command: OffsiteCommand,
) -> Result<(), anyhow::Error> {
    match command {
        OffsiteCommand::Test => {
            let result = orchestrator.offsite().test_connection().await?;
            for step in &result.steps {
                let mark = if step.passed { "✓" } else { "✗" };
                println!("{mark} {}", step.name);
                if !step.passed && !step.output.is_empty() {
                    println!("    {}", step.output.trim());
                }
            }
            println!("{}", result.message);
            if !result.success {
                bail!("Offsite connection test failed");
            }
        }
        OffsiteCommand::List => {
            let backups = orchestrator.offsite().list_remote_backups().await?;
            if backups.is_empty() {
                println!("No remote backups found");
            }
            for backup in backups {
                let modified = backup
                    .modified
                    .map(format_timestamp)
                    .unwrap_or_else(|| "-".into());
                println!("{}  {:>10}  {}", modified, format_size(backup.size), backup.name);
            }
        }
    }
    Ok(())
}

fn run_key(command: &KeyCommand) -> Result<(), anyhow::Error> {
    let engine = backstop_core::EncryptionEngine::default();
    match command {
        KeyCommand::Generate => println!("{}", engine.generate_key("cli")),
        KeyCommand::Validate { key } => {
            let validation = engine.validate_key(key);
            print_json(&validation)?;
            if !validation.valid {
                bail!("Key does not meet the strength rules");
            }
        }
    }
    Ok(())
}

fn print_info(info: &BackupInfo) {
    println!("Backup File:");
    println!("  Name: {}", info.file_name);
    println!("  Size: {}", format_size(info.size));
    if let Some(modified) = info.modified {
        println!("  Modified: {}", format_timestamp(modified));
    }
    println!("  Type: {:?}", info.detection.detected);
    println!("  Encrypted: {}", info.detection.encrypted);
    println!("  Detected by: {:?}", info.detection.method);
    if !info.contents.is_empty() {
        println!("  Contents:");
        for entry in &info.contents {
            println!("    {entry}");
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), anyhow::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool, anyhow::Error> {
    use std::io::{self, Write};
    print!("{prompt} (y/N): ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_lowercase().starts_with('y'))
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_parse_restore_flags() {
        let cli = Cli::try_parse_from([
            "backstop",
            "backup",
            "restore",
            "database_20240301_020000_0a1b2c3d",
            "--drop-existing",
            "--no-snapshot",
        ])
        .unwrap();
        let Commands::Backup(BackupCommand::Restore(args)) = cli.command else {
            panic!("expected restore");
        };
        assert!(args.drop_existing);
        assert!(args.no_snapshot);
        assert!(!args.keep_newer);
    }

    #[test]
    fn test_parse_schedule_create() {
        let cli = Cli::try_parse_from([
            "backstop", "schedule", "create", "--name", "weekly", "--type", "full-system",
            "--frequency", "weekly", "--time", "03:30", "--day-of-week", "0",
        ])
        .unwrap();
        let Commands::Schedule(ScheduleCommand::Create {
            backup_type,
            day_of_week,
            ..
        }) = cli.command
        else {
            panic!("expected schedule create");
        };
        assert_eq!(BackupType::from(backup_type), BackupType::FullSystem);
        assert_eq!(day_of_week, Some(0));
    }
}
