use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use mediatool_core::api::GhostAdminClient;
use mediatool_core::backup::{BACKUPS_DIRNAME, BackupOrchestrator};
use mediatool_core::config::{MediaToolConfig, load_config};
use mediatool_core::confirm::{AutoConfirm, Confirm, TerminalConfirm};
use mediatool_core::convert::WebpCodec;
use mediatool_core::executor::RetryPolicy;
use mediatool_core::filesystem::MediaLibrary;
use mediatool_core::identifier::Resolver;
use mediatool_core::index::{build_index, find_dangling};
use mediatool_core::journal::Journal;
use mediatool_core::pipeline::{PipelineOutcome, RunRequest, Services, restore_journal, run_operation};
use mediatool_core::plan::{ChangeStatus, Operation};
use mediatool_core::reachability::analyze;
use mediatool_core::report::print_summary;
use mediatool_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, RunLock, init_layout, inspect_runtime,
    locate_config, normalize_for_display, resolve_paths,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "mediatool",
    version,
    about = "Maintenance tools for a Ghost media library"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    state_dir: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    config: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            config: cli.config.clone(),
            state_dir: cli.state_dir.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Write a starter config and create the state directory")]
    Init(InitArgs),
    #[command(about = "Convert images to WebP and rewrite every reference")]
    Convert(ConvertArgs),
    #[command(about = "Move referenced files into per-slug directories")]
    Relocate(OperationArgs),
    #[command(about = "Move unreferenced files into the run stash")]
    Cleanup(OperationArgs),
    #[command(name = "alt-text", about = "Fill empty image alt text from file names")]
    AltText(OperationArgs),
    #[command(about = "Revert the applied changes recorded in a journal")]
    Restore(RestoreArgs),
    #[command(about = "Dump the database and archive the content directory")]
    Backup(BackupArgs),
    #[command(about = "Index content references and report reachability")]
    Index,
    #[command(about = "Show the header, events and records of a journal")]
    Journal(JournalArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Args)]
struct OperationArgs {
    #[arg(long, help = "Plan and journal without changing anything")]
    dry_run: bool,
    #[arg(long, help = "Do not take a backup before changing anything")]
    skip_backup: bool,
    #[arg(long, help = "Overwrite existing targets and replace existing values")]
    force: bool,
    #[arg(short, long, help = "Answer yes to every confirmation")]
    yes: bool,
    #[arg(long, value_name = "JOURNAL", help = "Revert a previous run of this command")]
    restore: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ConvertArgs {
    #[command(flatten)]
    operation: OperationArgs,
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100), help = "WebP quality")]
    quality: Option<u8>,
}

#[derive(Debug, Args)]
struct RestoreArgs {
    journal: PathBuf,
    #[arg(short, long, help = "Answer yes to every confirmation")]
    yes: bool,
}

#[derive(Debug, Args)]
struct BackupArgs {
    #[arg(long, help = "Describe the backup steps without running them")]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct JournalArgs {
    journal: PathBuf,
    #[arg(long, help = "Print the header and events as JSON")]
    json: bool,
}

struct Session {
    paths: ResolvedPaths,
    config: MediaToolConfig,
}

fn main() -> ExitCode {
    init_tracing();
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run() -> Result<u8> {
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Convert(ConvertArgs { operation, quality })) => {
            run_maintenance(&runtime, Operation::Convert, operation, quality)
        }
        Some(Commands::Relocate(args)) => run_maintenance(&runtime, Operation::Relocate, args, None),
        Some(Commands::Cleanup(args)) => run_maintenance(&runtime, Operation::Cleanup, args, None),
        Some(Commands::AltText(args)) => run_maintenance(&runtime, Operation::AltText, args, None),
        Some(Commands::Restore(args)) => run_restore(&runtime, args),
        Some(Commands::Backup(args)) => run_backup(&runtime, args),
        Some(Commands::Index) => run_index(&runtime),
        Some(Commands::Journal(args)) => run_journal(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(0)
        }
    }
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<u8> {
    let session = open_session(runtime)?;
    let report = init_layout(&session.paths, args.force)?;

    println!("Initialized mediatool runtime layout");
    println!("config_path: {}", normalize_for_display(&session.paths.config_path));
    println!("state_dir: {}", normalize_for_display(&session.paths.state_dir));
    println!("journal_dir: {}", normalize_for_display(&session.paths.journal_dir));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    if !report.wrote_config {
        println!("note: config already exists; pass --force to overwrite");
    }
    print_diagnostics(runtime, &session)?;
    Ok(0)
}

fn run_maintenance(
    runtime: &RuntimeOptions,
    operation: Operation,
    args: OperationArgs,
    quality: Option<u8>,
) -> Result<u8> {
    let session = open_session(runtime)?;
    let _lock = RunLock::acquire(&session.paths)?;
    let config = &session.config;

    let mut api = GhostAdminClient::from_config(config)?;
    let library = MediaLibrary::from_config(config)?;
    let resolver = site_resolver(config)?;
    let needs_backup = !args.dry_run && !args.skip_backup && args.restore.is_none();
    let backup = if needs_backup {
        Some(BackupOrchestrator::from_config(
            config,
            &session.paths.state_dir.join(BACKUPS_DIRNAME),
        )?)
    } else {
        None
    };
    let mut terminal = TerminalConfirm;
    let mut auto = AutoConfirm::default();
    let confirm: &mut dyn Confirm = if args.yes { &mut auto } else { &mut terminal };

    let mut services = Services {
        api: &mut api,
        codec: &WebpCodec,
        library: &library,
        resolver: &resolver,
        confirm,
        backup: backup.as_ref(),
        journal_dir: session.paths.journal_dir.clone(),
        retry: RetryPolicy::from_config(config),
        page_size: config.page_size(),
    };
    let outcome = match args.restore.as_deref() {
        Some(journal) => restore_journal(&mut services, journal, Some(operation))?,
        None => run_operation(
            &mut services,
            &RunRequest {
                operation,
                dry_run: args.dry_run,
                skip_backup: args.skip_backup,
                force: args.force,
                quality: quality.unwrap_or_else(|| config.webp_quality()),
            },
        )?,
    };
    print_diagnostics(runtime, &session)?;
    Ok(report_outcome(outcome))
}

fn run_restore(runtime: &RuntimeOptions, args: RestoreArgs) -> Result<u8> {
    let session = open_session(runtime)?;
    let _lock = RunLock::acquire(&session.paths)?;
    let config = &session.config;

    let mut api = GhostAdminClient::from_config(config)?;
    let library = MediaLibrary::from_config(config)?;
    let resolver = site_resolver(config)?;
    let mut terminal = TerminalConfirm;
    let mut auto = AutoConfirm::default();
    let confirm: &mut dyn Confirm = if args.yes { &mut auto } else { &mut terminal };

    let mut services = Services {
        api: &mut api,
        codec: &WebpCodec,
        library: &library,
        resolver: &resolver,
        confirm,
        backup: None,
        journal_dir: session.paths.journal_dir.clone(),
        retry: RetryPolicy::from_config(config),
        page_size: config.page_size(),
    };
    let outcome = restore_journal(&mut services, &args.journal, None)?;
    print_diagnostics(runtime, &session)?;
    Ok(report_outcome(outcome))
}

fn run_backup(runtime: &RuntimeOptions, args: BackupArgs) -> Result<u8> {
    let session = open_session(runtime)?;
    let _lock = if args.dry_run {
        None
    } else {
        Some(RunLock::acquire(&session.paths)?)
    };
    let orchestrator = BackupOrchestrator::from_config(
        &session.config,
        &session.paths.state_dir.join(BACKUPS_DIRNAME),
    )?;
    let report = orchestrator.run(args.dry_run)?;

    println!("backup");
    println!("dry_run: {}", report.dry_run);
    println!("backup_dir: {}", normalize_for_display(&report.backup_dir));
    for step in &report.planned {
        println!("planned: {step}");
    }
    for artifact in &report.artifacts {
        println!(
            "artifact.{}: {} ({} bytes)",
            artifact.step,
            normalize_for_display(&artifact.path),
            artifact.size
        );
    }
    print_diagnostics(runtime, &session)?;
    Ok(0)
}

fn run_index(runtime: &RuntimeOptions) -> Result<u8> {
    let session = open_session(runtime)?;
    let config = &session.config;
    let mut api = GhostAdminClient::from_config(config)?;
    let library = MediaLibrary::from_config(config)?;
    let resolver = site_resolver(config)?;

    let index = build_index(&mut api, &resolver, config.page_size())?;
    let listing = library.list_assets(&resolver)?;
    let reachability = analyze(&index, &listing);
    let dangling = find_dangling(&index, &listing);

    println!("content index");
    for (collection, count) in index.counts_by_kind() {
        println!("items.{collection}: {count}");
    }
    println!("items_not_decoded: {}", index.skipped.len());
    println!("references: {}", index.references.len());
    for (field, count) in index.counts_by_field() {
        println!("references.{field}: {count}");
    }
    println!("api_requests: {}", index.request_count);
    println!("files: {}", listing.files.len());
    println!("files_bytes: {}", listing.total_bytes());
    println!("reachable_files: {}", reachability.reachable_files);
    println!("unreachable_files: {}", reachability.unreachable.len());
    println!("unreachable_bytes: {}", reachability.unreachable_bytes);
    println!("unmapped_files: {}", reachability.unmapped.len());
    println!("dangling_references: {}", dangling.len());
    for item in &index.skipped {
        println!(
            "not_decoded: {} {} ({})",
            item.kind.as_str(),
            item.id.as_deref().unwrap_or("<unknown>"),
            item.reason
        );
    }
    for reference in &dangling {
        println!(
            "dangling: {} {} -> {}",
            reference.owner, reference.locator, reference.identifier
        );
    }
    print_diagnostics(runtime, &session)?;
    Ok(0)
}

fn run_journal(runtime: &RuntimeOptions, args: JournalArgs) -> Result<u8> {
    let session = open_session(runtime)?;
    let journal = Journal::open(&args.journal)?;
    let header = journal.header();
    let events = journal.events()?;

    if args.json {
        let value = serde_json::json!({ "header": header, "events": events });
        println!(
            "{}",
            serde_json::to_string_pretty(&value).context("failed to encode journal")?
        );
        return Ok(0);
    }

    let fold = journal.fold()?;
    println!("journal: {}", normalize_for_display(journal.path()));
    println!("format_version: {}", header.format_version);
    println!("run_id: {}", header.run_id);
    println!("operation: {}", header.operation.as_str());
    println!("mode: {}", header.mode.as_str());
    println!("started_at: {}", header.started_at.to_rfc3339());
    println!("stash_dir: {}", normalize_for_display(&header.stash_dir));
    if let Some(source) = &header.source_journal {
        println!("source_journal: {}", normalize_for_display(source));
    }
    println!(
        "state: {}",
        journal.last_state()?.unwrap_or_else(|| "<none>".to_string())
    );
    for status in [
        ChangeStatus::Planned,
        ChangeStatus::Applied,
        ChangeStatus::Failed,
        ChangeStatus::Skipped,
    ] {
        println!("records.{}: {}", status.as_str(), fold.count(status));
    }
    for event in &events {
        println!(
            "event: {} {}{}",
            event.recorded_at.to_rfc3339(),
            event.state,
            event
                .detail
                .as_deref()
                .map(|detail| format!(" ({detail})"))
                .unwrap_or_default()
        );
    }
    for folded in &fold.records {
        println!(
            "record: {} {}{}",
            folded.record.status.as_str(),
            folded.record,
            folded
                .record
                .detail
                .as_deref()
                .map(|detail| format!(" [{detail}]"))
                .unwrap_or_default()
        );
    }
    print_diagnostics(runtime, &session)?;
    Ok(0)
}

fn report_outcome(outcome: PipelineOutcome) -> u8 {
    match outcome {
        PipelineOutcome::Finished(summary) => {
            print_summary(&summary);
            summary.exit_code()
        }
        PipelineOutcome::NothingToDo { skipped, warnings } => {
            println!("nothing to do");
            println!("skipped: {skipped}");
            println!("warnings: {warnings}");
            0
        }
        PipelineOutcome::Cancelled => {
            println!("cancelled: no changes made");
            0
        }
    }
}

fn open_session(runtime: &RuntimeOptions) -> Result<Session> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        config: runtime.config.clone(),
        state_dir: runtime.state_dir.clone(),
    };
    let location = locate_config(&context, &overrides);
    if let Some(dir) = location.path.parent() {
        load_env_file(&dir.join(".env"));
    }
    let config = load_config(&location.path)?;
    let paths = resolve_paths(&overrides, location, &config);
    Ok(Session { paths, config })
}

fn load_env_file(path: &Path) {
    if path.exists() {
        match dotenvy::from_path(path) {
            Ok(()) => debug!(path = %path.display(), "loaded environment file"),
            Err(error) => debug!(path = %path.display(), %error, "failed to load environment file"),
        }
    }
}

fn site_resolver(config: &MediaToolConfig) -> Result<Resolver> {
    let (site_url, _) = config.require_remote()?;
    Resolver::new(&site_url)
}

fn print_diagnostics(runtime: &RuntimeOptions, session: &Session) -> Result<()> {
    if !runtime.diagnostics {
        return Ok(());
    }
    let status = inspect_runtime(&session.paths, &session.config)?;
    println!("\n[diagnostics]\n{}", session.paths.diagnostics());
    println!("config_exists: {}", format_flag(status.config_exists));
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("journal_count: {}", status.journal_count);
    println!("lock_held: {}", format_flag(status.lock_held));
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    Ok(())
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
