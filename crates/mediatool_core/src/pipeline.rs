//! One maintenance run end to end: index, plan, journal, confirm, back up,
//! execute.
//!
//! Planning and confirmation come before the backup, and the backup completes
//! before the first mutation.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::alt_text::{AltTextOptions, plan_alt_text};
use crate::api::ContentApi;
use crate::backup::BackupOrchestrator;
use crate::confirm::Confirm;
use crate::convert::{ConvertOptions, ImageCodec, plan_conversion};
use crate::executor::{Executor, RetryPolicy, RunSummary, RunTracker, record_dry_run};
use crate::filesystem::{AssetListing, MediaLibrary};
use crate::identifier::Resolver;
use crate::index::{ContentIndex, build_index};
use crate::journal::{Journal, RunMode};
use crate::plan::{Operation, Plan};
use crate::reachability::{ReachabilityReport, plan_cleanup};
use crate::relocate::plan_relocation;
use crate::report::{append_summary, write_restore_log, write_run_log};

/// Collaborators for a run, built once in `main`.
pub struct Services<'a> {
    pub api: &'a mut dyn ContentApi,
    pub codec: &'a dyn ImageCodec,
    pub library: &'a MediaLibrary,
    pub resolver: &'a Resolver,
    pub confirm: &'a mut dyn Confirm,
    pub backup: Option<&'a BackupOrchestrator>,
    pub journal_dir: PathBuf,
    pub retry: RetryPolicy,
    pub page_size: u32,
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub operation: Operation,
    pub dry_run: bool,
    pub skip_backup: bool,
    pub force: bool,
    pub quality: u8,
}

#[derive(Debug)]
pub enum PipelineOutcome {
    Finished(RunSummary),
    /// Execute requested but the plan has no records.
    NothingToDo { skipped: usize, warnings: usize },
    Cancelled,
}

pub fn run_operation(services: &mut Services<'_>, request: &RunRequest) -> Result<PipelineOutcome> {
    let index = build_index(&mut *services.api, services.resolver, services.page_size)
        .context("failed to index site content")?;
    info!(
        items = index.items.len(),
        references = index.references.len(),
        requests = index.request_count,
        "content indexed"
    );
    let listing = services.library.list_assets(services.resolver)?;
    info!(files = listing.files.len(), bytes = listing.total_bytes(), "media listed");

    let (plan, reachability) = build_plan(services, request, &index, &listing);
    info!(
        operation = request.operation.as_str(),
        records = plan.records.len(),
        skipped = plan.skipped.len(),
        warnings = plan.warnings.len(),
        "plan built"
    );

    if request.dry_run {
        let journal = Journal::create(&services.journal_dir, request.operation, RunMode::DryRun, None)?;
        let mut tracker = RunTracker::begin(&journal)?;
        write_run_log(&journal, &plan, &index, services.resolver, reachability.as_ref())?;
        let summary = record_dry_run(&plan, &mut tracker)?;
        append_summary(&summary)?;
        return Ok(PipelineOutcome::Finished(summary));
    }

    if plan.is_empty() {
        return Ok(PipelineOutcome::NothingToDo {
            skipped: plan.skipped.len(),
            warnings: plan.warnings.len(),
        });
    }
    let prompt = format!(
        "Apply {} {} changes?",
        plan.records.len(),
        request.operation.as_str()
    );
    if !services.confirm.confirm(&prompt)? {
        return Ok(PipelineOutcome::Cancelled);
    }
    if request.skip_backup
        && !services
            .confirm
            .confirm("No backup will be taken. Continue anyway?")?
    {
        return Ok(PipelineOutcome::Cancelled);
    }

    let journal = Journal::create(&services.journal_dir, request.operation, RunMode::Execute, None)?;
    let mut tracker = RunTracker::begin(&journal)?;
    write_run_log(&journal, &plan, &index, services.resolver, reachability.as_ref())?;

    if !request.skip_backup {
        let Some(backup) = services.backup else {
            tracker.abort("no backup configured")?;
            bail!("no backup configured; configure [database] or [paths].ghost_root, or pass --skip-backup");
        };
        match backup.run(false) {
            Ok(report) => {
                for artifact in &report.artifacts {
                    info!(step = artifact.step, path = %artifact.path.display(), "backup artifact");
                }
            }
            Err(error) => {
                tracker.abort(&format!("{error:#}"))?;
                return Err(error.context(format!(
                    "run aborted before any change; see {}",
                    journal.path().display()
                )));
            }
        }
    }

    let mut executor = Executor::new(
        &mut *services.api,
        services.codec,
        services.resolver,
        services.library,
        services.retry,
    )
    .with_quality(request.quality)
    .with_force(request.force);
    let summary = executor.execute(&plan, &mut tracker)?;
    append_summary(&summary)?;
    Ok(PipelineOutcome::Finished(summary))
}

/// Reverts the applied records of an execute journal. `expected` rejects a
/// journal written by a different operation.
pub fn restore_journal(
    services: &mut Services<'_>,
    source_path: &Path,
    expected: Option<Operation>,
) -> Result<PipelineOutcome> {
    let source = Journal::open(source_path)?;
    let header = source.header();
    if let Some(operation) = expected
        && operation != header.operation
    {
        bail!(
            "{} was written by {}, not {}",
            source_path.display(),
            header.operation.as_str(),
            operation.as_str()
        );
    }
    match header.mode {
        RunMode::DryRun => bail!(
            "{} is a dry-run journal; nothing was changed",
            source_path.display()
        ),
        RunMode::Restore => bail!(
            "{} is a restore journal and cannot be restored",
            source_path.display()
        ),
        RunMode::Execute => {}
    }

    let applied = source.fold()?.applied_in_reverse().len();
    let prompt = format!(
        "Revert {applied} applied {} changes from {}?",
        header.operation.as_str(),
        source_path.display()
    );
    if !services.confirm.confirm(&prompt)? {
        return Ok(PipelineOutcome::Cancelled);
    }

    let journal = Journal::create(
        &services.journal_dir,
        header.operation,
        RunMode::Restore,
        Some(source.path()),
    )?;
    let mut tracker = RunTracker::begin(&journal)?;
    write_restore_log(&journal, &source)?;
    let mut executor = Executor::new(
        &mut *services.api,
        services.codec,
        services.resolver,
        services.library,
        services.retry,
    );
    let summary = executor.restore(&source, &mut tracker)?;
    append_summary(&summary)?;
    Ok(PipelineOutcome::Finished(summary))
}

fn build_plan(
    services: &Services<'_>,
    request: &RunRequest,
    index: &ContentIndex,
    listing: &AssetListing,
) -> (Plan, Option<ReachabilityReport>) {
    match request.operation {
        Operation::Convert => (
            plan_conversion(
                index,
                listing,
                services.library,
                services.codec.target_extension(),
                ConvertOptions {
                    force: request.force,
                },
            ),
            None,
        ),
        Operation::Relocate => (plan_relocation(index, listing, services.library), None),
        Operation::Cleanup => {
            let (plan, report) = plan_cleanup(index, listing, services.library);
            (plan, Some(report))
        }
        Operation::AltText => (
            plan_alt_text(
                index,
                AltTextOptions {
                    force: request.force,
                },
            ),
            None,
        ),
    }
}
