use std::fs;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use tracing::{info, warn};

use crate::api::{ApiError, ContentApi, backoff_delay};
use crate::config::MediaToolConfig;
use crate::content::{ContentReference, Owner};
use crate::convert::ImageCodec;
use crate::filesystem::{MediaLibrary, move_file, write_new_file};
use crate::identifier::{Identifier, Resolver};
use crate::journal::{Journal, RunMode};
use crate::plan::{ChangeKind, ChangeRecord, ChangeStatus, Operation, Plan};

/// Stash subdirectory for files a forced write displaced.
const OVERWRITTEN_DIRNAME: &str = "overwritten";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Dry,
    Planned,
    Executing,
    Committed,
    Failed,
    Restoring,
    Restored,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dry => "dry",
            Self::Planned => "planned",
            Self::Executing => "executing",
            Self::Committed => "committed",
            Self::Failed => "failed",
            Self::Restoring => "restoring",
            Self::Restored => "restored",
        }
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (
                Self::Planned,
                Self::Dry | Self::Executing | Self::Failed | Self::Restoring
            ) | (Self::Executing, Self::Committed | Self::Failed)
                | (Self::Restoring, Self::Restored | Self::Failed)
        )
    }
}

/// Run state backed by the journal's event table; every transition is
/// written before it takes effect.
pub struct RunTracker<'j> {
    journal: &'j Journal,
    state: RunState,
}

impl<'j> RunTracker<'j> {
    pub fn begin(journal: &'j Journal) -> Result<Self> {
        journal.record_event(RunState::Planned.as_str(), None)?;
        Ok(Self {
            journal,
            state: RunState::Planned,
        })
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn journal(&self) -> &'j Journal {
        self.journal
    }

    pub fn advance(&mut self, next: RunState, detail: Option<&str>) -> Result<()> {
        if !self.state.can_transition_to(next) {
            bail!(
                "illegal run state transition {} -> {}",
                self.state.as_str(),
                next.as_str()
            );
        }
        self.journal.record_event(next.as_str(), detail)?;
        info!(from = self.state.as_str(), to = next.as_str(), "run state changed");
        self.state = next;
        Ok(())
    }

    /// Backup failure or refusal before any mutation: a single aborted event.
    pub fn abort(&mut self, reason: &str) -> Result<()> {
        self.advance(RunState::Failed, Some(&format!("run aborted: {reason}")))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &MediaToolConfig) -> Self {
        Self {
            max_retries: config.max_retries(),
            base_delay: config.retry_delay(),
        }
    }

    /// Retries while the failure is a retryable [`ApiError`].
    pub fn run<T>(&self, label: &str, mut operation: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let retryable = error
                        .downcast_ref::<ApiError>()
                        .map(ApiError::is_retryable)
                        .unwrap_or(false);
                    if !retryable || attempt >= self.max_retries {
                        return Err(error);
                    }
                    warn!(label, attempt, error = %error, "retrying content API update");
                    if !self.base_delay.is_zero() {
                        sleep(backoff_delay(self.base_delay, attempt));
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub operation: Operation,
    pub mode: RunMode,
    pub state: RunState,
    pub planned: usize,
    pub applied: usize,
    pub failed: usize,
    pub skipped: usize,
    pub unconfirmed: usize,
    pub journal_path: PathBuf,
    pub log_path: PathBuf,
}

impl RunSummary {
    fn new(journal: &Journal, state: RunState) -> Self {
        let header = journal.header();
        Self {
            operation: header.operation,
            mode: header.mode,
            state,
            planned: 0,
            applied: 0,
            failed: 0,
            skipped: 0,
            unconfirmed: 0,
            journal_path: journal.path().to_path_buf(),
            log_path: journal.log_path(),
        }
    }

    /// 0 on full success, 2 when a record failed or a restore left records
    /// unreverted.
    pub fn exit_code(&self) -> u8 {
        if self.failed > 0 || self.state == RunState::Failed {
            return 2;
        }
        if self.mode == RunMode::Restore && self.unconfirmed > 0 {
            return 2;
        }
        0
    }
}

/// Persists the plan under a dry-run journal without mutating anything.
pub fn record_dry_run(plan: &Plan, tracker: &mut RunTracker<'_>) -> Result<RunSummary> {
    let journal = tracker.journal();
    if journal.header().mode != RunMode::DryRun {
        bail!("{} is not a dry-run journal", journal.path().display());
    }
    for record in &plan.records {
        journal.append(record)?;
    }
    tracker.advance(RunState::Dry, Some(&format!("{} records planned", plan.records.len())))?;
    let mut summary = RunSummary::new(journal, RunState::Dry);
    summary.planned = plan.records.len();
    summary.skipped = plan.skipped.len();
    Ok(summary)
}

enum Outcome {
    Applied(String),
    Skipped(String),
}

pub struct Executor<'a> {
    api: &'a mut dyn ContentApi,
    codec: &'a dyn ImageCodec,
    resolver: &'a Resolver,
    library: &'a MediaLibrary,
    retry: RetryPolicy,
    quality: u8,
    force: bool,
}

impl<'a> Executor<'a> {
    pub fn new(
        api: &'a mut dyn ContentApi,
        codec: &'a dyn ImageCodec,
        resolver: &'a Resolver,
        library: &'a MediaLibrary,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            api,
            codec,
            resolver,
            library,
            retry,
            quality: crate::config::DEFAULT_WEBP_QUALITY,
            force: false,
        }
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality.min(100);
        self
    }

    /// Allow writes over existing files; displaced files go to the stash.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Applies every record in order. Each record is journaled `planned`
    /// before its first mutation and `applied` or `failed` after; a failed
    /// record does not stop the run.
    pub fn execute(&mut self, plan: &Plan, tracker: &mut RunTracker<'_>) -> Result<RunSummary> {
        let journal = tracker.journal();
        if journal.header().mode != RunMode::Execute {
            bail!("{} is not an execute journal", journal.path().display());
        }
        tracker.advance(RunState::Executing, None)?;
        let stash = journal.stash_dir().to_path_buf();
        let mut summary = RunSummary::new(journal, RunState::Executing);
        summary.skipped = plan.skipped.len();

        for record in &plan.records {
            journal.append(&record.transition(ChangeStatus::Planned, None))?;
            summary.planned += 1;
            let outcome = self.apply(record, &stash);
            finish_record(journal, record, outcome, &mut summary)?;
        }

        let detail = format!("{} applied, {} failed", summary.applied, summary.failed);
        tracker.advance(RunState::Committed, Some(&detail))?;
        summary.state = RunState::Committed;
        Ok(summary)
    }

    /// Inverts the applied records of `source`, most recent first, journaling
    /// into the restore journal behind `tracker`.
    pub fn restore(&mut self, source: &Journal, tracker: &mut RunTracker<'_>) -> Result<RunSummary> {
        let journal = tracker.journal();
        match source.header().mode {
            RunMode::DryRun => bail!(
                "{} is a dry-run journal; nothing was changed",
                source.path().display()
            ),
            RunMode::Restore => bail!(
                "{} is a restore journal and cannot be restored",
                source.path().display()
            ),
            RunMode::Execute => {}
        }
        let fold = source.fold()?;
        let unconfirmed = fold.unconfirmed();
        for record in &unconfirmed {
            warn!(record = %record, "record was interrupted before completion; not reverting");
        }
        let applied = fold.applied_in_reverse();
        tracker.advance(
            RunState::Restoring,
            Some(&format!(
                "restoring {} records from {}",
                applied.len(),
                source.path().display()
            )),
        )?;

        let source_stash = source.stash_dir().to_path_buf();
        let restore_stash = journal.stash_dir().to_path_buf();
        let mut summary = RunSummary::new(journal, RunState::Restoring);
        summary.unconfirmed = unconfirmed.len();

        for (index, original) in applied.into_iter().enumerate() {
            let mut inverse = ChangeRecord::new(
                original.kind,
                original.subject.clone(),
                original.new_value.clone(),
                original.old_value.clone(),
            )
            .with_references(original.references.clone());
            inverse.record_id = index as u64 + 1;
            let inverse = inverse.transition(
                ChangeStatus::Planned,
                Some(format!("reverts record #{}", original.record_id)),
            );
            journal.append(&inverse)?;
            summary.planned += 1;
            let outcome = self.revert(original, &source_stash, &restore_stash);
            finish_record(journal, &inverse, outcome, &mut summary)?;
        }

        let detail = format!("{} reverted, {} failed", summary.applied, summary.failed);
        tracker.advance(RunState::Restored, Some(&detail))?;
        summary.state = RunState::Restored;
        Ok(summary)
    }

    fn apply(&mut self, record: &ChangeRecord, stash: &Path) -> Result<Outcome> {
        match record.kind {
            ChangeKind::CodecConversion => self.convert(record, stash),
            ChangeKind::Relocation => self.relocate(
                &record.old_identifier(),
                &record.new_identifier(),
                &record.references,
                stash,
            ),
            ChangeKind::AltText => self.set_alt(record, &record.new_value),
            ChangeKind::Deletion => {
                let identifier = record.old_identifier();
                let source = self.scoped_path(&identifier, stash)?;
                let stashed = stash_path(stash, &identifier);
                move_file(&source, &stashed, false)
                    .with_context(|| format!("failed to move {identifier} into the stash"))?;
                Ok(Outcome::Applied("moved to stash".to_string()))
            }
        }
    }

    fn revert(
        &mut self,
        original: &ChangeRecord,
        source_stash: &Path,
        restore_stash: &Path,
    ) -> Result<Outcome> {
        let old = original.old_identifier();
        match original.kind {
            ChangeKind::CodecConversion => {
                self.revert_conversion(original, source_stash, restore_stash)
            }
            ChangeKind::Relocation => {
                let new = original.new_identifier();
                let outcome = self.relocate(&new, &old, &original.references, restore_stash)?;
                self.recover_overwritten(&new, source_stash)?;
                Ok(outcome)
            }
            ChangeKind::AltText => self.set_alt(original, &original.old_value),
            ChangeKind::Deletion => {
                let target = self.scoped_path(&old, source_stash)?;
                let stashed = stash_path(source_stash, &old);
                if !stashed.is_file() {
                    bail!("{old} is missing from {}", source_stash.display());
                }
                move_file(&stashed, &target, false)
                    .with_context(|| format!("failed to move {old} back from the stash"))?;
                Ok(Outcome::Applied("moved back from stash".to_string()))
            }
        }
    }

    fn convert(&mut self, record: &ChangeRecord, stash: &Path) -> Result<Outcome> {
        let source_id = record.old_identifier();
        let target_id = record.new_identifier();
        let source = self.scoped_path(&source_id, stash)?;
        let target = self.scoped_path(&target_id, stash)?;

        let bytes = fs::read(&source).with_context(|| format!("failed to read {}", source.display()))?;
        let encoded = self
            .codec
            .encode(&bytes, self.quality)
            .with_context(|| format!("failed to encode {source_id}"))?;

        let displaced = self.displace_existing(&target, &target_id, stash)?;
        if let Err(error) = write_new_file(&target, &encoded, false) {
            undisplace(displaced, &target);
            return Err(error);
        }
        let updated = match self.rewrite_owners(&record.references, &source_id, &target_id) {
            Ok(updated) => updated,
            Err(error) => {
                remove_written(&target);
                undisplace(displaced, &target);
                return Err(error);
            }
        };
        if let Err(error) = move_file(&source, &stash_path(stash, &source_id), false) {
            self.revert_owners(&distinct_owners(&record.references), &source_id, &target_id);
            remove_written(&target);
            undisplace(displaced, &target);
            return Err(error.context(format!("failed to move {source_id} into the stash")));
        }
        Ok(Outcome::Applied(format!(
            "{updated} references updated; {} -> {} bytes",
            bytes.len(),
            encoded.len()
        )))
    }

    fn revert_conversion(
        &mut self,
        original: &ChangeRecord,
        source_stash: &Path,
        restore_stash: &Path,
    ) -> Result<Outcome> {
        let source_id = original.old_identifier();
        let target_id = original.new_identifier();
        let source = self.scoped_path(&source_id, source_stash)?;
        let target = self.scoped_path(&target_id, source_stash)?;
        let stashed_source = stash_path(source_stash, &source_id);
        if !stashed_source.is_file() {
            bail!("{source_id} is missing from {}", source_stash.display());
        }
        if source.exists() {
            bail!("refusing to overwrite existing file {}", source.display());
        }

        let set_aside = stash_path(restore_stash, &target_id);
        let target_moved = target.is_file();
        if target_moved {
            move_file(&target, &set_aside, false)
                .with_context(|| format!("failed to set {target_id} aside"))?;
        } else {
            warn!(target = %target_id, "converted file is already gone");
        }
        if let Err(error) = move_file(&stashed_source, &source, false) {
            if target_moved {
                move_back(&set_aside, &target);
            }
            return Err(error.context(format!("failed to move {source_id} back from the stash")));
        }
        let updated = match self.rewrite_owners(&original.references, &target_id, &source_id) {
            Ok(updated) => updated,
            Err(error) => {
                move_back(&source, &stashed_source);
                if target_moved {
                    move_back(&set_aside, &target);
                }
                return Err(error);
            }
        };
        self.recover_overwritten(&target_id, source_stash)?;
        Ok(Outcome::Applied(format!("{updated} references restored")))
    }

    fn relocate(
        &mut self,
        from: &Identifier,
        to: &Identifier,
        references: &[ContentReference],
        stash: &Path,
    ) -> Result<Outcome> {
        let source = self.scoped_path(from, stash)?;
        let target = self.scoped_path(to, stash)?;
        if !source.is_file() {
            bail!("{from} no longer exists at {}", source.display());
        }
        let displaced = self.displace_existing(&target, to, stash)?;
        if let Err(error) = move_file(&source, &target, false) {
            undisplace(displaced, &target);
            return Err(error);
        }
        match self.rewrite_owners(references, from, to) {
            Ok(updated) => Ok(Outcome::Applied(format!("{updated} references updated"))),
            Err(error) => {
                if let Err(move_error) = move_file(&target, &source, false) {
                    warn!(
                        file = %target.display(),
                        error = %format!("{move_error:#}"),
                        "failed to move file back after a failed rewrite"
                    );
                }
                undisplace(displaced, &target);
                Err(error)
            }
        }
    }

    fn set_alt(&mut self, record: &ChangeRecord, value: &str) -> Result<Outcome> {
        let reference = record
            .references
            .first()
            .ok_or_else(|| anyhow!("record #{} has no reference", record.record_id))?;
        let Owner::Item { kind, id, .. } = &reference.owner else {
            bail!("alt text can only be set on posts and pages");
        };
        let retry = self.retry;
        let api = &mut *self.api;
        let resolver = self.resolver;
        retry.run(&format!("set alt on {}", reference.owner), || {
            let mut item = api.fetch_item(*kind, id)?;
            let current = item
                .references(resolver)?
                .into_iter()
                .find(|candidate| candidate.locator == reference.locator)
                .and_then(|candidate| candidate.alt);
            if current.as_deref().map(str::trim) == Some(value) {
                return Ok(Outcome::Skipped("alt text already has this value".to_string()));
            }
            item.set_alt(resolver, &reference.locator, &record.subject, value)?;
            api.patch_item(&item)?;
            Ok(Outcome::Applied(format!("alt text set on {}", reference.owner)))
        })
    }

    /// Rewrites every owner of `references` from `from` to `to`. When one
    /// owner fails, owners already patched are put back before returning.
    fn rewrite_owners(
        &mut self,
        references: &[ContentReference],
        from: &Identifier,
        to: &Identifier,
    ) -> Result<usize> {
        let owners = distinct_owners(references);
        let mut total = 0;
        for (index, owner) in owners.iter().enumerate() {
            match self.rewrite_owner(owner, from, to) {
                Ok(0) => warn!(owner = %owner, asset = %from, "owner no longer references the asset"),
                Ok(count) => total += count,
                Err(error) => {
                    self.revert_owners(&owners[..index], from, to);
                    return Err(error.context(format!("failed to update {owner}")));
                }
            }
        }
        Ok(total)
    }

    fn revert_owners(&mut self, owners: &[Owner], from: &Identifier, to: &Identifier) {
        for owner in owners.iter().rev() {
            if let Err(error) = self.rewrite_owner(owner, to, from) {
                warn!(owner = %owner, error = %format!("{error:#}"), "failed to revert owner");
            }
        }
    }

    fn rewrite_owner(&mut self, owner: &Owner, from: &Identifier, to: &Identifier) -> Result<usize> {
        let retry = self.retry;
        let api = &mut *self.api;
        let resolver = self.resolver;
        match owner {
            Owner::Item { kind, id, .. } => retry.run(&format!("update {owner}"), || {
                let mut item = api.fetch_item(*kind, id)?;
                let count = item.rewrite_asset(resolver, from, to)?;
                if count > 0 {
                    api.patch_item(&item)?;
                }
                Ok(count)
            }),
            Owner::Settings => retry.run("update site settings", || {
                let mut settings = api.fetch_settings()?;
                let changed = settings.rewrite_asset(resolver, from, to);
                if !changed.is_empty() {
                    api.patch_settings(&changed)?;
                }
                Ok(changed.len())
            }),
        }
    }

    fn scoped_path(&self, identifier: &Identifier, stash: &Path) -> Result<PathBuf> {
        let path = self
            .library
            .path_for(identifier)
            .ok_or_else(|| anyhow!("{identifier} is outside the configured media directories"))?;
        self.library.validate_scoped_path(&path, &[stash])?;
        Ok(path)
    }

    /// Moves an existing file at `target` into the stash when forced.
    fn displace_existing(
        &self,
        target: &Path,
        identifier: &Identifier,
        stash: &Path,
    ) -> Result<Option<PathBuf>> {
        if !target.exists() {
            return Ok(None);
        }
        if !self.force {
            bail!("refusing to overwrite existing file {}", target.display());
        }
        let displaced = stash.join(OVERWRITTEN_DIRNAME).join(relative(identifier));
        move_file(target, &displaced, false)
            .with_context(|| format!("failed to move {identifier} aside"))?;
        Ok(Some(displaced))
    }

    fn recover_overwritten(&self, identifier: &Identifier, source_stash: &Path) -> Result<()> {
        let displaced = source_stash.join(OVERWRITTEN_DIRNAME).join(relative(identifier));
        if !displaced.is_file() {
            return Ok(());
        }
        let target = self.scoped_path(identifier, source_stash)?;
        move_file(&displaced, &target, false)
            .with_context(|| format!("failed to put the overwritten {identifier} back"))
    }
}

fn finish_record(
    journal: &Journal,
    record: &ChangeRecord,
    outcome: Result<Outcome>,
    summary: &mut RunSummary,
) -> Result<()> {
    match outcome {
        Ok(Outcome::Applied(detail)) => {
            info!(record = %record, "{detail}");
            journal.append(&record.transition(ChangeStatus::Applied, Some(detail)))?;
            summary.applied += 1;
        }
        Ok(Outcome::Skipped(reason)) => {
            info!(record = %record, "skipped: {reason}");
            journal.append(&record.transition(ChangeStatus::Skipped, Some(reason)))?;
            summary.skipped += 1;
        }
        Err(error) => {
            let detail = format!("{error:#}");
            warn!(record = %record, error = %detail, "record failed");
            journal.append(&record.transition(ChangeStatus::Failed, Some(detail)))?;
            summary.failed += 1;
        }
    }
    Ok(())
}

fn distinct_owners(references: &[ContentReference]) -> Vec<Owner> {
    let mut owners: Vec<Owner> = Vec::new();
    for reference in references {
        if reference.is_rewritable() && !owners.contains(&reference.owner) {
            owners.push(reference.owner.clone());
        }
    }
    owners
}

fn relative(identifier: &Identifier) -> &str {
    identifier.as_str().trim_start_matches('/')
}

fn stash_path(stash: &Path, identifier: &Identifier) -> PathBuf {
    stash.join(relative(identifier))
}

fn remove_written(path: &Path) {
    if let Err(error) = fs::remove_file(path) {
        warn!(file = %path.display(), %error, "failed to remove written file");
    }
}

/// Compensating move; a failure is logged and leaves both paths as they are.
fn move_back(from: &Path, to: &Path) -> bool {
    match move_file(from, to, false) {
        Ok(()) => true,
        Err(error) => {
            warn!(
                from = %from.display(),
                to = %to.display(),
                error = %format!("{error:#}"),
                "failed to move file back"
            );
            false
        }
    }
}

fn undisplace(displaced: Option<PathBuf>, target: &Path) {
    if let Some(displaced) = displaced
        && let Err(error) = move_file(&displaced, target, true)
    {
        warn!(
            file = %target.display(),
            error = %format!("{error:#}"),
            "failed to put displaced file back"
        );
    }
}
