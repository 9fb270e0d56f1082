use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use similar::TextDiff;
use tracing::warn;

use crate::content::{ContentItem, ContentReference, ItemKind, Owner, SiteSettings};
use crate::executor::RunSummary;
use crate::filesystem::display_path;
use crate::identifier::Resolver;
use crate::index::ContentIndex;
use crate::journal::{Journal, RunMode};
use crate::plan::{ChangeKind, ChangeRecord, Plan};
use crate::reachability::ReachabilityReport;

const DIFF_CONTEXT_LINES: usize = 2;

/// Writes the human-readable companion log next to the journal.
pub fn write_run_log(
    journal: &Journal,
    plan: &Plan,
    index: &ContentIndex,
    resolver: &Resolver,
    reachability: Option<&ReachabilityReport>,
) -> Result<PathBuf> {
    let header = journal.header();
    let mut out = String::new();
    let _ = writeln!(out, "operation: {}", header.operation.as_str());
    let _ = writeln!(out, "mode: {}", header.mode.as_str());
    let _ = writeln!(out, "run_id: {}", header.run_id);
    let _ = writeln!(out, "started_at: {}", header.started_at.to_rfc3339());
    let _ = writeln!(out, "journal: {}", journal.path().display());
    let _ = writeln!(out, "stash: {}", journal.stash_dir().display());
    let _ = writeln!(out, "records: {}", plan.records.len());
    let _ = writeln!(out, "skipped: {}", plan.skipped.len());
    let _ = writeln!(out, "warnings: {}", plan.warnings.len());
    if !index.skipped.is_empty() {
        let _ = writeln!(out, "items_not_decoded: {}", index.skipped.len());
    }

    if !plan.warnings.is_empty() {
        let _ = writeln!(out, "\n## warnings");
        for message in &plan.warnings {
            let _ = writeln!(out, "- {message}");
        }
    }
    if !index.skipped.is_empty() {
        let _ = writeln!(out, "\n## items not decoded");
        for item in &index.skipped {
            let _ = writeln!(
                out,
                "- {} {}: {}",
                item.kind.as_str(),
                item.id.as_deref().unwrap_or("<unknown>"),
                item.reason
            );
        }
    }
    if !plan.records.is_empty() {
        let _ = writeln!(out, "\n## changes");
        for record in &plan.records {
            let _ = writeln!(out, "{record}");
            for reference in &record.references {
                let _ = writeln!(out, "    {} {}", reference.owner, reference.locator);
            }
        }
    }
    if !plan.skipped.is_empty() {
        let _ = writeln!(out, "\n## skipped");
        for skip in &plan.skipped {
            let _ = writeln!(out, "- {}: {}", skip.subject, skip.reason);
        }
    }
    if !plan.unowned.is_empty() {
        let _ = writeln!(out, "\n## unowned");
        for identifier in &plan.unowned {
            let _ = writeln!(out, "- {identifier}");
        }
    }
    if let Some(report) = reachability {
        let _ = writeln!(out, "\n## reachability");
        let _ = writeln!(out, "reachable_files: {}", report.reachable_files);
        let _ = writeln!(out, "unreachable_files: {}", report.unreachable.len());
        let _ = writeln!(out, "unreachable_bytes: {}", report.unreachable_bytes);
        for path in &report.unmapped {
            let _ = writeln!(out, "unmapped: {}", path.display());
        }
    }
    if header.mode == RunMode::DryRun {
        let diffs = render_content_diffs(plan, index, resolver);
        if !diffs.is_empty() {
            let _ = writeln!(out, "\n## content changes");
            out.push_str(&diffs);
        }
    }

    let path = journal.log_path();
    fs::write(&path, out).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

/// Log header for a restore run, listing interrupted records of the source
/// that will not be reverted.
pub fn write_restore_log(journal: &Journal, source: &Journal) -> Result<PathBuf> {
    let header = journal.header();
    let fold = source.fold()?;
    let mut out = String::new();
    let _ = writeln!(out, "operation: {}", header.operation.as_str());
    let _ = writeln!(out, "mode: {}", header.mode.as_str());
    let _ = writeln!(out, "run_id: {}", header.run_id);
    let _ = writeln!(out, "started_at: {}", header.started_at.to_rfc3339());
    let _ = writeln!(out, "journal: {}", journal.path().display());
    let _ = writeln!(out, "source_journal: {}", source.path().display());
    let _ = writeln!(out, "source_run_id: {}", source.header().run_id);
    let _ = writeln!(out, "to_revert: {}", fold.applied_in_reverse().len());

    let unconfirmed = fold.unconfirmed();
    if !unconfirmed.is_empty() {
        let _ = writeln!(out, "\n## unconfirmed (not reverted)");
        for record in unconfirmed {
            let _ = writeln!(out, "{record}");
        }
    }

    let path = journal.log_path();
    fs::write(&path, out).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

/// Appends the final counts of a run to its log.
pub fn append_summary(summary: &RunSummary) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&summary.log_path)
        .with_context(|| format!("failed to open {}", summary.log_path.display()))?;
    let mut out = String::from("\n## result\n");
    let _ = writeln!(out, "state: {}", summary.state.as_str());
    let _ = writeln!(out, "planned: {}", summary.planned);
    let _ = writeln!(out, "applied: {}", summary.applied);
    let _ = writeln!(out, "failed: {}", summary.failed);
    let _ = writeln!(out, "skipped: {}", summary.skipped);
    if summary.unconfirmed > 0 {
        let _ = writeln!(out, "unconfirmed: {}", summary.unconfirmed);
    }
    file.write_all(out.as_bytes())
        .with_context(|| format!("failed to write {}", summary.log_path.display()))
}

pub fn print_summary(summary: &RunSummary) {
    println!("operation: {}", summary.operation.as_str());
    println!("mode: {}", summary.mode.as_str());
    println!("state: {}", summary.state.as_str());
    println!("planned: {}", summary.planned);
    println!("applied: {}", summary.applied);
    println!("failed: {}", summary.failed);
    println!("skipped: {}", summary.skipped);
    if summary.unconfirmed > 0 {
        println!("unconfirmed: {}", summary.unconfirmed);
    }
    println!("journal: {}", display_path(&summary.journal_path));
    println!("log: {}", display_path(&summary.log_path));
}

/// Unified diffs of every item and setting the plan would edit.
pub fn render_content_diffs(plan: &Plan, index: &ContentIndex, resolver: &Resolver) -> String {
    let mut items: BTreeMap<(ItemKind, String), (ContentItem, ContentItem)> = BTreeMap::new();
    let mut settings: Option<(SiteSettings, SiteSettings)> = None;

    for record in &plan.records {
        for reference in &record.references {
            match &reference.owner {
                Owner::Item { kind, id, .. } => {
                    let key = (*kind, id.clone());
                    if !items.contains_key(&key) {
                        let Some(item) = index.item(*kind, id) else {
                            continue;
                        };
                        items.insert(key.clone(), (item.clone(), item.clone()));
                    }
                    if let Some((_, after)) = items.get_mut(&key)
                        && let Err(error) = preview_item(after, record, reference, resolver)
                    {
                        warn!(record = %record, error = %format!("{error:#}"), "cannot preview change");
                    }
                }
                Owner::Settings => {
                    let (_, after) = settings
                        .get_or_insert_with(|| (index.settings.clone(), index.settings.clone()));
                    if matches!(record.kind, ChangeKind::CodecConversion | ChangeKind::Relocation) {
                        after.rewrite_asset(
                            resolver,
                            &record.old_identifier(),
                            &record.new_identifier(),
                        );
                    }
                }
            }
        }
    }

    let mut out = String::new();
    for ((kind, id), (before, after)) in &items {
        let label = format!("{} {} ({id})", kind.as_str(), before.slug);
        push_diff(&mut out, &label, &before.reviewable_text(), &after.reviewable_text());
    }
    if let Some((before, after)) = settings {
        push_diff(&mut out, "settings", &settings_text(&before), &settings_text(&after));
    }
    out
}

fn preview_item(
    item: &mut ContentItem,
    record: &ChangeRecord,
    reference: &ContentReference,
    resolver: &Resolver,
) -> Result<()> {
    match record.kind {
        ChangeKind::CodecConversion | ChangeKind::Relocation => {
            item.rewrite_asset(resolver, &record.old_identifier(), &record.new_identifier())?;
        }
        ChangeKind::AltText => {
            item.set_alt(resolver, &reference.locator, &record.subject, &record.new_value)?;
        }
        ChangeKind::Deletion => {}
    }
    Ok(())
}

fn settings_text(settings: &SiteSettings) -> String {
    let mut out = String::new();
    for key in SiteSettings::ASSET_KEYS {
        if let Some(value) = settings.value(key) {
            let _ = writeln!(out, "{key}: {value}");
        }
    }
    out
}

fn push_diff(out: &mut String, label: &str, before: &str, after: &str) {
    if before == after {
        return;
    }
    let diff = TextDiff::from_lines(before, after)
        .unified_diff()
        .context_radius(DIFF_CONTEXT_LINES)
        .header(&format!("{label} (current)"), &format!("{label} (planned)"))
        .to_string();
    out.push_str(&diff);
    if !out.ends_with('\n') {
        out.push('\n');
    }
}
