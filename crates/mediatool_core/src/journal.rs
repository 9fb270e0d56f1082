use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::identifier::Identifier;
use crate::migrate::{current_version, open_connection, run_migrations};
use crate::plan::{ChangeKind, ChangeRecord, ChangeStatus, Operation};

pub const JOURNAL_PREFIX: &str = "journal_";
const RESTORE_TAG: &str = "restore_";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    DryRun,
    Execute,
    Restore,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DryRun => "dry-run",
            Self::Execute => "execute",
            Self::Restore => "restore",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        Ok(match value {
            "dry-run" => Self::DryRun,
            "execute" => Self::Execute,
            "restore" => Self::Restore,
            other => bail!("unknown run mode: {other}"),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JournalHeader {
    pub format_version: u32,
    pub run_id: String,
    pub operation: Operation,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub stash_dir: PathBuf,
    pub source_journal: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub seq: i64,
    pub record: ChangeRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    pub seq: i64,
    pub state: String,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Latest state of one record after replaying its entries.
#[derive(Debug, Clone)]
pub struct FoldedRecord {
    pub record: ChangeRecord,
    /// Sequence number of the `applied` entry when that is the final status.
    pub applied_seq: Option<i64>,
}

impl FoldedRecord {
    /// A trailing `planned` entry: the mutation may or may not have happened.
    pub fn is_unconfirmed(&self) -> bool {
        self.record.status == ChangeStatus::Planned
    }
}

#[derive(Debug, Clone, Default)]
pub struct JournalFold {
    pub records: Vec<FoldedRecord>,
}

impl JournalFold {
    pub fn count(&self, status: ChangeStatus) -> usize {
        self.records
            .iter()
            .filter(|folded| folded.record.status == status)
            .count()
    }

    /// Applied records, most recently applied first.
    pub fn applied_in_reverse(&self) -> Vec<&ChangeRecord> {
        let mut applied: Vec<(i64, &ChangeRecord)> = self
            .records
            .iter()
            .filter_map(|folded| folded.applied_seq.map(|seq| (seq, &folded.record)))
            .collect();
        applied.sort_by(|left, right| right.0.cmp(&left.0));
        applied.into_iter().map(|(_, record)| record).collect()
    }

    pub fn unconfirmed(&self) -> Vec<&ChangeRecord> {
        self.records
            .iter()
            .filter(|folded| folded.is_unconfirmed())
            .map(|folded| &folded.record)
            .collect()
    }
}

/// Durable, append-only record of one run.
pub struct Journal {
    connection: Connection,
    path: PathBuf,
    header: JournalHeader,
}

impl Journal {
    pub fn create(
        dir: &Path,
        operation: Operation,
        mode: RunMode,
        source_journal: Option<&Path>,
    ) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let started_at = Utc::now();
        let path = unused_journal_path(dir, operation, mode, started_at);
        let stash_dir = path.with_extension("stash");

        let connection = open_connection(&path)?;
        run_migrations(&connection)
            .with_context(|| format!("failed to initialise journal {}", path.display()))?;
        let header = JournalHeader {
            format_version: current_version(&connection)?,
            run_id: compute_hash(&format!(
                "{}:{}:{}",
                operation.as_str(),
                started_at.timestamp_nanos_opt().unwrap_or_default(),
                std::process::id()
            )),
            operation,
            mode,
            started_at,
            stash_dir,
            source_journal: source_journal.map(Path::to_path_buf),
        };
        connection
            .execute(
                "INSERT INTO journal_run
                    (singleton, run_id, operation, mode, started_at, stash_dir, source_journal)
                 VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    header.run_id,
                    operation.as_str(),
                    mode.as_str(),
                    started_at.to_rfc3339(),
                    header.stash_dir.to_string_lossy().into_owned(),
                    header
                        .source_journal
                        .as_ref()
                        .map(|source| source.to_string_lossy().into_owned()),
                ],
            )
            .context("failed to write journal header")?;
        debug!(journal = %path.display(), run_id = %header.run_id, "created journal");
        Ok(Self {
            connection,
            path,
            header,
        })
    }

    /// Opens an existing journal, upgrading older formats in place.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            bail!("journal not found: {}", path.display());
        }
        let connection = open_connection(path)?;
        run_migrations(&connection)
            .with_context(|| format!("failed to upgrade journal {}", path.display()))?;
        let header = connection
            .query_row(
                "SELECT run_id, operation, mode, started_at, stash_dir, source_journal
                 FROM journal_run WHERE singleton = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()
            .context("failed to read journal header")?
            .ok_or_else(|| anyhow::anyhow!("{} has no run header", path.display()))?;
        let (run_id, operation, mode, started_at, stash_dir, source_journal) = header;
        let header = JournalHeader {
            format_version: current_version(&connection)?,
            run_id,
            operation: Operation::parse(&operation)?,
            mode: RunMode::parse(&mode)?,
            started_at: parse_timestamp(&started_at)?,
            stash_dir: PathBuf::from(stash_dir),
            source_journal: source_journal.map(PathBuf::from),
        };
        Ok(Self {
            connection,
            path: path.to_path_buf(),
            header,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Companion human-readable log next to the journal.
    pub fn log_path(&self) -> PathBuf {
        self.path.with_extension("log")
    }

    pub fn stash_dir(&self) -> &Path {
        &self.header.stash_dir
    }

    pub fn header(&self) -> &JournalHeader {
        &self.header
    }

    /// Appends one status transition. Returns its sequence number once the
    /// row is on disk.
    pub fn append(&self, record: &ChangeRecord) -> Result<i64> {
        let references = serde_json::to_string(&record.references)
            .context("failed to encode record references")?;
        self.connection
            .execute(
                "INSERT INTO journal_entries
                    (record_id, kind, status, subject, old_value, new_value,
                     references_json, detail, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    i64::try_from(record.record_id).context("record id does not fit into i64")?,
                    record.kind.as_str(),
                    record.status.as_str(),
                    record.subject.as_str(),
                    record.old_value,
                    record.new_value,
                    references,
                    record.detail,
                    record.recorded_at.to_rfc3339(),
                ],
            )
            .with_context(|| {
                format!(
                    "failed to append record #{} to {}",
                    record.record_id,
                    self.path.display()
                )
            })?;
        Ok(self.connection.last_insert_rowid())
    }

    pub fn record_event(&self, state: &str, detail: Option<&str>) -> Result<()> {
        self.connection
            .execute(
                "INSERT INTO journal_events (state, detail, recorded_at) VALUES (?1, ?2, ?3)",
                params![state, detail, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("failed to record run state {state}"))?;
        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<JournalEntry>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT seq, record_id, kind, status, subject, old_value, new_value,
                        references_json, detail, recorded_at
                 FROM journal_entries ORDER BY seq",
            )
            .context("failed to prepare journal entry query")?;
        let rows = statement
            .query_map([], read_entry_row)
            .context("failed to read journal entries")?;
        let mut entries = Vec::new();
        for row in rows {
            let raw = row.context("failed to decode journal entry row")?;
            entries.push(raw.into_entry()?);
        }
        Ok(entries)
    }

    pub fn events(&self) -> Result<Vec<RunEvent>> {
        let mut statement = self
            .connection
            .prepare("SELECT seq, state, detail, recorded_at FROM journal_events ORDER BY seq")
            .context("failed to prepare run event query")?;
        let rows = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .context("failed to read run events")?;
        let mut events = Vec::new();
        for row in rows {
            let (seq, state, detail, recorded_at) = row.context("failed to decode run event")?;
            events.push(RunEvent {
                seq,
                state,
                detail,
                recorded_at: parse_timestamp(&recorded_at)?,
            });
        }
        Ok(events)
    }

    pub fn last_state(&self) -> Result<Option<String>> {
        Ok(self.events()?.pop().map(|event| event.state))
    }

    /// Replays entries into the final state of every record, in record order.
    pub fn fold(&self) -> Result<JournalFold> {
        let mut folded: BTreeMap<u64, FoldedRecord> = BTreeMap::new();
        for entry in self.entries()? {
            let applied_seq =
                (entry.record.status == ChangeStatus::Applied).then_some(entry.seq);
            folded.insert(
                entry.record.record_id,
                FoldedRecord {
                    record: entry.record,
                    applied_seq,
                },
            );
        }
        Ok(JournalFold {
            records: folded.into_values().collect(),
        })
    }
}

struct RawEntry {
    seq: i64,
    record_id: i64,
    kind: String,
    status: String,
    subject: String,
    old_value: String,
    new_value: String,
    references_json: String,
    detail: Option<String>,
    recorded_at: String,
}

fn read_entry_row(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        seq: row.get(0)?,
        record_id: row.get(1)?,
        kind: row.get(2)?,
        status: row.get(3)?,
        subject: row.get(4)?,
        old_value: row.get(5)?,
        new_value: row.get(6)?,
        references_json: row.get(7)?,
        detail: row.get(8)?,
        recorded_at: row.get(9)?,
    })
}

impl RawEntry {
    fn into_entry(self) -> Result<JournalEntry> {
        let references = serde_json::from_str(&self.references_json)
            .with_context(|| format!("entry {} has malformed references", self.seq))?;
        Ok(JournalEntry {
            seq: self.seq,
            record: ChangeRecord {
                record_id: u64::try_from(self.record_id)
                    .with_context(|| format!("entry {} has a negative record id", self.seq))?,
                kind: ChangeKind::parse(&self.kind)?,
                subject: Identifier::new(self.subject),
                old_value: self.old_value,
                new_value: self.new_value,
                status: ChangeStatus::parse(&self.status)?,
                references,
                recorded_at: parse_timestamp(&self.recorded_at)?,
                detail: self.detail,
            },
        })
    }
}

fn unused_journal_path(
    dir: &Path,
    operation: Operation,
    mode: RunMode,
    started_at: DateTime<Utc>,
) -> PathBuf {
    let tag = match mode {
        RunMode::Restore => format!("{RESTORE_TAG}{}", operation.file_tag()),
        _ => operation.file_tag().to_string(),
    };
    let stamp = started_at.format("%Y%m%d_%H%M%S");
    let mut path = dir.join(format!("{JOURNAL_PREFIX}{tag}_{stamp}.db"));
    let mut attempt = 2;
    while path.exists() {
        path = dir.join(format!("{JOURNAL_PREFIX}{tag}_{stamp}_{attempt}.db"));
        attempt += 1;
    }
    path
}

/// Journal files in `dir`, oldest first.
pub fn list_journals(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut journals = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry
            .with_context(|| format!("failed to read {}", dir.display()))?
            .path();
        let is_journal = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with(JOURNAL_PREFIX) && name.ends_with(".db"))
            .unwrap_or(false);
        if is_journal {
            journals.push(path);
        }
    }
    journals.sort();
    Ok(journals)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp in journal: {value}"))
}

fn compute_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn record(id: u64, old: &str) -> ChangeRecord {
        let mut record = ChangeRecord::new(
            ChangeKind::Deletion,
            Identifier::new(old),
            old.to_string(),
            String::new(),
        );
        record.record_id = id;
        record
    }

    #[test]
    fn create_writes_header_and_reopens() {
        let temp = tempdir().expect("tempdir");
        let journal =
            Journal::create(temp.path(), Operation::AltText, RunMode::DryRun, None).expect("create");
        let name = journal
            .path()
            .file_name()
            .and_then(|name| name.to_str())
            .expect("name")
            .to_string();
        assert!(name.starts_with("journal_alt_text_"));
        assert!(journal.log_path().to_string_lossy().ends_with(".log"));
        assert!(journal.stash_dir().to_string_lossy().ends_with(".stash"));
        let run_id = journal.header().run_id.clone();
        assert_eq!(run_id.len(), 16);

        let second =
            Journal::create(temp.path(), Operation::AltText, RunMode::DryRun, None).expect("second");
        assert_ne!(second.path(), journal.path());

        let reopened = Journal::open(journal.path()).expect("open");
        assert_eq!(reopened.header().run_id, run_id);
        assert_eq!(reopened.header().mode, RunMode::DryRun);
        assert_eq!(reopened.header().operation, Operation::AltText);
        assert_eq!(reopened.header().format_version, 3);
        assert_eq!(list_journals(temp.path()).expect("list").len(), 2);
    }

    #[test]
    fn fold_tracks_final_status_and_applied_order() {
        let temp = tempdir().expect("tempdir");
        let journal =
            Journal::create(temp.path(), Operation::Cleanup, RunMode::Execute, None).expect("create");
        let first = record(1, "/content/images/a.jpg");
        let second = record(2, "/content/images/b.jpg");
        let third = record(3, "/content/images/c.jpg");

        journal.append(&first).expect("planned 1");
        journal.append(&second).expect("planned 2");
        journal
            .append(&second.transition(ChangeStatus::Applied, None))
            .expect("applied 2");
        journal
            .append(&first.transition(ChangeStatus::Applied, None))
            .expect("applied 1");
        journal.append(&third).expect("planned 3");

        let fold = journal.fold().expect("fold");
        assert_eq!(fold.count(ChangeStatus::Applied), 2);
        let reversed: Vec<u64> = fold
            .applied_in_reverse()
            .iter()
            .map(|record| record.record_id)
            .collect();
        assert_eq!(reversed, vec![1, 2]);
        let unconfirmed: Vec<u64> = fold
            .unconfirmed()
            .iter()
            .map(|record| record.record_id)
            .collect();
        assert_eq!(unconfirmed, vec![3]);
    }

    #[test]
    fn entries_cannot_be_rewritten() {
        let temp = tempdir().expect("tempdir");
        let journal =
            Journal::create(temp.path(), Operation::Convert, RunMode::Execute, None).expect("create");
        journal.append(&record(1, "/content/images/a.jpg")).expect("append");
        let update = journal
            .connection
            .execute("UPDATE journal_entries SET status = 'applied'", []);
        assert!(update.is_err());
        let delete = journal.connection.execute("DELETE FROM journal_entries", []);
        assert!(delete.is_err());
        assert_eq!(journal.entries().expect("entries").len(), 1);
    }

    #[test]
    fn events_keep_order_and_restore_journals_are_tagged() {
        let temp = tempdir().expect("tempdir");
        let journal = Journal::create(
            temp.path(),
            Operation::Convert,
            RunMode::Restore,
            Some(Path::new("/tmp/journal_convert_x.db")),
        )
        .expect("create");
        assert!(
            journal
                .path()
                .to_string_lossy()
                .contains("journal_restore_convert_")
        );
        journal.record_event("planned", None).expect("event");
        journal.record_event("restoring", Some("2 records")).expect("event");
        let events = journal.events().expect("events");
        assert_eq!(events.len(), 2);
        assert_eq!(journal.last_state().expect("state").as_deref(), Some("restoring"));

        assert!(Journal::open(&temp.path().join("missing.db")).is_err());
    }
}
