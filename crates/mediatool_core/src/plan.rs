use std::fmt;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::ContentReference;
use crate::identifier::Identifier;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    CodecConversion,
    Relocation,
    AltText,
    Deletion,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CodecConversion => "codec-conversion",
            Self::Relocation => "relocation",
            Self::AltText => "alt-text",
            Self::Deletion => "deletion",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        Ok(match value {
            "codec-conversion" => Self::CodecConversion,
            "relocation" => Self::Relocation,
            "alt-text" => Self::AltText,
            "deletion" => Self::Deletion,
            other => bail!("unknown change kind: {other}"),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Planned,
    Applied,
    Failed,
    Skipped,
}

impl ChangeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        Ok(match value {
            "planned" => Self::Planned,
            "applied" => Self::Applied,
            "failed" => Self::Failed,
            "skipped" => Self::Skipped,
            other => bail!("unknown change status: {other}"),
        })
    }
}

/// One mutation with its before and after values.
///
/// For files, `old_value`/`new_value` are identifiers. Alt-text records carry
/// the alt strings and name the image in `subject`; a deletion has an empty
/// `new_value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub record_id: u64,
    pub kind: ChangeKind,
    pub subject: Identifier,
    pub old_value: String,
    pub new_value: String,
    pub status: ChangeStatus,
    pub references: Vec<ContentReference>,
    pub recorded_at: DateTime<Utc>,
    pub detail: Option<String>,
}

impl ChangeRecord {
    pub fn new(kind: ChangeKind, subject: Identifier, old_value: String, new_value: String) -> Self {
        Self {
            record_id: 0,
            kind,
            subject,
            old_value,
            new_value,
            status: ChangeStatus::Planned,
            references: Vec::new(),
            recorded_at: Utc::now(),
            detail: None,
        }
    }

    pub fn with_references(mut self, references: Vec<ContentReference>) -> Self {
        self.references = references;
        self
    }

    /// Copy of this record at a new status, stamped now.
    pub fn transition(&self, status: ChangeStatus, detail: Option<String>) -> Self {
        Self {
            status,
            detail,
            recorded_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn old_identifier(&self) -> Identifier {
        Identifier::new(self.old_value.clone())
    }

    pub fn new_identifier(&self) -> Identifier {
        Identifier::new(self.new_value.clone())
    }
}

impl fmt::Display for ChangeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ChangeKind::AltText => write!(
                f,
                "#{} {} {}: {:?} -> {:?}",
                self.record_id,
                self.kind.as_str(),
                self.subject,
                self.old_value,
                self.new_value
            ),
            ChangeKind::Deletion => {
                write!(f, "#{} {} {}", self.record_id, self.kind.as_str(), self.old_value)
            }
            _ => write!(
                f,
                "#{} {} {} -> {}",
                self.record_id,
                self.kind.as_str(),
                self.old_value,
                self.new_value
            ),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    Convert,
    Relocate,
    Cleanup,
    AltText,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Convert => "convert",
            Self::Relocate => "relocate",
            Self::Cleanup => "cleanup",
            Self::AltText => "alt-text",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        Ok(match value {
            "convert" => Self::Convert,
            "relocate" => Self::Relocate,
            "cleanup" => Self::Cleanup,
            "alt-text" => Self::AltText,
            other => bail!("unknown operation: {other}"),
        })
    }

    /// File-name safe form used in journal names.
    pub fn file_tag(self) -> &'static str {
        match self {
            Self::AltText => "alt_text",
            other => other.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanSkip {
    pub subject: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub operation: Operation,
    pub records: Vec<ChangeRecord>,
    pub warnings: Vec<String>,
    pub skipped: Vec<PlanSkip>,
    /// Relocation only: assets no content item references.
    pub unowned: Vec<Identifier>,
}

impl Plan {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            records: Vec::new(),
            warnings: Vec::new(),
            skipped: Vec::new(),
            unowned: Vec::new(),
        }
    }

    /// Appends in discovery order, numbering records from 1.
    pub fn push_record(&mut self, mut record: ChangeRecord) {
        record.record_id = self.records.len() as u64 + 1;
        self.records.push(record);
    }

    pub fn skip(&mut self, subject: impl Into<String>, reason: impl Into<String>) {
        self.skipped.push(PlanSkip {
            subject: subject.into(),
            reason: reason.into(),
        });
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(operation = self.operation.as_str(), "{message}");
        self.warnings.push(message);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
