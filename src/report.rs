use std::{fmt::Write as _, time::Duration};

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Disposition {
    Inserted,
    Updated,
    Rejected { reason: String },
}

/// Result of loading one data row, identified by its 1-based position in the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportOutcome {
    pub ordinal: usize,
    #[serde(flatten)]
    pub disposition: Disposition,
}

impl ImportOutcome {
    pub fn inserted(ordinal: usize) -> Self {
        Self {
            ordinal,
            disposition: Disposition::Inserted,
        }
    }

    pub fn updated(ordinal: usize) -> Self {
        Self {
            ordinal,
            disposition: Disposition::Updated,
        }
    }

    pub fn rejected(ordinal: usize, reason: impl Into<String>) -> Self {
        Self {
            ordinal,
            disposition: Disposition::Rejected {
                reason: reason.into(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub table: String,
    pub rows_read: usize,
    pub inserted: usize,
    pub updated: usize,
    pub rejected: Vec<ImportOutcome>,
    pub batches_committed: usize,
    pub batches_failed: usize,
    pub cancelled: bool,
    #[serde(serialize_with = "serialize_seconds")]
    pub elapsed: Duration,
}

fn serialize_seconds<S: serde::Serializer>(
    value: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}

impl ImportReport {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    pub fn record(&mut self, outcome: ImportOutcome) {
        self.rows_read += 1;
        match outcome.disposition {
            Disposition::Inserted => self.inserted += 1,
            Disposition::Updated => self.updated += 1,
            Disposition::Rejected { .. } => self.rejected.push(outcome),
        }
    }

    pub fn extend(&mut self, outcomes: impl IntoIterator<Item = ImportOutcome>) {
        for outcome in outcomes {
            self.record(outcome);
        }
    }

    pub fn successes(&self) -> usize {
        self.inserted + self.updated
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.len()
    }

    /// A run that stored nothing counts as failed even when no error propagated.
    pub fn is_failed(&self) -> bool {
        self.successes() == 0
    }

    pub fn rejection_for(&self, ordinal: usize) -> Option<&str> {
        self.rejected
            .iter()
            .find(|outcome| outcome.ordinal == ordinal)
            .and_then(|outcome| match &outcome.disposition {
                Disposition::Rejected { reason } => Some(reason.as_str()),
                _ => None,
            })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let status = match (self.cancelled, self.is_failed()) {
            (true, _) => "cancelled",
            (false, true) => "failed",
            (false, false) => "completed",
        };
        let _ = writeln!(out, "Import into {} {status}", self.table);
        let _ = writeln!(out, "  rows read:  {}", self.rows_read);
        let _ = writeln!(out, "  inserted:   {}", self.inserted);
        let _ = writeln!(out, "  updated:    {}", self.updated);
        let _ = writeln!(out, "  rejected:   {}", self.rejected_count());
        let _ = writeln!(
            out,
            "  batches:    {} committed, {} failed",
            self.batches_committed, self.batches_failed
        );
        let _ = writeln!(out, "  elapsed:    {:.2}s", self.elapsed.as_secs_f64());
        if !self.rejected.is_empty() {
            let _ = writeln!(out, "Rejected rows:");
            for outcome in &self.rejected {
                if let Disposition::Rejected { reason } = &outcome.disposition {
                    let _ = writeln!(out, "  row {}: {reason}", outcome.ordinal);
                }
            }
        }
        out
    }
}
