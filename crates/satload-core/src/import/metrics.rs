use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::batch::PlannedBatch;
use super::service::ImportOutcome;

/// Shape of an imported record. Each shape has its own quarantine output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Vertex,
    Edge,
    Document,
}

impl RecordKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vertex => "vertex",
            Self::Edge => "edge",
            Self::Document => "document",
        }
    }

    #[must_use]
    pub fn plural(&self) -> &'static str {
        match self {
            Self::Vertex => "vertices",
            Self::Edge => "edges",
            Self::Document => "documents",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of driving one fixed batch to completion.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub batch: PlannedBatch,
    pub attempts: u32,
    /// Credited totals. `documents_imported` never exceeds the batch's
    /// documents that were not rejected.
    pub outcome: ImportOutcome,
    /// Raw writes reported across every submission, repeats included.
    pub writes: u64,
    pub error: Option<String>,
    pub cancelled: bool,
}

impl BatchOutcome {
    #[must_use]
    pub fn new(batch: PlannedBatch) -> Self {
        Self {
            batch,
            attempts: 0,
            outcome: ImportOutcome::default(),
            writes: 0,
            error: None,
            cancelled: false,
        }
    }

    /// Folds one submission in. A resubmitted record that was already
    /// written is upserted again, so imports are credited up to the number
    /// of records that can still be imported.
    pub fn credit(&mut self, outcome: ImportOutcome) {
        self.writes += outcome.documents_imported;
        self.outcome.merge(outcome);
        let importable =
            (self.batch.len() as u64).saturating_sub(self.outcome.bad_input.len() as u64);
        self.outcome.documents_imported = self.writes.min(importable);
    }

    /// Imported plus quarantined records cover the whole batch.
    pub fn is_complete(&self) -> bool {
        self.settled() >= self.batch.len() as u64
    }

    pub fn settled(&self) -> u64 {
        self.outcome.documents_imported + self.outcome.bad_input.len() as u64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct KindTotals {
    pub imported: u64,
    pub rejected: u64,
}

/// Run-level totals across every import call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub by_kind: BTreeMap<RecordKind, KindTotals>,
    pub elapsed: Duration,
    pub request_units: f64,
    pub skipped_at_extraction: usize,
    pub failed_batches: usize,
}

impl RunSummary {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            by_kind: BTreeMap::new(),
            elapsed: Duration::ZERO,
            request_units: 0.0,
            skipped_at_extraction: 0,
            failed_batches: 0,
        }
    }

    /// Folds one call's statistics in. Elapsed time is summed; concurrent
    /// callers overwrite it with wall-clock time afterwards.
    pub fn record(&mut self, kind: RecordKind, outcome: &ImportOutcome) {
        let totals = self.by_kind.entry(kind).or_default();
        totals.imported += outcome.documents_imported;
        totals.rejected += outcome.bad_input.len() as u64;
        self.elapsed += outcome.time_taken;
        self.request_units += outcome.request_units_consumed;
    }

    pub fn imported(&self, kind: RecordKind) -> u64 {
        self.by_kind.get(&kind).map_or(0, |t| t.imported)
    }

    pub fn rejected(&self, kind: RecordKind) -> u64 {
        self.by_kind.get(&kind).map_or(0, |t| t.rejected)
    }

    pub fn total_imported(&self) -> u64 {
        self.by_kind.values().map(|t| t.imported).sum()
    }

    pub fn total_rejected(&self) -> u64 {
        self.by_kind.values().map(|t| t.rejected).sum()
    }

    pub fn writes_per_second(&self) -> f64 {
        per_second(self.total_imported() as f64, self.elapsed)
    }

    pub fn request_units_per_second(&self) -> f64 {
        per_second(self.request_units, self.elapsed)
    }

    pub fn average_request_units(&self) -> f64 {
        match self.total_imported() {
            0 => 0.0,
            n => self.request_units / n as f64,
        }
    }
}

impl Default for RunSummary {
    fn default() -> Self {
        Self::new()
    }
}

fn per_second(amount: f64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        amount / secs
    } else {
        0.0
    }
}

const RULE: &str = "---------------------------------------------------------------------";

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Summary for run started {}", self.started_at.to_rfc3339())?;
        writeln!(f, "{RULE}")?;

        let breakdown: Vec<String> = self
            .by_kind
            .iter()
            .map(|(kind, totals)| format!("{} {}", totals.imported, kind.plural()))
            .collect();

        writeln!(
            f,
            "Inserted {} records ({}) @ {:.0} writes/s, {:.0} RU/s in {:.3} sec",
            self.total_imported(),
            breakdown.join(", "),
            self.writes_per_second(),
            self.request_units_per_second(),
            self.elapsed.as_secs_f64(),
        )?;
        writeln!(
            f,
            "Average RU consumption per insert: {:.2}",
            self.average_request_units()
        )?;

        if self.total_rejected() > 0 {
            writeln!(f, "Rejected as bad input: {}", self.total_rejected())?;
        }
        if self.skipped_at_extraction > 0 {
            writeln!(
                f,
                "Skipped malformed source documents: {}",
                self.skipped_at_extraction
            )?;
        }
        if self.failed_batches > 0 {
            writeln!(f, "Incomplete batches: {}", self.failed_batches)?;
        }

        write!(f, "{RULE}")
    }
}
