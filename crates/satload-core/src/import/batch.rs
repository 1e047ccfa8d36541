use std::ops::Range;

use serde::{Deserialize, Serialize};

/// What happens to the `total % batches` documents left over after
/// splitting into equal batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemainderPolicy {
    /// The last batch takes the leftover documents.
    #[default]
    AbsorbIntoLast,
    /// Leftover documents are not imported.
    Drop,
}

impl RemainderPolicy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AbsorbIntoLast => "absorb_into_last",
            Self::Drop => "drop",
        }
    }
}

impl std::fmt::Display for RemainderPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RemainderPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "absorb_into_last" | "absorb" => Ok(Self::AbsorbIntoLast),
            "drop" => Ok(Self::Drop),
            _ => Err(format!("unknown remainder policy: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedBatch {
    pub index: usize,
    pub range: Range<usize>,
}

impl PlannedBatch {
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub batches: Vec<PlannedBatch>,
    /// Positions left out under [`RemainderPolicy::Drop`].
    pub dropped: Range<usize>,
}

/// Splits `0..total` into contiguous batches of `floor(total / batches)`.
///
/// The batch count is capped at `total` so no batch is empty.
pub fn partition(total: usize, number_of_batches: usize, policy: RemainderPolicy) -> Partition {
    let count = number_of_batches.min(total);
    if count == 0 {
        return Partition {
            batches: Vec::new(),
            dropped: total..total,
        };
    }

    let size = total / count;
    let covered = size * count;

    let mut batches: Vec<PlannedBatch> = (0..count)
        .map(|index| PlannedBatch {
            index,
            range: index * size..(index + 1) * size,
        })
        .collect();

    let dropped = match policy {
        RemainderPolicy::AbsorbIntoLast => {
            if let Some(last) = batches.last_mut() {
                last.range.end = total;
            }
            total..total
        }
        RemainderPolicy::Drop => covered..total,
    };

    Partition { batches, dropped }
}
