use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use crate::record::{LogRecord, parse_timestamp};

pub const EPOCH_CURSOR: &str = "1970-01-01 00:00:00";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn epoch() -> Self {
        Self(EPOCH_CURSOR.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_epoch(&self) -> bool {
        self.0 == EPOCH_CURSOR
    }

    // Timestamps never move backwards; other tokens are adopted as-is.
    pub fn advance(&mut self, next: Option<&str>) -> bool {
        let Some(next) = next.map(str::trim).filter(|value| !value.is_empty()) else {
            return false;
        };
        if next == self.0 {
            return false;
        }
        if let (Some(current), Some(candidate)) = (parse_timestamp(&self.0), parse_timestamp(next))
            && candidate < current
        {
            return false;
        }
        self.0 = next.to_string();
        true
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self::epoch()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeOutcome {
    pub first_new: usize,
    pub appended: usize,
    pub duplicates: usize,
    pub unidentified: usize,
}

impl MergeOutcome {
    pub fn is_empty(&self) -> bool {
        self.appended == 0
    }
}

pub fn merge_rows(
    log: &mut Vec<LogRecord>,
    seen: &mut HashSet<String>,
    batch: Vec<LogRecord>,
) -> MergeOutcome {
    let mut outcome = MergeOutcome {
        first_new: log.len(),
        ..MergeOutcome::default()
    };

    for record in batch {
        match record.id.as_deref() {
            Some(id) if seen.contains(id) => {
                outcome.duplicates += 1;
                continue;
            }
            Some(id) => {
                seen.insert(id.to_string());
            }
            None => outcome.unidentified += 1,
        }
        log.push(record);
        outcome.appended += 1;
    }

    outcome
}
