//! Five-field cron schedule expressions at minute resolution.

use std::fmt;

use chrono::{DateTime, Timelike, Utc};
use croner::Cron;

/// A parsed `min hour dom month dow` expression.
///
/// Day of week accepts 0-7 (0 and 7 are Sunday). When both day fields are
/// restricted a timestamp matches if either one does.
#[derive(Clone)]
pub struct Schedule {
    source: String,
    cron: Cron,
}

impl Schedule {
    /// Parse a five-field expression such as `*/15 9-17 * * 1-5`.
    pub fn parse(expression: &str) -> std::result::Result<Self, String> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(format!(
                "expected 5 schedule fields, found {}",
                fields.len()
            ));
        }
        Self::from_fields([fields[0], fields[1], fields[2], fields[3], fields[4]])
    }

    pub(crate) fn from_fields(fields: [&str; 5]) -> std::result::Result<Self, String> {
        let source = fields.join(" ");
        let cron = Cron::new(&source)
            .parse()
            .map_err(|e| format!("invalid schedule '{source}': {e}"))?;
        Ok(Self { source, cron })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the minute containing `ts` is scheduled.
    pub fn matches(&self, ts: DateTime<Utc>) -> bool {
        self.cron.is_time_matching(&floor_minute(ts)).unwrap_or(false)
    }

    /// Scheduled minutes in `(after, until]`, ascending.
    pub fn timestamps_between(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        if after >= until {
            return Vec::new();
        }
        self.cron
            .iter_after(after)
            .take_while(|ts| *ts <= until)
            .collect()
    }
}

impl PartialEq for Schedule {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Schedule {}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Schedule").field(&self.source).finish()
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Truncate to the start of the minute.
pub fn floor_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_nanosecond(0)
        .and_then(|t| t.with_second(0))
        .unwrap_or(ts)
}
