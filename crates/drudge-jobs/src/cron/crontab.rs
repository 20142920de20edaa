//! Crontab parsing.
//!
//! One item per line:
//!
//! ```text
//! <min> <hour> <dom> <month> <dow> <task_identifier> [?<options>] [<json payload>]
//! ```
//!
//! Options use URL query syntax: `id`, `fill`, `max`, `queue`, `priority`,
//! `jobKey` and `jobKeyMode`. Lines starting with `#` and blank lines are
//! ignored.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};

use drudge_core::{Error, JobKeyMode, JobSpec, Result};

use super::schedule::Schedule;

/// Per-item job options.
#[derive(Debug, Clone, PartialEq)]
pub struct CronItemOptions {
    /// How far back missed timestamps are produced after downtime. Zero disables backfill.
    pub backfill_period: Duration,
    pub max_attempts: Option<i32>,
    pub queue_name: Option<String>,
    pub priority: Option<i32>,
    pub job_key: Option<String>,
    pub job_key_mode: Option<JobKeyMode>,
}

impl Default for CronItemOptions {
    fn default() -> Self {
        Self {
            backfill_period: Duration::zero(),
            max_attempts: None,
            queue_name: None,
            priority: None,
            job_key: None,
            job_key_mode: None,
        }
    }
}

/// A recurring job definition.
#[derive(Debug, Clone, PartialEq)]
pub struct CronItem {
    /// Unique identity used to de-duplicate produced jobs.
    pub identifier: String,
    pub schedule: Schedule,
    pub task_identifier: String,
    /// Payload template; always a JSON object.
    pub payload: JsonValue,
    pub options: CronItemOptions,
}

impl CronItem {
    /// Create an item identified by its task identifier with an empty payload.
    pub fn new(task_identifier: impl Into<String>, schedule: Schedule) -> Self {
        let task_identifier = task_identifier.into();
        Self {
            identifier: task_identifier.clone(),
            schedule,
            task_identifier,
            payload: json!({}),
            options: CronItemOptions::default(),
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_backfill(mut self, period: Duration) -> Self {
        self.options.backfill_period = period;
        self
    }

    pub fn with_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.options.queue_name = Some(queue_name.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.options.max_attempts = Some(max_attempts);
        self
    }

    pub fn backfills(&self) -> bool {
        self.options.backfill_period > Duration::zero()
    }

    /// Spec of the job produced for scheduled timestamp `ts`.
    pub fn to_job_spec(&self, ts: DateTime<Utc>, backfilled: bool) -> JobSpec {
        let mut payload = match &self.payload {
            JsonValue::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        payload.insert(
            "_cron".to_string(),
            json!({ "ts": ts.to_rfc3339(), "backfilled": backfilled }),
        );

        let mut spec = JobSpec::new(&self.task_identifier, JsonValue::Object(payload))
            .with_run_at(ts);
        let options = &self.options;
        if let Some(queue) = &options.queue_name {
            spec = spec.with_queue(queue);
        }
        if let Some(max) = options.max_attempts {
            spec = spec.with_max_attempts(max);
        }
        if let Some(priority) = options.priority {
            spec = spec.with_priority(priority);
        }
        if let Some(key) = &options.job_key {
            spec = spec.with_job_key(key);
        }
        if let Some(mode) = options.job_key_mode {
            spec = spec.with_job_key_mode(mode);
        }
        spec
    }
}

fn parse_err(line: usize, message: impl Into<String>) -> Error {
    Error::CronParse {
        line,
        message: message.into(),
    }
}

/// Split off the first whitespace-delimited token.
fn next_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(end) => Some((&s[..end], s[end..].trim_start())),
        None => Some((s, "")),
    }
}

fn is_valid_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
}

/// Parse a fill period such as `1w2d3h4m5s`. Units must appear in that order.
pub fn parse_fill_period(text: &str) -> std::result::Result<Duration, String> {
    const UNITS: [(char, i64); 5] = [
        ('w', 7 * 24 * 3600),
        ('d', 24 * 3600),
        ('h', 3600),
        ('m', 60),
        ('s', 1),
    ];
    if text.is_empty() {
        return Err("empty fill period".to_string());
    }

    let mut seconds: i64 = 0;
    let mut next_unit = 0;
    let mut digits = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let position = UNITS[next_unit..]
            .iter()
            .position(|(unit, _)| *unit == c)
            .map(|p| p + next_unit)
            .ok_or_else(|| format!("invalid fill period '{text}'"))?;
        let amount: i64 = digits
            .parse()
            .map_err(|_| format!("invalid fill period '{text}'"))?;
        seconds = amount
            .checked_mul(UNITS[position].1)
            .and_then(|s| s.checked_add(seconds))
            .ok_or_else(|| format!("fill period '{text}' is too large"))?;
        digits.clear();
        next_unit = position + 1;
    }
    if !digits.is_empty() {
        return Err(format!("fill period '{text}' is missing a unit"));
    }
    Ok(Duration::seconds(seconds))
}

/// Decode `%XX` escapes and `+` in an option value.
fn decode_option(value: &str) -> std::result::Result<String, String> {
    urlencoding::decode(&value.replace('+', " "))
        .map(|decoded| decoded.into_owned())
        .map_err(|_| format!("'{value}' is not valid UTF-8"))
}

fn parse_options(
    query: &str,
    line: usize,
    item: &mut CronItem,
) -> Result<()> {
    let mut seen = HashSet::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| parse_err(line, format!("option '{pair}' has no value")))?;
        if !seen.insert(key) {
            return Err(parse_err(line, format!("option '{key}' given twice")));
        }
        let value = decode_option(raw).map_err(|m| parse_err(line, m))?;
        let options = &mut item.options;
        match key {
            "id" => {
                if !is_valid_identifier(&value) {
                    return Err(parse_err(line, format!("invalid identifier '{value}'")));
                }
                item.identifier = value;
            }
            "fill" => {
                options.backfill_period =
                    parse_fill_period(&value).map_err(|m| parse_err(line, m))?;
            }
            "max" => {
                let max: i32 = value
                    .parse()
                    .ok()
                    .filter(|m| *m >= 1)
                    .ok_or_else(|| parse_err(line, format!("invalid max attempts '{value}'")))?;
                options.max_attempts = Some(max);
            }
            "queue" => {
                if value.is_empty() {
                    return Err(parse_err(line, "queue name must not be empty"));
                }
                options.queue_name = Some(value);
            }
            "priority" => {
                let priority: i32 = value
                    .parse()
                    .map_err(|_| parse_err(line, format!("invalid priority '{value}'")))?;
                options.priority = Some(priority);
            }
            "jobKey" => {
                if value.is_empty() {
                    return Err(parse_err(line, "job key must not be empty"));
                }
                options.job_key = Some(value);
            }
            "jobKeyMode" => {
                let mode = JobKeyMode::parse(&value).map_err(|e| parse_err(line, e.to_string()))?;
                options.job_key_mode = Some(mode);
            }
            other => return Err(parse_err(line, format!("unknown option '{other}'"))),
        }
    }
    Ok(())
}

fn parse_line(text: &str, line: usize) -> Result<CronItem> {
    let mut rest = text;
    let mut fields = [""; 5];
    for field in fields.iter_mut() {
        let (token, tail) =
            next_token(rest).ok_or_else(|| parse_err(line, "expected 5 schedule fields"))?;
        *field = token;
        rest = tail;
    }
    let schedule = Schedule::from_fields(fields).map_err(|m| parse_err(line, m))?;

    let (task_identifier, mut rest) =
        next_token(rest).ok_or_else(|| parse_err(line, "missing task identifier"))?;
    if !is_valid_identifier(task_identifier) {
        return Err(parse_err(
            line,
            format!("invalid task identifier '{task_identifier}'"),
        ));
    }
    let mut item = CronItem::new(task_identifier, schedule);

    if let Some(query) = rest.strip_prefix('?') {
        let (query, tail) = next_token(query).unwrap_or(("", ""));
        parse_options(query, line, &mut item)?;
        rest = tail;
    }

    if !rest.is_empty() {
        let payload: JsonValue = serde_json::from_str(rest)
            .map_err(|e| parse_err(line, format!("invalid payload: {e}")))?;
        if !payload.is_object() {
            return Err(parse_err(line, "payload must be a JSON object"));
        }
        item.payload = payload;
    }
    Ok(item)
}

/// Parse crontab text into items, rejecting duplicate identifiers.
pub fn parse_crontab(text: &str) -> Result<Vec<CronItem>> {
    let mut items: Vec<CronItem> = Vec::new();
    let mut seen = HashSet::new();
    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let item = parse_line(trimmed, line)?;
        if !seen.insert(item.identifier.clone()) {
            return Err(parse_err(
                line,
                format!(
                    "duplicate identifier '{}'; add ?id=<unique> to one of the items",
                    item.identifier
                ),
            ));
        }
        items.push(item);
    }
    Ok(items)
}

/// Check that programmatically built items have unique identifiers.
pub fn validate_items(items: &[CronItem]) -> Result<()> {
    let mut seen = HashSet::new();
    for item in items {
        if !is_valid_identifier(&item.identifier) {
            return Err(Error::InvalidInput(format!(
                "Invalid cron identifier '{}'",
                item.identifier
            )));
        }
        if !seen.insert(item.identifier.as_str()) {
            return Err(Error::InvalidInput(format!(
                "Duplicate cron identifier '{}'",
                item.identifier
            )));
        }
    }
    Ok(())
}

/// Load a crontab file. A missing file means no cron items.
pub fn load_crontab_file(path: impl AsRef<Path>) -> Result<Vec<CronItem>> {
    let path = path.as_ref();
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(
                subsystem = "cron",
                path = %path.display(),
                "No crontab file; cron disabled"
            );
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };
    let items = parse_crontab(&text)?;
    info!(
        subsystem = "cron",
        path = %path.display(),
        item_count = items.len(),
        "Loaded crontab"
    );
    Ok(items)
}
