//! Schema name validation and installation of the queue tables.
//!
//! All tables live in one dedicated PostgreSQL schema (default `drudge`):
//!
//! - `jobs`: one row per pending, running or permanently failed job
//! - `job_queues`: one row per queue name ever referenced, carrying the queue lock
//! - `known_crontabs`: cron de-duplication bookkeeping
//!
//! Schema names are interpolated into SQL, so every entry point validates them
//! first.

use sqlx::PgPool;
use tracing::info;

use drudge_core::{Error, Result};

/// PostgreSQL identifier length limit.
const MAX_IDENTIFIER_LEN: usize = 63;

const RESERVED_SCHEMAS: &[&str] = &[
    "pg_catalog",
    "information_schema",
    "pg_toast",
    "select",
    "insert",
    "update",
    "delete",
    "drop",
    "create",
    "alter",
    "grant",
    "revoke",
    "truncate",
];

/// Validate a PostgreSQL schema name before it is interpolated into SQL.
///
/// Accepts ASCII letters, digits and underscores, not starting with a digit,
/// at most 63 characters, and not a system schema or SQL keyword.
///
/// ```
/// use drudge_db::validate_schema_name;
///
/// assert!(validate_schema_name("drudge").is_ok());
/// assert!(validate_schema_name("tenant_42").is_ok());
/// assert!(validate_schema_name("42tenant").is_err());
/// assert!(validate_schema_name("").is_err());
/// ```
pub fn validate_schema_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidInput(
            "Schema name cannot be empty".to_string(),
        ));
    }

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::InvalidInput(format!(
            "Schema name exceeds {MAX_IDENTIFIER_LEN} character limit: {} characters",
            name.len()
        )));
    }

    if let Some(first) = name.chars().next() {
        if !first.is_ascii_alphabetic() && first != '_' {
            return Err(Error::InvalidInput(format!(
                "Schema name must start with a letter or underscore, found: '{first}'"
            )));
        }
    }

    if let Some(ch) = name
        .chars()
        .find(|ch| !ch.is_ascii_alphanumeric() && *ch != '_')
    {
        return Err(Error::InvalidInput(format!(
            "Schema name contains invalid character: '{ch}'. Only alphanumeric and underscore allowed"
        )));
    }

    if RESERVED_SCHEMAS.contains(&name.to_lowercase().as_str()) {
        return Err(Error::InvalidInput(format!(
            "Schema name '{name}' is reserved"
        )));
    }

    Ok(())
}

/// `NOTIFY` channel that job inserts into `schema` are announced on.
pub fn insert_channel(schema: &str) -> String {
    format!("{schema}_jobs_insert")
}

fn schema_sql(schema: &str) -> String {
    format!(
        r#"
CREATE SCHEMA IF NOT EXISTS {schema};

CREATE TABLE IF NOT EXISTS {schema}.job_queues (
    queue_name text PRIMARY KEY,
    job_count integer NOT NULL DEFAULT 0,
    locked_at timestamptz,
    locked_by text
);

CREATE TABLE IF NOT EXISTS {schema}.jobs (
    id bigserial PRIMARY KEY,
    queue_name text REFERENCES {schema}.job_queues (queue_name),
    task_identifier text NOT NULL CHECK (length(task_identifier) > 0),
    payload jsonb NOT NULL DEFAULT '{{}}'::jsonb,
    priority integer NOT NULL DEFAULT 0,
    run_at timestamptz NOT NULL DEFAULT now(),
    attempts integer NOT NULL DEFAULT 0,
    max_attempts integer NOT NULL DEFAULT 25 CHECK (max_attempts >= 1),
    last_error text,
    key text UNIQUE CHECK (length(key) > 0),
    locked_at timestamptz,
    locked_by text,
    flags text[] NOT NULL DEFAULT '{{}}',
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS jobs_claim_order_idx
    ON {schema}.jobs (run_at, priority, id)
    WHERE attempts < max_attempts;

CREATE INDEX IF NOT EXISTS jobs_locked_by_idx
    ON {schema}.jobs (locked_by)
    WHERE locked_by IS NOT NULL;

CREATE TABLE IF NOT EXISTS {schema}.known_crontabs (
    identifier text PRIMARY KEY,
    known_since timestamptz NOT NULL,
    last_execution timestamptz
);
"#
    )
}

/// Create the schema and its tables if they do not exist yet. Idempotent.
pub async fn install_schema(pool: &PgPool, schema: &str) -> Result<()> {
    validate_schema_name(schema)?;
    sqlx::raw_sql(&schema_sql(schema))
        .execute(pool)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "database",
        component = "schema",
        op = "install",
        schema,
        "Job queue schema installed"
    );
    Ok(())
}

/// Drop the schema and everything in it.
pub async fn drop_schema(pool: &PgPool, schema: &str) -> Result<()> {
    validate_schema_name(schema)?;
    sqlx::raw_sql(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE"))
        .execute(pool)
        .await
        .map_err(Error::Database)?;
    Ok(())
}
