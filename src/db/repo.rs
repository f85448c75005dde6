use super::model::OutboxTask;
use crate::model::OutboxKind;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let in_memory = normalized.starts_with("sqlite::memory");
    let mut options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    if !in_memory {
        // Enable WAL and stricter durability.
        options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
    }
    // Every connection to `sqlite::memory:` is its own database, so pin the
    // pool to one long-lived connection.
    let pool = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?
    };
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{expanded_path}");
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Open a migrated in-memory database. Used by tests and dry runs.
pub async fn memory_pool() -> Result<Pool> {
    let pool = init_pool("sqlite::memory:").await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

#[instrument(skip_all)]
pub async fn register_payout_details(pool: &Pool, user_id: i64) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO payout_details (user_id) VALUES (?)")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn has_payout_details(pool: &Pool, user_id: i64) -> Result<bool> {
    let found: Option<i64> =
        sqlx::query_scalar("SELECT user_id FROM payout_details WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(pool)
            .await?;
    Ok(found.is_some())
}

pub async fn enqueue_outbox_tx(
    conn: &mut SqliteConnection,
    kind: OutboxKind,
    application_id: i64,
    payload: &str,
    due_at: DateTime<Utc>,
) -> sqlx::Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO outbox (kind, application_id, payload, attempt, due_at) VALUES (?, ?, ?, 0, ?) RETURNING id",
    )
    .bind(kind.as_str())
    .bind(application_id)
    .bind(payload)
    .bind(due_at)
    .fetch_one(conn)
    .await?;
    Ok(rec.get("id"))
}

/// Oldest due task that has no earlier task queued for the same
/// application, so one application's events go out in commit order.
#[instrument(skip_all)]
pub async fn next_due_outbox(pool: &Pool, now: DateTime<Utc>) -> Result<Option<OutboxTask>> {
    let task = sqlx::query_as::<_, OutboxTask>(
        "SELECT o.id, o.kind, o.application_id, o.payload, o.attempt FROM outbox o \
         WHERE o.due_at <= ? \
           AND NOT EXISTS (SELECT 1 FROM outbox p WHERE p.application_id = o.application_id AND p.id < o.id) \
         ORDER BY o.id ASC LIMIT 1",
    )
    .bind(now)
    .fetch_optional(pool)
    .await?;
    Ok(task)
}

#[instrument(skip_all)]
pub async fn delete_outbox(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM outbox WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Exponential backoff: 5s * 2^attempt, capped at `max_cap_secs` (when > 0).
pub fn backoff_delay_secs(attempt: i64, max_cap_secs: i64) -> i64 {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    if max_cap_secs <= 0 {
        secs
    } else {
        secs.min(max_cap_secs)
    }
}

#[instrument(skip_all)]
pub async fn backoff_outbox_with_cap(
    pool: &Pool,
    id: i64,
    attempt: i64,
    max_cap_secs: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    let due_at = now + ChronoDuration::seconds(backoff_delay_secs(attempt, max_cap_secs));
    sqlx::query("UPDATE outbox SET attempt = ?, due_at = ? WHERE id = ?")
        .bind(attempt + 1)
        .bind(due_at)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_remaining_outbox_tasks(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
        .fetch_one(pool)
        .await?;
    Ok(count)
}
