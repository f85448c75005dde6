//! SQL for applications and contracts.
//!
//! State changes are compare-and-set: the `WHERE` clause pins the status and
//! assignee columns the caller computed its transition from, and a zero
//! row count means another writer got there first.
use super::model::{ApplicationRow, ApplicationViewRow, ContractRow, DueFilter, ListQuery};
use crate::model::{ApplicationState, ApplicationStatus, ContractStatus};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqliteExecutor};

const APP_COLUMNS: &str = "a.id, a.customer_id, a.broadcast_id, a.status, a.agent_id, a.commercial_id, \
     a.duration_secs, a.cost_cents, a.contact_phone, a.description, a.approved_at, a.due_at, \
     a.paid_at, a.reversed_at, a.version, a.created_at, a.updated_at";

#[derive(Debug, Clone)]
pub struct NewApplication<'a> {
    pub customer_id: i64,
    pub broadcast_id: i64,
    pub duration_secs: i64,
    pub cost_cents: i64,
    pub contact_phone: &'a str,
    pub description: &'a str,
}

/// Operational fields the exclusive owner may change.
#[derive(Debug, Clone)]
pub struct FieldValues<'a> {
    pub broadcast_id: i64,
    pub duration_secs: i64,
    pub cost_cents: i64,
    pub contact_phone: &'a str,
    pub description: &'a str,
}

pub async fn insert_application(
    conn: &mut SqliteConnection,
    new: &NewApplication<'_>,
    now: DateTime<Utc>,
) -> sqlx::Result<i64> {
    let row = sqlx::query(
        "INSERT INTO applications (customer_id, broadcast_id, status, duration_secs, cost_cents, \
         contact_phone, description, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(new.customer_id)
    .bind(new.broadcast_id)
    .bind(ApplicationStatus::Pending.as_str())
    .bind(new.duration_secs)
    .bind(new.cost_cents)
    .bind(new.contact_phone)
    .bind(new.description)
    .bind(now)
    .bind(now)
    .fetch_one(conn)
    .await?;
    Ok(row.get("id"))
}

pub async fn fetch_application<'e>(
    ex: impl SqliteExecutor<'e>,
    id: i64,
) -> sqlx::Result<Option<ApplicationRow>> {
    sqlx::query_as::<_, ApplicationRow>(&format!(
        "SELECT {APP_COLUMNS} FROM applications a WHERE a.id = ?"
    ))
    .bind(id)
    .fetch_optional(ex)
    .await
}

/// Move an application from `from` to `to`, provided its stored status and
/// assignees still match `from`.
pub async fn compare_and_set_state(
    conn: &mut SqliteConnection,
    id: i64,
    from: &ApplicationState,
    to: &ApplicationState,
    now: DateTime<Utc>,
) -> sqlx::Result<bool> {
    let old = from.to_columns();
    let new = to.to_columns();
    let res = sqlx::query(
        "UPDATE applications SET status = ?, agent_id = ?, commercial_id = ?, \
             approved_at = COALESCE(?, approved_at), due_at = COALESCE(?, due_at), \
             paid_at = ?, reversed_at = ?, version = version + 1, updated_at = ? \
         WHERE id = ? AND status = ? AND agent_id IS ? AND commercial_id IS ?",
    )
    .bind(new.status)
    .bind(new.agent_id)
    .bind(new.commercial_id)
    .bind(new.approved_at)
    .bind(new.due_at)
    .bind(new.paid_at)
    .bind(new.reversed_at)
    .bind(now)
    .bind(id)
    .bind(old.status)
    .bind(old.agent_id)
    .bind(old.commercial_id)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Rewrite the operational fields while the state is still `expected`.
pub async fn update_fields(
    conn: &mut SqliteConnection,
    id: i64,
    expected: &ApplicationState,
    values: &FieldValues<'_>,
    now: DateTime<Utc>,
) -> sqlx::Result<bool> {
    let cols = expected.to_columns();
    let res = sqlx::query(
        "UPDATE applications SET broadcast_id = ?, duration_secs = ?, cost_cents = ?, \
             contact_phone = ?, description = ?, version = version + 1, updated_at = ? \
         WHERE id = ? AND status = ? AND agent_id IS ? AND commercial_id IS ?",
    )
    .bind(values.broadcast_id)
    .bind(values.duration_secs)
    .bind(values.cost_cents)
    .bind(values.contact_phone)
    .bind(values.description)
    .bind(now)
    .bind(id)
    .bind(cols.status)
    .bind(cols.agent_id)
    .bind(cols.commercial_id)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Delete a customer's application while it is still cancellable and still
/// in the `expected` state.
pub async fn delete_cancellable(
    conn: &mut SqliteConnection,
    id: i64,
    customer_id: i64,
    expected: &ApplicationState,
) -> sqlx::Result<bool> {
    let cols = expected.to_columns();
    let res = sqlx::query(
        "DELETE FROM applications WHERE id = ? AND customer_id = ? \
         AND status IN ('pending', 'in_progress', 'sent_to_commercial') \
         AND status = ? AND agent_id IS ? AND commercial_id IS ?",
    )
    .bind(id)
    .bind(customer_id)
    .bind(cols.status)
    .bind(cols.agent_id)
    .bind(cols.commercial_id)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn count_for_broadcast<'e>(
    ex: impl SqliteExecutor<'e>,
    broadcast_id: i64,
) -> sqlx::Result<i64> {
    sqlx::query_scalar("SELECT COUNT(*) FROM applications WHERE broadcast_id = ?")
        .bind(broadcast_id)
        .fetch_one(ex)
        .await
}

fn view_select() -> String {
    format!(
        "SELECT {APP_COLUMNS}, s.id AS show_id, s.name AS show_name, \
                s.window_start || '-' || s.window_end AS show_window, \
                b.air_date, b.starts_at \
         FROM applications a \
         JOIN broadcasts b ON b.id = a.broadcast_id \
         JOIN shows s ON s.id = b.show_id"
    )
}

pub async fn fetch_view<'e>(
    ex: impl SqliteExecutor<'e>,
    id: i64,
) -> sqlx::Result<Option<ApplicationViewRow>> {
    sqlx::query_as::<_, ApplicationViewRow>(&format!("{} WHERE a.id = ?", view_select()))
        .bind(id)
        .fetch_optional(ex)
        .await
}

pub async fn list_views<'e>(
    ex: impl SqliteExecutor<'e>,
    query: &ListQuery,
) -> sqlx::Result<Vec<ApplicationViewRow>> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!("{} WHERE 1 = 1", view_select()));

    if let Some(statuses) = &query.statuses {
        if statuses.is_empty() {
            qb.push(" AND 1 = 0");
        } else {
            qb.push(" AND a.status IN (");
            let mut sep = qb.separated(", ");
            for status in statuses {
                sep.push_bind(status.as_str());
            }
            sep.push_unseparated(")");
        }
    }
    if query.exclude_rejected {
        qb.push(" AND a.status <> ")
            .push_bind(ApplicationStatus::Rejected.as_str());
    }
    if let Some(customer_id) = query.customer_id {
        qb.push(" AND a.customer_id = ").push_bind(customer_id);
    }
    if let Some(agent_id) = query.agent_id {
        qb.push(" AND a.agent_id = ").push_bind(agent_id);
    }
    if let Some(agent_id) = query.unclaimed_or_agent {
        qb.push(" AND ((a.status = ")
            .push_bind(ApplicationStatus::Pending.as_str())
            .push(" AND a.agent_id IS NULL) OR a.agent_id = ")
            .push_bind(agent_id)
            .push(")");
    }
    match query.due {
        DueFilter::Any => {}
        DueFilter::NotDue(now) => {
            qb.push(" AND (a.due_at IS NULL OR a.due_at >= ").push_bind(now).push(")");
        }
        DueFilter::PastDue(now) => {
            qb.push(" AND a.due_at < ").push_bind(now);
        }
    }
    if let Some(from) = query.air_date_from {
        qb.push(" AND b.air_date >= ").push_bind(from);
    }
    if let Some(to) = query.air_date_to {
        qb.push(" AND b.air_date <= ").push_bind(to);
    }
    qb.push(" ORDER BY a.id");

    qb.build_query_as::<ApplicationViewRow>().fetch_all(ex).await
}

pub async fn insert_contract(
    conn: &mut SqliteConnection,
    application_id: i64,
    now: DateTime<Utc>,
) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO contracts (application_id, status, sent_at) VALUES (?, ?, ?)",
    )
    .bind(application_id)
    .bind(ContractStatus::Sent.as_str())
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

const CONTRACT_COLUMNS: &str = "id, application_id, status, sent_at, viewed_at, downloaded_at";

pub async fn fetch_contract<'e>(
    ex: impl SqliteExecutor<'e>,
    id: i64,
) -> sqlx::Result<Option<ContractRow>> {
    sqlx::query_as::<_, ContractRow>(&format!(
        "SELECT {CONTRACT_COLUMNS} FROM contracts WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(ex)
    .await
}

pub async fn fetch_contract_for_application<'e>(
    ex: impl SqliteExecutor<'e>,
    application_id: i64,
) -> sqlx::Result<Option<ContractRow>> {
    sqlx::query_as::<_, ContractRow>(&format!(
        "SELECT {CONTRACT_COLUMNS} FROM contracts WHERE application_id = ?"
    ))
    .bind(application_id)
    .fetch_optional(ex)
    .await
}

/// Advance a contract from `from` to `to`, filling any skipped timestamps.
pub async fn advance_contract<'e>(
    ex: impl SqliteExecutor<'e>,
    id: i64,
    from: ContractStatus,
    to: ContractStatus,
    now: DateTime<Utc>,
) -> sqlx::Result<bool> {
    let res = sqlx::query(
        "UPDATE contracts SET status = ?, \
             viewed_at = COALESCE(viewed_at, ?), \
             downloaded_at = CASE WHEN ? = 'downloaded' THEN COALESCE(downloaded_at, ?) ELSE downloaded_at END \
         WHERE id = ? AND status = ?",
    )
    .bind(to.as_str())
    .bind(now)
    .bind(to.as_str())
    .bind(now)
    .bind(id)
    .bind(from.as_str())
    .execute(ex)
    .await?;
    Ok(res.rows_affected() == 1)
}
