//! SQL for shows and broadcasts.
//!
//! `booked_slots` is written only by [`reserve_slot`] and [`release_slot`].
use crate::model::{Broadcast, Show};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::{FromRow, Row, SqliteConnection, SqliteExecutor};

const SHOW_COLUMNS: &str = "id, name, category, window_start || '-' || window_end AS time_window, \
     recurrence, price_per_minute_cents, active";

const BROADCAST_COLUMNS: &str =
    "id, show_id, air_date, starts_at, duration_minutes, ad_minutes, capacity, booked_slots";

/// Canonicalised show fields ready to be stored.
#[derive(Debug, Clone)]
pub struct ShowRecord<'a> {
    pub name: &'a str,
    pub category: &'a str,
    pub window_start: String,
    pub window_end: String,
    pub recurrence: String,
    pub price_per_minute_cents: i64,
}

pub async fn insert_show(conn: &mut SqliteConnection, rec: &ShowRecord<'_>) -> sqlx::Result<i64> {
    let row = sqlx::query(
        "INSERT INTO shows (name, category, window_start, window_end, recurrence, price_per_minute_cents, active) \
         VALUES (?, ?, ?, ?, ?, ?, 1) RETURNING id",
    )
    .bind(rec.name)
    .bind(rec.category)
    .bind(&rec.window_start)
    .bind(&rec.window_end)
    .bind(&rec.recurrence)
    .bind(rec.price_per_minute_cents)
    .fetch_one(conn)
    .await?;
    Ok(row.get("id"))
}

pub async fn update_show(
    conn: &mut SqliteConnection,
    id: i64,
    rec: &ShowRecord<'_>,
) -> sqlx::Result<bool> {
    let res = sqlx::query(
        "UPDATE shows SET name = ?, category = ?, window_start = ?, window_end = ?, recurrence = ?, \
         price_per_minute_cents = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(rec.name)
    .bind(rec.category)
    .bind(&rec.window_start)
    .bind(&rec.window_end)
    .bind(&rec.recurrence)
    .bind(rec.price_per_minute_cents)
    .bind(id)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn set_show_active<'e>(
    ex: impl SqliteExecutor<'e>,
    id: i64,
    active: bool,
) -> sqlx::Result<bool> {
    let res = sqlx::query("UPDATE shows SET active = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(active)
        .bind(id)
        .execute(ex)
        .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn fetch_show<'e>(ex: impl SqliteExecutor<'e>, id: i64) -> sqlx::Result<Option<Show>> {
    sqlx::query_as::<_, Show>(&format!("SELECT {SHOW_COLUMNS} FROM shows WHERE id = ?"))
        .bind(id)
        .fetch_optional(ex)
        .await
}

pub async fn list_active_shows<'e>(ex: impl SqliteExecutor<'e>) -> sqlx::Result<Vec<Show>> {
    sqlx::query_as::<_, Show>(&format!(
        "SELECT {SHOW_COLUMNS} FROM shows WHERE active = 1 ORDER BY id"
    ))
    .fetch_all(ex)
    .await
}

#[derive(Debug, Clone)]
pub struct BroadcastRecord {
    pub show_id: i64,
    pub air_date: NaiveDate,
    pub starts_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub ad_minutes: i64,
    pub capacity: i64,
}

pub async fn insert_broadcast(
    conn: &mut SqliteConnection,
    rec: &BroadcastRecord,
) -> sqlx::Result<i64> {
    let row = sqlx::query(
        "INSERT INTO broadcasts (show_id, air_date, starts_at, duration_minutes, ad_minutes, capacity, booked_slots) \
         VALUES (?, ?, ?, ?, ?, ?, 0) RETURNING id",
    )
    .bind(rec.show_id)
    .bind(rec.air_date)
    .bind(rec.starts_at)
    .bind(rec.duration_minutes)
    .bind(rec.ad_minutes)
    .bind(rec.capacity)
    .fetch_one(conn)
    .await?;
    Ok(row.get("id"))
}

pub async fn fetch_broadcast<'e>(
    ex: impl SqliteExecutor<'e>,
    id: i64,
) -> sqlx::Result<Option<Broadcast>> {
    sqlx::query_as::<_, Broadcast>(&format!(
        "SELECT {BROADCAST_COLUMNS} FROM broadcasts WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(ex)
    .await
}

/// Broadcasts of `show_id` that start after `after`.
pub async fn upcoming_broadcasts_of_show<'e>(
    ex: impl SqliteExecutor<'e>,
    show_id: i64,
    after: DateTime<Utc>,
) -> sqlx::Result<Vec<Broadcast>> {
    sqlx::query_as::<_, Broadcast>(&format!(
        "SELECT {BROADCAST_COLUMNS} FROM broadcasts WHERE show_id = ? AND starts_at > ? ORDER BY air_date"
    ))
    .bind(show_id)
    .bind(after)
    .fetch_all(ex)
    .await
}

pub async fn set_broadcast_start(
    conn: &mut SqliteConnection,
    id: i64,
    starts_at: DateTime<Utc>,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE broadcasts SET starts_at = ? WHERE id = ?")
        .bind(starts_at)
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Update the budget fields unless the new capacity would drop below the
/// slots already booked.
pub async fn update_broadcast_limits<'e>(
    ex: impl SqliteExecutor<'e>,
    id: i64,
    capacity: i64,
    ad_minutes: i64,
    duration_minutes: i64,
) -> sqlx::Result<bool> {
    let res = sqlx::query(
        "UPDATE broadcasts SET capacity = ?, ad_minutes = ?, duration_minutes = ? \
         WHERE id = ? AND booked_slots <= ?",
    )
    .bind(capacity)
    .bind(ad_minutes)
    .bind(duration_minutes)
    .bind(id)
    .bind(capacity)
    .execute(ex)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn delete_unbooked_broadcast(conn: &mut SqliteConnection, id: i64) -> sqlx::Result<bool> {
    let res = sqlx::query("DELETE FROM broadcasts WHERE id = ? AND booked_slots = 0")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(res.rows_affected() == 1)
}

/// Bookable broadcast with the display fields of its show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct BroadcastListing {
    #[sqlx(flatten)]
    pub broadcast: Broadcast,
    pub show_name: String,
    pub show_window: String,
    pub price_per_minute_cents: i64,
}

pub async fn broadcasts_on<'e>(
    ex: impl SqliteExecutor<'e>,
    date: NaiveDate,
    after: DateTime<Utc>,
) -> sqlx::Result<Vec<BroadcastListing>> {
    sqlx::query_as::<_, BroadcastListing>(
        "SELECT b.id, b.show_id, b.air_date, b.starts_at, b.duration_minutes, b.ad_minutes, \
                b.capacity, b.booked_slots, s.name AS show_name, \
                s.window_start || '-' || s.window_end AS show_window, s.price_per_minute_cents \
         FROM broadcasts b JOIN shows s ON s.id = b.show_id \
         WHERE b.air_date = ? AND b.starts_at > ? \
         ORDER BY b.starts_at, b.id",
    )
    .bind(date)
    .bind(after)
    .fetch_all(ex)
    .await
}

/// Take one slot if one is free. Returns false at capacity.
pub async fn reserve_slot(conn: &mut SqliteConnection, id: i64) -> sqlx::Result<bool> {
    let res = sqlx::query(
        "UPDATE broadcasts SET booked_slots = booked_slots + 1 WHERE id = ? AND booked_slots < capacity",
    )
    .bind(id)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Give one slot back. Returns false if the counter was already zero.
pub async fn release_slot(conn: &mut SqliteConnection, id: i64) -> sqlx::Result<bool> {
    let res = sqlx::query(
        "UPDATE broadcasts SET booked_slots = booked_slots - 1 WHERE id = ? AND booked_slots > 0",
    )
    .bind(id)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}
