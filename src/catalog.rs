//! Show catalog: the recurring programs broadcasts are created from.
use crate::db::catalog::{self as repo, ShowRecord};
use crate::db::Pool;
use crate::error::{require_role, BookingError, BookingResult, Conflict, Precondition};
use crate::model::{Actor, Show};
use crate::schedule::{find_conflict, Recurrence, TimeWindow, SCHEDULE_EDITORS};
use chrono::{DateTime, Utc};
use tracing::{info, instrument};

/// Upper bound on a show's price, in cents per minute.
pub const MAX_PRICE_PER_MINUTE_CENTS: i64 = 100_000_000_000;

#[derive(Debug, Clone)]
pub struct ShowDraft {
    pub name: String,
    pub category: String,
    pub window: String,
    pub recurrence: String,
    pub price_per_minute_cents: i64,
}

struct ValidDraft<'a> {
    window: TimeWindow,
    recurrence: Recurrence,
    record: ShowRecord<'a>,
}

fn validate(draft: &ShowDraft) -> BookingResult<ValidDraft<'_>> {
    if draft.name.trim().is_empty() {
        return Err(BookingError::validation("show name must be non-empty"));
    }
    if draft.category.trim().is_empty() {
        return Err(BookingError::validation("show category must be non-empty"));
    }
    if !(0..=MAX_PRICE_PER_MINUTE_CENTS).contains(&draft.price_per_minute_cents) {
        return Err(BookingError::validation(format!(
            "price per minute must be between 0 and {MAX_PRICE_PER_MINUTE_CENTS} cents"
        )));
    }
    let window = TimeWindow::parse(&draft.window)?;
    let recurrence = Recurrence::parse(&draft.recurrence)?;
    let record = ShowRecord {
        name: draft.name.trim(),
        category: draft.category.trim(),
        window_start: window.start.format("%H:%M").to_string(),
        window_end: window.end.format("%H:%M").to_string(),
        recurrence: recurrence.to_string(),
        price_per_minute_cents: draft.price_per_minute_cents,
    };
    Ok(ValidDraft {
        window,
        recurrence,
        record,
    })
}

/// Save a new show. The overlap check runs again inside the write
/// transaction; a preview from `schedule::check_conflict` is not enough.
#[instrument(skip(pool, draft), fields(name = %draft.name))]
pub async fn create_show(pool: &Pool, actor: Actor, draft: ShowDraft) -> BookingResult<Show> {
    require_role(actor.role, SCHEDULE_EDITORS, "edit the show catalog")?;
    let valid = validate(&draft)?;

    let mut tx = pool.begin().await?;
    let active = repo::list_active_shows(&mut *tx).await?;
    if let Some(conflict) = find_conflict(&valid.window, &valid.recurrence, &active, None) {
        return Err(Conflict::ShowOverlap(conflict).into());
    }
    let id = repo::insert_show(&mut tx, &valid.record).await?;
    tx.commit().await?;

    info!(show_id = id, window = %valid.window, "created show");
    get_show(pool, id).await
}

/// Edit a show. Broadcasts that have not aired yet follow the new window;
/// a recurrence that no longer covers one of them is refused.
#[instrument(skip(pool, draft))]
pub async fn update_show(
    pool: &Pool,
    actor: Actor,
    id: i64,
    draft: ShowDraft,
    now: DateTime<Utc>,
) -> BookingResult<Show> {
    require_role(actor.role, SCHEDULE_EDITORS, "edit the show catalog")?;
    let valid = validate(&draft)?;

    let mut tx = pool.begin().await?;
    let current = repo::fetch_show(&mut *tx, id)
        .await?
        .ok_or_else(|| BookingError::not_found("show", id))?;
    if current.active {
        let active = repo::list_active_shows(&mut *tx).await?;
        if let Some(conflict) = find_conflict(&valid.window, &valid.recurrence, &active, Some(id))
        {
            return Err(Conflict::ShowOverlap(conflict).into());
        }
    }
    let upcoming = repo::upcoming_broadcasts_of_show(&mut *tx, id, now).await?;
    if let Some(orphan) = upcoming
        .iter()
        .find(|b| !valid.recurrence.runs_on(b.air_date))
    {
        return Err(Precondition::DateNotInRecurrence {
            show_id: id,
            date: orphan.air_date,
            recurrence: valid.record.recurrence.clone(),
        }
        .into());
    }
    repo::update_show(&mut tx, id, &valid.record).await?;
    let mut moved = 0;
    for b in &upcoming {
        let starts_at = b.air_date.and_time(valid.window.start).and_utc();
        if starts_at != b.starts_at {
            repo::set_broadcast_start(&mut tx, b.id, starts_at).await?;
            moved += 1;
        }
    }
    tx.commit().await?;

    info!(show_id = id, window = %valid.window, moved, "updated show");
    get_show(pool, id).await
}

/// Activate or deactivate a show. Reactivation is refused if another active
/// show has taken the slot in the meantime.
#[instrument(skip(pool))]
pub async fn set_show_active(
    pool: &Pool,
    actor: Actor,
    id: i64,
    active: bool,
) -> BookingResult<Show> {
    require_role(actor.role, SCHEDULE_EDITORS, "edit the show catalog")?;

    let mut tx = pool.begin().await?;
    let current = repo::fetch_show(&mut *tx, id)
        .await?
        .ok_or_else(|| BookingError::not_found("show", id))?;
    if active && !current.active {
        let window = TimeWindow::parse(&current.time_window)?;
        let recurrence = Recurrence::parse(&current.recurrence)?;
        let others = repo::list_active_shows(&mut *tx).await?;
        if let Some(conflict) = find_conflict(&window, &recurrence, &others, Some(id)) {
            return Err(Conflict::ShowOverlap(conflict).into());
        }
    }
    repo::set_show_active(&mut *tx, id, active).await?;
    tx.commit().await?;
    info!(show_id = id, active, "changed show activation");
    get_show(pool, id).await
}

pub async fn get_show(pool: &Pool, id: i64) -> BookingResult<Show> {
    repo::fetch_show(pool, id)
        .await?
        .ok_or_else(|| BookingError::not_found("show", id))
}

pub async fn list_active_shows(pool: &Pool) -> BookingResult<Vec<Show>> {
    Ok(repo::list_active_shows(pool).await?)
}

/// Quote for an ad of `duration_secs` at the show's per-minute price,
/// rounded up to the cent.
pub fn quote_cents(price_per_minute_cents: i64, duration_secs: i64) -> BookingResult<i64> {
    price_per_minute_cents
        .checked_mul(duration_secs)
        .and_then(|c| c.checked_add(59))
        .map(|c| c / 60)
        .ok_or_else(|| {
            BookingError::validation(format!(
                "price of {duration_secs}s at {price_per_minute_cents} cents per minute is out of range"
            ))
        })
}
