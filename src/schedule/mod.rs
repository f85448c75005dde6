//! Schedule engine: show time-window uniqueness and broadcast capacity.
//!
//! Callers never write `booked_slots`. The lifecycle takes and returns
//! slots through [`try_reserve`] and [`release`] inside its own
//! transaction, so a failed reservation rolls the status change back too.
pub mod window;

pub use window::{find_conflict, Recurrence, ShowConflict, TimeWindow};

use crate::db::catalog::{self as repo, BroadcastListing, BroadcastRecord};
use crate::db::{applications, Pool};
use crate::error::{require_role, BookingError, BookingResult, Conflict, Precondition};
use crate::model::{Actor, Broadcast, Role};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::SqliteConnection;
use tracing::{info, instrument, warn};

pub(crate) const SCHEDULE_EDITORS: &[Role] = &[Role::Commercial, Role::Admin];

/// Longest a broadcast, and so its ad budget, can run.
pub const MAX_BROADCAST_MINUTES: i64 = 24 * 60;

/// Advisory conflict preview for a proposed window. Nothing is saved; the
/// caller decides whether to go ahead, and the save re-checks.
#[instrument(skip(pool))]
pub async fn check_conflict(
    pool: &Pool,
    window: &str,
    recurrence: &str,
    exclude_show: Option<i64>,
) -> BookingResult<Option<ShowConflict>> {
    let window = TimeWindow::parse(window)?;
    let recurrence = Recurrence::parse(recurrence)?;
    let shows = repo::list_active_shows(pool).await?;
    Ok(find_conflict(&window, &recurrence, &shows, exclude_show))
}

#[derive(Debug, Clone)]
pub struct BroadcastDraft {
    pub show_id: i64,
    pub air_date: NaiveDate,
    /// Defaults to the length of the show's window.
    pub duration_minutes: Option<i64>,
    pub ad_minutes: i64,
    pub capacity: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct BroadcastLimits {
    pub capacity: i64,
    pub ad_minutes: i64,
    pub duration_minutes: i64,
}

fn validate_limits(limits: &BroadcastLimits) -> BookingResult<()> {
    if limits.capacity < 0 {
        return Err(BookingError::validation("capacity must be >= 0"));
    }
    if !(1..=MAX_BROADCAST_MINUTES).contains(&limits.duration_minutes) {
        return Err(BookingError::validation(format!(
            "duration_minutes must be between 1 and {MAX_BROADCAST_MINUTES}"
        )));
    }
    if limits.ad_minutes <= 0 || limits.ad_minutes > limits.duration_minutes {
        return Err(BookingError::validation(
            "ad_minutes must be > 0 and fit within the broadcast duration",
        ));
    }
    Ok(())
}

#[instrument(skip(pool, draft), fields(show_id = draft.show_id, air_date = %draft.air_date))]
pub async fn create_broadcast(
    pool: &Pool,
    actor: Actor,
    draft: BroadcastDraft,
    now: DateTime<Utc>,
) -> BookingResult<Broadcast> {
    require_role(actor.role, SCHEDULE_EDITORS, "create broadcasts")?;

    let show = repo::fetch_show(pool, draft.show_id)
        .await?
        .ok_or_else(|| BookingError::not_found("show", draft.show_id))?;
    if !show.active {
        return Err(Precondition::ShowInactive { show_id: show.id }.into());
    }
    let window = TimeWindow::parse(&show.time_window)?;
    let recurrence = Recurrence::parse(&show.recurrence)?;
    if !recurrence.runs_on(draft.air_date) {
        return Err(Precondition::DateNotInRecurrence {
            show_id: show.id,
            date: draft.air_date,
            recurrence: show.recurrence.clone(),
        }
        .into());
    }

    let limits = BroadcastLimits {
        capacity: draft.capacity,
        ad_minutes: draft.ad_minutes,
        duration_minutes: draft
            .duration_minutes
            .unwrap_or_else(|| (window.end - window.start).num_minutes()),
    };
    validate_limits(&limits)?;

    let starts_at = draft.air_date.and_time(window.start).and_utc();
    if starts_at <= now {
        return Err(Precondition::BroadcastStartInPast {
            show_id: show.id,
            starts_at,
        }
        .into());
    }

    let record = BroadcastRecord {
        show_id: show.id,
        air_date: draft.air_date,
        starts_at,
        duration_minutes: limits.duration_minutes,
        ad_minutes: limits.ad_minutes,
        capacity: limits.capacity,
    };
    let mut tx = pool.begin().await?;
    let id = match repo::insert_broadcast(&mut tx, &record).await {
        Ok(id) => id,
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            return Err(Conflict::DuplicateBroadcast {
                show_id: show.id,
                air_date: draft.air_date,
            }
            .into());
        }
        Err(err) => return Err(err.into()),
    };
    tx.commit().await?;
    info!(broadcast_id = id, capacity = limits.capacity, "created broadcast");
    get_broadcast(pool, id).await
}

/// Replace a broadcast's capacity and ad budget. Capacity may shrink, but
/// never below the slots already booked.
#[instrument(skip(pool))]
pub async fn update_broadcast(
    pool: &Pool,
    actor: Actor,
    id: i64,
    limits: BroadcastLimits,
) -> BookingResult<Broadcast> {
    require_role(actor.role, SCHEDULE_EDITORS, "edit broadcasts")?;
    validate_limits(&limits)?;

    let updated = repo::update_broadcast_limits(
        pool,
        id,
        limits.capacity,
        limits.ad_minutes,
        limits.duration_minutes,
    )
    .await?;
    if !updated {
        let current = get_broadcast(pool, id).await?;
        return Err(Precondition::CapacityBelowBooked {
            broadcast_id: id,
            requested: limits.capacity,
            booked: current.booked_slots,
        }
        .into());
    }
    get_broadcast(pool, id).await
}

/// Delete a broadcast nobody has booked or applied for.
#[instrument(skip(pool))]
pub async fn delete_broadcast(pool: &Pool, actor: Actor, id: i64) -> BookingResult<()> {
    require_role(actor.role, SCHEDULE_EDITORS, "delete broadcasts")?;

    let mut tx = pool.begin().await?;
    let referencing = applications::count_for_broadcast(&mut *tx, id).await?;
    if referencing > 0 {
        return Err(Precondition::BroadcastInUse {
            broadcast_id: id,
            applications: referencing,
        }
        .into());
    }
    if !repo::delete_unbooked_broadcast(&mut tx, id).await? {
        return match repo::fetch_broadcast(&mut *tx, id).await? {
            None => Err(BookingError::not_found("broadcast", id)),
            Some(b) => Err(Precondition::BroadcastInUse {
                broadcast_id: id,
                applications: b.booked_slots,
            }
            .into()),
        };
    }
    tx.commit().await?;
    info!(broadcast_id = id, "deleted broadcast");
    Ok(())
}

pub async fn get_broadcast(pool: &Pool, id: i64) -> BookingResult<Broadcast> {
    repo::fetch_broadcast(pool, id)
        .await?
        .ok_or_else(|| BookingError::not_found("broadcast", id))
}

/// Broadcasts airing on `date` that have not started yet as of `now`.
#[instrument(skip(pool))]
pub async fn bookable_on(
    pool: &Pool,
    date: NaiveDate,
    now: DateTime<Utc>,
) -> BookingResult<Vec<BroadcastListing>> {
    Ok(repo::broadcasts_on(pool, date, now).await?)
}

/// Take one slot on `broadcast_id`, bounded by its capacity.
pub(crate) async fn try_reserve(conn: &mut SqliteConnection, broadcast_id: i64) -> BookingResult<()> {
    if repo::reserve_slot(conn, broadcast_id).await? {
        return Ok(());
    }
    let current = repo::fetch_broadcast(&mut *conn, broadcast_id)
        .await?
        .ok_or_else(|| BookingError::not_found("broadcast", broadcast_id))?;
    Err(Precondition::CapacityExceeded {
        broadcast_id,
        capacity: current.capacity,
        booked: current.booked_slots,
    }
    .into())
}

/// Return one slot. A counter already at zero stays at zero.
pub(crate) async fn release(conn: &mut SqliteConnection, broadcast_id: i64) -> BookingResult<()> {
    if !repo::release_slot(conn, broadcast_id).await? {
        warn!(broadcast_id, "slot release on a broadcast with no booked slots; clamped at zero");
    }
    Ok(())
}
