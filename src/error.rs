//! Typed failures returned by the catalog, schedule and lifecycle
//! operations.
//!
//! Guard and race failures are ordinary results the caller can act on. Only
//! persistence faults end up in [`BookingError::Internal`].
use crate::model::{ApplicationStatus, ContractStatus, Role};
use crate::schedule::ShowConflict;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tracing::{error, warn};

pub type BookingResult<T> = Result<T, BookingError>;

#[derive(Debug, Error)]
pub enum BookingError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("precondition failed: {0}")]
    Precondition(#[from] Precondition),
    #[error("conflict: {0}")]
    Conflict(#[from] Conflict),
    #[error("not allowed: {0}")]
    Authorization(#[from] Denied),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Precondition {
    #[error("customer {customer_id} has no payout details on file")]
    PayoutDetailsMissing { customer_id: i64 },
    #[error("broadcast {broadcast_id} started at {starts_at}")]
    ScheduleInPast {
        broadcast_id: i64,
        starts_at: DateTime<Utc>,
    },
    #[error("show {show_id} would start at {starts_at}, which has passed")]
    BroadcastStartInPast {
        show_id: i64,
        starts_at: DateTime<Utc>,
    },
    #[error("broadcast {broadcast_id} has no free slot ({booked}/{capacity} booked)")]
    SlotUnavailable {
        broadcast_id: i64,
        capacity: i64,
        booked: i64,
    },
    #[error("broadcast {broadcast_id} is at capacity ({booked}/{capacity} booked)")]
    CapacityExceeded {
        broadcast_id: i64,
        capacity: i64,
        booked: i64,
    },
    #[error("broadcast {broadcast_id} capacity {requested} is below its {booked} booked slots")]
    CapacityBelowBooked {
        broadcast_id: i64,
        requested: i64,
        booked: i64,
    },
    #[error("broadcast {broadcast_id} is referenced by {applications} application(s)")]
    BroadcastInUse {
        broadcast_id: i64,
        applications: i64,
    },
    #[error("show {show_id} is inactive")]
    ShowInactive { show_id: i64 },
    #[error("show {show_id} does not air on {date} ({recurrence})")]
    DateNotInRecurrence {
        show_id: i64,
        date: NaiveDate,
        recurrence: String,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Conflict {
    #[error("application {application_id} is already claimed by {holder}")]
    AlreadyClaimed { application_id: i64, holder: i64 },
    #[error("application {application_id} is {actual}, expected one of {expected:?}")]
    StateMismatch {
        application_id: i64,
        expected: &'static [ApplicationStatus],
        actual: ApplicationStatus,
    },
    #[error("contract {contract_id} is already {current:?}")]
    ContractRegression {
        contract_id: i64,
        current: ContractStatus,
    },
    #[error("overlaps show {} \"{}\" ({} {})", .0.show_id, .0.name, .0.window, .0.recurrence)]
    ShowOverlap(ShowConflict),
    #[error("show {show_id} already has a broadcast on {air_date}")]
    DuplicateBroadcast { show_id: i64, air_date: NaiveDate },
    #[error("storage is busy with another writer; retry")]
    Busy,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Denied {
    #[error("user {user_id} does not own application {application_id}")]
    NotOwner { application_id: i64, user_id: i64 },
    #[error("application {application_id} is {status} and can no longer be cancelled")]
    NotCancellable {
        application_id: i64,
        status: ApplicationStatus,
    },
    #[error("role {role} may not {action}")]
    RoleNotPermitted { role: Role, action: &'static str },
}

impl BookingError {
    pub fn validation(msg: impl Into<String>) -> Self {
        BookingError::Validation(msg.into())
    }

    pub fn not_found(entity: &'static str, id: i64) -> Self {
        BookingError::NotFound { entity, id }
    }

    /// Wrap an unexpected fault, logging it once at the boundary.
    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        let err = err.into();
        error!(?err, "persistence fault");
        BookingError::Internal(err)
    }
}

impl From<sqlx::Error> for BookingError {
    fn from(err: sqlx::Error) -> Self {
        if is_busy(&err) {
            warn!(?err, "write lock not acquired");
            return Conflict::Busy.into();
        }
        BookingError::internal(err)
    }
}

/// `SQLITE_BUSY` or `SQLITE_LOCKED`, including their extended codes.
fn is_busy(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db) = err else {
        return false;
    };
    db.code()
        .and_then(|code| code.parse::<i32>().ok())
        .is_some_and(|code| matches!(code & 0xff, 5 | 6))
}

impl From<serde_json::Error> for BookingError {
    fn from(err: serde_json::Error) -> Self {
        BookingError::internal(err)
    }
}

/// Fail unless `actor_role` is one of `allowed`.
pub fn require_role(actor_role: Role, allowed: &[Role], action: &'static str) -> BookingResult<()> {
    if allowed.contains(&actor_role) {
        Ok(())
    } else {
        Err(Denied::RoleNotPermitted {
            role: actor_role,
            action,
        }
        .into())
    }
}
