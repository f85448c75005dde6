//! Pure transition rules. Each function takes the current state and the
//! acting user and returns the next state or the typed reason it is not
//! allowed. Nothing here touches storage, so the same rules are replayed
//! against a fresh read when a compare-and-set loses a race.
use crate::error::{BookingResult, Conflict, Denied};
use crate::model::{Actor, ApplicationState, ApplicationStatus};
use chrono::{DateTime, Duration, Utc};

/// A requested lifecycle step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Claim,
    HandOff,
    CommercialClaim,
    Approve { now: DateTime<Utc>, due_days: i64 },
    Reject,
    Reverse { now: DateTime<Utc> },
    MarkPaid { now: DateTime<Utc> },
}

impl Transition {
    /// Stored statuses this step may start from.
    pub fn sources(&self) -> &'static [ApplicationStatus] {
        match self {
            Transition::Claim => &[ApplicationStatus::Pending],
            Transition::HandOff => &[ApplicationStatus::InProgress],
            Transition::CommercialClaim | Transition::Approve { .. } | Transition::Reject => {
                &[ApplicationStatus::SentToCommercial]
            }
            Transition::Reverse { .. } | Transition::MarkPaid { .. } => {
                &[ApplicationStatus::Approved]
            }
        }
    }
}

fn mismatch(application_id: i64, t: &Transition, state: &ApplicationState) -> Conflict {
    Conflict::StateMismatch {
        application_id,
        expected: t.sources(),
        actual: state.status(),
    }
}

fn not_owner(application_id: i64, actor: Actor) -> Denied {
    Denied::NotOwner {
        application_id,
        user_id: actor.user_id,
    }
}

/// Compute the state after applying `t` on behalf of `actor`.
pub fn next_state(
    application_id: i64,
    current: &ApplicationState,
    t: Transition,
    actor: Actor,
) -> BookingResult<ApplicationState> {
    use ApplicationState as S;

    let next = match (t, *current) {
        (Transition::Claim, S::Pending) => S::InProgress {
            agent_id: actor.user_id,
        },
        // Once an agent holds the application it stays theirs, whatever
        // happened to it after the claim.
        (Transition::Claim, state) => {
            return Err(match state.agent_id() {
                Some(holder) => Conflict::AlreadyClaimed {
                    application_id,
                    holder,
                },
                None => mismatch(application_id, &t, &state),
            }
            .into())
        }

        (Transition::HandOff, S::InProgress { agent_id }) => {
            if agent_id != actor.user_id {
                return Err(not_owner(application_id, actor).into());
            }
            S::SentToCommercial {
                agent_id,
                commercial_id: None,
            }
        }

        (
            Transition::CommercialClaim,
            S::SentToCommercial {
                agent_id,
                commercial_id,
            },
        ) => match commercial_id {
            None => S::SentToCommercial {
                agent_id,
                commercial_id: Some(actor.user_id),
            },
            Some(holder) => {
                return Err(Conflict::AlreadyClaimed {
                    application_id,
                    holder,
                }
                .into())
            }
        },

        (
            Transition::Approve { now, due_days },
            S::SentToCommercial {
                agent_id,
                commercial_id,
            },
        ) => {
            owned_by_or_free(application_id, commercial_id, actor)?;
            S::Approved {
                agent_id,
                commercial_id: actor.user_id,
                approved_at: now,
                due_at: now + Duration::days(due_days),
            }
        }

        (
            Transition::Reject,
            S::SentToCommercial {
                agent_id,
                commercial_id,
            },
        ) => {
            owned_by_or_free(application_id, commercial_id, actor)?;
            S::Rejected {
                agent_id,
                commercial_id: actor.user_id,
                reversed_at: None,
            }
        }

        (
            Transition::Reverse { now },
            S::Approved {
                agent_id,
                commercial_id,
                ..
            },
        ) => S::Rejected {
            agent_id,
            commercial_id,
            reversed_at: Some(now),
        },

        (
            Transition::MarkPaid { now },
            S::Approved {
                agent_id,
                commercial_id,
                ..
            },
        ) => S::Paid {
            agent_id,
            commercial_id,
            paid_at: now,
        },

        (t, state) => return Err(mismatch(application_id, &t, &state).into()),
    };
    Ok(next)
}

/// A commercial verdict is allowed from the commercial who picked the
/// application up, or from any commercial while nobody has.
fn owned_by_or_free(
    application_id: i64,
    commercial_id: Option<i64>,
    actor: Actor,
) -> BookingResult<()> {
    match commercial_id {
        Some(owner) if owner != actor.user_id => Err(not_owner(application_id, actor).into()),
        _ => Ok(()),
    }
}
