//! Role-scoped listing. The role scope is merged with the caller's filter
//! before any SQL runs, so a filter can narrow a scope but never widen it.
use crate::db::model::{DueFilter, ListQuery};
use crate::model::{Actor, Application, ApplicationStatus, Role};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Caller-supplied listing filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationFilter {
    pub status: Option<ApplicationStatus>,
    pub agent_id: Option<i64>,
    pub customer_id: Option<i64>,
    pub air_date_from: Option<NaiveDate>,
    pub air_date_to: Option<NaiveDate>,
}

const COMMERCIAL_SCOPE: &[ApplicationStatus] = &[
    ApplicationStatus::SentToCommercial,
    ApplicationStatus::Approved,
    ApplicationStatus::Paid,
];

const ACCOUNTING_SCOPE: &[ApplicationStatus] = &[ApplicationStatus::Approved, ApplicationStatus::Paid];

/// Statuses the role may see at all; `None` means every status.
fn role_scope(role: Role) -> Option<&'static [ApplicationStatus]> {
    match role {
        Role::Commercial => Some(COMMERCIAL_SCOPE),
        Role::Accountant => Some(ACCOUNTING_SCOPE),
        Role::Customer | Role::Agent | Role::Admin | Role::Director => None,
    }
}

/// Merge `actor`'s scope with `filter` into a query.
pub fn resolve(actor: Actor, filter: &ApplicationFilter, now: DateTime<Utc>) -> ListQuery {
    let mut q = ListQuery {
        agent_id: filter.agent_id,
        customer_id: filter.customer_id,
        air_date_from: filter.air_date_from,
        air_date_to: filter.air_date_to,
        ..ListQuery::default()
    };

    let requested = filter.status.map(|status| match status {
        ApplicationStatus::Overdue => {
            q.due = DueFilter::PastDue(now);
            ApplicationStatus::Approved
        }
        ApplicationStatus::Approved => {
            q.due = DueFilter::NotDue(now);
            ApplicationStatus::Approved
        }
        other => other,
    });

    q.statuses = match (role_scope(actor.role), requested) {
        (None, None) => None,
        (None, Some(s)) => Some(vec![s]),
        (Some(scope), None) => Some(scope.to_vec()),
        (Some(scope), Some(s)) => Some(if scope.contains(&s) { vec![s] } else { Vec::new() }),
    };

    match actor.role {
        Role::Customer => {
            if filter.customer_id.is_some_and(|id| id != actor.user_id) {
                q.statuses = Some(Vec::new());
            }
            q.customer_id = Some(actor.user_id);
        }
        Role::Agent => q.unclaimed_or_agent = Some(actor.user_id),
        Role::Commercial => q.exclude_rejected = true,
        _ => {}
    }
    q
}

/// The commercial queue: whatever the filter says, rejected applications
/// are never included.
pub fn commercial_queue(filter: &ApplicationFilter, now: DateTime<Utc>) -> ListQuery {
    let mut q = resolve(Actor::new(0, Role::Commercial), filter, now);
    q.exclude_rejected = true;
    q
}

/// Whether `actor` may see `app` individually. Mirrors [`resolve`].
pub fn can_view(actor: Actor, app: &Application) -> bool {
    let status = app.state.status();
    match actor.role {
        Role::Customer => app.customer_id == actor.user_id,
        Role::Agent => {
            status == ApplicationStatus::Pending || app.state.agent_id() == Some(actor.user_id)
        }
        role => role_scope(role).map_or(true, |scope| scope.contains(&status)),
    }
}
