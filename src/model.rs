use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Dashboard roles. Supplied by the identity collaborator and trusted as-is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Agent,
    Commercial,
    Accountant,
    Admin,
    Director,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Agent => "agent",
            Role::Commercial => "commercial",
            Role::Accountant => "accountant",
            Role::Admin => "admin",
            Role::Director => "director",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The acting user of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: i64,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: i64, role: Role) -> Self {
        Self { user_id, role }
    }
}

/// Status as shown to callers. `Overdue` is never stored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Pending,
    InProgress,
    SentToCommercial,
    Approved,
    Rejected,
    Paid,
    Overdue,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::Pending => "pending",
            ApplicationStatus::InProgress => "in_progress",
            ApplicationStatus::SentToCommercial => "sent_to_commercial",
            ApplicationStatus::Approved => "approved",
            ApplicationStatus::Rejected => "rejected",
            ApplicationStatus::Paid => "paid",
            ApplicationStatus::Overdue => "overdue",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ApplicationStatus::Pending),
            "in_progress" => Some(ApplicationStatus::InProgress),
            "sent_to_commercial" => Some(ApplicationStatus::SentToCommercial),
            "approved" => Some(ApplicationStatus::Approved),
            "rejected" => Some(ApplicationStatus::Rejected),
            "paid" => Some(ApplicationStatus::Paid),
            "overdue" => Some(ApplicationStatus::Overdue),
            _ => None,
        }
    }

    /// Customer cancellation is allowed until commercial renders a verdict.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            ApplicationStatus::Pending
                | ApplicationStatus::InProgress
                | ApplicationStatus::SentToCommercial
        )
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of one application. Assignees live inside the variant
/// that requires them, so e.g. an approved application without an agent
/// cannot be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApplicationState {
    Pending,
    InProgress {
        agent_id: i64,
    },
    SentToCommercial {
        agent_id: i64,
        commercial_id: Option<i64>,
    },
    Approved {
        agent_id: i64,
        commercial_id: i64,
        approved_at: DateTime<Utc>,
        due_at: DateTime<Utc>,
    },
    Rejected {
        agent_id: i64,
        commercial_id: i64,
        reversed_at: Option<DateTime<Utc>>,
    },
    Paid {
        agent_id: i64,
        commercial_id: i64,
        paid_at: DateTime<Utc>,
    },
}

/// Flat column set an [`ApplicationState`] is persisted as.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateColumns {
    pub status: &'static str,
    pub agent_id: Option<i64>,
    pub commercial_id: Option<i64>,
    pub approved_at: Option<DateTime<Utc>>,
    pub due_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub reversed_at: Option<DateTime<Utc>>,
}

impl ApplicationState {
    /// The stored status; never `Overdue`.
    pub fn status(&self) -> ApplicationStatus {
        match self {
            ApplicationState::Pending => ApplicationStatus::Pending,
            ApplicationState::InProgress { .. } => ApplicationStatus::InProgress,
            ApplicationState::SentToCommercial { .. } => ApplicationStatus::SentToCommercial,
            ApplicationState::Approved { .. } => ApplicationStatus::Approved,
            ApplicationState::Rejected { .. } => ApplicationStatus::Rejected,
            ApplicationState::Paid { .. } => ApplicationStatus::Paid,
        }
    }

    /// Status as of `now`: an approved application past its due date reads
    /// as overdue.
    pub fn effective_status(&self, now: DateTime<Utc>) -> ApplicationStatus {
        match self {
            ApplicationState::Approved { due_at, .. } if *due_at < now => {
                ApplicationStatus::Overdue
            }
            other => other.status(),
        }
    }

    pub fn agent_id(&self) -> Option<i64> {
        match *self {
            ApplicationState::Pending => None,
            ApplicationState::InProgress { agent_id }
            | ApplicationState::SentToCommercial { agent_id, .. }
            | ApplicationState::Approved { agent_id, .. }
            | ApplicationState::Rejected { agent_id, .. }
            | ApplicationState::Paid { agent_id, .. } => Some(agent_id),
        }
    }

    pub fn commercial_id(&self) -> Option<i64> {
        match *self {
            ApplicationState::Pending | ApplicationState::InProgress { .. } => None,
            ApplicationState::SentToCommercial { commercial_id, .. } => commercial_id,
            ApplicationState::Approved { commercial_id, .. }
            | ApplicationState::Rejected { commercial_id, .. }
            | ApplicationState::Paid { commercial_id, .. } => Some(commercial_id),
        }
    }

    pub fn to_columns(&self) -> StateColumns {
        let mut cols = StateColumns {
            status: self.status().as_str(),
            agent_id: self.agent_id(),
            commercial_id: self.commercial_id(),
            ..Default::default()
        };
        match *self {
            ApplicationState::Approved {
                approved_at, due_at, ..
            } => {
                cols.approved_at = Some(approved_at);
                cols.due_at = Some(due_at);
            }
            ApplicationState::Rejected { reversed_at, .. } => cols.reversed_at = reversed_at,
            ApplicationState::Paid { paid_at, .. } => cols.paid_at = Some(paid_at),
            _ => {}
        }
        cols
    }

    /// Rebuild the state from stored columns. Returns `None` for column
    /// combinations no transition can produce.
    pub fn from_columns(
        status: &str,
        agent_id: Option<i64>,
        commercial_id: Option<i64>,
        approved_at: Option<DateTime<Utc>>,
        due_at: Option<DateTime<Utc>>,
        paid_at: Option<DateTime<Utc>>,
        reversed_at: Option<DateTime<Utc>>,
    ) -> Option<Self> {
        let state = match ApplicationStatus::parse_status(status)? {
            ApplicationStatus::Pending => {
                if agent_id.is_some() {
                    return None;
                }
                ApplicationState::Pending
            }
            ApplicationStatus::InProgress => ApplicationState::InProgress {
                agent_id: agent_id?,
            },
            ApplicationStatus::SentToCommercial => ApplicationState::SentToCommercial {
                agent_id: agent_id?,
                commercial_id,
            },
            ApplicationStatus::Approved => ApplicationState::Approved {
                agent_id: agent_id?,
                commercial_id: commercial_id?,
                approved_at: approved_at?,
                due_at: due_at?,
            },
            ApplicationStatus::Rejected => ApplicationState::Rejected {
                agent_id: agent_id?,
                commercial_id: commercial_id?,
                reversed_at,
            },
            ApplicationStatus::Paid => ApplicationState::Paid {
                agent_id: agent_id?,
                commercial_id: commercial_id?,
                paid_at: paid_at?,
            },
            ApplicationStatus::Overdue => return None,
        };
        Some(state)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Sent,
    Viewed,
    Downloaded,
}

impl ContractStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractStatus::Sent => "sent",
            ContractStatus::Viewed => "viewed",
            ContractStatus::Downloaded => "downloaded",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(ContractStatus::Sent),
            "viewed" => Some(ContractStatus::Viewed),
            "downloaded" => Some(ContractStatus::Downloaded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutboxKind {
    Notify,
    Contract,
}

impl OutboxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxKind::Notify => "notify",
            OutboxKind::Contract => "contract",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "notify" => Some(OutboxKind::Notify),
            "contract" => Some(OutboxKind::Contract),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, sqlx::FromRow)]
pub struct Show {
    pub id: i64,
    pub name: String,
    pub category: String,
    /// `HH:MM-HH:MM`
    pub time_window: String,
    /// `daily` or a weekday list such as `mon,wed,fri`
    pub recurrence: String,
    pub price_per_minute_cents: i64,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, sqlx::FromRow)]
pub struct Broadcast {
    pub id: i64,
    pub show_id: i64,
    pub air_date: NaiveDate,
    pub starts_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub ad_minutes: i64,
    pub capacity: i64,
    pub booked_slots: i64,
}

impl Broadcast {
    pub fn has_free_slot(&self) -> bool {
        self.booked_slots < self.capacity
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Application {
    pub id: i64,
    pub customer_id: i64,
    pub broadcast_id: i64,
    pub state: ApplicationState,
    pub duration_secs: i64,
    pub cost_cents: i64,
    pub contact_phone: String,
    pub description: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Application joined with the display fields of its broadcast and show.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplicationView {
    pub application: Application,
    pub status: ApplicationStatus,
    pub show_id: i64,
    pub show_name: String,
    pub show_window: String,
    pub air_date: NaiveDate,
    pub starts_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contract {
    pub id: i64,
    pub application_id: i64,
    pub status: ContractStatus,
    pub sent_at: DateTime<Utc>,
    pub viewed_at: Option<DateTime<Utc>>,
    pub downloaded_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn state_round_trips_through_columns() {
        let now = Utc::now();
        let states = [
            ApplicationState::Pending,
            ApplicationState::InProgress { agent_id: 3 },
            ApplicationState::SentToCommercial {
                agent_id: 3,
                commercial_id: None,
            },
            ApplicationState::Approved {
                agent_id: 3,
                commercial_id: 9,
                approved_at: now,
                due_at: now + Duration::days(14),
            },
            ApplicationState::Rejected {
                agent_id: 3,
                commercial_id: 9,
                reversed_at: Some(now),
            },
            ApplicationState::Paid {
                agent_id: 3,
                commercial_id: 9,
                paid_at: now,
            },
        ];
        for state in states {
            let c = state.to_columns();
            let back = ApplicationState::from_columns(
                c.status,
                c.agent_id,
                c.commercial_id,
                c.approved_at,
                c.due_at,
                c.paid_at,
                c.reversed_at,
            );
            assert_eq!(back, Some(state));
        }
    }

    #[test]
    fn invalid_column_combinations_are_rejected() {
        assert!(ApplicationState::from_columns("approved", None, Some(1), None, None, None, None)
            .is_none());
        assert!(ApplicationState::from_columns("pending", Some(4), None, None, None, None, None)
            .is_none());
        assert!(ApplicationState::from_columns("overdue", Some(4), Some(1), None, None, None, None)
            .is_none());
        assert!(ApplicationState::from_columns("bogus", None, None, None, None, None, None).is_none());
    }

    #[test]
    fn overdue_is_derived_from_due_date() {
        let approved_at = Utc::now();
        let state = ApplicationState::Approved {
            agent_id: 1,
            commercial_id: 2,
            approved_at,
            due_at: approved_at + Duration::days(1),
        };
        assert_eq!(state.effective_status(approved_at), ApplicationStatus::Approved);
        assert_eq!(
            state.effective_status(approved_at + Duration::days(2)),
            ApplicationStatus::Overdue
        );
        assert_eq!(state.status(), ApplicationStatus::Approved);

        let paid = ApplicationState::Paid {
            agent_id: 1,
            commercial_id: 2,
            paid_at: approved_at,
        };
        assert_eq!(
            paid.effective_status(approved_at + Duration::days(30)),
            ApplicationStatus::Paid
        );
    }

    #[test]
    fn cancellable_statuses() {
        use ApplicationStatus::*;
        for s in [Pending, InProgress, SentToCommercial] {
            assert!(s.is_cancellable());
        }
        for s in [Approved, Rejected, Paid, Overdue] {
            assert!(!s.is_cancellable());
        }
    }
}
