//! Change notifications.
//!
//! Every lifecycle change plans its recipients here and writes one outbox
//! row per recipient inside the transaction that made the change. The
//! outbox worker hands the rows to a [`NotificationSink`] afterwards.
pub mod hub;
pub mod rooms;

pub use hub::NotificationHub;
pub use rooms::{application_room, can_join, commercial_agent_room, rooms_for, Room};

use crate::db;
use crate::error::BookingResult;
use crate::model::{Actor, Application, ApplicationStatus, OutboxKind, Role};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use std::sync::Arc;

pub const APPLICATION_UPDATED: &str = "application:updated";

/// Who a notification is addressed to: one user's private channel or a
/// whole role desk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    User(i64),
    Desk(Role),
}

/// Payload pushed to clients. Clients re-fetch the application on receipt,
/// so only the id and the new status matter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_role: Option<Role>,
    pub application_id: i64,
    /// `None` once the application has been cancelled and deleted.
    pub new_status: Option<ApplicationStatus>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

impl Notification {
    pub fn new(
        recipient: Recipient,
        application_id: i64,
        new_status: Option<ApplicationStatus>,
        message: impl Into<String>,
    ) -> Self {
        let (target_user_id, target_role) = match recipient {
            Recipient::User(id) => (Some(id), None),
            Recipient::Desk(role) => (None, Some(role)),
        };
        Self {
            kind: APPLICATION_UPDATED.to_string(),
            target_user_id,
            target_role,
            application_id,
            new_status,
            message: message.into(),
            room: None,
        }
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    pub fn recipient(&self) -> Recipient {
        match (self.target_user_id, self.target_role) {
            (Some(id), _) => Recipient::User(id),
            (None, Some(role)) => Recipient::Desk(role),
            // Rows are only written through `new`; treat a blank target as the admin desk.
            (None, None) => Recipient::Desk(Role::Admin),
        }
    }
}

/// Delivery side of the outbox.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// A shared sink, e.g. a hub that the worker delivers into while the
/// connection layer holds it to hand out subscriptions.
#[async_trait]
impl<T: NotificationSink + ?Sized> NotificationSink for Arc<T> {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        (**self).deliver(notification).await
    }
}

/// What happened to an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Submitted,
    Claimed,
    HandedOff,
    CommercialClaimed,
    Approved,
    Rejected,
    Reversed,
    Paid,
    FieldsEdited,
    Cancelled,
}

impl Change {
    fn describe(&self, application_id: i64) -> String {
        let what = match self {
            Change::Submitted => "was submitted",
            Change::Claimed => "was claimed by an agent",
            Change::HandedOff => "was sent to the commercial desk",
            Change::CommercialClaimed => "was picked up by the commercial desk",
            Change::Approved => "was approved",
            Change::Rejected => "was rejected",
            Change::Reversed => "was reversed after approval",
            Change::Paid => "was marked as paid",
            Change::FieldsEdited => "was edited",
            Change::Cancelled => "was cancelled by the customer",
        };
        format!("Application #{application_id} {what}")
    }
}

/// Recipients of `change`. `app` is the state after the change (or, for
/// a cancellation, the state just before deletion). The actor is never
/// notified about their own action.
pub fn plan(change: Change, app: &Application, actor: Actor) -> Vec<Notification> {
    let customer = Recipient::User(app.customer_id);
    let agent = app.state.agent_id().map(Recipient::User);
    let commercial = app.state.commercial_id().map(Recipient::User);

    let mut recipients: Vec<Recipient> = Vec::new();
    match change {
        Change::Submitted => recipients.extend([customer, Recipient::Desk(Role::Agent)]),
        Change::Claimed | Change::Rejected => {
            recipients.push(customer);
            recipients.extend(agent);
        }
        Change::HandedOff => {
            recipients.push(customer);
            recipients.extend(commercial.or(Some(Recipient::Desk(Role::Commercial))));
        }
        Change::CommercialClaimed => recipients.extend(agent),
        Change::Approved => {
            recipients.push(customer);
            recipients.extend(agent);
            recipients.push(Recipient::Desk(Role::Accountant));
        }
        Change::Reversed => {
            recipients.push(customer);
            recipients.extend(agent);
            recipients.extend(commercial);
            recipients.push(Recipient::Desk(Role::Accountant));
        }
        Change::Paid => {
            recipients.push(customer);
            recipients.extend(agent);
            recipients.extend(commercial);
        }
        Change::FieldsEdited => {
            recipients.push(customer);
            recipients.extend(agent);
            if agent.is_none() {
                recipients.push(Recipient::Desk(Role::Agent));
            }
        }
        Change::Cancelled => match (agent, commercial) {
            (None, _) => recipients.push(Recipient::Desk(Role::Agent)),
            (Some(agent), commercial) => {
                recipients.push(agent);
                recipients.extend(commercial.or_else(|| {
                    matches!(app.state.status(), ApplicationStatus::SentToCommercial)
                        .then_some(Recipient::Desk(Role::Commercial))
                }));
            }
        },
    }

    let mut seen = Vec::with_capacity(recipients.len());
    recipients.retain(|r| {
        if *r == Recipient::User(actor.user_id) || seen.contains(r) {
            return false;
        }
        seen.push(*r);
        true
    });

    let new_status = match change {
        Change::Cancelled => None,
        _ => Some(app.state.status()),
    };
    let message = change.describe(app.id);
    recipients
        .into_iter()
        .map(|recipient| {
            let n = Notification::new(recipient, app.id, new_status, message.clone());
            match room_for(recipient, app) {
                Some(room) => n.with_room(room),
                None => n,
            }
        })
        .collect()
}

fn room_for(recipient: Recipient, app: &Application) -> Option<String> {
    let Recipient::User(user_id) = recipient else {
        return None;
    };
    if user_id == app.customer_id {
        return Some(application_room(app.id));
    }
    match (app.state.agent_id(), app.state.commercial_id()) {
        (Some(agent), Some(commercial)) if user_id == commercial || user_id == agent => {
            Some(commercial_agent_room(agent, app.id))
        }
        (Some(agent), _) if user_id == agent => Some(application_room(app.id)),
        _ => None,
    }
}

/// Write one outbox row per notification on the caller's transaction.
pub(crate) async fn enqueue(
    conn: &mut SqliteConnection,
    notifications: &[Notification],
    now: DateTime<Utc>,
) -> BookingResult<()> {
    for n in notifications {
        let payload = serde_json::to_string(n)?;
        db::enqueue_outbox_tx(conn, OutboxKind::Notify, n.application_id, &payload, now).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ApplicationState;
    use chrono::Duration;

    fn app(state: ApplicationState) -> Application {
        Application {
            id: 5,
            customer_id: 1,
            broadcast_id: 2,
            state,
            duration_secs: 30,
            cost_cents: 100,
            contact_phone: "+15550100".into(),
            description: "spot".into(),
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn targets(ns: &[Notification]) -> Vec<Recipient> {
        ns.iter().map(Notification::recipient).collect()
    }

    #[test]
    fn payload_uses_the_wire_names() {
        let n = Notification::new(Recipient::User(3), 5, Some(ApplicationStatus::InProgress), "m")
            .with_room("application-5");
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "application:updated");
        assert_eq!(json["targetUserId"], 3);
        assert_eq!(json["applicationId"], 5);
        assert_eq!(json["newStatus"], "in_progress");
        assert_eq!(json["room"], "application-5");
        assert!(json.get("targetRole").is_none());

        let desk = Notification::new(Recipient::Desk(Role::Commercial), 5, None, "m");
        let json = serde_json::to_value(&desk).unwrap();
        assert_eq!(json["targetRole"], "commercial");
        assert!(json["newStatus"].is_null());
        let back: Notification = serde_json::from_value(json).unwrap();
        assert_eq!(back.recipient(), Recipient::Desk(Role::Commercial));
    }

    #[test]
    fn claim_notifies_customer_but_not_the_acting_agent() {
        let a = app(ApplicationState::InProgress { agent_id: 4 });
        let ns = plan(Change::Claimed, &a, Actor::new(4, Role::Agent));
        assert_eq!(targets(&ns), vec![Recipient::User(1)]);
        assert_eq!(ns[0].room.as_deref(), Some("application-5"));
        assert_eq!(ns[0].new_status, Some(ApplicationStatus::InProgress));
    }

    #[test]
    fn unowned_hand_off_goes_to_the_commercial_desk() {
        let a = app(ApplicationState::SentToCommercial {
            agent_id: 4,
            commercial_id: None,
        });
        let ns = plan(Change::HandedOff, &a, Actor::new(4, Role::Agent));
        assert_eq!(
            targets(&ns),
            vec![Recipient::User(1), Recipient::Desk(Role::Commercial)]
        );
    }

    #[test]
    fn approval_reaches_customer_agent_and_accounting() {
        let now = Utc::now();
        let a = app(ApplicationState::Approved {
            agent_id: 4,
            commercial_id: 9,
            approved_at: now,
            due_at: now + Duration::days(14),
        });
        let ns = plan(Change::Approved, &a, Actor::new(9, Role::Commercial));
        assert_eq!(
            targets(&ns),
            vec![
                Recipient::User(1),
                Recipient::User(4),
                Recipient::Desk(Role::Accountant)
            ]
        );
        assert_eq!(ns[1].room.as_deref(), Some("commercial-agent-4-app-5"));
    }

    #[test]
    fn cancellation_reaches_whoever_was_working_on_it() {
        let pending = app(ApplicationState::Pending);
        let ns = plan(Change::Cancelled, &pending, Actor::new(1, Role::Customer));
        assert_eq!(targets(&ns), vec![Recipient::Desk(Role::Agent)]);
        assert_eq!(ns[0].new_status, None);

        let handed = app(ApplicationState::SentToCommercial {
            agent_id: 4,
            commercial_id: None,
        });
        let ns = plan(Change::Cancelled, &handed, Actor::new(1, Role::Customer));
        assert_eq!(
            targets(&ns),
            vec![Recipient::User(4), Recipient::Desk(Role::Commercial)]
        );
    }
}
