//! Application lifecycle: submission, claims, hand-off, the commercial
//! verdict, reversal, payment and cancellation.
//!
//! Every command reads the current state, computes the next one with the
//! pure rules in [`state`], and writes it back with a compare-and-set in a
//! single transaction together with its slot bookkeeping and outbox rows.
//! When the compare-and-set loses, the rules are replayed against a fresh
//! read to report why.
pub mod query;
pub mod state;

pub use query::ApplicationFilter;
pub use state::{next_state, Transition};

use crate::catalog::quote_cents;
use crate::clock::{Clock, SystemClock};
use crate::contract;
use crate::db::applications::{self, FieldValues, NewApplication};
use crate::db::catalog as schedule_repo;
use crate::db::Pool;
use crate::error::{require_role, BookingError, BookingResult, Conflict, Denied, Precondition};
use crate::model::{
    Actor, Application, ApplicationState, ApplicationStatus, ApplicationView, Contract,
    ContractStatus, Role,
};
use crate::notify::{self, Change};
use crate::profile::ProfileDirectory;
use crate::schedule;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use std::sync::Arc;
use tracing::{info, instrument};

static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9][0-9 ()-]{5,19}$").expect("valid phone regex"));

const EDITABLE: &[ApplicationStatus] = &[ApplicationStatus::Pending, ApplicationStatus::InProgress];
const CANCELLABLE: &[ApplicationStatus] = &[
    ApplicationStatus::Pending,
    ApplicationStatus::InProgress,
    ApplicationStatus::SentToCommercial,
];

/// Tunables for the booking flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BookingPolicy {
    /// Days between approval and the payment due date.
    pub payment_due_days: i64,
    pub max_description_len: usize,
    /// Roles allowed to reverse an approval.
    pub reversal_roles: Vec<Role>,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            payment_due_days: 14,
            max_description_len: 2000,
            reversal_roles: vec![Role::Commercial, Role::Admin, Role::Director],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub broadcast_id: i64,
    pub duration_secs: i64,
    pub contact_phone: String,
    pub description: String,
}

/// Partial edit of the operational fields. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldEdit {
    pub broadcast_id: Option<i64>,
    pub duration_secs: Option<i64>,
    /// Price override; only the handling agent may set it.
    pub cost_cents: Option<i64>,
    pub contact_phone: Option<String>,
    pub description: Option<String>,
}

fn validate_phone(phone: &str) -> BookingResult<&str> {
    let phone = phone.trim();
    if !PHONE_RE.is_match(phone) {
        return Err(BookingError::validation(format!(
            "contact phone {phone:?} is not a phone number"
        )));
    }
    Ok(phone)
}

async fn load_in(conn: &mut SqliteConnection, id: i64) -> BookingResult<Application> {
    applications::fetch_application(conn, id)
        .await?
        .ok_or_else(|| BookingError::not_found("application", id))?
        .into_application()
        .map_err(BookingError::internal)
}

pub struct Lifecycle {
    pool: Pool,
    profiles: Arc<dyn ProfileDirectory>,
    clock: Arc<dyn Clock>,
    policy: BookingPolicy,
}

impl Lifecycle {
    pub fn new(pool: Pool, profiles: Arc<dyn ProfileDirectory>, policy: BookingPolicy) -> Self {
        Self {
            pool,
            profiles,
            clock: Arc::new(SystemClock),
            policy,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn policy(&self) -> &BookingPolicy {
        &self.policy
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn load(&self, id: i64) -> BookingResult<Application> {
        let mut conn = self.pool.acquire().await?;
        load_in(&mut conn, id).await
    }

    fn validate_description<'a>(&self, description: &'a str) -> BookingResult<&'a str> {
        let description = description.trim();
        if description.is_empty() {
            return Err(BookingError::validation("description must be non-empty"));
        }
        if description.chars().count() > self.policy.max_description_len {
            return Err(BookingError::validation(format!(
                "description is longer than {} characters",
                self.policy.max_description_len
            )));
        }
        Ok(description)
    }

    /// Price an ad of `duration_secs` on `broadcast_id`. With `bookable`
    /// set, the broadcast must also be in the future with a free slot.
    async fn quote(
        &self,
        broadcast_id: i64,
        duration_secs: i64,
        now: DateTime<Utc>,
        bookable: bool,
    ) -> BookingResult<i64> {
        if duration_secs < 1 {
            return Err(BookingError::validation("duration must be at least one second"));
        }
        let broadcast = schedule_repo::fetch_broadcast(&self.pool, broadcast_id)
            .await?
            .ok_or_else(|| BookingError::not_found("broadcast", broadcast_id))?;
        if bookable {
            if broadcast.starts_at <= now {
                return Err(Precondition::ScheduleInPast {
                    broadcast_id,
                    starts_at: broadcast.starts_at,
                }
                .into());
            }
            if !broadcast.has_free_slot() {
                return Err(Precondition::SlotUnavailable {
                    broadcast_id,
                    capacity: broadcast.capacity,
                    booked: broadcast.booked_slots,
                }
                .into());
            }
        }
        let budget_secs = broadcast.ad_minutes.checked_mul(60).ok_or_else(|| {
            BookingError::validation(format!(
                "ad budget of broadcast {broadcast_id} is out of range"
            ))
        })?;
        if duration_secs > budget_secs {
            return Err(BookingError::validation(format!(
                "duration {duration_secs}s exceeds the {} minute ad budget of broadcast {broadcast_id}",
                broadcast.ad_minutes
            )));
        }
        let show = schedule_repo::fetch_show(&self.pool, broadcast.show_id)
            .await?
            .ok_or_else(|| BookingError::not_found("show", broadcast.show_id))?;
        quote_cents(show.price_per_minute_cents, duration_secs)
    }

    /// Create a pending application for a future broadcast with a free slot.
    #[instrument(skip(self, req), fields(customer_id = actor.user_id, broadcast_id = req.broadcast_id))]
    pub async fn submit(&self, actor: Actor, req: SubmitRequest) -> BookingResult<Application> {
        require_role(actor.role, &[Role::Customer], "submit applications")?;
        let now = self.clock.now();
        let phone = validate_phone(&req.contact_phone)?;
        let description = self.validate_description(&req.description)?;
        let cost_cents = self
            .quote(req.broadcast_id, req.duration_secs, now, true)
            .await?;
        let has_payout = self
            .profiles
            .has_payout_details(actor.user_id)
            .await
            .map_err(BookingError::internal)?;
        if !has_payout {
            return Err(Precondition::PayoutDetailsMissing {
                customer_id: actor.user_id,
            }
            .into());
        }

        let mut tx = self.pool.begin().await?;
        let new = NewApplication {
            customer_id: actor.user_id,
            broadcast_id: req.broadcast_id,
            duration_secs: req.duration_secs,
            cost_cents,
            contact_phone: phone,
            description,
        };
        let id = applications::insert_application(&mut tx, &new, now).await?;
        let app = load_in(&mut tx, id).await?;
        notify::enqueue(&mut tx, &notify::plan(Change::Submitted, &app, actor), now).await?;
        tx.commit().await?;

        info!(application_id = id, cost_cents, "application submitted");
        Ok(app)
    }

    /// Take an unclaimed pending application. Exactly one of several
    /// concurrent claimers wins; the rest get `AlreadyClaimed`.
    pub async fn claim(&self, actor: Actor, id: i64) -> BookingResult<Application> {
        require_role(actor.role, &[Role::Agent], "claim applications")?;
        self.apply(actor, id, Transition::Claim, Change::Claimed).await
    }

    pub async fn hand_off(&self, actor: Actor, id: i64) -> BookingResult<Application> {
        require_role(actor.role, &[Role::Agent], "hand applications to commercial")?;
        self.apply(actor, id, Transition::HandOff, Change::HandedOff)
            .await
    }

    pub async fn commercial_claim(&self, actor: Actor, id: i64) -> BookingResult<Application> {
        require_role(actor.role, &[Role::Commercial], "pick up handed-off applications")?;
        self.apply(actor, id, Transition::CommercialClaim, Change::CommercialClaimed)
            .await
    }

    /// Approve and book a slot on the broadcast. Fails with
    /// `CapacityExceeded`, leaving the application untouched, when the
    /// broadcast filled up in the meantime.
    pub async fn approve(&self, actor: Actor, id: i64) -> BookingResult<Application> {
        require_role(actor.role, &[Role::Commercial], "approve applications")?;
        let t = Transition::Approve {
            now: self.clock.now(),
            due_days: self.policy.payment_due_days,
        };
        self.apply(actor, id, t, Change::Approved).await
    }

    pub async fn reject(&self, actor: Actor, id: i64) -> BookingResult<Application> {
        require_role(actor.role, &[Role::Commercial], "reject applications")?;
        self.apply(actor, id, Transition::Reject, Change::Rejected)
            .await
    }

    /// Undo an approval and give the slot back.
    pub async fn reverse(&self, actor: Actor, id: i64) -> BookingResult<Application> {
        require_role(actor.role, &self.policy.reversal_roles, "reverse approvals")?;
        let t = Transition::Reverse {
            now: self.clock.now(),
        };
        self.apply(actor, id, t, Change::Reversed).await
    }

    pub async fn mark_paid(&self, actor: Actor, id: i64) -> BookingResult<Application> {
        require_role(actor.role, &[Role::Accountant, Role::Admin], "record payments")?;
        let t = Transition::MarkPaid {
            now: self.clock.now(),
        };
        self.apply(actor, id, t, Change::Paid).await
    }

    #[instrument(skip(self), fields(user_id = actor.user_id))]
    async fn apply(
        &self,
        actor: Actor,
        id: i64,
        t: Transition,
        change: Change,
    ) -> BookingResult<Application> {
        let now = self.clock.now();
        let current = self.load(id).await?;
        let next = next_state(id, &current.state, t, actor)?;

        let mut tx = self.pool.begin().await?;
        if !applications::compare_and_set_state(&mut tx, id, &current.state, &next, now).await? {
            tx.rollback().await?;
            return Err(self.lost_race(id, t, actor).await);
        }
        match change {
            Change::Approved => {
                schedule::try_reserve(&mut tx, current.broadcast_id).await?;
                contract::issue(&mut tx, id, now).await?;
            }
            Change::Reversed => schedule::release(&mut tx, current.broadcast_id).await?,
            _ => {}
        }
        let updated = load_in(&mut tx, id).await?;
        notify::enqueue(&mut tx, &notify::plan(change, &updated, actor), now).await?;
        tx.commit().await?;

        info!(
            application_id = id,
            from = %current.state.status(),
            to = %updated.state.status(),
            "application transitioned"
        );
        Ok(updated)
    }

    /// Explain a lost compare-and-set from the state that won.
    async fn lost_race(&self, id: i64, t: Transition, actor: Actor) -> BookingError {
        let fresh = match self.load(id).await {
            Ok(app) => app,
            Err(err) => return err,
        };
        match next_state(id, &fresh.state, t, actor) {
            Err(err) => err,
            Ok(_) => Conflict::StateMismatch {
                application_id: id,
                expected: t.sources(),
                actual: fresh.state.status(),
            }
            .into(),
        }
    }

    fn ensure_cancellable(actor: Actor, app: &Application) -> BookingResult<()> {
        if app.customer_id != actor.user_id {
            return Err(Denied::NotOwner {
                application_id: app.id,
                user_id: actor.user_id,
            }
            .into());
        }
        let status = app.state.status();
        if !status.is_cancellable() {
            return Err(Denied::NotCancellable {
                application_id: app.id,
                status,
            }
            .into());
        }
        Ok(())
    }

    /// Withdraw and delete the customer's own application before the
    /// commercial verdict.
    #[instrument(skip(self), fields(user_id = actor.user_id))]
    pub async fn cancel(&self, actor: Actor, id: i64) -> BookingResult<()> {
        require_role(actor.role, &[Role::Customer], "cancel applications")?;
        let now = self.clock.now();
        let current = self.load(id).await?;
        Self::ensure_cancellable(actor, &current)?;

        let mut tx = self.pool.begin().await?;
        if !applications::delete_cancellable(&mut tx, id, actor.user_id, &current.state).await? {
            tx.rollback().await?;
            let fresh = self.load(id).await?;
            Self::ensure_cancellable(actor, &fresh)?;
            return Err(Conflict::StateMismatch {
                application_id: id,
                expected: CANCELLABLE,
                actual: fresh.state.status(),
            }
            .into());
        }
        notify::enqueue(&mut tx, &notify::plan(Change::Cancelled, &current, actor), now).await?;
        tx.commit().await?;

        info!(application_id = id, status = %current.state.status(), "application cancelled");
        Ok(())
    }

    fn ensure_editor(actor: Actor, app: &Application) -> BookingResult<()> {
        match (actor.role, app.state) {
            (Role::Customer, ApplicationState::Pending) if app.customer_id == actor.user_id => Ok(()),
            (Role::Agent, ApplicationState::InProgress { agent_id }) if agent_id == actor.user_id => {
                Ok(())
            }
            (_, ApplicationState::Pending | ApplicationState::InProgress { .. }) => {
                Err(Denied::NotOwner {
                    application_id: app.id,
                    user_id: actor.user_id,
                }
                .into())
            }
            (_, state) => Err(Conflict::StateMismatch {
                application_id: app.id,
                expected: EDITABLE,
                actual: state.status(),
            }
            .into()),
        }
    }

    /// Edit the operational fields. The customer may edit while the
    /// application is unclaimed, the claiming agent while it is in progress.
    #[instrument(skip(self, edit), fields(user_id = actor.user_id))]
    pub async fn edit_fields(
        &self,
        actor: Actor,
        id: i64,
        edit: FieldEdit,
    ) -> BookingResult<Application> {
        let now = self.clock.now();
        let current = self.load(id).await?;
        Self::ensure_editor(actor, &current)?;
        if edit.cost_cents.is_some() && actor.role != Role::Agent {
            return Err(BookingError::validation(
                "only the handling agent may adjust the price",
            ));
        }
        if edit.cost_cents.is_some_and(|c| c < 0) {
            return Err(BookingError::validation("cost must be >= 0"));
        }

        let broadcast_id = edit.broadcast_id.unwrap_or(current.broadcast_id);
        let duration_secs = edit.duration_secs.unwrap_or(current.duration_secs);
        let contact_phone = match &edit.contact_phone {
            Some(p) => validate_phone(p)?,
            None => current.contact_phone.as_str(),
        };
        let description = match &edit.description {
            Some(d) => self.validate_description(d)?,
            None => current.description.as_str(),
        };

        let moved = broadcast_id != current.broadcast_id;
        let cost_cents = if moved || duration_secs != current.duration_secs {
            let quote = self.quote(broadcast_id, duration_secs, now, moved).await?;
            edit.cost_cents.unwrap_or(quote)
        } else {
            edit.cost_cents.unwrap_or(current.cost_cents)
        };

        let values = FieldValues {
            broadcast_id,
            duration_secs,
            cost_cents,
            contact_phone,
            description,
        };
        let mut tx = self.pool.begin().await?;
        if !applications::update_fields(&mut tx, id, &current.state, &values, now).await? {
            tx.rollback().await?;
            let fresh = self.load(id).await?;
            Self::ensure_editor(actor, &fresh)?;
            return Err(Conflict::StateMismatch {
                application_id: id,
                expected: EDITABLE,
                actual: fresh.state.status(),
            }
            .into());
        }
        let updated = load_in(&mut tx, id).await?;
        notify::enqueue(&mut tx, &notify::plan(Change::FieldsEdited, &updated, actor), now).await?;
        tx.commit().await?;

        info!(application_id = id, broadcast_id, cost_cents, "application edited");
        Ok(updated)
    }

    /// One application with its broadcast and show, if `actor` may see it.
    pub async fn get(&self, actor: Actor, id: i64) -> BookingResult<ApplicationView> {
        let view = applications::fetch_view(&self.pool, id)
            .await?
            .ok_or_else(|| BookingError::not_found("application", id))?
            .into_view(self.clock.now())
            .map_err(BookingError::internal)?;
        if !query::can_view(actor, &view.application) {
            return Err(Denied::NotOwner {
                application_id: id,
                user_id: actor.user_id,
            }
            .into());
        }
        Ok(view)
    }

    /// Applications visible to `actor`, narrowed by `filter`.
    #[instrument(skip(self, filter), fields(user_id = actor.user_id, role = %actor.role))]
    pub async fn list(
        &self,
        actor: Actor,
        filter: &ApplicationFilter,
    ) -> BookingResult<Vec<ApplicationView>> {
        let now = self.clock.now();
        let q = query::resolve(actor, filter, now);
        self.fetch_views(&q, now).await
    }

    /// Commercial inbox. Rejected applications never appear, whatever the
    /// filter asks for.
    pub async fn commercial_queue(
        &self,
        actor: Actor,
        filter: &ApplicationFilter,
    ) -> BookingResult<Vec<ApplicationView>> {
        require_role(
            actor.role,
            &[Role::Commercial, Role::Admin, Role::Director],
            "read the commercial queue",
        )?;
        let now = self.clock.now();
        self.fetch_views(&query::commercial_queue(filter, now), now)
            .await
    }

    async fn fetch_views(
        &self,
        q: &crate::db::ListQuery,
        now: DateTime<Utc>,
    ) -> BookingResult<Vec<ApplicationView>> {
        applications::list_views(&self.pool, q)
            .await?
            .into_iter()
            .map(|row| row.into_view(now).map_err(BookingError::internal))
            .collect()
    }

    pub async fn contract_for(&self, actor: Actor, application_id: i64) -> BookingResult<Contract> {
        contract::for_application(&self.pool, actor, application_id).await
    }

    pub async fn advance_contract(
        &self,
        actor: Actor,
        contract_id: i64,
        to: ContractStatus,
    ) -> BookingResult<Contract> {
        contract::advance(&self.pool, actor, contract_id, to, self.clock.now()).await
    }
}
