//! Row structs returned by repositories.
//!
//! Keep these focused on the data returned by queries; conversion into
//! domain types fails loudly on rows no transition could have written.

use crate::model::{
    Application, ApplicationState, ApplicationStatus, ApplicationView, Contract, ContractStatus,
};
use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct ApplicationRow {
    pub id: i64,
    pub customer_id: i64,
    pub broadcast_id: i64,
    pub status: String,
    pub agent_id: Option<i64>,
    pub commercial_id: Option<i64>,
    pub duration_secs: i64,
    pub cost_cents: i64,
    pub contact_phone: String,
    pub description: String,
    pub approved_at: Option<DateTime<Utc>>,
    pub due_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub reversed_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApplicationRow {
    pub fn into_application(self) -> Result<Application> {
        let state = ApplicationState::from_columns(
            &self.status,
            self.agent_id,
            self.commercial_id,
            self.approved_at,
            self.due_at,
            self.paid_at,
            self.reversed_at,
        )
        .ok_or_else(|| {
            anyhow!(
                "application {} has inconsistent state columns (status {})",
                self.id,
                self.status
            )
        })?;
        Ok(Application {
            id: self.id,
            customer_id: self.customer_id,
            broadcast_id: self.broadcast_id,
            state,
            duration_secs: self.duration_secs,
            cost_cents: self.cost_cents,
            contact_phone: self.contact_phone,
            description: self.description,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Application row joined with its broadcast and show for display.
#[derive(Debug, Clone, FromRow)]
pub struct ApplicationViewRow {
    #[sqlx(flatten)]
    pub application: ApplicationRow,
    pub show_id: i64,
    pub show_name: String,
    pub show_window: String,
    pub air_date: NaiveDate,
    pub starts_at: DateTime<Utc>,
}

impl ApplicationViewRow {
    pub fn into_view(self, now: DateTime<Utc>) -> Result<ApplicationView> {
        let application = self.application.into_application()?;
        Ok(ApplicationView {
            status: application.state.effective_status(now),
            application,
            show_id: self.show_id,
            show_name: self.show_name,
            show_window: self.show_window,
            air_date: self.air_date,
            starts_at: self.starts_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ContractRow {
    pub id: i64,
    pub application_id: i64,
    pub status: String,
    pub sent_at: DateTime<Utc>,
    pub viewed_at: Option<DateTime<Utc>>,
    pub downloaded_at: Option<DateTime<Utc>>,
}

impl ContractRow {
    pub fn into_contract(self) -> Result<Contract> {
        let status = ContractStatus::parse_status(&self.status)
            .ok_or_else(|| anyhow!("contract {} has unknown status {}", self.id, self.status))?;
        Ok(Contract {
            id: self.id,
            application_id: self.application_id,
            status,
            sent_at: self.sent_at,
            viewed_at: self.viewed_at,
            downloaded_at: self.downloaded_at,
        })
    }
}

/// Outbox slice handed to the worker.
#[derive(Debug, Clone, FromRow)]
pub struct OutboxTask {
    pub id: i64,
    pub kind: String,
    pub application_id: i64,
    pub payload: String,
    pub attempt: i64,
}

/// Which approved rows a listing keeps, relative to their due date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueFilter {
    Any,
    NotDue(DateTime<Utc>),
    PastDue(DateTime<Utc>),
}

/// Fully resolved listing query: role scope and caller filter merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    /// Stored statuses to keep; `None` keeps all.
    pub statuses: Option<Vec<ApplicationStatus>>,
    /// Applied on top of everything else, whatever `statuses` says.
    pub exclude_rejected: bool,
    pub customer_id: Option<i64>,
    pub agent_id: Option<i64>,
    /// Agent scope: unclaimed pending rows plus rows claimed by this agent.
    pub unclaimed_or_agent: Option<i64>,
    pub due: DueFilter,
    pub air_date_from: Option<NaiveDate>,
    pub air_date_to: Option<NaiveDate>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            statuses: None,
            exclude_rejected: false,
            customer_id: None,
            agent_id: None,
            unclaimed_or_agent: None,
            due: DueFilter::Any,
            air_date_from: None,
            air_date_to: None,
        }
    }
}
