//! Contracts issued on approval and the document hand-off.
//!
//! A contract only moves forward: `sent` -> `viewed` -> `downloaded`.
//! Skipping `viewed` is allowed and fills its timestamp.
use crate::db::{self, applications, Pool};
use crate::error::{BookingError, BookingResult, Conflict, Denied};
use crate::model::{Actor, ApplicationStatus, Contract, ContractStatus, OutboxKind, Role};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::{info, instrument};

/// Receives finalized applications for document generation.
#[async_trait]
pub trait DocumentService: Send + Sync {
    async fn application_finalized(
        &self,
        application_id: i64,
        status: ApplicationStatus,
    ) -> Result<()>;
}

/// Document service that only records the hand-off in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDocuments;

#[async_trait]
impl DocumentService for LoggingDocuments {
    async fn application_finalized(
        &self,
        application_id: i64,
        status: ApplicationStatus,
    ) -> Result<()> {
        info!(application_id, %status, "application finalized");
        Ok(())
    }
}

/// Outbox payload for a document hand-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentHandOff {
    pub application_id: i64,
    pub status: ApplicationStatus,
}

/// Create the `sent` contract for a freshly approved application and queue
/// the document hand-off, both on the approving transaction.
pub(crate) async fn issue(
    conn: &mut SqliteConnection,
    application_id: i64,
    now: DateTime<Utc>,
) -> BookingResult<()> {
    applications::insert_contract(&mut *conn, application_id, now).await?;
    let payload = serde_json::to_string(&DocumentHandOff {
        application_id,
        status: ApplicationStatus::Approved,
    })?;
    db::enqueue_outbox_tx(conn, OutboxKind::Contract, application_id, &payload, now).await?;
    Ok(())
}

async fn ensure_visible(pool: &Pool, actor: Actor, application_id: i64) -> BookingResult<()> {
    if actor.role != Role::Customer {
        return Ok(());
    }
    let row = applications::fetch_application(pool, application_id)
        .await?
        .ok_or_else(|| BookingError::not_found("application", application_id))?;
    if row.customer_id != actor.user_id {
        return Err(Denied::NotOwner {
            application_id,
            user_id: actor.user_id,
        }
        .into());
    }
    Ok(())
}

pub async fn for_application(
    pool: &Pool,
    actor: Actor,
    application_id: i64,
) -> BookingResult<Contract> {
    ensure_visible(pool, actor, application_id).await?;
    let row = applications::fetch_contract_for_application(pool, application_id)
        .await?
        .ok_or_else(|| BookingError::not_found("contract for application", application_id))?;
    row.into_contract().map_err(BookingError::internal)
}

/// Move a contract forward. Only the customer who owns the application
/// may advance it.
#[instrument(skip(pool))]
pub async fn advance(
    pool: &Pool,
    actor: Actor,
    contract_id: i64,
    to: ContractStatus,
    now: DateTime<Utc>,
) -> BookingResult<Contract> {
    let current = applications::fetch_contract(pool, contract_id)
        .await?
        .ok_or_else(|| BookingError::not_found("contract", contract_id))?
        .into_contract()
        .map_err(BookingError::internal)?;

    let owner = applications::fetch_application(pool, current.application_id)
        .await?
        .map(|row| row.customer_id);
    if actor.role != Role::Customer || owner != Some(actor.user_id) {
        return Err(Denied::NotOwner {
            application_id: current.application_id,
            user_id: actor.user_id,
        }
        .into());
    }

    if to <= current.status {
        return Err(Conflict::ContractRegression {
            contract_id,
            current: current.status,
        }
        .into());
    }
    if !applications::advance_contract(pool, contract_id, current.status, to, now).await? {
        let latest = applications::fetch_contract(pool, contract_id)
            .await?
            .ok_or_else(|| BookingError::not_found("contract", contract_id))?
            .into_contract()
            .map_err(BookingError::internal)?;
        return Err(Conflict::ContractRegression {
            contract_id,
            current: latest.status,
        }
        .into());
    }
    info!(contract_id, to = to.as_str(), "contract advanced");

    applications::fetch_contract(pool, contract_id)
        .await?
        .ok_or_else(|| BookingError::not_found("contract", contract_id))?
        .into_contract()
        .map_err(BookingError::internal)
}
