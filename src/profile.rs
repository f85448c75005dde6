//! Customer profile lookups the booking flow depends on.
use crate::db::{self, Pool};
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    /// Whether the customer has registered payout details.
    async fn has_payout_details(&self, customer_id: i64) -> Result<bool>;
}

/// Profile directory backed by the `payout_details` table.
#[derive(Clone)]
pub struct SqlProfiles {
    pool: Pool,
}

impl SqlProfiles {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn register_payout_details(&self, customer_id: i64) -> Result<()> {
        db::register_payout_details(&self.pool, customer_id).await
    }
}

#[async_trait]
impl ProfileDirectory for SqlProfiles {
    async fn has_payout_details(&self, customer_id: i64) -> Result<bool> {
        db::has_payout_details(&self.pool, customer_id).await
    }
}
