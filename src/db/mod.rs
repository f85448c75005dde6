//! Database module: row models and SQL repositories.
//!
//! - `model`: row structs returned by queries and the listing query shape.
//! - `repo`: pool setup, migrations, outbox and payout-details SQL.
//! - `catalog`: shows and broadcasts, including the slot counter.
//! - `applications`: applications and their contracts.
//!
//! Business rules live in `catalog`, `schedule` and `lifecycle` at the crate
//! root; these modules only map rows.

pub mod applications;
pub mod catalog;
pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{ApplicationRow, ApplicationViewRow, ListQuery, OutboxTask};
