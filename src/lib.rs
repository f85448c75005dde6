//! TV advertising booking: show catalog, broadcast capacity, the
//! application lifecycle and its change notifications.
pub mod catalog;
pub mod clock;
pub mod config;
pub mod contract;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod notify;
pub mod outbox;
pub mod profile;
pub mod schedule;

pub use error::{BookingError, BookingResult};
pub use lifecycle::Lifecycle;
