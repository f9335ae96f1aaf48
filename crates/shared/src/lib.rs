//! Orderflow shared types
//!
//! Domain enums and database pool construction shared by the api,
//! fulfillment, and worker crates.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{CommissionTier, FulfillmentKind, PlanType};
