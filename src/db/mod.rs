//! Database module: row models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed rows returned by repositories.
//! - `repo`: SQL-only functions for the continuation queue, import status
//!   bookkeeping and the local entity store.
//!
//! External modules should import from `channel_sync::db`; the repository API
//! and row models are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::StoredEntityRow;
