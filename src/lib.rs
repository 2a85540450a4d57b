pub mod access;
pub mod config;
pub mod db;
pub mod diff;
pub mod import;
pub mod model;
pub mod query;
pub mod remote;
pub mod scheduler;
pub mod schema;
pub mod server;
pub mod settings;
pub mod store;
