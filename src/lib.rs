pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod geo;
pub mod journal;
pub mod location;
pub mod models;
pub mod notify;
pub mod openapi;
pub mod rate_limit;
pub mod repo;
pub mod routes;
pub mod security;
pub mod telemetry;

// Re-export commonly used items for tests / external users
pub use routes::{config, AppState};
pub use security::SecurityHeaders;
