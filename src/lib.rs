// Internal modules required when compiled as a library for tests.
pub mod app;
pub mod config;
pub mod dashboard;
pub mod db;
pub mod growth;
pub mod http;
pub mod metrics;
pub mod poller;
pub mod queries;
pub mod state;
// Re-export commonly used types for tests
pub use dashboard::{DashboardSnapshot, Section};
pub use growth::{Observation, select_top_n};
pub use state::SharedState;
