//! DNS-over-HTTPS gateway translating DNS queries into JSON-API lookups.

pub mod auth;
pub mod config;
pub mod error;
pub mod filtering;
pub mod gateway;
pub mod json_dns;
pub mod lists;
pub mod metrics;
pub mod server;
pub mod telemetry;
pub mod tracker;
pub mod translate;
pub mod upstream;

pub use config::GatewayConfig;
pub use error::QueryError;
pub use gateway::{Gateway, QueryOutcome, QueryStatus};
