pub mod aggregate;
pub mod classify;
pub mod config;
pub mod error;
pub mod intake;
pub mod language;
pub mod model;
pub mod pool;
pub mod routes;
pub mod runner;
pub mod sandbox;
pub mod sink;
pub mod web_server;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
