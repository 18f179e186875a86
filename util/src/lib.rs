//! Shared helpers that do not belong to any single engine: integer money
//! math and the rate-limited operator alert dispatcher.

pub mod alert;
pub mod math;

pub use alert::{AlertSink, Alerter, LogAlertSink};

/// Unix time in seconds.
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
