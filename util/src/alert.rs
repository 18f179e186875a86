//! Operator alerting.
//!
//! Workers funnel unexpected conditions through an [`Alerter`], which
//! rate-limits dispatch to the configured sink. Alerts suppressed inside
//! the minimum interval are counted and reported as a `(+N more since)`
//! suffix on the next dispatched message, so a flapping worker cannot
//! flood the operator's phone.

use std::sync::Mutex;

/// Out-of-process destination for operator alerts (SMS, email, pager).
///
/// Implementations must not block for long and must not panic; delivery
/// failures are their own problem to log.
pub trait AlertSink: Send + Sync {
    /// Deliver a single alert message.
    fn deliver(&self, message: &str);
}

/// Sink that only writes to the process log. Used in tests and as a
/// fallback when no notification credentials are configured.
#[derive(Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn deliver(&self, message: &str) {
        log::error!("<!> ALERT <!> {message}");
    }
}

struct AlertState {
    last_dispatch: i64,
    suppressed: u32,
}

/// Rate-limited alert dispatcher.
pub struct Alerter {
    app_name: String,
    min_interval: i64,
    sink: Box<dyn AlertSink>,
    state: Mutex<AlertState>,
}

impl Alerter {
    /// Create an alerter that dispatches at most one message per
    /// `min_interval` seconds.
    pub fn new(app_name: impl Into<String>, min_interval: i64, sink: Box<dyn AlertSink>) -> Self {
        Alerter {
            app_name: app_name.into(),
            min_interval,
            sink,
            state: Mutex::new(AlertState {
                last_dispatch: 0,
                suppressed: 0,
            }),
        }
    }

    /// Raise an alert. Always logged; dispatched to the sink only when the
    /// rate limit allows.
    pub fn alert(&self, message: &str) {
        self.alert_at(crate::now(), message)
    }

    fn alert_at(&self, now: i64, message: &str) {
        log::error!("<!> ALERT <!> {message}");

        let mut state = match self.state.lock() {
            Ok(state) => state,
            // A panic while holding the lock only loses rate-limit state.
            Err(poisoned) => poisoned.into_inner(),
        };
        if now - state.last_dispatch <= self.min_interval {
            state.suppressed += 1;
            return;
        }

        let mut dispatch = format!("{}: {}", self.app_name, message);
        if state.suppressed > 0 {
            dispatch = format!("{} (+{} more since)", dispatch, state.suppressed);
            state.suppressed = 0;
        }
        state.last_dispatch = now;
        drop(state);

        self.sink.deliver(&dispatch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingSink(Arc<Mutex<Vec<String>>>);

    impl AlertSink for RecordingSink {
        fn deliver(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    #[test]
    fn suppressed_alerts_are_counted() {
        let sink = RecordingSink::default();
        let alerter = Alerter::new("TEST", 600, Box::new(sink.clone()));

        alerter.alert_at(1_000, "first");
        alerter.alert_at(1_010, "second");
        alerter.alert_at(1_020, "third");
        alerter.alert_at(2_000, "fourth");

        let delivered = sink.0.lock().unwrap();
        assert_eq!(
            *delivered,
            vec![
                "TEST: first".to_string(),
                "TEST: fourth (+2 more since)".to_string(),
            ]
        );
    }
}
