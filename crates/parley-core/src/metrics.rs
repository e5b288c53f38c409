//! Client-side instrumentation.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! embedding application installs a recorder.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Metric names.
pub mod names {
    pub const EVENTS_APPLIED_TOTAL: &str = "parley_events_applied_total";
    pub const FRAMES_DROPPED_TOTAL: &str = "parley_frames_dropped_total";
    pub const SESSIONS_OPENED_TOTAL: &str = "parley_sessions_opened_total";
    pub const SESSIONS_CLOSED_TOTAL: &str = "parley_sessions_closed_total";
    pub const SESSIONS_LIVE: &str = "parley_sessions_live";
    pub const HISTORY_LATENCY_SECONDS: &str = "parley_history_latency_seconds";
    pub const HISTORY_FAILURES_TOTAL: &str = "parley_history_failures_total";
    pub const SEND_FAILURES_TOTAL: &str = "parley_send_failures_total";
}

/// Register descriptions with the installed recorder.
pub fn describe() {
    metrics::describe_counter!(
        names::EVENTS_APPLIED_TOTAL,
        "Events applied to the message store, by kind"
    );
    metrics::describe_counter!(
        names::FRAMES_DROPPED_TOTAL,
        "Inbound frames dropped, by reason"
    );
    metrics::describe_counter!(names::SESSIONS_OPENED_TOTAL, "Transport sessions connected");
    metrics::describe_counter!(
        names::SESSIONS_CLOSED_TOTAL,
        "Transport sessions ended, by cause"
    );
    metrics::describe_gauge!(names::SESSIONS_LIVE, "Currently connected transport sessions");
    metrics::describe_histogram!(
        names::HISTORY_LATENCY_SECONDS,
        "History fetch latency in seconds"
    );
    metrics::describe_counter!(names::HISTORY_FAILURES_TOTAL, "Failed history fetches");
    metrics::describe_counter!(names::SEND_FAILURES_TOTAL, "Failed message submissions");
}

/// Record an event applied to the store.
pub fn record_event(kind: &'static str) {
    counter!(names::EVENTS_APPLIED_TOTAL, "kind" => kind).increment(1);
}

/// Record a dropped frame.
pub fn record_dropped_frame(reason: &'static str) {
    counter!(names::FRAMES_DROPPED_TOTAL, "reason" => reason).increment(1);
}

/// Record a session reaching the connected state.
pub fn record_session_opened() {
    counter!(names::SESSIONS_OPENED_TOTAL).increment(1);
    gauge!(names::SESSIONS_LIVE).increment(1.0);
}

/// Record a connected session ending.
pub fn record_session_closed(cause: &'static str) {
    counter!(names::SESSIONS_CLOSED_TOTAL, "cause" => cause).increment(1);
    gauge!(names::SESSIONS_LIVE).decrement(1.0);
}

/// Record history fetch latency.
pub fn record_history_latency(elapsed: Duration) {
    histogram!(names::HISTORY_LATENCY_SECONDS).record(elapsed.as_secs_f64());
}

/// Record a failed history fetch.
pub fn record_history_failure() {
    counter!(names::HISTORY_FAILURES_TOTAL).increment(1);
}

/// Record a failed send.
pub fn record_send_failure() {
    counter!(names::SEND_FAILURES_TOTAL).increment(1);
}
