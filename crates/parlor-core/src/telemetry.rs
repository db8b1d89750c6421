//! Metrics recorded by the core components.
//!
//! Recording goes through the `metrics` facade; the binary decides whether
//! anything is exported.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Metric names.
pub mod names {
    pub const EVENTS_PUBLISHED: &str = "parlor_events_published_total";
    pub const EVENTS_DEDUPLICATED: &str = "parlor_events_deduplicated_total";
    pub const EVENTS_POISONED: &str = "parlor_events_poisoned_total";
    pub const HANDLER_ERRORS: &str = "parlor_handler_errors_total";
    pub const ATTEMPTS_TOTAL: &str = "parlor_attempts_total";
    pub const ATTEMPT_SECONDS: &str = "parlor_attempt_duration_seconds";
    pub const DISPATCH_DROPPED: &str = "parlor_dispatch_dropped_total";
    pub const QUEUE_DEPTH: &str = "parlor_dispatch_queue_depth";
    pub const EMIT_FAILURES: &str = "parlor_emit_failures_total";
    pub const MESSAGES_ROUTED: &str = "parlor_messages_routed_total";
    pub const MESSAGES_REJECTED: &str = "parlor_messages_rejected_total";
    pub const PARTITIONS_CREATED: &str = "parlor_partitions_created_total";
    pub const ADMISSIONS: &str = "parlor_admissions_total";
}

/// Register descriptions for every core metric.
pub fn describe() {
    metrics::describe_counter!(names::EVENTS_PUBLISHED, "Events handed to subscribers");
    metrics::describe_counter!(
        names::EVENTS_DEDUPLICATED,
        "Message events suppressed as duplicates"
    );
    metrics::describe_counter!(
        names::EVENTS_POISONED,
        "Message events dropped after exhausting their attempt cap"
    );
    metrics::describe_counter!(names::HANDLER_ERRORS, "Event handler failures");
    metrics::describe_counter!(names::ATTEMPTS_TOTAL, "Retried operation attempts by outcome");
    metrics::describe_histogram!(names::ATTEMPT_SECONDS, "Duration of a single attempt");
    metrics::describe_counter!(
        names::DISPATCH_DROPPED,
        "Dispatch jobs abandoned after their retry budget"
    );
    metrics::describe_gauge!(names::QUEUE_DEPTH, "Jobs waiting in the dispatch queue");
    metrics::describe_counter!(names::EMIT_FAILURES, "Outbound writes that failed every attempt");
    metrics::describe_counter!(names::MESSAGES_ROUTED, "Messages persisted and published");
    metrics::describe_counter!(names::MESSAGES_REJECTED, "Messages rejected by the router");
    metrics::describe_counter!(names::PARTITIONS_CREATED, "Group partitions created");
    metrics::describe_counter!(names::ADMISSIONS, "Admission attempts by outcome");
}

pub(crate) fn record_event_published(kind: &'static str) {
    counter!(names::EVENTS_PUBLISHED, "kind" => kind).increment(1);
}

pub(crate) fn record_event_deduplicated(kind: &'static str) {
    counter!(names::EVENTS_DEDUPLICATED, "kind" => kind).increment(1);
}

pub(crate) fn record_event_poisoned(kind: &'static str) {
    counter!(names::EVENTS_POISONED, "kind" => kind).increment(1);
}

pub(crate) fn record_handler_error(kind: &'static str, handler: &'static str) {
    counter!(names::HANDLER_ERRORS, "kind" => kind, "handler" => handler).increment(1);
}

pub(crate) fn record_attempt(operation: &'static str, outcome: &'static str, elapsed: Duration) {
    counter!(names::ATTEMPTS_TOTAL, "operation" => operation, "outcome" => outcome).increment(1);
    histogram!(names::ATTEMPT_SECONDS, "operation" => operation).record(elapsed.as_secs_f64());
}

pub(crate) fn record_dispatch_dropped(action: &'static str) {
    counter!(names::DISPATCH_DROPPED, "action" => action).increment(1);
}

pub(crate) fn set_queue_depth(depth: usize) {
    gauge!(names::QUEUE_DEPTH).set(depth as f64);
}

pub(crate) fn record_emit_failure() {
    counter!(names::EMIT_FAILURES).increment(1);
}

pub(crate) fn record_message_routed(target: &'static str) {
    counter!(names::MESSAGES_ROUTED, "target" => target).increment(1);
}

pub(crate) fn record_message_rejected(reason: &'static str) {
    counter!(names::MESSAGES_REJECTED, "reason" => reason).increment(1);
}

pub(crate) fn record_partition_created() {
    counter!(names::PARTITIONS_CREATED).increment(1);
}

pub(crate) fn record_admission(outcome: &'static str) {
    counter!(names::ADMISSIONS, "outcome" => outcome).increment(1);
}
