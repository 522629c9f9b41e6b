//! Metric names recorded through the `metrics` facade.
//!
//! The library never installs a recorder; the embedding application decides
//! whether and where these are exported.

/// Initial connect attempts (counter).
pub const BUS_CONNECT_ATTEMPTS_TOTAL: &str = "bus_connect_attempts_total";
/// Connect loops that exhausted their retries (counter).
pub const BUS_CONNECT_FAILURES_TOTAL: &str = "bus_connect_failures_total";
/// Status events seen by the connection listener (counter, labels: event).
pub const BUS_STATUS_EVENTS_TOTAL: &str = "bus_status_events_total";
/// Subject subscriptions opened (counter).
pub const BUS_SUBSCRIPTIONS_TOTAL: &str = "bus_subscriptions_total";
/// Messages handed to a handler successfully (counter, labels: path).
pub const BUS_MESSAGES_DELIVERED_TOTAL: &str = "bus_messages_delivered_total";
/// Per-message delivery failures (counter, labels: kind).
pub const BUS_DELIVERY_ERRORS_TOTAL: &str = "bus_delivery_errors_total";
/// Publishes sent (counter).
pub const BUS_PUBLISHES_TOTAL: &str = "bus_publishes_total";
/// Publishes rejected (counter, labels: reason).
pub const BUS_PUBLISH_ERRORS_TOTAL: &str = "bus_publish_errors_total";
/// Durable delivery loops started (counter).
pub const BUS_DURABLE_LOOPS_TOTAL: &str = "bus_durable_loops_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            BUS_CONNECT_ATTEMPTS_TOTAL,
            BUS_CONNECT_FAILURES_TOTAL,
            BUS_STATUS_EVENTS_TOTAL,
            BUS_SUBSCRIPTIONS_TOTAL,
            BUS_MESSAGES_DELIVERED_TOTAL,
            BUS_DELIVERY_ERRORS_TOTAL,
            BUS_PUBLISHES_TOTAL,
            BUS_PUBLISH_ERRORS_TOTAL,
            BUS_DURABLE_LOOPS_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
            assert!(name.starts_with("bus_"));
        }
    }
}
