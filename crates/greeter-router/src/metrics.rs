//! Metric names recorded by the router.

/// Inbound events handled (counter, labels: type).
pub const EVENTS_TOTAL: &str = "greeter_events_total";
/// Inbound events that failed (counter, labels: type, code).
pub const EVENT_ERRORS_TOTAL: &str = "greeter_event_errors_total";
/// Inbound event handling time (histogram, labels: type).
pub const EVENT_DURATION_SECONDS: &str = "greeter_event_duration_seconds";
/// Call request outcomes (counter, labels: outcome).
pub const CALLS_TOTAL: &str = "greeter_calls_total";
/// Requests moved to another agent after a miss or disconnect (counter).
pub const REROUTES_TOTAL: &str = "greeter_reroutes_total";
/// Agents forced away (counter, labels: reason).
pub const AGENTS_MARKED_AWAY_TOTAL: &str = "greeter_agents_marked_away_total";
/// Connected visitors (gauge).
pub const VISITORS_ACTIVE: &str = "greeter_visitors_active";
/// Agent sessions (gauge).
pub const AGENTS_ACTIVE: &str = "greeter_agents_active";
/// Active calls (gauge).
pub const CALLS_ACTIVE: &str = "greeter_calls_active";
/// Side effects dropped because the queue was full (counter).
pub const SIDE_EFFECTS_DROPPED_TOTAL: &str = "greeter_side_effects_dropped_total";
/// Side effects whose collaborator call failed (counter, labels: kind).
pub const SIDE_EFFECT_FAILURES_TOTAL: &str = "greeter_side_effect_failures_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_prefixed_snake_case() {
        for name in [
            EVENTS_TOTAL,
            EVENT_ERRORS_TOTAL,
            EVENT_DURATION_SECONDS,
            CALLS_TOTAL,
            REROUTES_TOTAL,
            AGENTS_MARKED_AWAY_TOTAL,
            VISITORS_ACTIVE,
            AGENTS_ACTIVE,
            CALLS_ACTIVE,
            SIDE_EFFECTS_DROPPED_TOTAL,
            SIDE_EFFECT_FAILURES_TOTAL,
        ] {
            assert!(name.starts_with("greeter_"), "{name}");
            assert!(name.chars().all(|c| c.is_ascii_lowercase() || c == '_'), "{name}");
        }
    }
}
