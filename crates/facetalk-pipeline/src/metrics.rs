//! Pipeline metrics. Compiled to no-ops without the `metrics` feature.

use std::time::Duration;

/// Record a finished turn by outcome ("delivered", "cancelled", or an error kind).
#[cfg(feature = "metrics")]
pub fn record_turn(outcome: &str) {
    let labels = [("outcome", outcome.to_string())];
    metrics::counter!("turns_total", &labels).increment(1);
}

#[cfg(not(feature = "metrics"))]
pub fn record_turn(_outcome: &str) {}

/// Record a stage adapter call duration.
#[cfg(feature = "metrics")]
pub fn record_stage(stage: &str, elapsed: Duration) {
    let labels = [("stage", stage.to_string())];
    metrics::histogram!("stage_duration_seconds", &labels).record(elapsed.as_secs_f64());
}

#[cfg(not(feature = "metrics"))]
pub fn record_stage(_stage: &str, _elapsed: Duration) {}

#[cfg(feature = "metrics")]
pub fn record_cache_lookup(hit: bool) {
    let name = if hit { "cache_hits_total" } else { "cache_misses_total" };
    metrics::counter!(name).increment(1);
}

#[cfg(not(feature = "metrics"))]
pub fn record_cache_lookup(_hit: bool) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_does_not_panic() {
        record_turn("delivered");
        record_stage("llm", Duration::from_millis(12));
        record_cache_lookup(true);
        record_cache_lookup(false);
    }
}
