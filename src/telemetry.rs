//! Metric registration.
//!
//! Emission happens at the call sites; this module owns the metric names and
//! their one-time descriptions. Installing a recorder is the host
//! application's job.

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};

pub(crate) const METRIC_HIT_TOTAL: &str = "sincro_cache_hit_total";
pub(crate) const METRIC_MISS_TOTAL: &str = "sincro_cache_miss_total";
pub(crate) const METRIC_FETCH_JOIN_TOTAL: &str = "sincro_fetch_join_total";
pub(crate) const METRIC_FETCH_DISCARD_TOTAL: &str = "sincro_fetch_discard_total";
pub(crate) const METRIC_FETCH_ERROR_TOTAL: &str = "sincro_fetch_error_total";
pub(crate) const METRIC_FETCH_MS: &str = "sincro_fetch_ms";
pub(crate) const METRIC_OPTIMISTIC_APPLY_TOTAL: &str = "sincro_optimistic_apply_total";
pub(crate) const METRIC_ROLLBACK_TOTAL: &str = "sincro_rollback_total";
pub(crate) const METRIC_MUTATION_MS: &str = "sincro_mutation_ms";
pub(crate) const METRIC_INVALIDATED_KEYS_TOTAL: &str = "sincro_invalidated_keys_total";
pub(crate) const METRIC_GC_EVICTED_TOTAL: &str = "sincro_gc_evicted_total";

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Register metric descriptions with the installed recorder. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_HIT_TOTAL,
            Unit::Count,
            "Reads served from fresh cached data without a network call."
        );
        describe_counter!(
            METRIC_MISS_TOTAL,
            Unit::Count,
            "Reads that issued a fetch (absent or stale entry)."
        );
        describe_counter!(
            METRIC_FETCH_JOIN_TOTAL,
            Unit::Count,
            "Callers attached to an already in-flight fetch for the same key."
        );
        describe_counter!(
            METRIC_FETCH_DISCARD_TOTAL,
            Unit::Count,
            "Fetch resolutions discarded because a newer one was already applied."
        );
        describe_counter!(
            METRIC_FETCH_ERROR_TOTAL,
            Unit::Count,
            "Fetches that resolved with a remote error."
        );
        describe_histogram!(
            METRIC_FETCH_MS,
            Unit::Milliseconds,
            "Latency of remote fetches, issue to applied resolution."
        );
        describe_counter!(
            METRIC_OPTIMISTIC_APPLY_TOTAL,
            Unit::Count,
            "Optimistic patches applied ahead of remote confirmation."
        );
        describe_counter!(
            METRIC_ROLLBACK_TOTAL,
            Unit::Count,
            "Mutations rolled back after a remote failure."
        );
        describe_histogram!(
            METRIC_MUTATION_MS,
            Unit::Milliseconds,
            "Latency of mutations including settlement."
        );
        describe_counter!(
            METRIC_INVALIDATED_KEYS_TOTAL,
            Unit::Count,
            "Cache entries marked stale by invalidation fan-out."
        );
        describe_counter!(
            METRIC_GC_EVICTED_TOTAL,
            Unit::Count,
            "Detached entries removed by the GC sweep."
        );
    });
}
