use tracing::trace;

// Lightweight metrics helpers that are safe in demo builds.
// These intentionally avoid pulling in metrics macros to keep deps stable.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "boutique.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn inc_events(kind: &'static str) {
    trace!(target = "boutique.metrics", kind = kind, "events_total_inc");
}

pub fn turn_elapsed(elapsed_ms: u128) {
    trace!(
        target = "boutique.metrics",
        elapsed_ms = elapsed_ms as u64,
        "turn_elapsed"
    );
}
