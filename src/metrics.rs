use tracing::trace;

// Trace-level counters; a collector can aggregate them from the
// `listing_bot.metrics` target without an exporter in the process.

pub fn inc_jobs(outcome: &'static str) {
    trace!(target = "listing_bot.metrics", outcome = outcome, "jobs_total_inc");
}

pub fn inc_fetch(ok: bool) {
    trace!(
        target = "listing_bot.metrics",
        result = if ok { "ok" } else { "failed" },
        "image_fetch_total_inc"
    );
}

pub fn inc_access_denied() {
    trace!(target = "listing_bot.metrics", "access_denied_total_inc");
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "listing_bot.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}
