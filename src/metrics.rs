use tracing::trace;

// Counters are emitted as trace events so a subscriber can aggregate them
// without an exporter being wired in.

pub fn job_finished(kind: &'static str, outcome: &'static str, elapsed_ms: u128) {
    trace!(
        target = "cardbulk.metrics",
        kind = kind,
        outcome = outcome,
        elapsed_ms = elapsed_ms as u64,
        "jobs_finished_total_inc"
    );
}

pub fn rows_resolved(outcome: &'static str) {
    trace!(
        target = "cardbulk.metrics",
        outcome = outcome,
        "import_rows_total_inc"
    );
}

pub fn batch_committed(records: usize, elapsed_ms: u128) {
    trace!(
        target = "cardbulk.metrics",
        records = records as u64,
        elapsed_ms = elapsed_ms as u64,
        "sync_batches_total_inc"
    );
}
