use lazy_static::lazy_static;
use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry, register_int_gauge_with_registry,
    Encoder, Histogram, IntCounterVec, IntGauge, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new_custom(Some("codex".to_string()), None)
        .expect("metric prefix is valid");

    pub static ref JOBS_SUBMITTED: IntCounterVec = register_int_counter_vec_with_registry!(
        "jobs_submitted_total",
        "Jobs accepted for execution",
        &["language"],
        REGISTRY
    )
    .expect("metric can be registered");

    pub static ref JOBS_FINISHED: IntCounterVec = register_int_counter_vec_with_registry!(
        "jobs_finished_total",
        "Jobs that reached a terminal state",
        &["state", "reason"],
        REGISTRY
    )
    .expect("metric can be registered");

    pub static ref SUBMISSIONS_REJECTED: IntCounterVec = register_int_counter_vec_with_registry!(
        "submissions_rejected_total",
        "Submissions refused at admission",
        &["reason"],
        REGISTRY
    )
    .expect("metric can be registered");

    pub static ref QUEUE_DEPTH: IntGauge = register_int_gauge_with_registry!(
        "queue_depth",
        "Jobs waiting for a sandbox slot",
        REGISTRY
    )
    .expect("metric can be registered");

    pub static ref BUSY_SLOTS: IntGauge = register_int_gauge_with_registry!(
        "busy_slots",
        "Sandbox slots currently executing a job",
        REGISTRY
    )
    .expect("metric can be registered");

    pub static ref JOB_DURATION: Histogram = register_histogram_with_registry!(
        "job_duration_seconds",
        "Wall time from dispatch to terminal state",
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
        REGISTRY
    )
    .expect("metric can be registered");
}

/// Render every metric in the Prometheus text exposition format.
pub fn gather() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_exposes_prefixed_metrics() {
        JOBS_SUBMITTED.with_label_values(&["python"]).inc();
        QUEUE_DEPTH.set(0);
        let text = gather().unwrap();
        assert!(text.contains("codex_jobs_submitted_total"));
        assert!(text.contains("codex_queue_depth"));
    }
}
