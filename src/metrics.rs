use envoy_production_toggle::CoordinatorState;
use prometheus::{Encoder, Gauge, IntCounterVec, IntGauge, TextEncoder};
use rocket::http::Status;

lazy_static! {
    static ref CURRENT_POWER_GAUGE: Gauge = register_gauge!(opts!(
        "envoy_current_power_watts",
        "current production power reported by the Envoy (in W)",
    ))
    .unwrap();
    static ref PRODUCING_GAUGE: IntGauge = register_int_gauge!(opts!(
        "envoy_producing",
        "1 while the Envoy reports non-zero production",
    ))
    .unwrap();
    static ref PRODUCTION_ENABLED_GAUGE: IntGauge = register_int_gauge!(opts!(
        "envoy_production_enabled",
        "1 while production is enabled on the Envoy",
    ))
    .unwrap();
    static ref LAST_UPDATE_SUCCESS_GAUGE: IntGauge = register_int_gauge!(opts!(
        "envoy_last_update_success",
        "1 if the most recent poll succeeded",
    ))
    .unwrap();
    static ref TOGGLE_FAILURES_COUNTER: IntCounterVec = register_int_counter_vec!(
        opts!(
            "envoy_toggle_failures_total",
            "production toggle commands that failed",
        ),
        &["command"],
    )
    .unwrap();
}

/// Copy the coordinator's latest state into the gauges. Without a snapshot the
/// production gauges keep their initial zero.
pub fn observe(state: &CoordinatorState) {
    LAST_UPDATE_SUCCESS_GAUGE.set(state.last_update_success as i64);

    if let Some(snapshot) = &state.snapshot {
        CURRENT_POWER_GAUGE.set(snapshot.current_power_watts as f64);
        PRODUCING_GAUGE.set(snapshot.is_producing as i64);
        PRODUCTION_ENABLED_GAUGE.set(snapshot.production_enabled as i64);
    }
}

pub fn record_toggle_failure(command: &str) {
    TOGGLE_FAILURES_COUNTER.with_label_values(&[command]).inc();
}

/// Read metrics from Prometheus exporter registry.
pub fn read() -> Result<String, Status> {
    // Gather the metrics.
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    encoder.encode(&metric_families, &mut buffer).map_err(|e| {
        log::error!("Unable to encode metrics: {}", e);
        Status::InternalServerError
    })?;
    String::from_utf8(buffer).or(Err(Status::InternalServerError))
}
