use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge,
    IntCounter, IntCounterVec, IntGauge,
};
use log::info;

/// Результаты изменений набора endpoints (committed, rolled_back, rejected)
pub static ENDPOINT_UPDATES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "endpoint_updates_total",
        "Total endpoint update attempts",
        &["result"]
    )
    .expect("Failed to register endpoint_updates_total metric")
});

/// Неудачные reload прокси
pub static PROXY_RELOAD_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "proxy_reload_failures_total",
        "Total failed proxy reloads"
    )
    .expect("Failed to register proxy_reload_failures_total metric")
});

/// Текущее количество endpoints
pub static ENDPOINTS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "endpoints",
        "Number of configured endpoints"
    )
    .expect("Failed to register endpoints metric")
});

/// Завершенные задачи по статусу
pub static JOBS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "jobs_total",
        "Total finished jobs",
        &["status"]
    )
    .expect("Failed to register jobs_total metric")
});

pub const RESULT_COMMITTED: &str = "committed";
pub const RESULT_ROLLED_BACK: &str = "rolled_back";
pub const RESULT_REJECTED: &str = "rejected";

pub fn record_update(result: &str) {
    ENDPOINT_UPDATES_TOTAL.with_label_values(&[result]).inc();
}

/// Инициализация метрик
pub fn init_metrics() {
    Lazy::force(&ENDPOINT_UPDATES_TOTAL);
    Lazy::force(&PROXY_RELOAD_FAILURES);
    Lazy::force(&ENDPOINTS);
    Lazy::force(&JOBS_TOTAL);
    info!("Prometheus metrics initialized");
    info!("Available metrics:");
    info!("  - endpoint_updates_total");
    info!("  - proxy_reload_failures_total");
    info!("  - endpoints");
    info!("  - jobs_total");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        init_metrics();
        let before = ENDPOINT_UPDATES_TOTAL.with_label_values(&[RESULT_REJECTED]).get();
        record_update(RESULT_REJECTED);
        assert!(ENDPOINT_UPDATES_TOTAL.with_label_values(&[RESULT_REJECTED]).get() > before);
        PROXY_RELOAD_FAILURES.inc();
        ENDPOINTS.set(3);
    }
}
