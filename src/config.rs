use once_cell::sync::Lazy;

fn env_var(key: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| panic!("{key} must be set"))
}

fn env_var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64_or(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub static DATABASE_URL: Lazy<String> = Lazy::new(|| env_var("DATABASE_URL"));
pub static BIND_ADDRESS: Lazy<String> = Lazy::new(|| env_var_or("BIND_ADDRESS", "0.0.0.0"));
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    env_var_or("BIND_PORT", "8080")
        .parse()
        .expect("BIND_PORT must be a u16")
});
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
});

/// Nominal heartbeat cadence in seconds; staleness is declared at 5x this value.
pub static HEARTBEAT_INTERVAL_SECS: Lazy<u64> =
    Lazy::new(|| env_u64_or("HEARTBEAT_INTERVAL_SECS", 30));
pub static STALE_SWEEP_INTERVAL_SECS: Lazy<u64> =
    Lazy::new(|| env_u64_or("STALE_SWEEP_INTERVAL_SECS", 15));

/// Default per-API-key token bucket rates.
pub static RATE_LIMIT_WRITE_RPS: Lazy<u32> =
    Lazy::new(|| env_u64_or("RATE_LIMIT_WRITE_RPS", 60) as u32);
pub static RATE_LIMIT_READ_RPS: Lazy<u32> =
    Lazy::new(|| env_u64_or("RATE_LIMIT_READ_RPS", 600) as u32);

/// Bounded buffer size applied to each slow viewer's fan-out subscription.
pub static VIEWER_BUFFER_FRAMES: Lazy<usize> =
    Lazy::new(|| env_u64_or("VIEWER_BUFFER_FRAMES", 1000) as usize);

/// Per-instance ingestion queue bound before backpressure kicks in.
pub static INGESTION_QUEUE_CAPACITY: Lazy<usize> =
    Lazy::new(|| env_u64_or("INGESTION_QUEUE_CAPACITY", 10_000) as usize);

pub static SCHEDULER_SCAN_INTERVAL_SECS: Lazy<u64> =
    Lazy::new(|| env_u64_or("SCHEDULER_SCAN_INTERVAL_SECS", 5));
pub static ALERT_EVAL_INTERVAL_SECS: Lazy<u64> =
    Lazy::new(|| env_u64_or("ALERT_EVAL_INTERVAL_SECS", 10));
pub static DRIFT_SCAN_INTERVAL_SECS: Lazy<u64> =
    Lazy::new(|| env_u64_or("DRIFT_SCAN_INTERVAL_SECS", 300));
