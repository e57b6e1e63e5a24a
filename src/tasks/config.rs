// src/tasks/config.rs
// Configuration for background tasks (C5 sync sweep/drain, C13 aggregate/retention)

use std::time::Duration;

pub struct TaskConfig {
    // Sync Engine (C5) periodic full reconcile, one sweep per catalog kind
    pub reconcile_enabled: bool,
    pub reconcile_interval: Duration,

    // Sync Engine (C5) PendingChange drain worker, polls for webhook-enqueued events
    pub drain_enabled: bool,
    pub drain_poll_interval: Duration,

    // Metrics Aggregator (C13) hourly rollup, fires at H:05 for hour=H-1
    pub hourly_aggregate_enabled: bool,

    // Metrics Aggregator (C13) daily rollup + retention, fires at 02:00 for date=yesterday
    pub daily_aggregate_enabled: bool,
    pub retention_enabled: bool,
}

impl TaskConfig {
    pub fn from_env() -> Self {
        Self {
            reconcile_enabled: env_bool("TASK_RECONCILE_ENABLED", true),
            reconcile_interval: Duration::from_secs(env_u64("TASK_RECONCILE_INTERVAL_SECS", 3600)),

            drain_enabled: env_bool("TASK_DRAIN_ENABLED", true),
            drain_poll_interval: Duration::from_secs(env_u64("TASK_DRAIN_POLL_INTERVAL_SECS", 5)),

            hourly_aggregate_enabled: env_bool("TASK_HOURLY_AGGREGATE_ENABLED", true),
            daily_aggregate_enabled: env_bool("TASK_DAILY_AGGREGATE_ENABLED", true),
            retention_enabled: env_bool("TASK_RETENTION_ENABLED", true),
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
