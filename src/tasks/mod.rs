// src/tasks/mod.rs

//! Background task management: the Sync Engine's periodic reconcile sweep
//! and PendingChange drain worker, plus the Metrics Aggregator's hourly/daily
//! rollup and retention jobs.

use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Datelike, Timelike, Utc};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{error, info, warn};

use crate::domain::RecordKind;
use crate::state::AppState;

pub mod config;
pub mod metrics;

use config::TaskConfig;
use metrics::TaskMetrics;

const RECONCILE_KINDS: [RecordKind; 2] = [RecordKind::Product, RecordKind::Category];

/// Owns every background job spawned alongside the HTTP/WS server.
pub struct TaskManager {
    app_state: Arc<AppState>,
    config: TaskConfig,
    metrics: Arc<TaskMetrics>,
    handles: Vec<JoinHandle<()>>,
}

impl TaskManager {
    pub fn new(app_state: Arc<AppState>) -> Self {
        Self {
            app_state,
            config: TaskConfig::from_env(),
            metrics: Arc::new(TaskMetrics::new()),
            handles: Vec::new(),
        }
    }

    /// Starts all enabled background tasks. Requeues any PendingChange rows
    /// left unprocessed by a prior crash before the drain worker starts.
    pub async fn start(&mut self) {
        info!("starting background task manager");

        match self
            .app_state
            .sync_engine
            .requeue_unprocessed(&self.app_state.pool)
            .await
        {
            Ok(count) if count > 0 => info!(count, "requeued unprocessed pending changes"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "failed to requeue unprocessed pending changes"),
        }

        if self.config.reconcile_enabled {
            self.handles.push(self.spawn_reconcile_sweep());
        }
        if self.config.drain_enabled {
            self.handles.push(self.spawn_drain_worker());
        }
        if self.config.hourly_aggregate_enabled {
            self.handles.push(self.spawn_hourly_aggregate());
        }
        if self.config.daily_aggregate_enabled || self.config.retention_enabled {
            self.handles.push(self.spawn_daily_aggregate_and_retention());
        }
        self.handles.push(self.spawn_metrics_reporter());

        info!(count = self.handles.len(), "background tasks started");
    }

    /// Full diff-and-converge pass over every catalog kind, on a fixed interval.
    /// Safety net behind the PendingChange drain worker: catches anything a
    /// dropped webhook or queue overflow missed.
    fn spawn_reconcile_sweep(&self) -> JoinHandle<()> {
        let sync_engine = self.app_state.sync_engine.clone();
        let interval = self.config.reconcile_interval;
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            info!(?interval, "reconcile sweep task started");
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                for kind in RECONCILE_KINDS {
                    let start = std::time::Instant::now();
                    match sync_engine.reconcile(kind).await {
                        Ok(report) => {
                            let elapsed = start.elapsed();
                            metrics.record_task_duration("reconcile", elapsed);
                            metrics.add_processed_items(
                                "reconcile",
                                report.upserted + report.deleted,
                            );
                            crate::metrics::record_sync_reconcile(
                                kind.as_str(),
                                report.upserted as u64,
                                report.deleted as u64,
                                report.unchanged as u64,
                            );
                        }
                        Err(e) => {
                            error!(kind = kind.as_str(), error = %e, "reconcile sweep failed");
                            metrics.record_error("reconcile");
                        }
                    }
                }
            }
        })
    }

    /// Drains the PendingChange queue as fast as events arrive; polls at
    /// `drain_poll_interval` when idle rather than busy-looping.
    fn spawn_drain_worker(&self) -> JoinHandle<()> {
        let sync_engine = self.app_state.sync_engine.clone();
        let pool = self.app_state.pool.clone();
        let poll_interval = self.config.drain_poll_interval;
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            info!(?poll_interval, "pending change drain worker started");
            loop {
                crate::metrics::set_pending_queue_depth(sync_engine.pending.len().await as u64);

                let start = std::time::Instant::now();
                match sync_engine.drain_one(&pool).await {
                    Ok(true) => {
                        metrics.record_task_duration("drain", start.elapsed());
                        metrics.add_processed_items("drain", 1);
                        continue;
                    }
                    Ok(false) => {
                        time::sleep(poll_interval).await;
                    }
                    Err(e) => {
                        error!(error = %e, "pending change drain failed");
                        metrics.record_error("drain");
                        time::sleep(poll_interval).await;
                    }
                }
            }
        })
    }

    /// Fires at H:05 for every completed hour H-1, per spec.
    fn spawn_hourly_aggregate(&self) -> JoinHandle<()> {
        let aggregator = self.app_state.aggregator.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            info!("hourly aggregate task started");
            loop {
                let now = Utc::now();
                let next_run = next_hourly_run(now);
                sleep_until(next_run).await;

                let hour_start = next_run
                    .date_naive()
                    .and_hms_opt(next_run.hour(), 0, 0)
                    .unwrap()
                    .and_utc()
                    - chrono::Duration::hours(1);

                let start = std::time::Instant::now();
                match aggregator.hourly_rollup(hour_start).await {
                    Ok(rows) => {
                        metrics.record_task_duration("hourly_aggregate", start.elapsed());
                        metrics.add_processed_items("hourly_aggregate", rows.len());
                        info!(bucket = %hour_start, buckets = rows.len(), "hourly aggregate complete");
                    }
                    Err(e) => {
                        error!(error = %e, "hourly aggregate failed");
                        metrics.record_error("hourly_aggregate");
                    }
                }
            }
        })
    }

    /// Fires at 02:00 for the completed day, then runs retention immediately
    /// after so the day's activity is captured in aggregates before its raw
    /// rows age out.
    fn spawn_daily_aggregate_and_retention(&self) -> JoinHandle<()> {
        let aggregator = self.app_state.aggregator.clone();
        let metrics = self.metrics.clone();
        let daily_enabled = self.config.daily_aggregate_enabled;
        let retention_enabled = self.config.retention_enabled;
        let message_retention_days = crate::config::CONFIG.session.message_retention_days;
        let conversation_retention_days = crate::config::CONFIG.session.conversation_retention_days;

        tokio::spawn(async move {
            info!("daily aggregate/retention task started");
            loop {
                let now = Utc::now();
                let next_run = next_daily_run(now);
                sleep_until(next_run).await;

                let day_start = next_run
                    .date_naive()
                    .and_hms_opt(0, 0, 0)
                    .unwrap()
                    .and_utc()
                    - chrono::Duration::days(1);

                if daily_enabled {
                    let start = std::time::Instant::now();
                    match aggregator.daily_rollup(day_start).await {
                        Ok(rows) => {
                            metrics.record_task_duration("daily_aggregate", start.elapsed());
                            metrics.add_processed_items("daily_aggregate", rows.len());
                            info!(bucket = %day_start, buckets = rows.len(), "daily aggregate complete");
                        }
                        Err(e) => {
                            error!(error = %e, "daily aggregate failed");
                            metrics.record_error("daily_aggregate");
                        }
                    }
                }

                if retention_enabled {
                    let start = std::time::Instant::now();
                    match aggregator
                        .run_retention(Utc::now(), message_retention_days, conversation_retention_days)
                        .await
                    {
                        Ok((messages, conversations)) => {
                            metrics.record_task_duration("retention", start.elapsed());
                            metrics.add_processed_items(
                                "retention",
                                (messages + conversations) as usize,
                            );
                            info!(messages, conversations, "retention sweep complete");
                        }
                        Err(e) => {
                            error!(error = %e, "retention sweep failed");
                            metrics.record_error("retention");
                        }
                    }
                }
            }
        })
    }

    fn spawn_metrics_reporter(&self) -> JoinHandle<()> {
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_secs(300));
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                metrics.report();
            }
        })
    }

    /// Gracefully aborts all background tasks.
    pub async fn shutdown(self) {
        info!("shutting down background tasks");
        for handle in self.handles {
            handle.abort();
        }
        info!("all background tasks stopped");
    }
}

fn next_hourly_run(now: DateTime<Utc>) -> DateTime<Utc> {
    let candidate = now
        .date_naive()
        .and_hms_opt(now.hour(), 5, 0)
        .unwrap()
        .and_utc();
    if candidate > now {
        candidate
    } else {
        candidate + chrono::Duration::hours(1)
    }
}

fn next_daily_run(now: DateTime<Utc>) -> DateTime<Utc> {
    let candidate = now.date_naive().and_hms_opt(2, 0, 0).unwrap().and_utc();
    if candidate > now {
        candidate
    } else {
        candidate + chrono::Duration::days(1)
    }
}

async fn sleep_until(target: DateTime<Utc>) {
    let now = Utc::now();
    let delta = (target - now).to_std().unwrap_or(Duration::from_secs(0));
    if delta > Duration::from_secs(0) {
        time::sleep(delta).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn next_hourly_run_lands_on_minute_five() {
        let now = Utc.with_ymd_and_hms(2026, 7, 27, 10, 3, 0).unwrap();
        let next = next_hourly_run(now);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 7, 27, 10, 5, 0).unwrap());
    }

    #[test]
    fn next_hourly_run_rolls_to_next_hour_if_already_past_minute_five() {
        let now = Utc.with_ymd_and_hms(2026, 7, 27, 10, 6, 0).unwrap();
        let next = next_hourly_run(now);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 7, 27, 11, 5, 0).unwrap());
    }

    #[test]
    fn next_daily_run_rolls_to_next_day_if_already_past_0200() {
        let now = Utc.with_ymd_and_hms(2026, 7, 27, 3, 0, 0).unwrap();
        let next = next_daily_run(now);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 7, 28, 2, 0, 0).unwrap());
    }
}
