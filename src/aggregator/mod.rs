// src/aggregator/mod.rs
// Metrics Aggregator (C13): hourly/daily rollups over conversations/messages
// and the retention sweep. Owns `metrics_hourly`/`metrics_daily`; only reads
// `conversations`/`messages`.

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::error::EngineResult;
use crate::metrics;

/// One row of `metrics_hourly`/`metrics_daily`.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRow {
    pub bucket: String,
    pub platform: String,
    pub conversations_started: i64,
    pub conversations_ended: i64,
    pub messages_count: i64,
    pub user_messages_count: i64,
    pub bot_messages_count: i64,
    pub escalation_count: i64,
    pub refine_count: i64,
    pub avg_response_time_ms: f64,
}

pub struct MetricsAggregator {
    pool: SqlitePool,
}

/// Truncates to the start of the hour containing `at`, formatted as RFC3339.
fn hour_bucket(at: DateTime<Utc>) -> String {
    at.date_naive()
        .and_hms_opt(at.hour(), 0, 0)
        .expect("valid hour")
        .and_utc()
        .to_rfc3339()
}

/// Truncates to the start of the day containing `at`, formatted as RFC3339.
fn day_bucket(at: DateTime<Utc>) -> String {
    at.date_naive().and_hms_opt(0, 0, 0).expect("valid day").and_utc().to_rfc3339()
}

impl MetricsAggregator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Rolls up the hour that started at `hour_start` (should be a hour-aligned
    /// timestamp, e.g. `now - 1h` truncated). Idempotent: UPSERTs keyed by
    /// `(bucket, platform)`.
    pub async fn hourly_rollup(&self, hour_start: DateTime<Utc>) -> EngineResult<Vec<AggregateRow>> {
        let t0 = std::time::Instant::now();
        let bucket = hour_bucket(hour_start);
        let window_end = hour_start + ChronoDuration::hours(1);
        let rows = self.rollup_window(&bucket, hour_start, window_end).await?;
        for row in &rows {
            self.upsert("metrics_hourly", row).await?;
        }
        info!(bucket = %bucket, platforms = rows.len(), "hourly rollup complete");
        metrics::record_aggregate_task("hourly", t0.elapsed().as_secs_f64());
        Ok(rows)
    }

    /// Rolls up the day that started at `day_start`. Idempotent like
    /// [`hourly_rollup`].
    pub async fn daily_rollup(&self, day_start: DateTime<Utc>) -> EngineResult<Vec<AggregateRow>> {
        let t0 = std::time::Instant::now();
        let bucket = day_bucket(day_start);
        let window_end = day_start + ChronoDuration::days(1);
        let rows = self.rollup_window(&bucket, day_start, window_end).await?;
        for row in &rows {
            self.upsert("metrics_daily", row).await?;
        }
        info!(bucket = %bucket, platforms = rows.len(), "daily rollup complete");
        metrics::record_aggregate_task("daily", t0.elapsed().as_secs_f64());
        Ok(rows)
    }

    async fn rollup_window(
        &self,
        bucket: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Vec<AggregateRow>> {
        let platforms: Vec<String> = sqlx::query(
            "SELECT DISTINCT platform FROM conversations WHERE started_at >= ? AND started_at < ?
             UNION
             SELECT DISTINCT platform FROM conversations WHERE updated_at >= ? AND updated_at < ?",
        )
        .bind(start.to_rfc3339())
        .bind(end.to_rfc3339())
        .bind(start.to_rfc3339())
        .bind(end.to_rfc3339())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| row.get::<String, _>("platform"))
        .collect();

        let mut out = Vec::with_capacity(platforms.len());
        for platform in platforms {
            out.push(self.rollup_platform(bucket, &platform, start, end).await?);
        }
        Ok(out)
    }

    async fn rollup_platform(
        &self,
        bucket: &str,
        platform: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<AggregateRow> {
        let started_row = sqlx::query(
            "SELECT COUNT(*) AS n FROM conversations
             WHERE platform = ? AND started_at >= ? AND started_at < ?",
        )
        .bind(platform)
        .bind(start.to_rfc3339())
        .bind(end.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        let conversations_started: i64 = started_row.get("n");

        let ended_row = sqlx::query(
            "SELECT COUNT(*) AS n FROM conversations
             WHERE platform = ? AND status IN ('ended', 'abandoned')
               AND ended_at >= ? AND ended_at < ?",
        )
        .bind(platform)
        .bind(start.to_rfc3339())
        .bind(end.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        let conversations_ended: i64 = ended_row.get("n");

        let msg_row = sqlx::query(
            "SELECT
               COUNT(*) AS total,
               SUM(CASE WHEN m.sender = 'user' THEN 1 ELSE 0 END) AS user_count,
               SUM(CASE WHEN m.sender = 'bot' THEN 1 ELSE 0 END) AS bot_count,
               SUM(CASE WHEN m.decision_kind = 'escalate' THEN 1 ELSE 0 END) AS escalations,
               SUM(CASE WHEN m.decision_kind = 'refine' THEN 1 ELSE 0 END) AS refines,
               AVG(CASE WHEN m.sender = 'bot' THEN m.response_time_ms ELSE NULL END) AS avg_latency
             FROM messages m
             JOIN conversations c ON c.id = m.conversation_id
             WHERE c.platform = ? AND m.created_at >= ? AND m.created_at < ?",
        )
        .bind(platform)
        .bind(start.to_rfc3339())
        .bind(end.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(AggregateRow {
            bucket: bucket.to_string(),
            platform: platform.to_string(),
            conversations_started,
            conversations_ended,
            messages_count: msg_row.get::<Option<i64>, _>("total").unwrap_or(0),
            user_messages_count: msg_row.get::<Option<i64>, _>("user_count").unwrap_or(0),
            bot_messages_count: msg_row.get::<Option<i64>, _>("bot_count").unwrap_or(0),
            escalation_count: msg_row.get::<Option<i64>, _>("escalations").unwrap_or(0),
            refine_count: msg_row.get::<Option<i64>, _>("refines").unwrap_or(0),
            avg_response_time_ms: msg_row.get::<Option<f64>, _>("avg_latency").unwrap_or(0.0),
        })
    }

    async fn upsert(&self, table: &str, row: &AggregateRow) -> EngineResult<()> {
        let now = Utc::now().to_rfc3339();
        let sql = format!(
            "INSERT INTO {table}
               (bucket, platform, conversations_started, conversations_ended, messages_count,
                user_messages_count, bot_messages_count, escalation_count, refine_count,
                avg_response_time_ms, computed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(bucket, platform) DO UPDATE SET
               conversations_started = excluded.conversations_started,
               conversations_ended = excluded.conversations_ended,
               messages_count = excluded.messages_count,
               user_messages_count = excluded.user_messages_count,
               bot_messages_count = excluded.bot_messages_count,
               escalation_count = excluded.escalation_count,
               refine_count = excluded.refine_count,
               avg_response_time_ms = excluded.avg_response_time_ms,
               computed_at = excluded.computed_at"
        );
        sqlx::query(&sql)
            .bind(&row.bucket)
            .bind(&row.platform)
            .bind(row.conversations_started)
            .bind(row.conversations_ended)
            .bind(row.messages_count)
            .bind(row.user_messages_count)
            .bind(row.bot_messages_count)
            .bind(row.escalation_count)
            .bind(row.refine_count)
            .bind(row.avg_response_time_ms)
            .bind(&now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes messages older than `message_retention_days`, conversations
    /// (and their remaining messages, via the FK's cascade-free delete order)
    /// older than `conversation_retention_days`. Aggregates are never touched.
    pub async fn run_retention(
        &self,
        now: DateTime<Utc>,
        message_retention_days: i64,
        conversation_retention_days: i64,
    ) -> EngineResult<(u64, u64)> {
        let message_cutoff = (now - ChronoDuration::days(message_retention_days)).to_rfc3339();
        let conversation_cutoff = (now - ChronoDuration::days(conversation_retention_days)).to_rfc3339();

        let messages_deleted = sqlx::query("DELETE FROM messages WHERE created_at < ?")
            .bind(&message_cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        // A conversation older than the retention window may still have
        // messages inside the 7-day message window; delete its messages
        // first so the conversation delete never leaves orphans.
        sqlx::query(
            "DELETE FROM messages WHERE conversation_id IN
               (SELECT id FROM conversations WHERE started_at < ?)",
        )
        .bind(&conversation_cutoff)
        .execute(&self.pool)
        .await?;

        let conversations_deleted = sqlx::query("DELETE FROM conversations WHERE started_at < ?")
            .bind(&conversation_cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        // session_pointers referencing a deleted conversation are now dangling;
        // the gateway treats a missing conversation as "start fresh" so we
        // clear them proactively rather than leave stale pointers around.
        sqlx::query(
            "DELETE FROM session_pointers WHERE conversation_id NOT IN (SELECT id FROM conversations)",
        )
        .execute(&self.pool)
        .await?;

        info!(
            messages_deleted,
            conversations_deleted, "retention sweep complete"
        );
        metrics::record_retention_deletions(messages_deleted, conversations_deleted, 0);
        Ok((messages_deleted, conversations_deleted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::MessageRole;
    use crate::session::SessionManager;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration as StdDuration;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn hourly_rollup_is_idempotent() {
        let pool = test_pool().await;
        let sessions = SessionManager::new(pool.clone());
        let now = Utc::now();

        let (conv, _) = sessions
            .begin_or_resume("u1", "web", "c1", now, StdDuration::from_secs(1800))
            .await
            .unwrap();
        sessions
            .append_message(&conv.id, MessageRole::User, "hola", None, None, None, None, None, None)
            .await
            .unwrap();
        sessions
            .append_message(
                &conv.id,
                MessageRole::Assistant,
                "hola!",
                Some("answer"),
                Some("greeting"),
                None,
                Some(0.9),
                Some(150.0),
                None,
            )
            .await
            .unwrap();

        let aggregator = MetricsAggregator::new(pool);
        let hour_start = now.date_naive().and_hms_opt(now.hour(), 0, 0).unwrap().and_utc();
        let first = aggregator.hourly_rollup(hour_start).await.unwrap();
        let second = aggregator.hourly_rollup(hour_start).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].messages_count, 2);
        assert_eq!(first[0].user_messages_count, 1);
        assert_eq!(first[0].bot_messages_count, 1);
    }

    #[tokio::test]
    async fn retention_deletes_old_messages_and_conversations() {
        let pool = test_pool().await;
        let sessions = SessionManager::new(pool.clone());
        let old = Utc::now() - ChronoDuration::days(40);

        let (conv, _) = sessions
            .begin_or_resume("u2", "web", "c2", old, StdDuration::from_secs(1800))
            .await
            .unwrap();
        sessions
            .append_message(&conv.id, MessageRole::User, "hola", None, None, None, None, None, None)
            .await
            .unwrap();

        // append_message stamps created_at with Utc::now(), so backdate directly.
        sqlx::query("UPDATE messages SET created_at = ? WHERE conversation_id = ?")
            .bind(old.to_rfc3339())
            .bind(&conv.id)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("UPDATE conversations SET started_at = ? WHERE id = ?")
            .bind(old.to_rfc3339())
            .bind(&conv.id)
            .execute(&pool)
            .await
            .unwrap();

        let aggregator = MetricsAggregator::new(pool.clone());
        let (messages_deleted, conversations_deleted) =
            aggregator.run_retention(Utc::now(), 7, 30).await.unwrap();
        assert_eq!(messages_deleted, 1);
        assert_eq!(conversations_deleted, 1);

        let remaining = sqlx::query("SELECT COUNT(*) AS n FROM conversations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining.get::<i64, _>("n"), 0);
    }
}
