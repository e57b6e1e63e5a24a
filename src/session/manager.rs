// src/session/manager.rs
// Session Store (C12): conversation lifecycle, durable message append, and
// session-pointer resumption.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::session::types::*;

pub struct SessionManager {
    pool: SqlitePool,
}

fn parse_timestamp(raw: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::invariant(format!("corrupt timestamp {raw}: {e}")))
}

impl SessionManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Resumes the (user_id, platform) pointer's conversation if it's active
    /// and within `idle_threshold` of its last activity; otherwise closes the
    /// stale one (ended if a bot ever replied, abandoned otherwise) and starts
    /// a fresh conversation, repointing the client id.
    pub async fn begin_or_resume(
        &self,
        user_id: &str,
        platform: &str,
        client_id: &str,
        now: DateTime<Utc>,
        idle_threshold: Duration,
    ) -> EngineResult<(Conversation, ResumeOutcome)> {
        let pointer_row = sqlx::query(
            "SELECT conversation_id FROM session_pointers WHERE user_id = ? AND platform = ?",
        )
        .bind(user_id)
        .bind(platform)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = pointer_row {
            let conversation_id: String = row.get("conversation_id");
            if let Some(conv) = self.get_conversation(&conversation_id).await? {
                let idle = now.signed_duration_since(conv.updated_at);
                if conv.status == ConversationStatus::Active
                    && idle.to_std().unwrap_or(Duration::MAX) <= idle_threshold
                {
                    self.touch_pointer(user_id, platform, client_id, now).await?;
                    return Ok((conv, ResumeOutcome::Resumed));
                }
                if conv.status == ConversationStatus::Active {
                    self.close_conversation(&conv, now).await?;
                }
            }
        }

        let conversation = self.create_conversation(user_id, platform, now).await?;
        self.set_pointer(user_id, platform, client_id, &conversation.id, now)
            .await?;
        Ok((conversation, ResumeOutcome::Created))
    }

    async fn create_conversation(
        &self,
        user_id: &str,
        platform: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Conversation> {
        let id = Uuid::new_v4().to_string();
        let now_str = now.to_rfc3339();
        sqlx::query(
            "INSERT INTO conversations
               (id, user_id, platform, status, refine_count, messages_count,
                user_messages_count, bot_messages_count, avg_response_time_ms,
                started_at, updated_at, ended_at)
             VALUES (?, ?, ?, 'active', 0, 0, 0, 0, 0, ?, ?, NULL)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(platform)
        .bind(&now_str)
        .bind(&now_str)
        .execute(&self.pool)
        .await?;

        info!(conversation_id = %id, user_id, platform, "conversation created");

        Ok(Conversation {
            id,
            user_id: user_id.to_string(),
            platform: platform.to_string(),
            status: ConversationStatus::Active,
            refine_count: 0,
            messages_count: 0,
            user_messages_count: 0,
            bot_messages_count: 0,
            avg_response_time_ms: 0.0,
            started_at: now,
            updated_at: now,
            ended_at: None,
        })
    }

    /// A conversation that saw at least one bot reply is `ended`; one that
    /// never got past the user's opening message idled out `abandoned`.
    async fn close_conversation(&self, conv: &Conversation, now: DateTime<Utc>) -> EngineResult<()> {
        let status = if conv.bot_messages_count > 0 {
            ConversationStatus::Ended
        } else {
            ConversationStatus::Abandoned
        };
        sqlx::query("UPDATE conversations SET status = ?, ended_at = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now.to_rfc3339())
            .bind(now.to_rfc3339())
            .bind(&conv.id)
            .execute(&self.pool)
            .await?;
        info!(conversation_id = %conv.id, status = status.as_str(), "conversation closed");
        Ok(())
    }

    async fn set_pointer(
        &self,
        user_id: &str,
        platform: &str,
        client_id: &str,
        conversation_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO session_pointers (user_id, platform, conversation_id, client_id, last_activity_at, last_delivered_at)
             VALUES (?, ?, ?, ?, ?, NULL)
             ON CONFLICT(user_id, platform) DO UPDATE SET
               conversation_id = excluded.conversation_id,
               client_id = excluded.client_id,
               last_activity_at = excluded.last_activity_at",
        )
        .bind(user_id)
        .bind(platform)
        .bind(conversation_id)
        .bind(client_id)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_pointer(
        &self,
        user_id: &str,
        platform: &str,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        sqlx::query(
            "UPDATE session_pointers SET last_activity_at = ?, client_id = ? WHERE user_id = ? AND platform = ?",
        )
        .bind(now.to_rfc3339())
        .bind(client_id)
        .bind(user_id)
        .bind(platform)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Messages delivered to the client after this point are not yet
    /// acknowledged; called by the realtime gateway whenever it actually
    /// flushes a frame to the socket.
    pub async fn mark_delivered(&self, user_id: &str, platform: &str, now: DateTime<Utc>) -> EngineResult<()> {
        sqlx::query("UPDATE session_pointers SET last_delivered_at = ? WHERE user_id = ? AND platform = ?")
            .bind(now.to_rfc3339())
            .bind(user_id)
            .bind(platform)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn last_delivered_at(
        &self,
        user_id: &str,
        platform: &str,
    ) -> EngineResult<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT last_delivered_at FROM session_pointers WHERE user_id = ? AND platform = ?",
        )
        .bind(user_id)
        .bind(platform)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let raw: Option<String> = row.get("last_delivered_at");
        raw.map(|s| parse_timestamp(&s)).transpose()
    }

    /// Writes the message durably, bumps the conversation's counters and
    /// `updated_at`, and for bot messages recomputes `avg_response_time_ms`
    /// as a running mean. Callers MUST await this before emitting the
    /// corresponding outbound reply.
    #[allow(clippy::too_many_arguments)]
    pub async fn append_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
        decision_kind: Option<&str>,
        intent: Option<&str>,
        entities: Option<Value>,
        confidence: Option<f64>,
        response_time_ms: Option<f64>,
        tools_used: Option<Value>,
    ) -> EngineResult<Message> {
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let message_id = Uuid::new_v4().to_string();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO messages
               (message_id, conversation_id, sender, content, intent, entities,
                confidence, response_time_ms, tools_used, decision_kind, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message_id)
        .bind(conversation_id)
        .bind(role.as_str())
        .bind(content)
        .bind(intent)
        .bind(entities.as_ref().map(|v| v.to_string()))
        .bind(confidence)
        .bind(response_time_ms)
        .bind(tools_used.as_ref().map(|v| v.to_string()))
        .bind(decision_kind)
        .bind(&now_str)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            "SELECT messages_count, user_messages_count, bot_messages_count, avg_response_time_ms
             FROM conversations WHERE id = ?",
        )
        .bind(conversation_id)
        .fetch_one(&mut *tx)
        .await?;
        let messages_count: i64 = row.get("messages_count");
        let user_messages_count: i64 = row.get("user_messages_count");
        let bot_messages_count: i64 = row.get("bot_messages_count");
        let avg: f64 = row.get("avg_response_time_ms");

        let new_messages_count = messages_count + 1;
        let new_user_count = user_messages_count + if role == MessageRole::User { 1 } else { 0 };
        let (new_bot_count, new_avg) = if role == MessageRole::Assistant {
            let new_count = bot_messages_count + 1;
            let new_avg = match response_time_ms {
                Some(latency) => avg + (latency - avg) / new_count as f64,
                None => avg,
            };
            (new_count, new_avg)
        } else {
            (bot_messages_count, avg)
        };

        sqlx::query(
            "UPDATE conversations
             SET messages_count = ?, user_messages_count = ?, bot_messages_count = ?,
                 avg_response_time_ms = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(new_messages_count)
        .bind(new_user_count)
        .bind(new_bot_count)
        .bind(new_avg)
        .bind(&now_str)
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(conversation_id, role = role.as_str(), "message appended");

        Ok(Message {
            message_id,
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            intent: intent.map(str::to_string),
            entities,
            confidence,
            response_time_ms,
            tools_used,
            decision_kind: decision_kind.map(str::to_string),
            created_at: now,
        })
    }

    /// Increments the conversation's refinement counter, used by the
    /// orchestrator on a `refine` decision.
    pub async fn increment_refine_count(&self, conversation_id: &str) -> EngineResult<()> {
        sqlx::query("UPDATE conversations SET refine_count = refine_count + 1 WHERE id = ?")
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Resets the conversation's refinement counter, used on an `answer`
    /// decision so a subsequent unrelated topic starts refinement fresh.
    pub async fn reset_refine_count(&self, conversation_id: &str) -> EngineResult<()> {
        sqlx::query("UPDATE conversations SET refine_count = 0 WHERE id = ?")
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_conversation(&self, id: &str) -> EngineResult<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT id, user_id, platform, status, refine_count, messages_count,
                    user_messages_count, bot_messages_count, avg_response_time_ms,
                    started_at, updated_at, ended_at
             FROM conversations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(self.row_to_conversation(row)?))
    }

    fn row_to_conversation(&self, row: sqlx::sqlite::SqliteRow) -> EngineResult<Conversation> {
        let status_str: String = row.get("status");
        let started_at: String = row.get("started_at");
        let updated_at: String = row.get("updated_at");
        let ended_at: Option<String> = row.get("ended_at");

        Ok(Conversation {
            id: row.get("id"),
            user_id: row.get("user_id"),
            platform: row.get("platform"),
            status: ConversationStatus::from_str(&status_str)
                .ok_or_else(|| EngineError::invariant(format!("unknown status {status_str}")))?,
            refine_count: row.get("refine_count"),
            messages_count: row.get("messages_count"),
            user_messages_count: row.get("user_messages_count"),
            bot_messages_count: row.get("bot_messages_count"),
            avg_response_time_ms: row.get("avg_response_time_ms"),
            started_at: parse_timestamp(&started_at)?,
            updated_at: parse_timestamp(&updated_at)?,
            ended_at: ended_at.map(|s| parse_timestamp(&s)).transpose()?,
        })
    }

    pub async fn list_messages(&self, conversation_id: &str, page: Page) -> EngineResult<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT message_id, conversation_id, sender, content, intent, entities,
                    confidence, response_time_ms, tools_used, decision_kind, created_at
             FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, message_id ASC
             LIMIT ? OFFSET ?",
        )
        .bind(conversation_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| self.row_to_message(row)).collect()
    }

    /// Returns the last `n` messages in chronological order, used to build
    /// the intent classifier's recent-history window.
    pub async fn recent_messages(&self, conversation_id: &str, n: i64) -> EngineResult<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT message_id, conversation_id, sender, content, intent, entities,
                    confidence, response_time_ms, tools_used, decision_kind, created_at
             FROM messages WHERE conversation_id = ? ORDER BY created_at DESC, message_id DESC LIMIT ?",
        )
        .bind(conversation_id)
        .bind(n)
        .fetch_all(&self.pool)
        .await?;

        let mut messages: Vec<Message> = rows
            .into_iter()
            .map(|row| self.row_to_message(row))
            .collect::<EngineResult<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Messages appended since the client's last acknowledged delivery,
    /// oldest first, for reconnect redelivery.
    pub async fn undelivered_messages(
        &self,
        conversation_id: &str,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> EngineResult<Vec<Message>> {
        let rows = match since {
            Some(since) => {
                sqlx::query(
                    "SELECT message_id, conversation_id, sender, content, intent, entities,
                            confidence, response_time_ms, tools_used, decision_kind, created_at
                     FROM messages WHERE conversation_id = ? AND created_at > ?
                     ORDER BY created_at ASC, message_id ASC LIMIT ?",
                )
                .bind(conversation_id)
                .bind(since.to_rfc3339())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT message_id, conversation_id, sender, content, intent, entities,
                            confidence, response_time_ms, tools_used, decision_kind, created_at
                     FROM messages WHERE conversation_id = ?
                     ORDER BY created_at ASC, message_id ASC LIMIT ?",
                )
                .bind(conversation_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(|row| self.row_to_message(row)).collect()
    }

    fn row_to_message(&self, row: sqlx::sqlite::SqliteRow) -> EngineResult<Message> {
        let role_str: String = row.get("sender");
        let created_at: String = row.get("created_at");
        let entities_raw: Option<String> = row.get("entities");
        let tools_used_raw: Option<String> = row.get("tools_used");
        Ok(Message {
            message_id: row.get("message_id"),
            conversation_id: row.get("conversation_id"),
            role: MessageRole::from_str(&role_str)
                .ok_or_else(|| EngineError::invariant(format!("unknown sender {role_str}")))?,
            content: row.get("content"),
            intent: row.get("intent"),
            entities: entities_raw.and_then(|s| serde_json::from_str(&s).ok()),
            confidence: row.get("confidence"),
            response_time_ms: row.get("response_time_ms"),
            tools_used: tools_used_raw.and_then(|s| serde_json::from_str(&s).ok()),
            decision_kind: row.get("decision_kind"),
            created_at: parse_timestamp(&created_at)?,
        })
    }

    pub async fn search_conversations(
        &self,
        filter: ConversationFilter,
        page: Page,
    ) -> EngineResult<Vec<Conversation>> {
        let mut sql = String::from(
            "SELECT id, user_id, platform, status, refine_count, messages_count,
                    user_messages_count, bot_messages_count, avg_response_time_ms,
                    started_at, updated_at, ended_at
             FROM conversations WHERE 1=1",
        );
        if filter.platform.is_some() {
            sql.push_str(" AND platform = ?");
        }
        if filter.user_id.is_some() {
            sql.push_str(" AND user_id = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY updated_at DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(platform) = &filter.platform {
            query = query.bind(platform);
        }
        if let Some(user_id) = &filter.user_id {
            query = query.bind(user_id);
        }
        if let Some(status) = &filter.status {
            query = query.bind(status.as_str());
        }
        query = query.bind(page.limit).bind(page.offset);

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(|row| self.row_to_conversation(row)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn begin_or_resume_creates_then_resumes_within_idle_window() {
        let manager = SessionManager::new(test_pool().await);
        let now = Utc::now();

        let (conv1, outcome1) = manager
            .begin_or_resume("user-1", "whatsapp", "client-1", now, Duration::from_secs(1800))
            .await
            .unwrap();
        assert_eq!(outcome1, ResumeOutcome::Created);

        let (conv2, outcome2) = manager
            .begin_or_resume(
                "user-1",
                "whatsapp",
                "client-1",
                now + chrono::Duration::seconds(60),
                Duration::from_secs(1800),
            )
            .await
            .unwrap();
        assert_eq!(outcome2, ResumeOutcome::Resumed);
        assert_eq!(conv1.id, conv2.id);
    }

    #[tokio::test]
    async fn begin_or_resume_starts_fresh_conversation_after_idle_timeout() {
        let manager = SessionManager::new(test_pool().await);
        let now = Utc::now();

        let (conv1, _) = manager
            .begin_or_resume("user-1", "whatsapp", "client-1", now, Duration::from_secs(60))
            .await
            .unwrap();

        let (conv2, outcome) = manager
            .begin_or_resume(
                "user-1",
                "whatsapp",
                "client-1",
                now + chrono::Duration::seconds(120),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert_eq!(outcome, ResumeOutcome::Created);
        assert_ne!(conv1.id, conv2.id);

        let closed = manager.get_conversation(&conv1.id).await.unwrap().unwrap();
        assert_eq!(closed.status, ConversationStatus::Abandoned);
    }

    #[tokio::test]
    async fn idle_timeout_with_bot_reply_ends_rather_than_abandons() {
        let manager = SessionManager::new(test_pool().await);
        let now = Utc::now();

        let (conv1, _) = manager
            .begin_or_resume("user-2", "web", "client-5", now, Duration::from_secs(60))
            .await
            .unwrap();
        manager
            .append_message(&conv1.id, MessageRole::User, "hola", None, None, None, None, None, None)
            .await
            .unwrap();
        manager
            .append_message(
                &conv1.id,
                MessageRole::Assistant,
                "hola!",
                Some("answer"),
                Some("greeting"),
                None,
                Some(0.9),
                Some(120.0),
                None,
            )
            .await
            .unwrap();

        manager
            .begin_or_resume(
                "user-2",
                "web",
                "client-5",
                now + chrono::Duration::seconds(120),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let closed = manager.get_conversation(&conv1.id).await.unwrap().unwrap();
        assert_eq!(closed.status, ConversationStatus::Ended);
    }

    #[tokio::test]
    async fn append_message_computes_running_mean_latency_and_counters() {
        let manager = SessionManager::new(test_pool().await);
        let now = Utc::now();
        let (conv, _) = manager
            .begin_or_resume("user-1", "web", "client-2", now, Duration::from_secs(1800))
            .await
            .unwrap();

        manager
            .append_message(&conv.id, MessageRole::User, "hola", None, None, None, None, None, None)
            .await
            .unwrap();
        manager
            .append_message(
                &conv.id,
                MessageRole::Assistant,
                "hola!",
                Some("answer"),
                Some("greeting"),
                None,
                Some(0.9),
                Some(100.0),
                None,
            )
            .await
            .unwrap();
        manager
            .append_message(
                &conv.id,
                MessageRole::Assistant,
                "otra vez",
                Some("answer"),
                Some("greeting"),
                None,
                Some(0.9),
                Some(200.0),
                None,
            )
            .await
            .unwrap();

        let messages = manager.list_messages(&conv.id, Page::first(10)).await.unwrap();
        assert_eq!(messages.len(), 3);

        let conv = manager.get_conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(conv.messages_count, 3);
        assert_eq!(conv.user_messages_count, 1);
        assert_eq!(conv.bot_messages_count, 2);
        assert!((conv.avg_response_time_ms - 150.0).abs() < 1e-6);
    }
}
