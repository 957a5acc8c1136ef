//! `message_trace` / `trace_payload` tables (spec.md §3 MessageTrace,
//! TracePayload). The lifecycle/redaction logic lives in
//! `crate::tracing_pipeline`; this module is pure storage.

use crate::error::{Result, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Received,
    Processing,
    Completed,
    Failed,
    AccessDenied,
}

impl TraceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TraceStatus::Received => "received",
            TraceStatus::Processing => "processing",
            TraceStatus::Completed => "completed",
            TraceStatus::Failed => "failed",
            TraceStatus::AccessDenied => "access_denied",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "received" => Some(TraceStatus::Received),
            "processing" => Some(TraceStatus::Processing),
            "completed" => Some(TraceStatus::Completed),
            "failed" => Some(TraceStatus::Failed),
            "access_denied" => Some(TraceStatus::AccessDenied),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TraceStatus::Completed | TraceStatus::Failed | TraceStatus::AccessDenied)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTrace {
    pub id: String,
    pub instance_name: String,
    pub channel_message_id: Option<String>,
    pub sender_external_id: String,
    pub sender_display_name: Option<String>,
    pub message_type: String,
    pub has_media: bool,
    pub has_quoted: bool,
    pub session_name: String,
    pub agent_session_id: Option<String>,
    pub status: TraceStatus,
    pub error_stage: Option<String>,
    pub error_message: Option<String>,
    pub received_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub agent_processing_time_ms: Option<i64>,
    pub total_processing_time_ms: Option<i64>,
    pub agent_response_success: Option<bool>,
    pub evolution_success: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct NewTrace {
    pub instance_name: String,
    pub channel_message_id: Option<String>,
    pub sender_external_id: String,
    pub sender_display_name: Option<String>,
    pub message_type: String,
    pub has_media: bool,
    pub has_quoted: bool,
    pub session_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    WebhookReceived,
    AccessCheck,
    AgentRequest,
    AgentResponse,
    OutboundRequest,
    OutboundResponse,
    Error,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::WebhookReceived => "webhook_received",
            Stage::AccessCheck => "access_check",
            Stage::AgentRequest => "agent_request",
            Stage::AgentResponse => "agent_response",
            Stage::OutboundRequest => "outbound_request",
            Stage::OutboundResponse => "outbound_response",
            Stage::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
    Internal,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
            Direction::Internal => "internal",
        }
    }
}

pub struct TraceStore {
    pool: SqlitePool,
}

impl TraceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(&self, new: NewTrace) -> Result<MessageTrace> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO message_trace (id, instance_name, channel_message_id, \
             sender_external_id, sender_display_name, message_type, has_media, has_quoted, \
             session_name, status, received_at) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
        )
        .bind(&id)
        .bind(&new.instance_name)
        .bind(&new.channel_message_id)
        .bind(&new.sender_external_id)
        .bind(&new.sender_display_name)
        .bind(&new.message_type)
        .bind(new.has_media)
        .bind(new.has_quoted)
        .bind(&new.session_name)
        .bind(TraceStatus::Received.as_str())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.get(&id).await?.ok_or_else(|| {
            StorageError::NotFound { entity: "message_trace", id: id.clone() }.into()
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<MessageTrace>> {
        let row = sqlx::query("SELECT * FROM message_trace WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| trace_from_row(&r)).transpose()
    }

    pub async fn set_status(&self, id: &str, status: TraceStatus) -> Result<()> {
        sqlx::query("UPDATE message_trace SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_agent_session_id(&self, id: &str, agent_session_id: &str) -> Result<()> {
        sqlx::query("UPDATE message_trace SET agent_session_id = ?1 WHERE id = ?2")
            .bind(agent_session_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_agent(&self, id: &str, ms: i64, ok: bool) -> Result<()> {
        sqlx::query(
            "UPDATE message_trace SET agent_processing_time_ms = ?1, agent_response_success = ?2 \
             WHERE id = ?3",
        )
        .bind(ms)
        .bind(ok)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_outbound(&self, id: &str, ok: bool) -> Result<()> {
        sqlx::query("UPDATE message_trace SET evolution_success = ?1 WHERE id = ?2")
            .bind(ok)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Write-once terminal transition; sets `completed_at` and
    /// `total_processing_time_ms` (spec.md §4.4 `ctx.close`).
    pub async fn close(
        &self,
        id: &str,
        status: TraceStatus,
        error_stage: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let trace = self
            .get(id)
            .await?
            .ok_or_else(|| StorageError::NotFound { entity: "message_trace", id: id.to_string() })?;
        if trace.status.is_terminal() {
            return Ok(());
        }

        let completed_at = Utc::now();
        let total_ms = (completed_at - trace.received_at).num_milliseconds();

        sqlx::query(
            "UPDATE message_trace SET status = ?1, error_stage = ?2, error_message = ?3, \
             completed_at = ?4, total_processing_time_ms = ?5 WHERE id = ?6",
        )
        .bind(status.as_str())
        .bind(error_stage)
        .bind(error_message)
        .bind(completed_at.to_rfc3339())
        .bind(total_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_payload(
        &self,
        trace_id: &str,
        stage: Stage,
        direction: Direction,
        payload: &str,
        payload_size_bytes: i64,
        truncated: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO trace_payload (id, trace_id, stage, direction, payload, \
             payload_size_bytes, truncated, captured_at) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(trace_id)
        .bind(stage.as_str())
        .bind(direction.as_str())
        .bind(payload)
        .bind(payload_size_bytes)
        .bind(truncated)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn payload_count(&self, trace_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM trace_payload WHERE trace_id = ?1")
            .bind(trace_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Deletes traces (and their payloads) older than `retention_days`, in
    /// bounded batches, one transaction per batch (spec.md §4.4 Retention
    /// GC). Returns the number of traces deleted this call.
    pub async fn gc_batch(&self, retention_days: i64, batch_size: i64) -> Result<i64> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);
        let mut tx = self.pool.begin().await?;

        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM message_trace WHERE received_at < ?1 LIMIT ?2",
        )
        .bind(cutoff.to_rfc3339())
        .bind(batch_size)
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        for id in &ids {
            sqlx::query("DELETE FROM trace_payload WHERE trace_id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM message_trace WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(ids.len() as i64)
    }
}

fn trace_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<MessageTrace> {
    let status_str: String = row.try_get("status")?;
    let received_at: String = row.try_get("received_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;

    Ok(MessageTrace {
        id: row.try_get("id")?,
        instance_name: row.try_get("instance_name")?,
        channel_message_id: row.try_get("channel_message_id")?,
        sender_external_id: row.try_get("sender_external_id")?,
        sender_display_name: row.try_get("sender_display_name")?,
        message_type: row.try_get("message_type")?,
        has_media: row.try_get::<i64, _>("has_media")? != 0,
        has_quoted: row.try_get::<i64, _>("has_quoted")? != 0,
        session_name: row.try_get("session_name")?,
        agent_session_id: row.try_get("agent_session_id")?,
        status: TraceStatus::parse(&status_str)
            .ok_or_else(|| StorageError::Constraint(format!("unknown status {status_str}")))?,
        error_stage: row.try_get("error_stage")?,
        error_message: row.try_get("error_message")?,
        received_at: DateTime::parse_from_rfc3339(&received_at)
            .map_err(|e| StorageError::Constraint(e.to_string()))?
            .with_timezone(&Utc),
        completed_at: completed_at
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
            .transpose()
            .map_err(|e| StorageError::Constraint(e.to_string()))?,
        agent_processing_time_ms: row.try_get("agent_processing_time_ms")?,
        total_processing_time_ms: row.try_get("total_processing_time_ms")?,
        agent_response_success: row
            .try_get::<Option<i64>, _>("agent_response_success")?
            .map(|v| v != 0),
        evolution_success: row.try_get::<Option<i64>, _>("evolution_success")?.map(|v| v != 0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_store() -> TraceStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        TraceStore::new(pool)
    }

    fn new_trace() -> NewTrace {
        NewTrace {
            instance_name: "acme".into(),
            channel_message_id: Some("M1".into()),
            sender_external_id: "+15551234567".into(),
            sender_display_name: None,
            message_type: "text".into(),
            has_media: false,
            has_quoted: false,
            session_name: "whatsapp:+15551234567".into(),
        }
    }

    #[tokio::test]
    async fn close_is_write_once() {
        let store = setup_store().await;
        let trace = store.open(new_trace()).await.unwrap();
        store.close(&trace.id, TraceStatus::Completed, None, None).await.unwrap();
        store
            .close(&trace.id, TraceStatus::Failed, Some("outbound_request"), Some("boom"))
            .await
            .unwrap();

        let reloaded = store.get(&trace.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, TraceStatus::Completed);
        assert!(reloaded.error_stage.is_none());
    }

    #[tokio::test]
    async fn close_sets_completed_at_after_received_at() {
        let store = setup_store().await;
        let trace = store.open(new_trace()).await.unwrap();
        store.close(&trace.id, TraceStatus::Completed, None, None).await.unwrap();
        let reloaded = store.get(&trace.id).await.unwrap().unwrap();
        assert!(reloaded.completed_at.unwrap() >= reloaded.received_at);
    }

    #[tokio::test]
    async fn gc_batch_removes_old_traces_and_payloads() {
        let store = setup_store().await;
        let trace = store.open(new_trace()).await.unwrap();
        store
            .insert_payload(&trace.id, Stage::WebhookReceived, Direction::Inbound, "{}", 2, false)
            .await
            .unwrap();

        sqlx::query("UPDATE message_trace SET received_at = ?1 WHERE id = ?2")
            .bind((Utc::now() - chrono::Duration::days(40)).to_rfc3339())
            .bind(&trace.id)
            .execute(&store.pool)
            .await
            .unwrap();

        let deleted = store.gc_batch(30, 100).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get(&trace.id).await.unwrap().is_none());
        assert_eq!(store.payload_count(&trace.id).await.unwrap(), 0);
    }
}
