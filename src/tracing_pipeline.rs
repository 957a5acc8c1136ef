//! Tracing Pipeline (spec.md §4.4): per-event trace context with staged
//! payload capture, size-capping, sensitive-field redaction and retention
//! GC. Storage failures here are logged and swallowed — tracing never fails
//! the main pipeline (spec.md §4.4 Failure semantics).

use crate::config::TraceConfig;
use crate::storage::traces::{Direction, NewTrace, Stage, TraceStatus, TraceStore};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

/// Case-insensitive key set redacted when `include_sensitive = false`
/// (spec.md §4.4).
const SENSITIVE_KEYS: &[&str] = &[
    "api_key",
    "token",
    "authorization",
    "secret",
    "password",
    "apikey",
    "bearer",
    "x-api-key",
    "webhook_secret",
];

const REDACTED_SENTINEL: &str = "***REDACTED***";

/// Recursive JSON-value rewriter (spec.md §9: "not... a regex over
/// serialized bytes, so key matching is well-defined"). Idempotent:
/// re-running over an already-redacted tree is a no-op.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                let key_is_sensitive = SENSITIVE_KEYS.iter().any(|s| s.eq_ignore_ascii_case(k));
                if key_is_sensitive {
                    out.insert(k.clone(), Value::String(REDACTED_SENTINEL.to_string()));
                } else {
                    out.insert(k.clone(), redact(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

/// Serializes `payload`, applying redaction then the size cap (spec.md §4.4
/// `ctx.capture`). Returns `(json_string, size_bytes, truncated)`.
fn prepare_payload(payload: &Value, cfg: &TraceConfig) -> (String, i64, bool) {
    let value = if cfg.include_sensitive { payload.clone() } else { redact(payload) };
    let serialized = serde_json::to_string(&value).unwrap_or_else(|_| "{}".to_string());
    let size = serialized.len() as i64;

    if size > cfg.max_payload_bytes {
        let sentinel = serde_json::json!({ "_truncated": true, "original_size": size });
        let sentinel_str = serde_json::to_string(&sentinel).unwrap_or_else(|_| "{}".to_string());
        (sentinel_str, size, true)
    } else {
        (serialized, size, false)
    }
}

/// Per-trace context, created at event ingress and closed exactly once.
pub struct TraceCtx {
    store: Arc<TraceStore>,
    cfg: TraceConfig,
    pub trace_id: String,
    opened_at: Instant,
    closed: std::sync::atomic::AtomicBool,
}

pub struct TracingPipeline {
    store: Arc<TraceStore>,
    cfg: TraceConfig,
}

impl TracingPipeline {
    pub fn new(store: Arc<TraceStore>, cfg: TraceConfig) -> Self {
        Self { store, cfg }
    }

    /// Writes the `MessageTrace` row in status `received`. Best-effort: a
    /// storage error is logged, and the context still returns (future
    /// operations will also swallow errors), rather than failing the
    /// handler (spec.md §4.4 Failure semantics: "a storage error in `open`
    /// or `close` is logged and the trace is best-effort").
    pub async fn open(&self, new: NewTrace) -> TraceCtx {
        if !self.cfg.enabled {
            return TraceCtx {
                store: self.store.clone(),
                cfg: self.cfg.clone(),
                trace_id: String::new(),
                opened_at: Instant::now(),
                closed: std::sync::atomic::AtomicBool::new(true),
            };
        }

        match self.store.open(new).await {
            Ok(trace) => TraceCtx {
                store: self.store.clone(),
                cfg: self.cfg.clone(),
                trace_id: trace.id,
                opened_at: Instant::now(),
                closed: std::sync::atomic::AtomicBool::new(false),
            },
            Err(e) => {
                tracing::error!(error = %e, "failed to open message trace");
                TraceCtx {
                    store: self.store.clone(),
                    cfg: self.cfg.clone(),
                    trace_id: String::new(),
                    opened_at: Instant::now(),
                    closed: std::sync::atomic::AtomicBool::new(true),
                }
            }
        }
    }

    pub async fn gc_once(&self, batch_size: i64) -> i64 {
        match self.store.gc_batch(self.cfg.retention_days, batch_size).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "retention GC batch failed");
                0
            }
        }
    }
}

impl TraceCtx {
    pub async fn capture(&self, stage: Stage, direction: Direction, payload: &Value) {
        if self.trace_id.is_empty() {
            return;
        }
        let (json, size, truncated) = prepare_payload(payload, &self.cfg);
        if let Err(e) = self
            .store
            .insert_payload(&self.trace_id, stage, direction, &json, size, truncated)
            .await
        {
            tracing::error!(error = %e, trace_id = %self.trace_id, stage = stage.as_str(), "failed to capture trace payload");
        }
    }

    pub async fn mark_agent(&self, ms: i64, ok: bool) {
        if self.trace_id.is_empty() {
            return;
        }
        if let Err(e) = self.store.mark_agent(&self.trace_id, ms, ok).await {
            tracing::error!(error = %e, trace_id = %self.trace_id, "failed to mark agent outcome");
        }
    }

    pub async fn mark_outbound(&self, ok: bool) {
        if self.trace_id.is_empty() {
            return;
        }
        if let Err(e) = self.store.mark_outbound(&self.trace_id, ok).await {
            tracing::error!(error = %e, trace_id = %self.trace_id, "failed to mark outbound outcome");
        }
    }

    pub async fn set_agent_session_id(&self, agent_session_id: &str) {
        if self.trace_id.is_empty() {
            return;
        }
        if let Err(e) = self.store.set_agent_session_id(&self.trace_id, agent_session_id).await {
            tracing::error!(error = %e, trace_id = %self.trace_id, "failed to set agent_session_id");
        }
    }

    pub async fn mark_processing(&self) {
        if self.trace_id.is_empty() {
            return;
        }
        if let Err(e) = self.store.set_status(&self.trace_id, TraceStatus::Processing).await {
            tracing::error!(error = %e, trace_id = %self.trace_id, "failed to mark processing");
        }
    }

    /// Write-once; swallows storage errors per spec.md §4.4.
    pub async fn close(&self, status: TraceStatus, error_stage: Option<&str>, error: Option<&str>) {
        if self.trace_id.is_empty() || self.closed.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.store.close(&self.trace_id, status, error_stage, error).await {
            tracing::error!(error = %e, trace_id = %self.trace_id, "failed to close trace");
        }
    }

    pub fn elapsed_ms(&self) -> i64 {
        self.opened_at.elapsed().as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::traces::TraceStore;
    use sqlx::sqlite::SqlitePoolOptions;

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

    async fn setup_pipeline() -> TracingPipeline {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        TracingPipeline::new(Arc::new(TraceStore::new(pool)), TraceConfig::default())
    }

    #[test]
    fn redaction_is_idempotent() {
        let original = serde_json::json!({"api_key": "sekret", "nested": {"Token": "abc"}});
        let once = redact(&original);
        let twice = redact(&once);
        assert_eq!(once, twice);
        assert_eq!(once["api_key"], serde_json::json!(REDACTED_SENTINEL));
        assert_eq!(once["nested"]["Token"], serde_json::json!(REDACTED_SENTINEL));
    }

    #[test]
    fn redaction_preserves_nonsensitive_values() {
        let original = serde_json::json!({"text": "hello", "count": 3});
        assert_eq!(redact(&original), original);
    }

    #[tokio::test]
    async fn capture_truncates_oversized_payload() {
        let pipeline = setup_pipeline().await;
        let mut cfg = TraceConfig::default();
        cfg.max_payload_bytes = 10;
        let pipeline = TracingPipeline { cfg, ..pipeline };

        let ctx = pipeline.open(new_trace()).await;
        ctx.capture(Stage::WebhookReceived, Direction::Inbound, &serde_json::json!({"body": "a very long message body"})).await;

        let count = pipeline.store.payload_count(&ctx.trace_id).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn close_is_write_once_through_ctx() {
        let pipeline = setup_pipeline().await;
        let ctx = pipeline.open(new_trace()).await;
        ctx.close(TraceStatus::Completed, None, None).await;
        ctx.close(TraceStatus::Failed, Some("outbound_request"), Some("boom")).await;

        let trace = pipeline.store.get(&ctx.trace_id).await.unwrap().unwrap();
        assert_eq!(trace.status, TraceStatus::Completed);
    }
}
