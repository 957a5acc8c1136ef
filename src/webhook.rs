//! Webhook / Event Entry (spec.md §4.3): binds a provider event to
//! `(instance, handler)`, runs the inbound pipeline, and enqueues outbound
//! work on the per-instance worker.

use crate::api::AppState;
use crate::storage::traces::{Direction, NewTrace, Stage, TraceStatus};
use crate::supervisor::Supervisor;
use crate::{ChannelKind, InboundEvent, InboundMessage, OutboundReply};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

#[derive(Clone)]
struct WebState {
    app: Arc<AppState>,
    supervisor: Arc<Supervisor>,
}

pub fn router(app: Arc<AppState>, supervisor: Arc<Supervisor>) -> Router {
    let state = WebState { app, supervisor };
    Router::new()
        .route("/webhook/evolution", post(legacy_webhook))
        .route("/webhook/{instance_name}", post(instance_webhook))
        .route("/healthz", get(healthz))
        .with_state(state)
}

pub fn cors_layer(cfg: &crate::config::CorsConfig) -> tower_http::cors::CorsLayer {
    use tower_http::cors::{AllowOrigin, CorsLayer};
    let origins: Vec<axum::http::HeaderValue> = cfg
        .origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    let mut layer = CorsLayer::new().allow_origin(AllowOrigin::list(origins));
    if cfg.credentials {
        layer = layer.allow_credentials(true);
    }
    layer
}

async fn healthz() -> &'static str {
    "ok"
}

/// `POST /webhook/evolution`: maps to the default instance. SPEC_FULL.md
/// §4.3: when no instance is marked default, respond 404 with no trace
/// created (resolves spec.md §9's Open Question).
async fn legacy_webhook(
    State(state): State<WebState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    match state.app.registry.default_instance() {
        Some(instance) => handle_webhook(&state, &instance, &headers, body).await,
        None => (StatusCode::NOT_FOUND, Json(serde_json::json!({"status": "unknown_instance"}))),
    }
}

async fn instance_webhook(
    State(state): State<WebState>,
    Path(instance_name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    match state.app.registry.get(&instance_name) {
        Some(instance) => handle_webhook(&state, &instance, &headers, body).await,
        None => (StatusCode::NOT_FOUND, Json(serde_json::json!({"status": "unknown_instance"}))),
    }
}

async fn handle_webhook(
    state: &WebState,
    instance: &crate::storage::instances::Instance,
    headers: &HeaderMap,
    body: serde_json::Value,
) -> (StatusCode, Json<serde_json::Value>) {
    let provided_key = headers.get("x-api-key").and_then(|v| v.to_str().ok()).unwrap_or("");
    let tenant_key = instance.evolution_key.as_deref().unwrap_or("");
    let global_key = state.app.config.api_key.as_str();
    if provided_key.is_empty() || (provided_key != tenant_key && provided_key != global_key) {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"status": "unauthorized"})));
    }

    let Some(handler) = state.app.channel_handlers.get(&instance.channel) else {
        return (StatusCode::NOT_FOUND, Json(serde_json::json!({"status": "unknown_channel"})));
    };

    let messages = match handler.parse(instance, &body) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(error = %e, instance = %instance.name, "failed to parse webhook payload");
            return (StatusCode::BAD_REQUEST, Json(serde_json::json!({"status": "bad_request"})));
        }
    };

    for message in messages {
        let event = InboundEvent { raw: body.clone(), message };
        if state.supervisor.enqueue(instance, event).await.is_err() {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(serde_json::json!({"status": "overflow"})),
            );
        }
    }

    (StatusCode::OK, Json(serde_json::json!({"status": "accepted"})))
}

/// The per-event pipeline (spec.md §4.3 Handler responsibilities, steps
/// 1-6), run from within a per-instance worker task so ordering per
/// `session_name` is preserved.
pub async fn process_inbound_event(
    state: &AppState,
    instance: &crate::storage::instances::Instance,
    raw: serde_json::Value,
    message: InboundMessage,
) {
    let session_name = crate::session_name(message.channel, &message.chat_id);

    // Step 1: open trace, capture raw payload (redacted by the pipeline).
    let ctx = state
        .tracing_pipeline
        .open(NewTrace {
            instance_name: instance.name.clone(),
            channel_message_id: message.message_id.clone(),
            sender_external_id: message.sender_external_id.clone(),
            sender_display_name: message.sender_display_name.clone(),
            message_type: message.content.type_tag().to_string(),
            has_media: message.content.has_media(),
            has_quoted: message.content.has_quoted(),
            session_name: session_name.clone(),
        })
        .await;

    ctx.capture(Stage::WebhookReceived, Direction::Inbound, &raw).await;

    // Group chats, reactions, and unsupported types are classified but
    // short-circuited after trace capture (spec.md §4.3).
    if message.content.short_circuits() {
        ctx.close(TraceStatus::Completed, None, None).await;
        return;
    }

    // Step 2: resolve/create User.
    if let Err(e) = state
        .users
        .resolve_or_create(
            message.channel,
            &message.sender_external_id,
            message.sender_display_name.as_deref(),
        )
        .await
    {
        tracing::error!(error = %e, trace_id = %ctx.trace_id, "failed to resolve user");
        ctx.close(TraceStatus::Failed, Some("user_resolution"), Some(&e.to_string())).await;
        return;
    }

    // Step 4: Access Engine.
    let decision = match state.access.check(&message.sender_external_id, &instance.name).await {
        Ok(d) => d,
        Err(e) => {
            ctx.close(TraceStatus::Failed, Some("access_check"), Some(&e.to_string())).await;
            return;
        }
    };
    if !decision.allowed {
        ctx.capture(
            Stage::AccessCheck,
            Direction::Internal,
            &serde_json::json!({"allowed": false, "matched_rule_id": decision.matched_rule_id}),
        )
        .await;
        ctx.close(TraceStatus::AccessDenied, None, None).await;
        return;
    }

    ctx.mark_processing().await;

    // Step 5: Agent Client.
    let Some(text) = message.content.text() else {
        ctx.close(TraceStatus::Completed, None, None).await;
        return;
    };

    let agent_req = crate::agent::AgentRequest {
        agent_api_url: instance.agent_api_url.as_deref().unwrap_or_default(),
        agent_api_key: instance.agent_api_key.as_deref().unwrap_or_default(),
        agent_name: instance.agent_default_name.as_deref().unwrap_or("default"),
        agent_session_id: None,
        user_id: &message.sender_external_id,
        message: text,
        streaming: instance.agent_streaming,
        timeout_seconds: instance.agent_timeout_seconds.max(1) as u64,
    };

    ctx.capture(
        Stage::AgentRequest,
        Direction::Outbound,
        &serde_json::json!({"message": text, "streaming": instance.agent_streaming}),
    )
    .await;

    let agent_reply = match state.agent_client.call(agent_req).await {
        Ok(reply) => reply,
        Err(e) => {
            ctx.mark_agent(0, false).await;
            ctx.capture(
                Stage::AgentResponse,
                Direction::Inbound,
                &serde_json::json!({"error": e.to_string()}),
            )
            .await;
            ctx.close(TraceStatus::Failed, Some("agent_request"), Some(&e.to_string())).await;
            return;
        }
    };

    ctx.mark_agent(agent_reply.processing_time_ms, true).await;
    if let Some(session_id) = &agent_reply.agent_session_id {
        ctx.set_agent_session_id(session_id).await;
    }

    // Step 6: Outbound Dispatcher.
    let reply = OutboundReply {
        recipient: outbound_recipient(instance.channel, &message),
        text: agent_reply.text,
        split_override: None,
    };

    ctx.capture(
        Stage::OutboundRequest,
        Direction::Outbound,
        &serde_json::json!({"recipient": reply.recipient, "text": reply.text}),
    )
    .await;

    let outcome = state.dispatcher.send(instance, &reply).await;
    ctx.mark_outbound(outcome.success).await;

    if outcome.success {
        ctx.close(TraceStatus::Completed, None, None).await;
    } else {
        ctx.capture(
            Stage::OutboundResponse,
            Direction::Outbound,
            &serde_json::json!({"success": false, "message_count": outcome.message_count}),
        )
        .await;
        let error = outcome.error.map(|e| e.to_string()).unwrap_or_default();
        ctx.close(TraceStatus::Failed, Some("outbound_request"), Some(&error)).await;
    }
}

fn outbound_recipient(channel: ChannelKind, message: &InboundMessage) -> String {
    match channel {
        ChannelKind::Whatsapp => message.sender_external_id.clone(),
        ChannelKind::Discord => message.chat_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessEngine;
    use crate::agent::AgentClient;
    use crate::config::{CorsConfig, TraceConfig};
    use crate::dispatch::Dispatcher;
    use crate::registry::Registry;
    use crate::storage::access::AccessStore;
    use crate::storage::instances::{InstanceStore, UpsertInstance};
    use crate::storage::users::UserStore;
    use crate::tracing_pipeline::TracingPipeline;
    use crate::MessageContent;
    use chrono::Utc;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::HashMap;

    async fn setup_state() -> (AppState, crate::storage::instances::Instance, sqlx::SqlitePool) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        let registry = Registry::new(InstanceStore::new(pool.clone())).await.unwrap();
        let instance = registry
            .upsert(UpsertInstance {
                name: "acme".into(),
                channel: ChannelKind::Whatsapp,
                is_default: true,
                enable_auto_split: true,
                evolution_url: Some("https://evo.example".into()),
                evolution_key: Some("tenant-key".into()),
                provider_instance_id: Some("acme-wa".into()),
                bot_token: None,
                agent_api_url: None,
                agent_api_key: None,
                agent_default_name: None,
                agent_streaming: false,
                agent_timeout_seconds: 5,
            })
            .await
            .unwrap();

        let config = crate::config::Config {
            api_key: "global-key".into(),
            database_url: None,
            data_dir: std::env::temp_dir(),
            trace: TraceConfig::default(),
            timezone: "UTC".into(),
            cors: CorsConfig::default(),
            run_dir: std::env::temp_dir(),
        };

        let state = AppState {
            config: Arc::new(config),
            registry: Arc::new(registry),
            access: Arc::new(AccessEngine::new(AccessStore::new(pool.clone()))),
            users: Arc::new(UserStore::new(pool.clone())),
            tracing_pipeline: Arc::new(TracingPipeline::new(
                Arc::new(crate::storage::traces::TraceStore::new(pool.clone())),
                TraceConfig::default(),
            )),
            agent_client: Arc::new(AgentClient::new()),
            dispatcher: Arc::new(Dispatcher::new(std::env::temp_dir())),
            channel_handlers: HashMap::new(),
        };

        (state, instance, pool)
    }

    #[tokio::test]
    async fn reaction_events_short_circuit_without_agent_call() {
        let (state, instance, pool) = setup_state().await;
        let message = InboundMessage {
            channel: ChannelKind::Whatsapp,
            instance_name: instance.name.clone(),
            message_id: Some("M1".into()),
            sender_external_id: "+15551234567".into(),
            sender_display_name: None,
            chat_id: "+15551234567".into(),
            content: MessageContent::Reaction { emoji: "👍".into(), target_message_id: None },
            timestamp: Utc::now(),
            metadata: Default::default(),
        };

        process_inbound_event(&state, &instance, serde_json::json!({"message_id": "M1"}), message).await;

        let status: String = sqlx::query_scalar("SELECT status FROM message_trace WHERE channel_message_id = 'M1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(status, "completed");

        let payload_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM trace_payload tp JOIN message_trace mt ON mt.id = tp.trace_id \
             WHERE mt.channel_message_id = 'M1'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(payload_count, 1, "short-circuited events capture only webhook_received");
    }

    #[tokio::test]
    async fn access_denied_stops_before_agent_call() {
        let (state, instance, pool) = setup_state().await;
        AccessStore::new(pool.clone())
            .insert("+1555*", crate::storage::access::RuleType::Block, Some(&instance.name))
            .await
            .unwrap();

        let message = InboundMessage {
            channel: ChannelKind::Whatsapp,
            instance_name: instance.name.clone(),
            message_id: Some("M2".into()),
            sender_external_id: "+15551234567".into(),
            sender_display_name: None,
            chat_id: "+15551234567".into(),
            content: MessageContent::Text { body: "hi".into() },
            timestamp: Utc::now(),
            metadata: Default::default(),
        };

        process_inbound_event(&state, &instance, serde_json::json!({"message_id": "M2"}), message).await;

        let status: String = sqlx::query_scalar("SELECT status FROM message_trace WHERE channel_message_id = 'M2'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(status, "access_denied");

        let access_check_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM trace_payload tp JOIN message_trace mt ON mt.id = tp.trace_id \
             WHERE mt.channel_message_id = 'M2' AND tp.stage = 'access_check'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(access_check_count, 1);
    }

    #[tokio::test]
    async fn webhook_received_payload_captures_the_raw_body_not_the_canonical_message() {
        let (state, instance, pool) = setup_state().await;
        let raw = serde_json::json!({"provider_envelope": true, "api_key": "sekret"});
        let message = InboundMessage {
            channel: ChannelKind::Whatsapp,
            instance_name: instance.name.clone(),
            message_id: Some("M3".into()),
            sender_external_id: "+15551234567".into(),
            sender_display_name: None,
            chat_id: "+15551234567".into(),
            content: MessageContent::Reaction { emoji: "👍".into(), target_message_id: None },
            timestamp: Utc::now(),
            metadata: Default::default(),
        };

        process_inbound_event(&state, &instance, raw, message).await;

        let payload: String = sqlx::query_scalar(
            "SELECT tp.payload FROM trace_payload tp JOIN message_trace mt ON mt.id = tp.trace_id \
             WHERE mt.channel_message_id = 'M3' AND tp.stage = 'webhook_received'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert!(payload.contains("provider_envelope"));
        assert!(!payload.contains("sekret"), "api_key must be redacted even in the raw capture");
    }
}

