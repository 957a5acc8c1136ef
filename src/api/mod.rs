//! Thin HTTP glue binding the core components to axum (spec.md §6 External
//! Interfaces). The components themselves carry the actual logic.

use crate::access::AccessEngine;
use crate::agent::AgentClient;
use crate::channels::discord::DiscordHandler;
use crate::channels::whatsapp::WhatsAppHandler;
use crate::channels::ChannelHandler;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::registry::Registry;
use crate::storage::users::UserStore;
use crate::tracing_pipeline::TracingPipeline;
use crate::ChannelKind;
use std::collections::HashMap;
use std::sync::Arc;

/// Process-singleton application state, constructed once at startup and
/// shared by reference (spec.md §9: "model as explicit owned values
/// constructed at startup and passed by reference").
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub access: Arc<AccessEngine>,
    pub users: Arc<UserStore>,
    pub tracing_pipeline: Arc<TracingPipeline>,
    pub agent_client: Arc<AgentClient>,
    pub dispatcher: Arc<Dispatcher>,
    pub channel_handlers: HashMap<ChannelKind, Box<dyn ChannelHandler>>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<Registry>,
        access: Arc<AccessEngine>,
        users: Arc<UserStore>,
        tracing_pipeline: Arc<TracingPipeline>,
        agent_client: Arc<AgentClient>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let mut channel_handlers: HashMap<ChannelKind, Box<dyn ChannelHandler>> = HashMap::new();
        channel_handlers.insert(ChannelKind::Whatsapp, Box::new(WhatsAppHandler::new()));
        channel_handlers.insert(ChannelKind::Discord, Box::new(DiscordHandler::new()));

        Self {
            config,
            registry,
            access,
            users,
            tracing_pipeline,
            agent_client,
            dispatcher,
            channel_handlers,
        }
    }
}

pub fn build_router(state: Arc<AppState>, supervisor: Arc<crate::supervisor::Supervisor>) -> axum::Router {
    use tower_http::cors::CorsLayer;

    let cors = if state.config.cors.origins.is_empty() {
        CorsLayer::permissive()
    } else {
        crate::webhook::cors_layer(&state.config.cors)
    };

    crate::webhook::router(state, supervisor).layer(cors)
}
