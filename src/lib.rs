//! Automagik Omni core: multi-tenant messaging hub library.
//!
//! Wires together the instance registry, access engine, tracing pipeline,
//! channel handlers, agent client and outbound dispatcher behind a single
//! `omni-core` binary (see `main.rs`).

pub mod access;
pub mod agent;
pub mod api;
pub mod channels;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod ipc;
pub mod registry;
pub mod storage;
pub mod supervisor;
pub mod tracing_pipeline;
pub mod webhook;

pub use error::{Error, Result};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Channel a message originated on or is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Whatsapp,
    Discord,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Whatsapp => "whatsapp",
            ChannelKind::Discord => "discord",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "whatsapp" => Some(ChannelKind::Whatsapp),
            "discord" => Some(ChannelKind::Discord),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A media attachment referenced by an inbound or outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: String,
    pub url: Option<String>,
    pub mime_type: Option<String>,
    pub filename: Option<String>,
}

/// Tagged union over inbound message kinds (spec.md §9 redesign note: avoid a
/// giant optional-everything record at the interior).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text { body: String },
    Media { text: Option<String>, attachments: Vec<Attachment> },
    Audio { attachments: Vec<Attachment> },
    Reaction { emoji: String, target_message_id: Option<String> },
    Quoted { body: String, quoted_message_id: String, quoted_body: Option<String> },
    GroupEvent { description: String },
    Unsupported { raw_type: String },
}

impl MessageContent {
    /// Short tag used for trace fields (`message_type`).
    pub fn type_tag(&self) -> &'static str {
        match self {
            MessageContent::Text { .. } => "text",
            MessageContent::Media { .. } => "media",
            MessageContent::Audio { .. } => "audio",
            MessageContent::Reaction { .. } => "reaction",
            MessageContent::Quoted { .. } => "quoted",
            MessageContent::GroupEvent { .. } => "group_event",
            MessageContent::Unsupported { .. } => "unsupported",
        }
    }

    pub fn has_media(&self) -> bool {
        matches!(self, MessageContent::Media { .. } | MessageContent::Audio { .. })
    }

    pub fn has_quoted(&self) -> bool {
        matches!(self, MessageContent::Quoted { .. })
    }

    /// True for events that are classified and traced but never reach the
    /// agent (spec.md §4.3: "short-circuited after trace capture").
    pub fn short_circuits(&self) -> bool {
        matches!(
            self,
            MessageContent::Reaction { .. }
                | MessageContent::GroupEvent { .. }
                | MessageContent::Unsupported { .. }
        )
    }

    /// Best-effort text body, used for the agent call and for trace display.
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageContent::Text { body } => Some(body),
            MessageContent::Media { text, .. } => text.as_deref(),
            MessageContent::Quoted { body, .. } => Some(body),
            _ => None,
        }
    }
}

/// Canonical inbound event shape, produced by every channel handler
/// regardless of provider (spec.md §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: ChannelKind,
    pub instance_name: String,
    /// Channel-native message id, when the provider supplies one.
    pub message_id: Option<String>,
    pub sender_external_id: String,
    pub sender_display_name: Option<String>,
    pub chat_id: String,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Reply handed to the Outbound Dispatcher (spec.md §4.6). Deliberately
/// simpler than a rich card/poll model: this hub only ever relays agent text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundReply {
    pub recipient: String,
    pub text: String,
    /// Per-call override of the instance's `enable_auto_split` setting.
    pub split_override: Option<bool>,
}

/// Derives the stable conversation identifier used for per-session ordering
/// and agent continuity (spec.md §4.3 step 3, §5 ordering guarantee).
pub fn session_name(channel: ChannelKind, chat_id: &str) -> String {
    format!("{}:{}", channel.as_str(), chat_id)
}

/// A parsed `InboundMessage` paired with the untouched provider payload it
/// was parsed from. Queued as a unit so the `webhook_received` trace payload
/// captures the raw envelope (spec.md §4.3 step 1) even though only the
/// canonical `message` flows through the rest of the pipeline.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub raw: serde_json::Value,
    pub message: InboundMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_name_is_stable_per_chat() {
        assert_eq!(
            session_name(ChannelKind::Whatsapp, "+15551234567"),
            session_name(ChannelKind::Whatsapp, "+15551234567")
        );
        assert_ne!(
            session_name(ChannelKind::Whatsapp, "a"),
            session_name(ChannelKind::Discord, "a")
        );
    }

    #[test]
    fn message_content_short_circuits_classification() {
        assert!(MessageContent::Reaction { emoji: "👍".into(), target_message_id: None }.short_circuits());
        assert!(!MessageContent::Text { body: "hi".into() }.short_circuits());
    }
}
