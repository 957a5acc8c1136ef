//! WhatsApp/Evolution webhook payload parsing (spec.md §4.3 WhatsApp path).

use super::ChannelHandler;
use crate::error::{Error, Result};
use crate::storage::instances::Instance;
use crate::{Attachment, ChannelKind, InboundMessage, MessageContent};
use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    #[serde(default)]
    entry: Vec<WebhookEntry>,
}

#[derive(Debug, Deserialize)]
struct WebhookEntry {
    #[serde(default)]
    changes: Vec<WebhookChange>,
}

#[derive(Debug, Deserialize)]
struct WebhookChange {
    value: WebhookValue,
}

#[derive(Debug, Deserialize)]
struct WebhookValue {
    #[serde(default)]
    messages: Vec<WebhookMessage>,
}

#[derive(Debug, Deserialize)]
struct WebhookMessage {
    from: String,
    id: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    push_name: Option<String>,
    #[serde(default)]
    text: Option<MessageText>,
    #[serde(default)]
    image: Option<MediaMessage>,
    #[serde(default)]
    document: Option<MediaMessage>,
    #[serde(default)]
    audio: Option<MediaMessage>,
    #[serde(default)]
    reaction: Option<ReactionMessage>,
    #[serde(default)]
    context: Option<QuotedContext>,
    #[serde(default)]
    group_id: Option<String>,
    #[serde(rename = "type", default)]
    message_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageText {
    body: String,
}

#[derive(Debug, Deserialize)]
struct MediaMessage {
    id: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    filename: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReactionMessage {
    emoji: String,
    #[serde(default)]
    message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QuotedContext {
    id: String,
}

pub struct WhatsAppHandler;

impl WhatsAppHandler {
    pub fn new() -> Self {
        Self
    }

    fn message_content(msg: &WebhookMessage) -> MessageContent {
        if let Some(reaction) = &msg.reaction {
            return MessageContent::Reaction {
                emoji: reaction.emoji.clone(),
                target_message_id: reaction.message_id.clone(),
            };
        }
        if msg.group_id.is_some() {
            return MessageContent::GroupEvent { description: "group message".into() };
        }
        if let Some(ctx) = &msg.context {
            let body = msg.text.as_ref().map(|t| t.body.clone()).unwrap_or_default();
            return MessageContent::Quoted {
                body,
                quoted_message_id: ctx.id.clone(),
                quoted_body: None,
            };
        }
        if let Some(audio) = &msg.audio {
            return MessageContent::Audio {
                attachments: vec![attachment_from("audio", audio)],
            };
        }
        if let Some(media) = msg.image.as_ref().or(msg.document.as_ref()) {
            return MessageContent::Media {
                text: msg.text.as_ref().map(|t| t.body.clone()),
                attachments: vec![attachment_from("media", media)],
            };
        }
        if let Some(text) = &msg.text {
            return MessageContent::Text { body: text.body.clone() };
        }
        MessageContent::Unsupported {
            raw_type: msg.message_type.clone().unwrap_or_else(|| "unknown".into()),
        }
    }
}

impl Default for WhatsAppHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn attachment_from(kind: &str, media: &MediaMessage) -> Attachment {
    Attachment {
        kind: kind.to_string(),
        url: None,
        mime_type: media.mime_type.clone(),
        filename: media.filename.clone().or_else(|| Some(media.id.clone())),
    }
}

impl ChannelHandler for WhatsAppHandler {
    fn channel(&self) -> ChannelKind {
        ChannelKind::Whatsapp
    }

    fn parse(&self, instance: &Instance, raw: &serde_json::Value) -> Result<Vec<InboundMessage>> {
        let envelope: WebhookEnvelope = serde_json::from_value(raw.clone())
            .map_err(|e| Error::Other(anyhow::anyhow!("invalid whatsapp webhook payload: {e}")))?;

        let mut out = Vec::new();
        for entry in envelope.entry {
            for change in entry.changes {
                for msg in change.value.messages {
                    let timestamp = msg
                        .timestamp
                        .as_deref()
                        .and_then(|t| t.parse::<i64>().ok())
                        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                        .unwrap_or_else(Utc::now);

                    out.push(InboundMessage {
                        channel: ChannelKind::Whatsapp,
                        instance_name: instance.name.clone(),
                        message_id: Some(msg.id.clone()),
                        sender_external_id: msg.from.clone(),
                        sender_display_name: msg.push_name.clone(),
                        chat_id: msg.from.clone(),
                        content: Self::message_content(&msg),
                        timestamp,
                        metadata: Default::default(),
                    });
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::instances::Instance;

    fn fixture_instance() -> Instance {
        Instance {
            id: "i1".into(),
            name: "acme".into(),
            channel: ChannelKind::Whatsapp,
            is_default: true,
            enable_auto_split: true,
            evolution_url: Some("https://evo.example".into()),
            evolution_key: Some("key".into()),
            provider_instance_id: Some("acme-wa".into()),
            bot_token: None,
            agent_api_url: None,
            agent_api_key: None,
            agent_default_name: None,
            agent_streaming: false,
            agent_timeout_seconds: 60,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn parses_plain_text_message() {
        let handler = WhatsAppHandler::new();
        let payload = serde_json::json!({
            "entry": [{"changes": [{"value": {"messages": [{
                "from": "+15551234567", "id": "M1", "timestamp": "1700000000",
                "text": {"body": "hello"}
            }]}}]}]
        });
        let messages = handler.parse(&fixture_instance(), &payload).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content.type_tag(), "text");
        assert_eq!(messages[0].content.text(), Some("hello"));
    }

    #[test]
    fn parses_reaction_as_short_circuiting_content() {
        let handler = WhatsAppHandler::new();
        let payload = serde_json::json!({
            "entry": [{"changes": [{"value": {"messages": [{
                "from": "+15551234567", "id": "M2",
                "reaction": {"emoji": "👍", "message_id": "M1"}
            }]}}]}]
        });
        let messages = handler.parse(&fixture_instance(), &payload).unwrap();
        assert!(messages[0].content.short_circuits());
    }

    #[test]
    fn rejects_malformed_payload() {
        let handler = WhatsAppHandler::new();
        let payload = serde_json::json!({"entry": "not-an-array"});
        assert!(handler.parse(&fixture_instance(), &payload).is_err());
    }
}
