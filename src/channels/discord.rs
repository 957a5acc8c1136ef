//! Discord channel handler (spec.md §4.3 Discord path): the bot sidecar
//! already normalizes events to the canonical `InboundMessage` shape before
//! pushing them over the Unix socket, so parsing here is a straight
//! deserialize plus instance-name stamping.

use super::ChannelHandler;
use crate::error::{Error, Result};
use crate::storage::instances::Instance;
use crate::{ChannelKind, InboundMessage};

pub struct DiscordHandler;

impl DiscordHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DiscordHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelHandler for DiscordHandler {
    fn channel(&self) -> ChannelKind {
        ChannelKind::Discord
    }

    fn parse(&self, instance: &Instance, raw: &serde_json::Value) -> Result<Vec<InboundMessage>> {
        let mut message: InboundMessage = serde_json::from_value(raw.clone())
            .map_err(|e| Error::Other(anyhow::anyhow!("invalid discord socket payload: {e}")))?;
        message.instance_name = instance.name.clone();
        message.channel = ChannelKind::Discord;
        Ok(vec![message])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::instances::Instance;
    use chrono::Utc;

    fn fixture_instance() -> Instance {
        Instance {
            id: "i1".into(),
            name: "acme-discord".into(),
            channel: ChannelKind::Discord,
            is_default: false,
            enable_auto_split: true,
            evolution_url: None,
            evolution_key: None,
            provider_instance_id: None,
            bot_token: Some("token".into()),
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
    fn parse_stamps_instance_name_from_socket_owner() {
        let handler = DiscordHandler::new();
        let payload = serde_json::json!({
            "channel": "discord",
            "instance_name": "wrong",
            "message_id": null,
            "sender_external_id": "u1",
            "sender_display_name": "Ann",
            "chat_id": "C1",
            "content": {"kind": "text", "body": "hi"},
            "timestamp": Utc::now().to_rfc3339(),
            "metadata": {}
        });
        let messages = handler.parse(&fixture_instance(), &payload).unwrap();
        assert_eq!(messages[0].instance_name, "acme-discord");
    }
}
