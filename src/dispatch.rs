//! Outbound Dispatcher (spec.md §4.6): splits reply text, picks a transport
//! per channel, retries transient failures with jittered backoff, and
//! reports segment counts back to the caller for trace capture.

use crate::error::DispatchError;
use crate::ipc::unix_http;
use crate::storage::instances::Instance;
use crate::{ChannelKind, OutboundReply};
use rand::Rng;
use std::path::Path;
use std::time::Duration;

const DISCORD_SEGMENT_CAP: usize = 2000;
const RETRY_ATTEMPTS: u32 = 2;
const RETRY_BASE_MS: u64 = 100;
const RETRY_FACTOR: u64 = 2;
const RETRY_JITTER: f64 = 0.25;
const OUTBOUND_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DispatchOutcome {
    pub success: bool,
    pub message_count: usize,
    pub error: Option<DispatchError>,
}

pub struct Dispatcher {
    http: reqwest::Client,
    sockets_dir: std::path::PathBuf,
}

impl Dispatcher {
    pub fn new(sockets_dir: std::path::PathBuf) -> Self {
        Self { http: reqwest::Client::new(), sockets_dir }
    }

    fn discord_socket_path(&self, instance: &Instance) -> std::path::PathBuf {
        self.sockets_dir.join(format!("discord-{}.sock", instance.name))
    }

    pub async fn send(&self, instance: &Instance, reply: &OutboundReply) -> DispatchOutcome {
        let split = reply.split_override.unwrap_or(instance.enable_auto_split);
        let segments = match instance.channel {
            ChannelKind::Whatsapp => split_whatsapp(&reply.text, split),
            ChannelKind::Discord => split_discord(&reply.text, split),
        };

        let mut sent = 0usize;
        for segment in &segments {
            let result = match instance.channel {
                ChannelKind::Whatsapp => self.send_whatsapp_segment(instance, &reply.recipient, segment).await,
                ChannelKind::Discord => self.send_discord_segment(instance, &reply.recipient, segment).await,
            };
            match result {
                Ok(()) => sent += 1,
                Err(e) => {
                    return DispatchOutcome { success: false, message_count: sent, error: Some(e) };
                }
            }
        }

        DispatchOutcome { success: true, message_count: sent, error: None }
    }

    async fn send_whatsapp_segment(
        &self,
        instance: &Instance,
        recipient: &str,
        text: &str,
    ) -> Result<(), DispatchError> {
        let base = instance
            .evolution_url
            .as_deref()
            .ok_or_else(|| DispatchError::Transport("instance missing evolution_url".into()))?;
        let provider_instance = instance.provider_instance_id.as_deref().unwrap_or(&instance.name);
        let url = format!("{base}/message/sendText/{provider_instance}");
        let key = instance.evolution_key.clone().unwrap_or_default();
        let body = serde_json::json!({ "number": recipient, "text": text });

        with_retry(|| async {
            let resp = self
                .http
                .post(&url)
                .header("apikey", &key)
                .json(&body)
                .timeout(OUTBOUND_TIMEOUT)
                .send()
                .await
                .map_err(classify_reqwest_error)?;
            if resp.status().is_success() {
                Ok(())
            } else {
                Err(DispatchError::Http(resp.status().as_u16()))
            }
        })
        .await
    }

    async fn send_discord_segment(
        &self,
        instance: &Instance,
        channel_id: &str,
        text: &str,
    ) -> Result<(), DispatchError> {
        let socket_path = self.discord_socket_path(instance);
        if !Path::new(&socket_path).exists() {
            return Err(DispatchError::BotMissing);
        }

        with_retry(|| async {
            unix_http::post_json(
                &socket_path,
                "/send",
                &serde_json::json!({ "channel_id": channel_id, "text": text }),
                OUTBOUND_TIMEOUT,
            )
            .await
        })
        .await
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> DispatchError {
    if e.is_timeout() {
        DispatchError::Timeout
    } else {
        DispatchError::Transport(e.to_string())
    }
}

/// Up to `RETRY_ATTEMPTS` additional attempts on retryable errors, with
/// exponential backoff and jitter (spec.md §4.6 step 4).
async fn with_retry<F, Fut>(mut op: F) -> Result<(), DispatchError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), DispatchError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < RETRY_ATTEMPTS && e.is_retryable() => {
                let backoff_ms = RETRY_BASE_MS * RETRY_FACTOR.pow(attempt);
                let jitter = {
                    let mut rng = rand::rng();
                    rng.random_range(-RETRY_JITTER..=RETRY_JITTER)
                };
                let sleep_ms = (backoff_ms as f64 * (1.0 + jitter)).max(0.0) as u64;
                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// WhatsApp: split on the literal two-newline boundary when `split=true`
/// (spec.md §4.6 step 2).
fn split_whatsapp(text: &str, split: bool) -> Vec<String> {
    if !split {
        return vec![text.to_string()];
    }
    text.split("\n\n").map(|s| s.to_string()).filter(|s| !s.is_empty()).collect()
}

/// Discord: the 2000-char cap is always enforced. Prefers the two-newline
/// boundary when `split=true`, then falls back to sentence, then word
/// boundaries to stay within the cap regardless of `split` (spec.md §4.6
/// step 2).
fn split_discord(text: &str, split: bool) -> Vec<String> {
    let mut segments = Vec::new();
    let coarse: Vec<&str> = if split {
        text.split("\n\n").filter(|s| !s.is_empty()).collect()
    } else {
        vec![text]
    };

    for chunk in coarse {
        segments.extend(split_to_cap(chunk, DISCORD_SEGMENT_CAP));
    }
    if segments.is_empty() {
        segments.push(String::new());
    }
    segments
}

/// Packs `text` into segments of at most `cap` chars, preferring to break at
/// a newline, then a sentence boundary (`. `), then a space, and finally a
/// hard char-boundary-safe cut if no boundary exists within the window.
fn split_to_cap(text: &str, cap: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.chars().count() <= cap {
            out.push(remaining.to_string());
            break;
        }

        let window_end = char_boundary_at_or_before(remaining, cap);
        let window = &remaining[..window_end];

        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(". ").map(|i| i + 1))
            .or_else(|| window.rfind(' '))
            .unwrap_or(window_end);

        let split_at = if split_at == 0 { window_end } else { split_at };

        out.push(remaining[..split_at].trim_end().to_string());
        remaining = remaining[split_at..].trim_start();
    }

    out
}

fn char_boundary_at_or_before(s: &str, byte_hint: usize) -> usize {
    let mut idx = byte_hint.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whatsapp_split_on_double_newline() {
        let segments = split_whatsapp("first\n\nsecond", true);
        assert_eq!(segments, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn whatsapp_no_split_keeps_single_segment() {
        let segments = split_whatsapp("first\n\nsecond", false);
        assert_eq!(segments.len(), 1);
    }

    #[test]
    fn discord_enforces_cap_even_without_split() {
        let long = "a".repeat(4500);
        let segments = split_discord(&long, false);
        assert!(segments.iter().all(|s| s.chars().count() <= DISCORD_SEGMENT_CAP));
        assert_eq!(segments.len(), 3);
    }

    #[test]
    fn discord_segment_of_exactly_cap_passes_uncut() {
        let text = "a".repeat(2000);
        let segments = split_discord(&text, false);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].chars().count(), 2000);
    }

    #[test]
    fn discord_segment_of_cap_plus_one_splits() {
        let text = "a".repeat(2001);
        let segments = split_discord(&text, false);
        assert_eq!(segments.len(), 2);
    }

    #[test]
    fn discord_prefers_sentence_then_word_boundary() {
        let text = format!("{}. {}", "a".repeat(1990), "b".repeat(50));
        let segments = split_discord(&text, false);
        assert!(segments[0].ends_with('.'));
    }
}
