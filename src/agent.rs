//! Agent Client (spec.md §4.5): calls a tenant's configured agent endpoint,
//! aggregating either a single JSON response or a newline-delimited JSON
//! event stream, with timeout/non-2xx classification and session
//! stickiness.

use crate::error::AgentError;
use futures::StreamExt;
use serde::Deserialize;
use std::time::{Duration, Instant};

pub struct AgentRequest<'a> {
    pub agent_api_url: &'a str,
    pub agent_api_key: &'a str,
    pub agent_name: &'a str,
    /// Seeded on the first successful call for a session, then passed back
    /// on subsequent calls (spec.md §4.5 Session stickiness).
    pub agent_session_id: Option<&'a str>,
    pub user_id: &'a str,
    pub message: &'a str,
    pub streaming: bool,
    pub timeout_seconds: u64,
}

pub struct AgentReply {
    pub text: String,
    pub agent_session_id: Option<String>,
    pub processing_time_ms: i64,
}

#[derive(Debug, Deserialize)]
struct NonStreamResponse {
    content: String,
    #[serde(default)]
    session_id: Option<String>,
}

/// One event from the NDJSON stream (spec.md §6 Agent endpoint contract).
#[derive(Debug, Deserialize)]
struct StreamEvent {
    event: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

pub struct AgentClient {
    http: reqwest::Client,
}

impl AgentClient {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }

    pub async fn call(&self, req: AgentRequest<'_>) -> Result<AgentReply, AgentError> {
        let started = Instant::now();
        let deadline = Duration::from_secs(req.timeout_seconds);

        let result = tokio::time::timeout(deadline, self.call_inner(&req)).await;

        match result {
            Ok(Ok(mut reply)) => {
                reply.processing_time_ms = started.elapsed().as_millis() as i64;
                Ok(reply)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AgentError::Timeout(req.timeout_seconds)),
        }
    }

    async fn call_inner(&self, req: &AgentRequest<'_>) -> Result<AgentReply, AgentError> {
        let url = format!(
            "{}/playground/agents/{}/runs",
            req.agent_api_url.trim_end_matches('/'),
            req.agent_name
        );

        let mut form = reqwest::multipart::Form::new()
            .text("message", req.message.to_string())
            .text("stream", if req.streaming { "true" } else { "false" }.to_string())
            .text("user_id", req.user_id.to_string());
        if let Some(session_id) = req.agent_session_id {
            form = form.text("session_id", session_id.to_string());
        }

        let response = self
            .http
            .post(&url)
            .bearer_auth(req.agent_api_key)
            .multipart(form)
            .send()
            .await
            .map_err(classify_transport_error)?;

        if !response.status().is_success() {
            return Err(AgentError::Http(response.status().as_u16()));
        }

        if req.streaming {
            self.aggregate_stream(response).await
        } else {
            let parsed: NonStreamResponse = response
                .json()
                .await
                .map_err(|e| AgentError::Transport(e.to_string()))?;
            Ok(AgentReply {
                text: parsed.content,
                agent_session_id: parsed.session_id,
                processing_time_ms: 0,
            })
        }
    }

    /// Concatenates `RunResponseContent.content` fragments in arrival order;
    /// terminates on `RunCompleted` or when the byte stream ends (spec.md
    /// §4.5, §9 "partial aggregation must survive early cancellation").
    async fn aggregate_stream(&self, response: reqwest::Response) -> Result<AgentReply, AgentError> {
        let mut buffer = NdjsonBuffer::new();
        let mut text = String::new();
        let mut agent_session_id = None;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(classify_transport_error)?;
            buffer.push_chunk(&chunk);

            while let Some(line) = buffer.next_line() {
                if line.trim().is_empty() {
                    continue;
                }
                let Ok(event) = serde_json::from_str::<StreamEvent>(&line) else {
                    continue;
                };
                match event.event.as_str() {
                    "RunResponseContent" => {
                        if let Some(content) = event.content {
                            text.push_str(&content);
                        }
                        if event.session_id.is_some() {
                            agent_session_id = event.session_id;
                        }
                    }
                    "RunCompleted" => {
                        if event.session_id.is_some() {
                            agent_session_id = event.session_id;
                        }
                        return Ok(AgentReply { text, agent_session_id, processing_time_ms: 0 });
                    }
                    _ => {}
                }
            }
        }

        Ok(AgentReply { text, agent_session_id, processing_time_ms: 0 })
    }
}

impl Default for AgentClient {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_transport_error(e: reqwest::Error) -> AgentError {
    if e.is_timeout() {
        AgentError::Timeout(0)
    } else {
        AgentError::Transport(e.to_string())
    }
}

/// Accumulates raw bytes and yields complete newline-delimited frames,
/// retaining any partial trailing line across chunks — adapted from the
/// double-newline SSE framing idiom to this endpoint's single-`\n` NDJSON
/// contract.
struct NdjsonBuffer {
    buffer: String,
}

impl NdjsonBuffer {
    fn new() -> Self {
        Self { buffer: String::new() }
    }

    fn push_chunk(&mut self, chunk: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
    }

    fn next_line(&mut self) -> Option<String> {
        let newline_pos = self.buffer.find('\n')?;
        let rest = self.buffer.split_off(newline_pos + 1);
        let mut line = std::mem::replace(&mut self.buffer, rest);
        line.pop(); // drop the newline itself
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ndjson_buffer_yields_only_complete_lines() {
        let mut buffer = NdjsonBuffer::new();
        buffer.push_chunk(b"{\"event\":\"RunStarted\"}\n{\"event\":\"RunResponseCont");
        assert_eq!(buffer.next_line(), Some(r#"{"event":"RunStarted"}"#.to_string()));
        assert_eq!(buffer.next_line(), None);

        buffer.push_chunk(b"ent\",\"content\":\"hi\"}\n");
        assert_eq!(
            buffer.next_line(),
            Some(r#"{"event":"RunResponseContent","content":"hi"}"#.to_string())
        );
    }

    #[test]
    fn stream_event_deserializes_known_variants() {
        let started: StreamEvent = serde_json::from_str(r#"{"event":"RunStarted"}"#).unwrap();
        assert_eq!(started.event, "RunStarted");
        let content: StreamEvent =
            serde_json::from_str(r#"{"event":"RunResponseContent","content":"hi","session_id":"S1"}"#)
                .unwrap();
        assert_eq!(content.content.as_deref(), Some("hi"));
        assert_eq!(content.session_id.as_deref(), Some("S1"));
    }
}
