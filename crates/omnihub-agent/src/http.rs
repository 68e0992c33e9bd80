//! HTTP implementation of [`AgentClient`].
//!
//! Buffered calls POST to `{base}/api/v1/agent/{agent_id}/run`; streaming
//! calls POST to `{base}/api/v1/agent/{agent_id}/stream` and read
//! server-sent events until a `done` marker or `[DONE]` sentinel.

use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;
use omnihub_schema::InstanceConfig;
use tokio_stream::StreamExt;

use crate::{AgentClient, AgentError, AgentReply, AgentRequest, AgentStream, StreamEvent};

#[derive(Clone)]
pub struct HttpAgentClient {
    base_url: String,
    api_key: Option<String>,
    agent_id: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpAgentClient {
    pub fn new(base_url: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            agent_id: agent_id.into(),
            timeout: Duration::from_secs(60),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_instance(cfg: &InstanceConfig) -> Self {
        let mut client = Self::new(cfg.agent_api_url.clone(), cfg.agent_id.clone())
            .with_timeout(Duration::from_millis(cfg.agent_timeout_ms));
        if let Some(key) = &cfg.agent_api_key {
            client = client.with_api_key(key.clone());
        }
        client
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn run_url(&self) -> String {
        format!("{}/api/v1/agent/{}/run", self.base_url, self.agent_id)
    }

    fn stream_url(&self) -> String {
        format!("{}/api/v1/agent/{}/stream", self.base_url, self.agent_id)
    }

    fn request(&self, url: String) -> reqwest::RequestBuilder {
        let mut req = self.client.post(url).timeout(self.timeout);
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }
        req
    }
}

/// Agents answer with slightly varying shapes; accept `text`, `message` or
/// `response` as the reply body.
fn parse_reply(value: serde_json::Value) -> Result<AgentReply, AgentError> {
    let text = value
        .get("text")
        .or_else(|| value.get("message"))
        .or_else(|| value.get("response"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            AgentError::Protocol("agent reply carries no text/message/response field".into())
        })?;
    let media = value
        .get("media")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| AgentError::Protocol(format!("bad media list in agent reply: {e}")))?
        .unwrap_or_default();
    Ok(AgentReply {
        text,
        media,
        metadata: value.get("metadata").cloned(),
    })
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentReply, AgentError> {
        let resp = self
            .request(self.run_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| AgentError::from_reqwest(e, self.timeout))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AgentError::Protocol(format!("invalid agent reply json: {e}")))?;
        parse_reply(value)
    }

    async fn stream(&self, request: AgentRequest) -> Result<AgentStream, AgentError> {
        let resp = self
            .request(self.stream_url())
            .header("accept", "text/event-stream")
            .json(&request)
            .send()
            .await
            .map_err(|e| AgentError::from_reqwest(e, self.timeout))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentError::Http {
                status: status.as_u16(),
                body,
            });
        }

        Ok(Box::pin(parse_sse_stream(resp.bytes_stream())))
    }
}

fn parse_sse_stream(
    byte_stream: impl Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>>
        + Send
        + 'static,
) -> impl Stream<Item = Result<StreamEvent, AgentError>> + Send {
    async_stream::stream! {
        tokio::pin!(byte_stream);
        let mut buffer = String::new();

        while let Some(chunk_result) = byte_stream.next().await {
            match chunk_result {
                Ok(bytes) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));

                    while let Some(pos) = buffer.find("\n\n") {
                        let event_text = buffer[..pos].to_string();
                        buffer = buffer[pos + 2..].to_string();

                        for line in event_text.lines() {
                            let Some(data) = line.strip_prefix("data: ") else {
                                continue;
                            };

                            if data == "[DONE]" {
                                yield Ok(StreamEvent {
                                    content: String::new(),
                                    done: true,
                                    metadata: None,
                                });
                                return;
                            }

                            match serde_json::from_str::<StreamEvent>(data) {
                                Ok(event) => {
                                    let done = event.done;
                                    yield Ok(event);
                                    if done {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    yield Err(AgentError::Protocol(format!(
                                        "invalid sse event payload: {e}"
                                    )));
                                    return;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    yield Err(AgentError::Transport(format!("stream error: {e}")));
                    return;
                }
            }
        }
    }
}
