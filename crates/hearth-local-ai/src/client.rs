//! HTTP client for llama-server's OpenAI-compatible API.

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::LocalAIError;
use crate::DEFAULT_PORT;

/// Client for communicating with the supervised inference server.
#[derive(Debug, Clone)]
pub struct CompletionClient {
    client: reqwest::Client,
    base_url: String,
}

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Chat message in OpenAI format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// OpenAI-compatible chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub max_tokens: u32,
    pub stop: Vec<String>,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub temperature: f32,
    pub top_p: f32,
    pub context_length: u32,
    pub stream: bool,
}

/// OpenAI-compatible chat completion response.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// One server-sent event of a streaming completion.
#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

impl CompletionClient {
    /// Create a new client with default URL (localhost:11435).
    pub fn new() -> Self {
        Self::with_url(format!("http://127.0.0.1:{}", DEFAULT_PORT))
    }

    /// Create a new client with a custom URL.
    pub fn with_url(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Create a new client with a custom port on localhost.
    pub fn with_port(port: u16) -> Self {
        Self::with_url(format!("http://127.0.0.1:{}", port))
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check if the server is running and healthy.
    pub async fn check_health(&self) -> Result<(), LocalAIError> {
        let url = format!("{}/health", self.base_url);

        let response = self
            .client
            .get(&url)
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(LocalAIError::ServerNotRunning(self.base_url.clone()))
        }
    }

    /// Send a completion request and return the assistant's reply.
    ///
    /// Uses the OpenAI-compatible `/v1/chat/completions` endpoint.
    pub async fn chat_completion(
        &self,
        request: &CompletionRequest,
    ) -> Result<String, LocalAIError> {
        let request = CompletionRequest {
            stream: false,
            ..request.clone()
        };
        let response = self.post_completion(&request).await?;
        let completion: ChatCompletionResponse = response.json().await?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LocalAIError::Api("No completion returned".to_string()))
    }

    /// Send a streaming completion request.
    ///
    /// Each content fragment is forwarded on `fragments` as it arrives; the
    /// concatenated reply is returned once the server sends `[DONE]` or
    /// closes the stream.
    pub async fn chat_completion_stream(
        &self,
        request: &CompletionRequest,
        fragments: &mpsc::UnboundedSender<String>,
    ) -> Result<String, LocalAIError> {
        let request = CompletionRequest {
            stream: true,
            ..request.clone()
        };
        let response = self.post_completion(&request).await?;

        let mut decoder = SseDecoder::default();
        let mut reply = String::new();
        let mut body = response.bytes_stream();

        'stream: while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for event in decoder.push(&chunk) {
                match event {
                    SseEvent::Done => break 'stream,
                    SseEvent::Data(data) => {
                        let chunk: ChatCompletionChunk = serde_json::from_str(&data)?;
                        let fragment = chunk
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.delta.content)
                            .unwrap_or_default();
                        if !fragment.is_empty() {
                            trace!("Completion fragment: {:?}", fragment);
                            reply.push_str(&fragment);
                            let _ = fragments.send(fragment);
                        }
                    }
                }
            }
        }

        debug!("Streamed completion of {} bytes", reply.len());
        Ok(reply)
    }

    async fn post_completion(
        &self,
        request: &CompletionRequest,
    ) -> Result<reqwest::Response, LocalAIError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        debug!(
            "Requesting completion for {} messages (stream: {})",
            request.messages.len(),
            request.stream
        );

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(LocalAIError::Api(format!("{}: {}", status, text)));
        }

        Ok(response)
    }

    fn transport_error(&self, e: reqwest::Error) -> LocalAIError {
        if e.is_connect() || e.is_timeout() {
            LocalAIError::ServerNotRunning(self.base_url.clone())
        } else {
            LocalAIError::Http(e)
        }
    }
}

impl Default for CompletionClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Data(String),
    Done,
}

/// Splits a server-sent-event byte stream into `data:` payloads.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                events.push(SseEvent::Done);
            } else if !data.is_empty() {
                events.push(SseEvent::Data(data.to_string()));
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn request() -> CompletionRequest {
        CompletionRequest {
            messages: vec![
                ChatMessage::system("You are a good assistant."),
                ChatMessage::user("hello"),
            ],
            model: "gpt-3.5-turbo".to_string(),
            max_tokens: 2048,
            stop: vec![],
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            temperature: 0.7,
            top_p: 0.95,
            context_length: 4096,
            stream: false,
        }
    }

    #[test]
    fn test_default_url() {
        let client = CompletionClient::new();
        assert_eq!(client.base_url(), "http://127.0.0.1:11435");
    }

    #[test]
    fn test_custom_url() {
        let client = CompletionClient::with_url("http://192.168.1.100:8080/");
        assert_eq!(client.base_url(), "http://192.168.1.100:8080");
    }

    #[test]
    fn test_custom_port() {
        let client = CompletionClient::with_port(9000);
        assert_eq!(client.base_url(), "http://127.0.0.1:9000");
    }

    #[test]
    fn test_roles_serialize_lowercase() {
        let json = serde_json::to_value(ChatMessage::assistant("hi")).unwrap();
        assert_eq!(json, json!({"role": "assistant", "content": "hi"}));
    }

    #[test]
    fn test_sse_decoder_handles_split_lines() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\":").is_empty());
        assert_eq!(
            decoder.push(b"1}\n\n: keep-alive\ndata: [DONE]\n"),
            vec![SseEvent::Data("{\"a\":1}".to_string()), SseEvent::Done]
        );
    }

    #[tokio::test]
    async fn test_chat_completion() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .json_body_partial(r#"{"stream": false, "max_tokens": 2048}"#);
                then.status(200).json_body(json!({
                    "choices": [{"message": {"role": "assistant", "content": "Hi there"}}]
                }));
            })
            .await;

        let client = CompletionClient::with_url(server.base_url());
        let reply = client.chat_completion(&request()).await.unwrap();
        assert_eq!(reply, "Hi there");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_chat_completion_error_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(500).body("model not loaded");
            })
            .await;

        let client = CompletionClient::with_url(server.base_url());
        let err = client.chat_completion(&request()).await.unwrap_err();
        match err {
            LocalAIError::Api(message) => assert!(message.contains("model not loaded")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_streaming_completion() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .json_body_partial(r#"{"stream": true}"#);
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(concat!(
                        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
                        "data: {\"choices\":[{\"delta\":{}}]}\n\n",
                        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
                        "data: [DONE]\n\n",
                    ));
            })
            .await;

        let client = CompletionClient::with_url(server.base_url());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reply = client
            .chat_completion_stream(&request(), &tx)
            .await
            .unwrap();

        assert_eq!(reply, "Hello");
        assert_eq!(rx.recv().await.as_deref(), Some("Hel"));
        assert_eq!(rx.recv().await.as_deref(), Some("lo"));
    }

    #[tokio::test]
    async fn test_health_check_against_closed_port() {
        let client = CompletionClient::with_url("http://127.0.0.1:9");
        let err = client.check_health().await.unwrap_err();
        assert!(matches!(err, LocalAIError::ServerNotRunning(_)));
    }
}
