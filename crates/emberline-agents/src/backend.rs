use std::time::Duration;

use bytes::Bytes;
use emberline_common::message::EntryRole;
use emberline_common::{Error, Result};
use emberline_config::{ModelDescriptor, PromptFormat};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

const CHAT_TIMEOUT: Duration = Duration::from_secs(120);
/// Thinking models spend most of their budget before the first visible
/// token, so they get a longer window.
const THINKING_TIMEOUT: Duration = Duration::from_secs(180);
const STREAM_TIMEOUT: Duration = Duration::from_secs(300);

/// Message in the shape the inference backend expects.
#[derive(Debug, Clone, Serialize)]
pub struct WireMessage {
    pub role: &'static str,
    pub content: String,
    /// Base64-encoded image payloads, only set on vision calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

impl WireMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
            images: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
            images: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant",
            content: content.into(),
            images: None,
        }
    }

    pub fn from_role(role: EntryRole, content: impl Into<String>) -> Self {
        Self {
            role: role.as_str(),
            content: content.into(),
            images: None,
        }
    }
}

/// One incremental fragment of a streaming response.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub content: String,
    pub done: bool,
}

#[derive(Deserialize)]
struct ChatCompletion {
    message: Option<CompletionMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: String,
}

#[derive(Deserialize)]
struct GenerateCompletion {
    #[serde(default)]
    response: String,
}

/// HTTP client for the model-inference backend.
///
/// Chat-format models go through the chat endpoint with a structured message
/// list; flattened models get the list folded into a single prompt string
/// against the generate endpoint.
#[derive(Clone)]
pub struct BackendClient {
    pub(crate) base_url: String,
    pub(crate) client: Client,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: Client::new(),
        }
    }

    fn build_chat_body(
        &self,
        descriptor: &ModelDescriptor,
        messages: &[WireMessage],
        stream: bool,
    ) -> Value {
        serde_json::json!({
            "model": descriptor.backend_model,
            "messages": messages,
            "stream": stream,
            "options": {
                "num_predict": descriptor.num_predict,
                "temperature": descriptor.temperature,
            },
        })
    }

    fn build_generate_body(
        &self,
        descriptor: &ModelDescriptor,
        messages: &[WireMessage],
        stream: bool,
    ) -> Value {
        serde_json::json!({
            "model": descriptor.backend_model,
            "prompt": flatten_prompt(messages),
            "stream": stream,
            "options": {
                "num_predict": descriptor.num_predict,
                "temperature": descriptor.temperature,
            },
        })
    }

    /// Single request, single response.
    pub async fn complete(
        &self,
        descriptor: &ModelDescriptor,
        messages: &[WireMessage],
    ) -> Result<String> {
        let (url, body) = match descriptor.prompt_format {
            PromptFormat::Chat => (
                format!("{}/api/chat", self.base_url),
                self.build_chat_body(descriptor, messages, false),
            ),
            PromptFormat::Flattened => (
                format!("{}/api/generate", self.base_url),
                self.build_generate_body(descriptor, messages, false),
            ),
        };

        debug!(model = %descriptor.id, url = %url, "dispatching completion request");

        let res = self
            .client
            .post(&url)
            .timeout(request_timeout(descriptor))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Backend(format!("request failed: {e}")))?;

        if !res.status().is_success() {
            return Err(Error::Backend(format!(
                "backend error status: {}",
                res.status()
            )));
        }

        match descriptor.prompt_format {
            PromptFormat::Chat => {
                let parsed: ChatCompletion = res
                    .json()
                    .await
                    .map_err(|e| Error::Backend(format!("failed to parse response: {e}")))?;
                Ok(parsed.message.map(|m| m.content).unwrap_or_default())
            }
            PromptFormat::Flattened => {
                let parsed: GenerateCompletion = res
                    .json()
                    .await
                    .map_err(|e| Error::Backend(format!("failed to parse response: {e}")))?;
                Ok(parsed.response)
            }
        }
    }

    /// Streaming chat request. The backend replies with newline-delimited
    /// JSON fragments; each carries an incremental content delta and a
    /// completion flag.
    pub async fn stream_chat(
        &self,
        descriptor: &ModelDescriptor,
        messages: &[WireMessage],
    ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        let body = self.build_chat_body(descriptor, messages, true);
        let url = format!("{}/api/chat", self.base_url);

        let res = self
            .client
            .post(&url)
            .timeout(STREAM_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Backend(format!("request failed: {e}")))?;

        if !res.status().is_success() {
            return Err(Error::Backend(format!(
                "backend error status: {}",
                res.status()
            )));
        }

        let stream = res
            .bytes_stream()
            .map_err(|e| Error::Backend(format!("stream error: {e}")));
        let stream: BoxStream<'static, Result<Bytes>> = Box::pin(stream);

        // unfold state: (stream, line buffer)
        let lines = futures::stream::unfold(
            (stream, Vec::new()),
            |(mut stream, mut buffer): (BoxStream<'static, Result<Bytes>>, Vec<u8>)| async move {
                loop {
                    if let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                        let line_bytes: Vec<u8> = buffer.drain(0..=pos).collect();
                        let line =
                            String::from_utf8_lossy(&line_bytes[..line_bytes.len() - 1]).to_string();
                        if !line.is_empty() {
                            return Some((Ok(line), (stream, buffer)));
                        }
                        continue;
                    }

                    match stream.next().await {
                        Some(Ok(chunk)) => {
                            buffer.extend_from_slice(&chunk);
                        }
                        Some(Err(e)) => return Some((Err(e), (stream, buffer))),
                        None => {
                            // End of stream, flush whatever is left.
                            if !buffer.is_empty() {
                                let line = String::from_utf8_lossy(&buffer).to_string();
                                buffer.clear();
                                if !line.is_empty() {
                                    return Some((Ok(line), (stream, buffer)));
                                }
                            }
                            return None;
                        }
                    }
                }
            },
        );

        let chunks = lines.map(|line: Result<String>| {
            let line = line?;
            let parsed: ChatCompletion = serde_json::from_str(&line)
                .map_err(|e| Error::Backend(format!("failed to parse stream chunk: {e}")))?;
            Ok(StreamChunk {
                content: parsed.message.map(|m| m.content).unwrap_or_default(),
                done: parsed.done,
            })
        });

        Ok(Box::pin(chunks))
    }
}

fn request_timeout(descriptor: &ModelDescriptor) -> Duration {
    if descriptor.shows_thinking {
        THINKING_TIMEOUT
    } else {
        CHAT_TIMEOUT
    }
}

/// Fold a message list into the single-prompt form the generate endpoint
/// expects, ending with an open assistant turn.
pub(crate) fn flatten_prompt(messages: &[WireMessage]) -> String {
    let mut prompt = String::new();
    for msg in messages {
        let label = match msg.role {
            "system" => "System",
            "assistant" => "Assistant",
            _ => "User",
        };
        prompt.push_str(label);
        prompt.push_str(": ");
        prompt.push_str(&msg.content);
        prompt.push('\n');
    }
    prompt.push_str("Assistant:");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberline_config::ModelRegistry;
    use serde_json::json;

    fn descriptor(id: &str) -> ModelDescriptor {
        ModelRegistry::defaults()
            .get(id)
            .expect("descriptor exists")
            .clone()
    }

    #[test]
    fn chat_body_serialization() {
        let client = BackendClient::new("http://localhost:11434");
        let desc = descriptor("flint");
        let body = client.build_chat_body(&desc, &[WireMessage::user("Hello")], false);

        assert_eq!(body["model"], "gemma3:27b-cloud");
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "Hello");
        assert_eq!(body["options"]["num_predict"], 1024);
        assert_eq!(body["options"]["temperature"], 0.9);
        // No image payload means no images key at all.
        assert!(body["messages"][0].get("images").is_none());
    }

    #[test]
    fn generate_body_flattens_messages() {
        let client = BackendClient::new("http://localhost:11434");
        let desc = descriptor("pyre");
        let messages = [
            WireMessage::system("stay in character"),
            WireMessage::user("hi"),
            WireMessage::assistant("hello"),
            WireMessage::user("roast me"),
        ];
        let body = client.build_generate_body(&desc, &messages, false);

        let prompt = body["prompt"].as_str().expect("prompt is a string");
        assert_eq!(
            prompt,
            "System: stay in character\nUser: hi\nAssistant: hello\nUser: roast me\nAssistant:"
        );
        assert_eq!(body["options"]["num_predict"], 3000);
    }

    // Integration tests against a mock backend.
    use axum::{
        Json, Router,
        routing::post,
    };
    use serde_json::Value;
    use tokio::sync::oneshot;

    async fn run_mock_server() -> (String, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel::<()>();

        let app = Router::new()
            .route(
                "/api/chat",
                post(|Json(payload): Json<Value>| async move {
                    let stream = payload
                        .get("stream")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    if stream {
                        "{\"model\":\"m\",\"message\":{\"role\":\"assistant\",\"content\":\"Hello\"},\"done\":false}\n{\"model\":\"m\",\"message\":{\"role\":\"assistant\",\"content\":\" World\"},\"done\":true}"
                            .to_string()
                    } else {
                        serde_json::to_string(&json!({
                            "model": "m",
                            "message": { "role": "assistant", "content": "Hello World" },
                            "done": true,
                        }))
                        .unwrap()
                    }
                }),
            )
            .route(
                "/api/generate",
                post(|Json(payload): Json<Value>| async move {
                    let prompt = payload
                        .get("prompt")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default();
                    assert!(prompt.ends_with("Assistant:"));
                    serde_json::to_string(&json!({
                        "model": "m",
                        "response": "flattened reply",
                        "done": true,
                    }))
                    .unwrap()
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{}", addr);

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    rx.await.ok();
                })
                .await
                .unwrap();
        });

        (url, tx)
    }

    #[tokio::test]
    async fn complete_chat_format() {
        let (url, stop) = run_mock_server().await;
        let client = BackendClient::new(url);

        let response = client
            .complete(&descriptor("flint"), &[WireMessage::user("Hi")])
            .await
            .unwrap();
        assert_eq!(response, "Hello World");

        let _ = stop.send(());
    }

    #[tokio::test]
    async fn complete_flattened_format() {
        let (url, stop) = run_mock_server().await;
        let client = BackendClient::new(url);

        let response = client
            .complete(&descriptor("pyre"), &[WireMessage::user("Hi")])
            .await
            .unwrap();
        assert_eq!(response, "flattened reply");

        let _ = stop.send(());
    }

    #[tokio::test]
    async fn stream_chat_yields_ordered_chunks() {
        let (url, stop) = run_mock_server().await;
        let client = BackendClient::new(url);

        let mut stream = client
            .stream_chat(&descriptor("flint"), &[WireMessage::user("Hi")])
            .await
            .unwrap();

        let mut full = String::new();
        let mut saw_done = false;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            full.push_str(&chunk.content);
            saw_done |= chunk.done;
        }
        assert_eq!(full, "Hello World");
        assert!(saw_done);

        let _ = stop.send(());
    }

    #[tokio::test]
    async fn non_success_status_is_backend_error() {
        // Nothing is listening on this port.
        let client = BackendClient::new("http://127.0.0.1:9");
        let result = client
            .complete(&descriptor("flint"), &[WireMessage::user("Hi")])
            .await;
        assert!(matches!(result, Err(Error::Backend(_))));
    }
}
