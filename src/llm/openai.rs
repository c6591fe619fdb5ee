//! OpenAI-compatible streaming backend.
//!
//! Posts a chat completion request with `stream: true` and decodes the
//! server-sent events of the response into answer fragments.

use super::sse::SseDecoder;
use super::ChatRequest;
use crate::config::Config;
use anyhow::{anyhow, bail, Context, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};

/// Environment variable consulted when the config has no API key.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

const DONE_MARKER: &str = "[DONE]";

/// Client for the `/chat/completions` endpoint of an OpenAI-compatible API.
pub struct OpenAIClient {
    model: String,
    temperature: f32,
    api_key: Option<String>,
    endpoint: String,
    client: Client,
}

impl OpenAIClient {
    /// Create a client from the loaded configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            model: config.api.model.clone(),
            temperature: config.output.temperature,
            api_key: config.api.api_key.clone(),
            endpoint: chat_endpoint(&config.api.base_url),
            client,
        })
    }

    /// Get the API key from config or environment.
    fn get_api_key(&self) -> Result<String> {
        self.api_key
            .clone()
            .filter(|key| !key.is_empty())
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .ok_or_else(|| {
                anyhow!(
                    "API key not found. Set api_key in the [api] section of the config file \
                     or the {} environment variable.",
                    API_KEY_ENV
                )
            })
    }

    /// Send the question and return the stream of answer fragments.
    pub async fn stream_chat(&self, system_prompt: &str, user_query: &str) -> Result<ChatStream> {
        let api_key = self.get_api_key()?;
        let request =
            ChatRequest::streaming(&self.model, system_prompt, user_query, self.temperature);

        debug!(endpoint = %self.endpoint, model = %self.model, "sending chat completion request");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .header("Accept", "text/event-stream")
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", self.endpoint))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            bail!(
                "Chat completion request failed with status {}: {}",
                status,
                message
            );
        }

        debug!(status = %response.status(), "response stream opened");

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Ok(ChatStream::new(body))
    }
}

/// Answer fragments of a streamed chat completion, pulled one at a time.
pub struct ChatStream {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: SseDecoder,
    payloads: VecDeque<String>,
    done: bool,
}

impl ChatStream {
    fn new(body: BoxStream<'static, reqwest::Result<Vec<u8>>>) -> Self {
        Self {
            body,
            decoder: SseDecoder::new(),
            payloads: VecDeque::new(),
            done: false,
        }
    }

    /// Wait for the next non-empty text fragment.
    ///
    /// Returns `Ok(None)` once the server sends `[DONE]` or closes the body.
    pub async fn next_fragment(&mut self) -> Result<Option<String>> {
        loop {
            while let Some(payload) = self.payloads.pop_front() {
                match parse_payload(&payload)? {
                    Payload::Done => {
                        self.done = true;
                        self.payloads.clear();
                        return Ok(None);
                    }
                    Payload::Delta(Some(fragment)) => return Ok(Some(fragment)),
                    Payload::Delta(None) => {}
                }
            }

            if self.done {
                return Ok(None);
            }

            match self.body.next().await {
                Some(chunk) => {
                    let chunk = chunk.context("Failed to read response stream")?;
                    self.payloads.extend(self.decoder.feed(&chunk));
                }
                None => {
                    debug!("response body ended without [DONE]");
                    self.done = true;
                    self.payloads.extend(self.decoder.finish());
                }
            }
        }
    }
}

#[derive(Debug, PartialEq)]
enum Payload {
    Done,
    Delta(Option<String>),
}

fn parse_payload(data: &str) -> Result<Payload> {
    if data.trim() == DONE_MARKER {
        return Ok(Payload::Done);
    }

    let event: StreamEvent = match serde_json::from_str(data) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "skipping malformed stream event");
            return Ok(Payload::Delta(None));
        }
    };

    if let Some(error) = event.error {
        bail!("Chat completion stream failed: {}", error.message);
    }

    let content = event
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty());
    Ok(Payload::Delta(content))
}

fn chat_endpoint(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::OutputMode;
    use crate::output::{render_stream, Renderer};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    fn delta(content: &str) -> String {
        let event = serde_json::json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}],
        });
        format!("data: {}\n\n", event)
    }

    fn test_config(base_url: &str) -> Config {
        let mut config = Config::default();
        config.api.base_url = base_url.to_string();
        config.api.api_key = Some("test-key".to_string());
        config.api.model = "test-model".to_string();
        config
    }

    /// Read one HTTP request, headers plus `content-length` body.
    async fn read_request(socket: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if data.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&data).into_owned()
    }

    /// Serve a single canned response and hand back the raw request.
    async fn serve_once(status: &'static str, body: String) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}/v1", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: text/event-stream\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            request
        });
        (base_url, handle)
    }

    #[test]
    fn test_chat_endpoint() {
        assert_eq!(
            chat_endpoint("https://api.openai.com/v1"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            chat_endpoint("https://api.deepseek.com/"),
            "https://api.deepseek.com/chat/completions"
        );
    }

    #[test]
    fn test_parse_payload() {
        assert_eq!(parse_payload("[DONE]").unwrap(), Payload::Done);
        assert_eq!(
            parse_payload(r#"{"choices":[{"delta":{"content":"hi"}}]}"#).unwrap(),
            Payload::Delta(Some("hi".to_string()))
        );
        assert_eq!(
            parse_payload(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            Payload::Delta(None)
        );
        assert_eq!(
            parse_payload(r#"{"choices":[{"delta":{"content":""}}]}"#).unwrap(),
            Payload::Delta(None)
        );
        assert_eq!(parse_payload(r#"{"choices":[]}"#).unwrap(), Payload::Delta(None));
        assert_eq!(parse_payload("not json").unwrap(), Payload::Delta(None));
    }

    #[test]
    fn test_parse_payload_error_event() {
        let err = parse_payload(r#"{"error":{"message":"rate limited"}}"#).unwrap_err();
        assert!(err.to_string().contains("rate limited"));
    }

    #[test]
    fn test_empty_api_key_falls_back_to_env() {
        let mut config = test_config("http://localhost:1/v1");
        config.api.api_key = Some(String::new());
        let client = OpenAIClient::from_config(&config).unwrap();
        match std::env::var(API_KEY_ENV) {
            Ok(key) => assert_eq!(client.get_api_key().unwrap(), key),
            Err(_) => assert!(client.get_api_key().is_err()),
        }
    }

    #[test]
    fn test_config_api_key_wins() {
        let client = OpenAIClient::from_config(&test_config("http://localhost:1/v1")).unwrap();
        assert_eq!(client.get_api_key().unwrap(), "test-key");
    }

    #[tokio::test]
    async fn test_stream_chat_yields_fragments() {
        let body = [
            delta("Sure, "),
            delta("```python\n"),
            delta("print(1)\n"),
            delta("```\n"),
            delta("Done."),
            "data: [DONE]\n\n".to_string(),
        ]
        .concat();
        let (base_url, server) = serve_once("200 OK", body).await;

        let client = OpenAIClient::from_config(&test_config(&base_url)).unwrap();
        let mut stream = client.stream_chat("be brief", "print one").await.unwrap();
        let mut fragments = Vec::new();
        while let Some(fragment) = stream.next_fragment().await.unwrap() {
            fragments.push(fragment);
        }
        assert_eq!(
            fragments,
            vec!["Sure, ", "```python\n", "print(1)\n", "```\n", "Done."]
        );
        assert_eq!(stream.next_fragment().await.unwrap(), None);

        let request = server.await.unwrap();
        let lower = request.to_lowercase();
        assert!(request.starts_with("POST /v1/chat/completions"));
        assert!(lower.contains("authorization: bearer test-key"));
        assert!(request.contains(r#""stream":true"#));
        assert!(request.contains(r#""model":"test-model""#));
        assert!(request.contains(r#""content":"print one""#));
    }

    #[tokio::test]
    async fn test_stream_rendered_clean() {
        let body = [
            delta("Sure, "),
            delta("```python\n"),
            delta("print(1)\n"),
            delta("```\n"),
            delta("Done."),
            "data: [DONE]\n\n".to_string(),
        ]
        .concat();
        let (base_url, server) = serve_once("200 OK", body).await;

        let client = OpenAIClient::from_config(&test_config(&base_url)).unwrap();
        let mut stream = client.stream_chat("be brief", "print one").await.unwrap();
        let out = render_stream(&mut stream, Renderer::new(OutputMode::Clean, Vec::new()))
            .await
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "Sure, print(1)\nDone.\n");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_ends_without_done_marker() {
        let body = format!("{}data: {{\"choices\":[{{\"delta\":{{\"content\":\"!\"}}}}]}}", delta("hi"));
        let (base_url, server) = serve_once("200 OK", body).await;

        let client = OpenAIClient::from_config(&test_config(&base_url)).unwrap();
        let mut stream = client.stream_chat("", "q").await.unwrap();
        assert_eq!(stream.next_fragment().await.unwrap().as_deref(), Some("hi"));
        assert_eq!(stream.next_fragment().await.unwrap().as_deref(), Some("!"));
        assert_eq!(stream.next_fragment().await.unwrap(), None);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_status_reports_api_message() {
        let body = r#"{"error":{"message":"Incorrect API key provided"}}"#.to_string();
        let (base_url, server) = serve_once("401 Unauthorized", body).await;

        let client = OpenAIClient::from_config(&test_config(&base_url)).unwrap();
        let err = client.stream_chat("", "q").await.err().unwrap();
        let message = err.to_string();
        assert!(message.contains("401"));
        assert!(message.contains("Incorrect API key provided"));
        server.await.unwrap();
    }
}
