use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::UpstreamConfig;
use crate::error::UpstreamError;
use crate::lines::LineBuffer;
use crate::message::PromptMessage;
use crate::upstream::{CompletionProvider, DeltaStream};

/// OpenAI chat completions request format
#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [PromptMessage],
    stream: bool,
}

/// One `chat.completion.chunk` from a streaming response
#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Non-streaming `chat.completion` response
#[derive(Debug, Deserialize)]
struct Completion {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiProvider {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        // No total timeout: it would also bound how long a reply may stream.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
        })
    }

    async fn send(
        &self,
        model: &str,
        messages: &[PromptMessage],
        stream: bool,
    ) -> Result<reqwest::Response, UpstreamError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!("🔄 Forwarding to provider: {} (stream={})", url, stream);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&CompletionRequest {
                model,
                messages,
                stream,
            })
            .send()
            .await?;

        let status = response.status();
        info!("📬 Provider response status: {}", status);
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn stream(
        &self,
        model: &str,
        messages: &[PromptMessage],
    ) -> Result<DeltaStream, UpstreamError> {
        let response = self.send(model, messages, true).await?;
        let model = model.to_string();
        Ok(DeltaStream::new(sse_deltas(response.bytes_stream()))
            .on_cancel(move || info!("🛑 Dropped provider stream for {}", model)))
    }

    async fn complete(
        &self,
        model: &str,
        messages: &[PromptMessage],
    ) -> Result<String, UpstreamError> {
        let response = self.send(model, messages, false).await?;
        let completion: Completion = response.json().await?;
        Ok(completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default())
    }
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Delta(String),
    Done,
    Ignore,
}

fn parse_sse_line(line: &str) -> Result<SseEvent, UpstreamError> {
    let Some(data) = line.strip_prefix("data:") else {
        // blank separators, `event:`, `id:`, `retry:` and `:` comments
        return Ok(SseEvent::Ignore);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }

    let value: Value = serde_json::from_str(data)
        .map_err(|e| UpstreamError::Protocol(format!("{}: {}", e, data)))?;
    if let Some(error) = value.get("error") {
        return Err(UpstreamError::Protocol(error.to_string()));
    }
    let chunk: CompletionChunk = serde_json::from_value(value)
        .map_err(|e| UpstreamError::Protocol(format!("{}: {}", e, data)))?;

    let content = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .unwrap_or_default();
    Ok(SseEvent::Delta(content))
}

struct SseState {
    body: BoxStream<'static, Result<Bytes, reqwest::Error>>,
    lines: LineBuffer,
    pending: VecDeque<String>,
    finished: bool,
}

/// Turn an SSE response body into a sequence of content deltas.
fn sse_deltas<S>(body: S) -> impl futures::Stream<Item = Result<String, UpstreamError>> + Send
where
    S: futures::Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let state = SseState {
        body: body.boxed(),
        lines: LineBuffer::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(delta) = state.pending.pop_front() {
                return Some((Ok(delta), state));
            }
            if state.finished {
                return None;
            }

            let lines = match state.body.next().await {
                Some(Ok(chunk)) => state.lines.push(&chunk),
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(UpstreamError::Transport(e)), state));
                }
                None => {
                    state.finished = true;
                    if state.lines.pending() > 0 {
                        warn!("⚠️  Provider stream ended with {} bytes of incomplete line", state.lines.pending());
                    }
                    state.lines.finish().into_iter().collect()
                }
            };

            for line in lines {
                match parse_sse_line(&line) {
                    Ok(SseEvent::Delta(delta)) => state.pending.push_back(delta),
                    Ok(SseEvent::Ignore) => {}
                    Ok(SseEvent::Done) => {
                        debug!("Provider sent [DONE]");
                        state.finished = true;
                        break;
                    }
                    Err(e) => {
                        state.finished = true;
                        state.pending.clear();
                        return Some((Err(e), state));
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(chunks: &[&str]) -> impl futures::Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static {
        let chunks: Vec<Result<Bytes, reqwest::Error>> = chunks
            .iter()
            .map(|c| Ok(Bytes::from(c.to_string())))
            .collect();
        stream::iter(chunks)
    }

    async fn collect(chunks: &[&str]) -> Vec<Result<String, UpstreamError>> {
        sse_deltas(body(chunks)).collect().await
    }

    #[test]
    fn test_parse_content_delta() {
        let event = parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#).unwrap();
        assert_eq!(event, SseEvent::Delta("Hel".to_string()));
    }

    #[test]
    fn test_role_only_chunk_is_empty_delta() {
        let event = parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap();
        assert_eq!(event, SseEvent::Delta(String::new()));
    }

    #[test]
    fn test_non_data_lines_ignored() {
        for line in ["", ": keep-alive", "event: message", "id: 4"] {
            assert_eq!(parse_sse_line(line).unwrap(), SseEvent::Ignore);
        }
        assert_eq!(parse_sse_line("data: [DONE]").unwrap(), SseEvent::Done);
    }

    #[test]
    fn test_error_payload_is_protocol_error() {
        let err = parse_sse_line(r#"data: {"error":{"message":"overloaded"}}"#).unwrap_err();
        assert!(matches!(err, UpstreamError::Protocol(_)));
        assert!(matches!(parse_sse_line("data: {oops"), Err(UpstreamError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_deltas_across_chunk_boundaries() {
        let items = collect(&[
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\ndata: {\"choi",
            "ces\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\ndata: [DONE]\n\n",
        ])
        .await;
        let deltas: Vec<String> = items.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(deltas, vec!["", "Hel", "lo"]);
    }

    #[tokio::test]
    async fn test_nothing_after_done() {
        let items = collect(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\ndata: [DONE]\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n",
        ])
        .await;
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn test_protocol_error_ends_sequence() {
        let items = collect(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
            "data: {\"error\":{\"message\":\"boom\"}}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n",
        ])
        .await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "a");
        assert!(items[1].is_err());
    }

    #[tokio::test]
    async fn test_unterminated_final_line_is_parsed() {
        let items = collect(&["data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}"]).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap(), "tail");
    }

    #[tokio::test]
    async fn test_complete_against_unreachable_provider() {
        let provider = OpenAiProvider::new(&UpstreamConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            api_key: "sk-test".to_string(),
            connect_timeout_seconds: 1,
        })
        .unwrap();
        let err = provider
            .complete("gpt-4o-mini", &[PromptMessage::user("Hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Transport(_)));
    }
}
