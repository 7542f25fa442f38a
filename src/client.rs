//! Client side of the relay protocol: decoding the frame stream, rebuilding
//! the assistant reply, and keeping the conversation log.

use futures::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::frame::{decode, StreamFrame};
use crate::lines::LineBuffer;
use crate::message::{ChatMessage, PromptMessage};

/// Shown in place of the reply when a turn fails for any reason other than
/// the user cancelling it.
pub const ERROR_MESSAGE: &str = "An error occurred. Please try again.";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("relay returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("relay transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("undecodable frame {line:?}: {source}")]
    Decode {
        line: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Incremental decoder for the newline-delimited frame stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    lines: LineBuffer,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns every frame completed by this chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<StreamFrame>, ClientError> {
        self.lines
            .push(chunk)
            .into_iter()
            .filter(|line| !line.is_empty())
            .map(parse_line)
            .collect()
    }

    /// Parse a trailing line the stream ended without terminating.
    pub fn finish(&mut self) -> Result<Option<StreamFrame>, ClientError> {
        match self.lines.finish() {
            Some(line) if !line.trim().is_empty() => parse_line(line).map(Some),
            _ => Ok(None),
        }
    }
}

fn parse_line(line: String) -> Result<StreamFrame, ClientError> {
    decode(&line).map_err(|source| ClientError::Decode { line, source })
}

/// Accumulates one in-flight assistant reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamConsumer {
    model: Option<String>,
    input_tokens: Option<usize>,
    content: String,
    tokens: usize,
}

impl StreamConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, frame: &StreamFrame) {
        match frame {
            StreamFrame::Model { data, tokens } => {
                self.model = Some(data.clone());
                self.input_tokens = Some(*tokens);
            }
            StreamFrame::Text { data, tokens } => {
                self.content.push_str(data);
                self.tokens += tokens;
            }
            StreamFrame::Unknown => debug!("Ignoring frame with unknown type"),
        }
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn input_tokens(&self) -> Option<usize> {
        self.input_tokens
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn tokens(&self) -> usize {
        self.tokens
    }
}

/// How a streamed turn ended.
#[derive(Debug)]
pub enum StreamEnd {
    Completed,
    Cancelled,
    Failed(ClientError),
}

/// A submitted user message waiting for its reply.
#[derive(Debug, Clone)]
pub struct PendingTurn {
    pub user: ChatMessage,
    pub context: Vec<PromptMessage>,
    pub model: String,
}

/// The UI session: an append-only log plus the input being edited.
#[derive(Debug, Clone)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
    input: String,
    model: String,
    in_flight: bool,
}

impl Conversation {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            messages: Vec::new(),
            input: String::new(),
            model: model.into(),
            in_flight: false,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn set_input(&mut self, input: impl Into<String>) {
        self.input = input.into();
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Take the current input as a new turn. Aborted replies are left out of
    /// the context sent to the model.
    pub fn begin_turn(&mut self) -> Option<PendingTurn> {
        if self.in_flight || self.input.trim().is_empty() {
            return None;
        }
        let user = ChatMessage::user(std::mem::take(&mut self.input));
        let context = self
            .messages
            .iter()
            .chain(std::iter::once(&user))
            .filter(|m| !m.aborted)
            .map(ChatMessage::to_prompt)
            .collect();
        self.in_flight = true;
        Some(PendingTurn {
            user,
            context,
            model: self.model.clone(),
        })
    }

    /// Log the turn's user message and its outcome.
    pub fn finish_turn(&mut self, turn: PendingTurn, consumer: StreamConsumer, end: StreamEnd) {
        let PendingTurn { mut user, .. } = turn;
        user.tokens = consumer.input_tokens;
        let restore = user.content.clone();
        self.messages.push(user);

        let mut reply = ChatMessage::assistant(consumer.content, consumer.model, consumer.tokens);
        match end {
            StreamEnd::Completed => {}
            StreamEnd::Cancelled => {
                reply.aborted = true;
                self.input = restore;
            }
            StreamEnd::Failed(err) => {
                warn!("⚠️  Turn failed: {}", err);
                reply.content = ERROR_MESSAGE.to_string();
                self.input = restore;
            }
        }
        self.messages.push(reply);
        self.in_flight = false;
    }
}

/// HTTP client for a running relay.
#[derive(Debug, Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    base_url: String,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Stream the reply to `turn`, calling `on_frame` after each frame is applied.
    ///
    /// Cancelling `cancel` drops the response, which closes the connection
    /// and is what the relay sees as a disconnect.
    pub async fn stream_turn(
        &self,
        turn: &PendingTurn,
        cancel: &CancellationToken,
        mut on_frame: impl FnMut(&StreamConsumer, &StreamFrame),
    ) -> (StreamConsumer, StreamEnd) {
        let mut consumer = StreamConsumer::new();
        let end = tokio::select! {
            biased;
            _ = cancel.cancelled() => StreamEnd::Cancelled,
            end = self.read_stream(turn, &mut consumer, &mut on_frame) => end,
        };
        (consumer, end)
    }

    async fn read_stream(
        &self,
        turn: &PendingTurn,
        consumer: &mut StreamConsumer,
        on_frame: &mut impl FnMut(&StreamConsumer, &StreamFrame),
    ) -> StreamEnd {
        let url = format!("{}/openai/stream/", self.base_url);
        let body = serde_json::json!({ "model": turn.model, "messages": turn.context });
        let response = match self.http.post(&url).json(&body).send().await {
            Ok(response) => response,
            Err(e) => return StreamEnd::Failed(e.into()),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return StreamEnd::Failed(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut decoder = FrameDecoder::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let frames = match chunk.map_err(ClientError::from).and_then(|c| decoder.push(&c)) {
                Ok(frames) => frames,
                Err(e) => return StreamEnd::Failed(e),
            };
            for frame in frames {
                consumer.apply(&frame);
                on_frame(consumer, &frame);
            }
        }
        match decoder.finish() {
            Ok(Some(frame)) => {
                consumer.apply(&frame);
                on_frame(consumer, &frame);
                StreamEnd::Completed
            }
            Ok(None) => StreamEnd::Completed,
            Err(e) => StreamEnd::Failed(e),
        }
    }

    /// Single-shot completion through `GET /openai/chat/`.
    pub async fn chat(&self, message: &str) -> Result<String, ClientError> {
        let url = format!("{}/openai/chat/", self.base_url);
        let response = self.http.get(&url).query(&[("message", message)]).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<String>().await?)
    }
}
