//! The relay controller: one session per request, pumping provider deltas
//! into the client's frame stream.
//!
//! ```text
//! Init -> Streaming -> { Completed | Aborted | Errored } -> Closed
//! ```
//!
//! Every suspension point (next delta, frame send) is raced against the
//! session's cancellation token and against the client hanging up, so an
//! abort is acted on immediately rather than at the next delta.

use bytes::Bytes;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{RelayError, UpstreamError};
use crate::frame::{encode, StreamFrame};
use crate::message::PromptMessage;
use crate::request::RelayRequest;
use crate::tokens::{TokenCounter, TokenizerSource};
use crate::upstream::{CompletionProvider, DeltaStream};

pub type FrameResult = Result<Bytes, io::Error>;
pub type FrameStream = ReceiverStream<FrameResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Init,
    Streaming,
    Completed,
    Aborted,
    Errored,
    Closed,
}

impl RelayState {
    pub fn can_transition_to(self, next: RelayState) -> bool {
        use RelayState::*;
        matches!(
            (self, next),
            (Init, Streaming)
                | (Streaming, Streaming)
                | (Streaming, Completed)
                | (Streaming, Aborted)
                | (Streaming, Errored)
                | (Completed, Closed)
                | (Aborted, Closed)
                | (Errored, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RelayState::Completed | RelayState::Aborted | RelayState::Errored)
    }
}

/// Shared entry point. Holds the injected provider and tokenizer source.
#[derive(Clone)]
pub struct Relay {
    provider: Arc<dyn CompletionProvider>,
    tokenizers: Arc<dyn TokenizerSource>,
    frame_buffer: usize,
}

impl Relay {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        tokenizers: Arc<dyn TokenizerSource>,
        frame_buffer: usize,
    ) -> Self {
        Self {
            provider,
            tokenizers,
            frame_buffer: frame_buffer.max(1),
        }
    }

    pub fn provider(&self) -> &dyn CompletionProvider {
        self.provider.as_ref()
    }

    /// Set up a session: resolve the tokenizer, then open the provider stream.
    pub async fn open(
        &self,
        request: RelayRequest,
        cancel: CancellationToken,
    ) -> Result<RelaySession, RelayError> {
        let counter = TokenCounter::for_model(self.tokenizers.as_ref(), &request.model)?;
        let upstream = self.provider.stream(&request.model, &request.messages).await?;

        let session = RelaySession {
            id: Uuid::new_v4(),
            model: request.model,
            messages: request.messages,
            counter,
            upstream,
            cancel,
            state: RelayState::Init,
            started: Instant::now(),
            frames_sent: 0,
            input_tokens: 0,
            output_tokens: 0,
            text: String::new(),
        };
        info!(
            "🌊 Session {} opened: model={}, messages={}",
            session.id,
            session.model,
            session.messages.len()
        );
        Ok(session)
    }

    /// Open a session and run it in the background, returning the frame stream.
    pub async fn start(
        &self,
        request: RelayRequest,
        cancel: CancellationToken,
    ) -> Result<FrameStream, RelayError> {
        let session = self.open(request, cancel).await?;
        let (tx, rx) = mpsc::channel::<FrameResult>(self.frame_buffer);
        tokio::spawn(session.run(tx));
        Ok(ReceiverStream::new(rx))
    }
}

/// Summary of a finished session, for logs only.
#[derive(Debug, Clone)]
pub struct RelayReport {
    pub session_id: Uuid,
    pub model: String,
    pub outcome: RelayState,
    pub frames_sent: usize,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub text: String,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AbortReason {
    Cancelled,
    Disconnected,
}

enum Outcome {
    Completed,
    Aborted(AbortReason),
    Failed(UpstreamError),
}

/// Owns the sending half of the client stream and closes it at most once.
struct FrameSink {
    tx: Option<mpsc::Sender<FrameResult>>,
}

impl FrameSink {
    fn new(tx: mpsc::Sender<FrameResult>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Waits for buffer space, so a frame is only queued once the previous one was taken.
    async fn send(&self, line: Bytes) -> bool {
        match &self.tx {
            Some(tx) => tx.send(Ok(line)).await.is_ok(),
            None => false,
        }
    }

    /// Resolves once the client side of the stream is gone.
    async fn disconnected(&self) {
        match &self.tx {
            Some(tx) => tx.closed().await,
            None => std::future::pending::<()>().await,
        }
    }

    /// Push an error item so the HTTP body ends abruptly instead of cleanly.
    async fn fail(&self, err: io::Error) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Err(err)).await;
        }
    }

    fn close(&mut self) -> bool {
        self.tx.take().is_some()
    }
}

pub struct RelaySession {
    id: Uuid,
    model: String,
    messages: Vec<PromptMessage>,
    counter: TokenCounter,
    upstream: DeltaStream,
    cancel: CancellationToken,
    state: RelayState,
    started: Instant,
    frames_sent: usize,
    input_tokens: usize,
    output_tokens: usize,
    text: String,
}

impl RelaySession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Drive the session to completion, writing frames into `tx`.
    pub async fn run(mut self, tx: mpsc::Sender<FrameResult>) -> RelayReport {
        let mut sink = FrameSink::new(tx);
        self.transition(RelayState::Streaming);
        self.input_tokens = self.counter.count_input(&self.messages);

        match self.pump(&sink).await {
            Outcome::Completed => {
                self.transition(RelayState::Completed);
            }
            Outcome::Aborted(reason) => {
                match reason {
                    AbortReason::Cancelled => warn!("⚠️  Session {} cancelled after {} frames", self.id, self.frames_sent),
                    AbortReason::Disconnected => warn!("⚠️  Client disconnected from session {} after {} frames", self.id, self.frames_sent),
                }
                self.cancel.cancel();
                self.upstream.cancel();
                self.transition(RelayState::Aborted);
            }
            Outcome::Failed(err) => {
                error!("❌ Session {} upstream error after {} frames: {}", self.id, self.frames_sent, err);
                self.transition(RelayState::Errored);
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {}
                    _ = sink.fail(io::Error::other(err.to_string())) => {}
                }
            }
        }

        let outcome = self.state;
        let closed = sink.close();
        debug_assert!(closed, "frame stream closed twice");
        self.transition(RelayState::Closed);

        let report = RelayReport {
            session_id: self.id,
            model: self.model,
            outcome,
            frames_sent: self.frames_sent,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            text: self.text,
            elapsed: self.started.elapsed(),
        };
        info!(
            "✅ Session {} finished: outcome={:?}, frames={}, input_tokens={}, output_tokens={}, duration={:?}",
            report.session_id,
            report.outcome,
            report.frames_sent,
            report.input_tokens,
            report.output_tokens,
            report.elapsed
        );
        debug!("📄 Session {} full response: {}", report.session_id, report.text);
        report
    }

    async fn pump(&mut self, sink: &FrameSink) -> Outcome {
        let model_frame = StreamFrame::model(self.model.clone(), self.input_tokens);
        if let Err(outcome) = self.emit(sink, &model_frame).await {
            return outcome;
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Outcome::Aborted(AbortReason::Cancelled),
                _ = sink.disconnected() => return Outcome::Aborted(AbortReason::Disconnected),
                item = self.upstream.next() => item,
            };

            match next {
                None => return Outcome::Completed,
                // an error racing a cancellation is the cancellation
                Some(Err(_)) if self.cancel.is_cancelled() => {
                    return Outcome::Aborted(AbortReason::Cancelled)
                }
                Some(Err(err)) => return Outcome::Failed(err),
                Some(Ok(delta)) => {
                    let tokens = self.counter.count(&delta);
                    self.output_tokens += tokens;
                    self.text.push_str(&delta);
                    let frame = StreamFrame::text(delta, tokens);
                    if let Err(outcome) = self.emit(sink, &frame).await {
                        return outcome;
                    }
                    self.transition(RelayState::Streaming);
                }
            }
        }
    }

    async fn emit(&mut self, sink: &FrameSink, frame: &StreamFrame) -> Result<(), Outcome> {
        let line = encode(frame)
            .map_err(|e| Outcome::Failed(UpstreamError::Protocol(format!("frame encoding failed: {}", e))))?;
        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Outcome::Aborted(AbortReason::Cancelled)),
            sent = sink.send(line) => sent,
        };
        if !sent {
            return Err(Outcome::Aborted(AbortReason::Disconnected));
        }
        self.frames_sent += 1;
        debug!("✉️  Session {} sent frame #{}", self.id, self.frames_sent);
        Ok(())
    }

    fn transition(&mut self, next: RelayState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal relay transition {:?} -> {:?}",
            self.state,
            next
        );
        if self.state != next {
            debug!("Session {} state {:?} -> {:?}", self.id, self.state, next);
        }
        self.state = next;
    }
}
