use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use futures::Stream;

use crate::error::UpstreamError;
use crate::message::PromptMessage;

/// An OpenAI-style chat completion backend.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Issue one streaming completion request.
    async fn stream(
        &self,
        model: &str,
        messages: &[PromptMessage],
    ) -> Result<DeltaStream, UpstreamError>;

    /// Issue one non-streaming completion request and return the full text.
    async fn complete(
        &self,
        model: &str,
        messages: &[PromptMessage],
    ) -> Result<String, UpstreamError>;
}

type CancelHook = Box<dyn FnOnce() + Send>;

/// Single-pass sequence of text deltas from the provider.
///
/// `cancel()` drops the provider stream (closing its connection) and makes
/// every later `next()` return `None`.
pub struct DeltaStream {
    inner: Option<BoxStream<'static, Result<String, UpstreamError>>>,
    on_cancel: Option<CancelHook>,
}

impl DeltaStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<String, UpstreamError>> + Send + 'static,
    {
        Self {
            inner: Some(stream.boxed()),
            on_cancel: None,
        }
    }

    /// Run `hook` the first time the stream is cancelled.
    pub fn on_cancel(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_cancel = Some(Box::new(hook));
        self
    }

    pub async fn next(&mut self) -> Option<Result<String, UpstreamError>> {
        match self.inner.as_mut() {
            Some(stream) => stream.next().await,
            None => None,
        }
    }

    /// Stop generation. Returns `true` only for the call that actually cancelled.
    pub fn cancel(&mut self) -> bool {
        if self.inner.take().is_none() {
            return false;
        }
        if let Some(hook) = self.on_cancel.take() {
            hook();
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_none()
    }
}

impl std::fmt::Debug for DeltaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaStream")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
