#![allow(dead_code)]

use async_trait::async_trait;
use axum::http::HeaderValue;
use axum::Router;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use stream_relay::config::{ModelCatalog, RelaySettings};
use stream_relay::error::{TokenizerError, UpstreamError};
use stream_relay::message::PromptMessage;
use stream_relay::relay::Relay;
use stream_relay::server::{router, AppState};
use stream_relay::tokens::{Tokenizer, TokenizerSource};
use stream_relay::upstream::{CompletionProvider, DeltaStream};

pub const UI_ORIGIN: &str = "http://localhost:5173";

/// One token per character, so expected counts are easy to read off.
pub struct CharTokenizer;

impl Tokenizer for CharTokenizer {
    fn count(&self, text: &str) -> usize {
        text.chars().count()
    }
}

pub struct CharTokenizers;

impl TokenizerSource for CharTokenizers {
    fn tokenizer(&self, _model: &str) -> Result<Arc<dyn Tokenizer>, TokenizerError> {
        Ok(Arc::new(CharTokenizer))
    }
}

#[derive(Debug, Clone)]
pub enum Script {
    /// Yield the deltas, then finish.
    Complete(Vec<&'static str>),
    /// Yield the deltas, then fail.
    FailAfter(Vec<&'static str>),
    /// Yield the deltas, then never produce anything again.
    Hang(Vec<&'static str>),
    /// Reject the request before any stream opens.
    Refuse,
}

pub struct FakeProvider {
    script: Script,
    cancels: Arc<AtomicUsize>,
    cancelled: Arc<Notify>,
    requests: Mutex<Vec<(String, Vec<PromptMessage>)>>,
}

impl FakeProvider {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            cancels: Arc::new(AtomicUsize::new(0)),
            cancelled: Arc::new(Notify::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<(String, Vec<PromptMessage>)> {
        self.requests.lock().unwrap().clone()
    }

    /// Wait (bounded) until the relay has cancelled the provider stream.
    pub async fn wait_for_cancel(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.cancelled.notified())
            .await
            .expect("provider stream was never cancelled");
    }
}

fn ok_deltas(deltas: &[&'static str]) -> Vec<Result<String, UpstreamError>> {
    deltas.iter().map(|d| Ok(d.to_string())).collect()
}

#[async_trait]
impl CompletionProvider for FakeProvider {
    async fn stream(
        &self,
        model: &str,
        messages: &[PromptMessage],
    ) -> Result<DeltaStream, UpstreamError> {
        self.requests
            .lock()
            .unwrap()
            .push((model.to_string(), messages.to_vec()));

        let deltas = match &self.script {
            Script::Complete(d) => stream::iter(ok_deltas(d)).boxed(),
            Script::FailAfter(d) => stream::iter(ok_deltas(d))
                .chain(stream::once(async {
                    Err(UpstreamError::Protocol("provider exploded".to_string()))
                }))
                .boxed(),
            Script::Hang(d) => stream::iter(ok_deltas(d)).chain(stream::pending()).boxed(),
            Script::Refuse => {
                return Err(UpstreamError::Status {
                    status: 401,
                    body: "invalid api key".to_string(),
                })
            }
        };

        let cancels = self.cancels.clone();
        let cancelled = self.cancelled.clone();
        Ok(DeltaStream::new(deltas).on_cancel(move || {
            cancels.fetch_add(1, Ordering::SeqCst);
            cancelled.notify_one();
        }))
    }

    async fn complete(
        &self,
        model: &str,
        messages: &[PromptMessage],
    ) -> Result<String, UpstreamError> {
        self.requests
            .lock()
            .unwrap()
            .push((model.to_string(), messages.to_vec()));
        match &self.script {
            Script::Complete(d) => Ok(d.concat()),
            _ => Err(UpstreamError::Status {
                status: 500,
                body: "provider exploded".to_string(),
            }),
        }
    }
}

pub fn settings() -> RelaySettings {
    RelaySettings {
        catalog: ModelCatalog::default(),
        cors_origin: HeaderValue::from_static(UI_ORIGIN),
        frame_buffer: 1,
    }
}

pub fn app(provider: &Arc<FakeProvider>, shutdown: CancellationToken) -> Router {
    let relay = Relay::new(provider.clone(), Arc::new(CharTokenizers), 1);
    router(AppState::new(relay, settings(), shutdown))
}

/// Serve the app on an ephemeral port and return its base URL.
pub async fn spawn_server(provider: &Arc<FakeProvider>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = app(provider, CancellationToken::new());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}
