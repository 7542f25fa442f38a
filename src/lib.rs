//! Streaming relay for OpenAI-compatible chat completions.
//!
//! Requests come in on `POST /openai/stream/`. Provider deltas go back out as
//! newline-delimited JSON frames with per-chunk token counts. A client hanging
//! up cancels the provider stream.

pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod lines;
pub mod message;
pub mod openai;
pub mod relay;
pub mod request;
pub mod server;
pub mod tokens;
pub mod upstream;
