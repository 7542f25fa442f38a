//! Wire frames for the relay's newline-delimited JSON protocol.
//!
//! A response is one `model` frame followed by zero or more `text` frames,
//! one JSON value per line. There is no terminal frame: the end of the
//! stream is the end of the response.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamFrame {
    /// Announces the model and the input token count. Always first.
    Model { data: String, tokens: usize },
    /// One upstream delta and its token count.
    Text { data: String, tokens: usize },
    /// Any tag this version doesn't know. Decoded and ignored, never sent.
    #[serde(other, skip_serializing)]
    Unknown,
}

impl StreamFrame {
    pub fn model(model: impl Into<String>, tokens: usize) -> Self {
        StreamFrame::Model {
            data: model.into(),
            tokens,
        }
    }

    pub fn text(delta: impl Into<String>, tokens: usize) -> Self {
        StreamFrame::Text {
            data: delta.into(),
            tokens,
        }
    }
}

/// Serialize a frame as a single line terminated by `\n`.
pub fn encode(frame: &StreamFrame) -> Result<Bytes, serde_json::Error> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

/// Parse one line (without its terminator) into a frame.
pub fn decode(line: &str) -> Result<StreamFrame, serde_json::Error> {
    serde_json::from_str(line)
}
