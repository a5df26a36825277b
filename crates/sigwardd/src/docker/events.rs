//! Decoding of the engine's newline-delimited JSON event stream

use serde::Deserialize;
use sigward_common::LifecycleEvent;
use thiserror::Error;

/// `filters` query value restricting the stream to container creation,
/// i.e. `{"type":["container"],"event":["create"]}` percent-encoded.
pub const CREATE_FILTER_QUERY: &str =
    "%7B%22type%22%3A%5B%22container%22%5D%2C%22event%22%3A%5B%22create%22%5D%7D";

/// Longest event line held back while waiting for its newline
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed event: {0}")]
    Json(#[from] serde_json::Error),

    #[error("event line exceeded {0} bytes without a newline, discarded")]
    Oversized(usize),
}

/// Event message as the engine sends it
#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "Type", default)]
    kind: Option<String>,
    #[serde(rename = "Action", default)]
    action: Option<String>,
    #[serde(rename = "Actor", default)]
    actor: Option<WireActor>,
    /// Pre-1.22 engines only fill these
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireActor {
    #[serde(rename = "ID", default)]
    id: Option<String>,
}

/// Parse one JSON event line
pub fn parse_event(line: &[u8]) -> Result<LifecycleEvent, serde_json::Error> {
    let raw: serde_json::Value = serde_json::from_slice(line)?;
    let wire: WireEvent = serde_json::from_value(raw.clone())?;

    let subject_id = wire
        .actor
        .and_then(|actor| actor.id)
        .or(wire.id)
        .unwrap_or_default();

    Ok(LifecycleEvent {
        kind: wire.kind.unwrap_or_default(),
        action: wire.action.or(wire.status).unwrap_or_default(),
        subject_id,
        raw_payload: raw,
    })
}

/// Incremental line splitter for chunked event bodies.
///
/// Chunks may end mid-line; the tail is kept until the next push. A tail
/// growing past [`MAX_LINE_BYTES`] is dropped along with the rest of its
/// line, and decoding resumes after the next newline.
#[derive(Debug, Default)]
pub struct EventDecoder {
    buffer: Vec<u8>,
    /// Inside an oversized line, skipping to its newline
    discarding: bool,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every complete event it finished
    pub fn push(&mut self, mut chunk: &[u8]) -> Vec<Result<LifecycleEvent, DecodeError>> {
        if self.discarding {
            match chunk.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    chunk = &chunk[pos + 1..];
                    self.discarding = false;
                }
                None => return Vec::new(),
            }
        }
        self.buffer.extend_from_slice(chunk);

        let mut decoded = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }
            decoded.push(parse_event(line).map_err(DecodeError::from));
        }

        if self.buffer.len() > MAX_LINE_BYTES {
            decoded.push(Err(DecodeError::Oversized(self.buffer.len())));
            self.buffer = Vec::new();
            self.discarding = true;
        }
        decoded
    }

    /// Bytes held back waiting for a newline
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
