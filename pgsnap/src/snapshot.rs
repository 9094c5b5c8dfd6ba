//! Snapshot Codec: the line-oriented on-disk format and the
//! in-memory `Step` sequence it encodes/decodes.
//!
//! The fixed startup/auth prelude never appears in the
//! file; it's synthesised by [`crate::preamble`] on every run, replay or
//! record. What's persisted here begins with the first post-handshake
//! message.

use std::path::Path;

use pq_proto::{BackendMessage, FrontendMessage};
use serde::Deserialize;

use crate::error::SnapError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Observed from the client; `Expect-Frontend` on replay.
    Frontend,
    /// Observed from the upstream server; `Send-Backend` on replay.
    Backend,
}

impl Direction {
    fn wire_byte(self) -> u8 {
        match self {
            Direction::Frontend => b'F',
            Direction::Backend => b'B',
        }
    }

    fn from_wire_byte(b: u8) -> Option<Self> {
        match b {
            b'F' => Some(Direction::Frontend),
            b'B' => Some(Direction::Backend),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    ExpectFrontend(FrontendMessage),
    SendBackend(BackendMessage),
}

impl Step {
    pub fn direction(&self) -> Direction {
        match self {
            Step::ExpectFrontend(_) => Direction::Frontend,
            Step::SendBackend(_) => Direction::Backend,
        }
    }
}

/// `<D> <json>\n` for one step, matching the on-disk form exactly (spec
/// §6). Used both by the writer and directly in tests.
pub fn encode_line(step: &Step) -> Result<String, SnapError> {
    let json = match step {
        Step::ExpectFrontend(m) => serde_json::to_string(m),
        Step::SendBackend(m) => serde_json::to_string(m),
    }
    .map_err(|e| SnapError::Setup(format!("can't encode step: {e}")))?;
    Ok(format!("{} {}\n", step.direction().wire_byte() as char, json))
}

/// Parse one line. Lines shorter than 2 bytes, and lines of any length
/// containing only whitespace (spec Testable Property 3's "trailing
/// whitespace-only line"), are ignored rather than treated as malformed.
fn parse_line(line: &str, lineno: usize) -> Result<Option<Step>, SnapError> {
    let bytes = line.as_bytes();
    if bytes.len() < 2 || line.trim().is_empty() {
        return Ok(None);
    }
    let direction = Direction::from_wire_byte(bytes[0]).ok_or_else(|| SnapError::ScriptMalformed {
        line: lineno,
        detail: format!("unknown direction byte '{}'", bytes[0] as char),
    })?;
    if bytes[1] != b' ' {
        return Err(SnapError::ScriptMalformed {
            line: lineno,
            detail: "missing space after direction byte".into(),
        });
    }
    let payload = &line[2..];
    let step = match direction {
        Direction::Frontend => {
            Step::ExpectFrontend(decode_tagged(payload, lineno)?)
        }
        Direction::Backend => Step::SendBackend(decode_tagged(payload, lineno)?),
    };
    Ok(Some(step))
}

fn decode_tagged<T: for<'de> Deserialize<'de>>(payload: &str, lineno: usize) -> Result<T, SnapError> {
    serde_json::from_str(payload).map_err(|e| SnapError::ScriptMalformed {
        line: lineno,
        detail: format!("bad message json: {e}"),
    })
}

/// Read every step out of a snapshot file. An empty result (the file
/// contains no steps once short lines are skipped) is not an error here --
/// the Session Controller is the one that interprets it as "record instead".
pub fn read_steps(path: &Path) -> Result<Vec<Step>, SnapError> {
    let contents = std::fs::read_to_string(path)?;
    let mut steps = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if let Some(step) = parse_line(line, idx + 1)? {
            steps.push(step);
        }
    }
    Ok(steps)
}
