//! Minimal STOMP 1.2 frame codec.
//!
//! Covers exactly the surface the realtime client exchanges with the broker:
//! `CONNECT`/`CONNECTED` for the handshake, `SUBSCRIBE`/`UNSUBSCRIBE` for
//! topic wiring, `SEND` for publishes, `MESSAGE` for inbound data, `ERROR`
//! for broker-level failures and `DISCONNECT` for graceful teardown.
//!
//! Header values are passed through without STOMP escaping; the order topics
//! and JSON bodies this client exchanges never contain the escapable
//! characters (`\r`, `\n`, `:`, `\`).

use crate::error::{Result, StreamError};

/// A single STOMP frame: command line, header lines, optional body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = body;
        self
    }

    /// Returns the first header with the given name, per STOMP precedence rules.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Serializes the frame to its wire form, NUL-terminated.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.command.len() + self.body.len() + 32);
        out.push_str(&self.command);
        out.push('\n');
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push(':');
            out.push_str(value);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parses one frame from the text payload of a websocket message.
    ///
    /// Returns `Ok(None)` for STOMP heart-beats (a bare EOL), which carry no
    /// frame at all.
    pub fn parse(raw: &str) -> Result<Option<Frame>> {
        let raw = raw.strip_suffix('\0').unwrap_or(raw);
        if raw.trim_matches(|c| c == '\r' || c == '\n').is_empty() {
            return Ok(None);
        }

        let (head, body) = if let Some(idx) = raw.find("\r\n\r\n") {
            (&raw[..idx], &raw[idx + 4..])
        } else if let Some(idx) = raw.find("\n\n") {
            (&raw[..idx], &raw[idx + 2..])
        } else {
            (raw, "")
        };

        let mut lines = head.lines();
        let command = lines
            .next()
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.is_empty())
            .ok_or_else(|| StreamError::StompError("frame missing command".to_string()))?
            .to_string();

        let mut headers = Vec::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (name, value) = line.split_once(':').ok_or_else(|| {
                StreamError::StompError(format!("malformed header line: {}", line))
            })?;
            headers.push((name.to_string(), value.to_string()));
        }

        Ok(Some(Frame {
            command,
            headers,
            body: body.to_string(),
        }))
    }
}

pub fn connect_frame(host: &str) -> Frame {
    Frame::new("CONNECT")
        .header("accept-version", "1.2")
        .header("host", host)
        .header("heart-beat", "0,0")
}

pub fn subscribe_frame(id: &str, destination: &str) -> Frame {
    Frame::new("SUBSCRIBE")
        .header("id", id)
        .header("destination", destination)
        .header("ack", "auto")
}

pub fn unsubscribe_frame(id: &str) -> Frame {
    Frame::new("UNSUBSCRIBE").header("id", id)
}

pub fn send_frame(destination: &str, body: String) -> Frame {
    let content_length = body.len().to_string();
    Frame::new("SEND")
        .header("destination", destination)
        .header("content-type", "application/json")
        .header("content-length", &content_length)
        .with_body(body)
}

pub fn disconnect_frame() -> Frame {
    Frame::new("DISCONNECT")
}
