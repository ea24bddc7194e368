use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

/// Well-known STOMP header names.
pub mod headers {
    pub const ACCEPT_VERSION: &str = "accept-version";
    pub const ACK: &str = "ack";
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const DESTINATION: &str = "destination";
    pub const HEART_BEAT: &str = "heart-beat";
    pub const HOST: &str = "host";
    pub const ID: &str = "id";
    pub const LOGIN: &str = "login";
    pub const MESSAGE: &str = "message";
    pub const MESSAGE_ID: &str = "message-id";
    pub const PASSCODE: &str = "passcode";
    pub const RECEIPT: &str = "receipt";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const VERSION: &str = "version";
}

/// STOMP 1.2 frame commands the bridge deals in.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Command {
    Connect,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Message,
    Error,
    Disconnect,
    Receipt,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Message => "MESSAGE",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
            Command::Receipt => "RECEIPT",
        }
    }

    pub fn parse(raw: &str) -> Option<Command> {
        match raw {
            "CONNECT" | "STOMP" => Some(Command::Connect),
            "CONNECTED" => Some(Command::Connected),
            "SEND" => Some(Command::Send),
            "SUBSCRIBE" => Some(Command::Subscribe),
            "UNSUBSCRIBE" => Some(Command::Unsubscribe),
            "MESSAGE" => Some(Command::Message),
            "ERROR" => Some(Command::Error),
            "DISCONNECT" => Some(Command::Disconnect),
            "RECEIPT" => Some(Command::Receipt),
            _ => None,
        }
    }

    /// CONNECT and CONNECTED predate header escaping and are exempt from it.
    pub fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single STOMP frame: command, ordered header list, opaque body.
///
/// Repeated headers are kept in arrival order; `header()` returns the first
/// occurrence, which is the one STOMP 1.2 declares authoritative.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Build a frame from a command and name/value header pairs.
    pub fn with_headers(command: Command, pairs: &[(&str, &str)]) -> Self {
        Self {
            command,
            headers: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: Bytes::new(),
        }
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) -> &mut Self {
        self.body = body.into();
        self
    }

    /// First occurrence of a header, if present.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header(headers::CONTENT_LENGTH)
            .and_then(|v| v.parse().ok())
    }

    /// Serialise the frame to wire bytes, including the terminating NUL.
    /// A `content-length` header is appended for non-empty bodies so binary
    /// payloads survive embedded NULs.
    pub fn to_bytes(&self) -> Bytes {
        let escape = self.command.escapes_headers();
        let mut buf = BytesMut::with_capacity(64 + self.body.len());
        buf.put_slice(self.command.as_str().as_bytes());
        buf.put_u8(b'\n');
        for (name, value) in &self.headers {
            if escape {
                put_escaped(&mut buf, name);
                buf.put_u8(b':');
                put_escaped(&mut buf, value);
            } else {
                buf.put_slice(name.as_bytes());
                buf.put_u8(b':');
                buf.put_slice(value.as_bytes());
            }
            buf.put_u8(b'\n');
        }
        if !self.body.is_empty() && self.content_length().is_none() {
            buf.put_slice(headers::CONTENT_LENGTH.as_bytes());
            buf.put_u8(b':');
            buf.put_slice(self.body.len().to_string().as_bytes());
            buf.put_u8(b'\n');
        }
        buf.put_u8(b'\n');
        buf.put_slice(&self.body);
        buf.put_u8(0);
        buf.freeze()
    }
}

fn put_escaped(buf: &mut BytesMut, raw: &str) {
    for b in raw.bytes() {
        match b {
            b'\r' => buf.put_slice(b"\\r"),
            b'\n' => buf.put_slice(b"\\n"),
            b':' => buf.put_slice(b"\\c"),
            b'\\' => buf.put_slice(b"\\\\"),
            other => buf.put_u8(other),
        }
    }
}

/// Undo STOMP 1.2 header escaping. Truncated or undefined escape sequences
/// are fatal per the protocol.
pub(crate) fn unescape_header(raw: &str) -> anyhow::Result<String> {
    if !raw.contains('\\') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            Some('\\') => out.push('\\'),
            other => anyhow::bail!("undefined header escape sequence: \\{:?}", other),
        }
    }
    Ok(out)
}
