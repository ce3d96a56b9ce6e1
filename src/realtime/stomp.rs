//! STOMP 1.2 framing, as carried in WebSocket text messages.

use std::fmt;

pub const ACCEPT_VERSION: &str = "1.2";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StompError {
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("malformed header line `{0}`")]
    MalformedHeader(String),
    #[error("invalid escape sequence in `{0}`")]
    InvalidEscape(String),
    #[error("invalid content-length `{0}`")]
    InvalidLength(String),
    #[error("frame is not terminated")]
    Unterminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Disconnect => "DISCONNECT",
            Command::Connected => "CONNECTED",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    fn parse(line: &str) -> Result<Self, StompError> {
        Ok(match line {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "DISCONNECT" => Command::Disconnect,
            "CONNECTED" => Command::Connected,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => return Err(StompError::UnknownCommand(other.to_string())),
        })
    }

    /// CONNECT and CONNECTED headers are sent verbatim.
    fn escapes_headers(self) -> bool {
        !matches!(self, Command::Connect | Command::Stomp | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of header `name`. Repeated headers keep the first value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Decode every frame in `input`. Heart-beat EOLs between frames are skipped.
    pub fn decode_all(input: &str) -> Result<Vec<Frame>, StompError> {
        let mut frames = Vec::new();
        let mut rest = input;
        loop {
            rest = rest.trim_start_matches(['\r', '\n']);
            if rest.is_empty() {
                return Ok(frames);
            }
            let (frame, remaining) = decode_one(rest)?;
            frames.push(frame);
            rest = remaining;
        }
    }
}

fn next_line(input: &str) -> Option<(&str, &str)> {
    let end = input.find('\n')?;
    let line = &input[..end];
    Some((line.strip_suffix('\r').unwrap_or(line), &input[end + 1..]))
}

fn decode_one(input: &str) -> Result<(Frame, &str), StompError> {
    let (command_line, mut cursor) = next_line(input).ok_or(StompError::Unterminated)?;
    let command = Command::parse(command_line)?;
    let escaped = command.escapes_headers();

    let mut headers = Vec::new();
    loop {
        let (line, rest) = next_line(cursor).ok_or(StompError::Unterminated)?;
        cursor = rest;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| StompError::MalformedHeader(line.to_string()))?;
        if escaped {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let frame = Frame {
        command,
        headers,
        body: String::new(),
    };

    let (body, rest) = match frame.get("content-length") {
        Some(raw) => {
            let length: usize = raw
                .trim()
                .parse()
                .map_err(|_| StompError::InvalidLength(raw.to_string()))?;
            let body = cursor.get(..length).ok_or(StompError::Unterminated)?;
            let rest = cursor[length..]
                .strip_prefix('\0')
                .ok_or(StompError::Unterminated)?;
            (body, rest)
        }
        None => {
            let end = cursor.find('\0').ok_or(StompError::Unterminated)?;
            (&cursor[..end], &cursor[end + 1..])
        }
    };

    Ok((frame.body(body), rest))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, StompError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(StompError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}

// --- Outbound frames ---

pub fn connect(host: &str, access_token: &str) -> Frame {
    Frame::new(Command::Connect)
        .header("accept-version", ACCEPT_VERSION)
        .header("host", host)
        .header("heart-beat", "0,0")
        .header("Authorization", format!("Bearer {access_token}"))
}

pub fn subscribe(id: &str, destination: &str) -> Frame {
    Frame::new(Command::Subscribe)
        .header("id", id)
        .header("destination", destination)
        .header("ack", "auto")
}

pub fn unsubscribe(id: &str) -> Frame {
    Frame::new(Command::Unsubscribe).header("id", id)
}

pub fn disconnect() -> Frame {
    Frame::new(Command::Disconnect)
}
