//! STOMP Frame Codec
//!
//! The live feed speaks STOMP 1.2 over WebSocket text messages, which is what
//! the backend's message broker exposes at `/ws`.
//!
//! ## Frame Structure
//!
//! ```text
//! COMMAND
//! header1:value1
//! header2:value2
//!
//! body^@
//! ```
//!
//! - The frame ends with a NUL octet (`^@`).
//! - Header values are escaped (`\\`, `\n`, `\r`, `\c`) except on
//!   CONNECT and CONNECTED frames.
//! - When `content-length` is present the body is read by length, so it may
//!   contain NUL octets.
//! - A bare end-of-line between frames is a heart-beat.
//!
//! ## References
//! - [STOMP 1.2 Specification](https://stomp.github.io/stomp-specification-1.2.html)

use crate::{ProtocolError, Result};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// STOMP protocol versions we offer during the handshake
pub const ACCEPT_VERSION: &str = "1.2,1.1";

/// STOMP frame commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    /// CONNECT and CONNECTED headers are sent without escaping
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CONNECT" => Ok(Command::Connect),
            "STOMP" => Ok(Command::Stomp),
            "CONNECTED" => Ok(Command::Connected),
            "SEND" => Ok(Command::Send),
            "SUBSCRIBE" => Ok(Command::Subscribe),
            "UNSUBSCRIBE" => Ok(Command::Unsubscribe),
            "DISCONNECT" => Ok(Command::Disconnect),
            "MESSAGE" => Ok(Command::Message),
            "RECEIPT" => Ok(Command::Receipt),
            "ERROR" => Ok(Command::Error),
            other => Err(ProtocolError::InvalidFrame(format!(
                "Unknown command: {}",
                other
            ))),
        }
    }
}

/// A STOMP frame
///
/// # Examples
///
/// ```
/// use sikboo_chat_protocol::stomp::{Command, Frame};
///
/// let frame = Frame::subscribe("sub-0", "/topic/groupbuying/42");
/// let bytes = frame.to_bytes();
/// assert_eq!(bytes.last(), Some(&0u8));
///
/// let parsed = Frame::from_bytes(&bytes).unwrap();
/// assert_eq!(parsed.command, Command::Subscribe);
/// assert_eq!(parsed.destination(), Some("/topic/groupbuying/42"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    /// Headers in wire order; repeated names are allowed and the first wins
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

    /// CONNECT frame opening a STOMP session
    ///
    /// `heartbeat` is `(outgoing_ms, incoming_ms)` as offered by the client.
    pub fn connect(host: &str, heartbeat: (u64, u64)) -> Self {
        Frame::new(Command::Connect)
            .with_header("accept-version", ACCEPT_VERSION)
            .with_header("host", host)
            .with_header("heart-beat", format!("{},{}", heartbeat.0, heartbeat.1))
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .with_header("id", id)
            .with_header("destination", destination)
            .with_header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).with_header("id", id)
    }

    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }

    /// SEND frame carrying a JSON body
    pub fn send_json<T: Serialize + ?Sized>(destination: &str, payload: &T) -> Result<Self> {
        let body = serde_json::to_string(payload)?;
        Ok(Frame::new(Command::Send)
            .with_header("destination", destination)
            .with_header("content-type", "application/json")
            .with_header("content-length", body.len().to_string())
            .with_body(body))
    }

    /// Builder pattern: append a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Builder pattern: set the body
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Look up a header; the first occurrence wins
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn is_command(&self, command: Command) -> bool {
        self.command == command
    }

    pub fn destination(&self) -> Option<&str> {
        self.header("destination")
    }

    pub fn subscription(&self) -> Option<&str> {
        self.header("subscription")
    }

    /// Parse the `heart-beat` header into `(cx, cy)` milliseconds
    pub fn heart_beat(&self) -> Option<(u64, u64)> {
        let (cx, cy) = self.header("heart-beat")?.split_once(',')?;
        Some((cx.trim().parse().ok()?, cy.trim().parse().ok()?))
    }

    /// Deserialize the body as JSON
    pub fn json_body<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }

    /// Serialize the frame, NUL terminated
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 64);
        out.extend_from_slice(self.command.as_str().as_bytes());
        out.push(b'\n');

        let escape = self.command.escapes_headers();
        for (name, value) in &self.headers {
            if escape {
                out.extend_from_slice(escape_header(name).as_bytes());
                out.push(b':');
                out.extend_from_slice(escape_header(value).as_bytes());
            } else {
                out.extend_from_slice(name.as_bytes());
                out.push(b':');
                out.extend_from_slice(value.as_bytes());
            }
            out.push(b'\n');
        }

        out.push(b'\n');
        out.extend_from_slice(self.body.as_bytes());
        out.push(0);
        out
    }

    /// Serialize the frame as text for a WebSocket text message
    pub fn encode(&self) -> String {
        // Headers and body are UTF-8 and the terminator is NUL, so this never loses data
        String::from_utf8_lossy(&self.to_bytes()).into_owned()
    }

    /// Deserialize one frame from a WebSocket text message
    pub fn decode(text: &str) -> Result<Self> {
        Self::from_bytes(text.as_bytes())
    }

    /// Deserialize exactly one frame
    ///
    /// Leading and trailing heart-beats are ignored.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut frames = Self::decode_all(data)?;
        match frames.len() {
            1 => Ok(frames.remove(0)),
            0 => Err(ProtocolError::InvalidFrame("no frame in input".to_string())),
            n => Err(ProtocolError::InvalidFrame(format!(
                "expected one frame, found {}",
                n
            ))),
        }
    }

    /// Deserialize every frame in a buffer, skipping heart-beats
    pub fn decode_all(data: &[u8]) -> Result<Vec<Self>> {
        let mut frames = Vec::new();
        let mut pos = 0;

        loop {
            pos += skip_heartbeats(&data[pos..]);
            if pos >= data.len() {
                break;
            }
            let (frame, consumed) = parse_frame(&data[pos..])?;
            frames.push(frame);
            pos += consumed;
        }

        Ok(frames)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.destination() {
            Some(destination) => write!(f, "{} {}", self.command, destination),
            None => write!(f, "{}", self.command),
        }
    }
}

fn skip_heartbeats(data: &[u8]) -> usize {
    let mut pos = 0;
    while pos < data.len() {
        match data[pos] {
            b'\n' => pos += 1,
            b'\r' if data.get(pos + 1) == Some(&b'\n') => pos += 2,
            _ => break,
        }
    }
    pos
}

/// Read one line, returning it without the EOL and the offset after it
fn read_line(data: &[u8], start: usize) -> Result<(&[u8], usize)> {
    let end = data[start..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|offset| start + offset)
        .ok_or_else(|| ProtocolError::InvalidFrame("unterminated frame header".to_string()))?;

    let line = data[start..end]
        .strip_suffix(b"\r")
        .unwrap_or(&data[start..end]);
    Ok((line, end + 1))
}

fn utf8(bytes: &[u8], what: &str) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| ProtocolError::InvalidFrame(format!("{} is not valid UTF-8", what)))
}

fn parse_frame(data: &[u8]) -> Result<(Frame, usize)> {
    let (command_line, mut pos) = read_line(data, 0)?;
    let command: Command = utf8(command_line, "command")?.parse()?;
    let unescape = command.escapes_headers();

    let mut headers = Vec::new();
    loop {
        let (line, next) = read_line(data, pos)?;
        pos = next;
        if line.is_empty() {
            break;
        }

        let line = utf8(line, "header")?;
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProtocolError::InvalidFrame(format!("malformed header: {}", line)))?;

        if unescape {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .map(|(_, value)| {
            value.trim().parse::<usize>().map_err(|_| {
                ProtocolError::InvalidFrame(format!("invalid content-length: {}", value))
            })
        })
        .transpose()?;

    let body_end = match content_length {
        Some(len) => match pos.checked_add(len).filter(|end| *end < data.len()) {
            Some(end) if data[end] == 0 => end,
            _ => {
                return Err(ProtocolError::InvalidFrame(
                    "body does not match content-length".to_string(),
                ))
            }
        },
        None => data[pos..]
            .iter()
            .position(|&b| b == 0)
            .map(|offset| pos + offset)
            .ok_or_else(|| ProtocolError::InvalidFrame("missing NUL terminator".to_string()))?,
    };

    let body = utf8(&data[pos..body_end], "body")?;

    Ok((
        Frame {
            command,
            headers,
            body,
        },
        body_end + 1,
    ))
}

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(value: &str) -> Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(ProtocolError::InvalidFrame(format!(
                    "invalid header escape: \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}
