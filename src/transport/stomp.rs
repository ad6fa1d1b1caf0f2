//! Minimal STOMP 1.2 framing for the push channel.
//!
//! Frames travel as WebSocket text messages. A bare end-of-line outside a
//! frame is a heartbeat.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StompError {
    #[error("unknown STOMP command {0:?}")]
    UnknownCommand(String),
    #[error("malformed header line {0:?}")]
    MalformedHeader(String),
    #[error("frame is truncated")]
    Truncated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Message,
    Receipt,
    Error,
    Disconnect,
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
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
        }
    }

    /// CONNECT and CONNECTED headers are sent raw.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl FromStr for Command {
    type Err = StompError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CONNECT" | "STOMP" => Command::Connect,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            "DISCONNECT" => Command::Disconnect,
            other => return Err(StompError::UnknownCommand(other.to_string())),
        })
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
        Self { command, headers: Vec::new(), body: String::new() }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value for `key`; repeated headers after the first are ignored.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn connect(host: &str, heartbeat: (u64, u64), bearer: Option<&str>) -> Self {
        let mut frame = Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", format!("{},{}", heartbeat.0, heartbeat.1));
        if let Some(token) = bearer {
            frame = frame.header("Authorization", format!("Bearer {token}"));
        }
        frame
    }

    pub fn subscribe(id: u64, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", id.to_string())
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: u64) -> Self {
        Frame::new(Command::Unsubscribe).header("id", id.to_string())
    }

    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }

    /// Server-provided reason of an ERROR frame.
    pub fn error_message(&self) -> String {
        match self.get("message") {
            Some(m) if !m.is_empty() => m.to_string(),
            _ if !self.body.trim().is_empty() => self.body.trim().to_string(),
            _ => "broker reported an error".into(),
        }
    }

    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        let escape = self.command.escapes_headers();
        for (k, v) in &self.headers {
            if escape {
                out.push_str(&escape_header(k));
                out.push(':');
                out.push_str(&escape_header(v));
            } else {
                out.push_str(k);
                out.push(':');
                out.push_str(v);
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
}

/// Something read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Heartbeat,
    Frame(Frame),
}

/// Decode every frame and heartbeat in one WebSocket text message.
pub fn decode(input: &str) -> Result<Vec<Incoming>, StompError> {
    let mut out = Vec::new();
    let mut rest = input;
    while !rest.is_empty() {
        if let Some(r) = rest.strip_prefix("\r\n").or_else(|| rest.strip_prefix('\n')) {
            out.push(Incoming::Heartbeat);
            rest = r;
            continue;
        }
        let (frame, r) = decode_frame(rest)?;
        out.push(Incoming::Frame(frame));
        rest = r;
    }
    Ok(out)
}

fn decode_frame(input: &str) -> Result<(Frame, &str), StompError> {
    let (command_line, mut rest) = next_line(input).ok_or(StompError::Truncated)?;
    let command: Command = command_line.parse()?;

    let mut headers = Vec::new();
    loop {
        let (line, r) = next_line(rest).ok_or(StompError::Truncated)?;
        rest = r;
        if line.is_empty() {
            break;
        }
        let (k, v) = line
            .split_once(':')
            .ok_or_else(|| StompError::MalformedHeader(line.to_string()))?;
        if command.escapes_headers() {
            headers.push((unescape_header(k)?, unescape_header(v)?));
        } else {
            headers.push((k.to_string(), v.to_string()));
        }
    }

    let declared = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .and_then(|(_, v)| v.trim().parse::<usize>().ok());
    let body_len = match declared {
        Some(n) => n,
        None => rest.find('\0').ok_or(StompError::Truncated)?,
    };
    let body = rest.get(..body_len).ok_or(StompError::Truncated)?;
    let after = rest
        .get(body_len..)
        .and_then(|r| r.strip_prefix('\0'))
        .ok_or(StompError::Truncated)?;

    Ok((Frame { command, headers, body: body.to_string() }, after))
}

fn next_line(s: &str) -> Option<(&str, &str)> {
    let idx = s.find('\n')?;
    let line = &s[..idx];
    Some((line.strip_suffix('\r').unwrap_or(line), &s[idx + 1..]))
}

fn escape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(s: &str) -> Result<String, StompError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
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
            _ => return Err(StompError::MalformedHeader(s.to_string())),
        }
    }
    Ok(out)
}

// ─── HEARTBEAT ──────────────────────────────────────────────────

/// Negotiated heartbeat periods. `None` means that direction is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Heartbeat {
    pub outgoing: Option<Duration>,
    pub incoming: Option<Duration>,
}

/// Parse a `heart-beat:cx,cy` value.
pub fn parse_heartbeat(value: &str) -> Option<(u64, u64)> {
    let (a, b) = value.split_once(',')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

/// Combine what the client offered with what the server answered.
///
/// Each direction runs at the slower of the two requested rates, and is off
/// if either side asked for 0.
pub fn negotiate(client: (u64, u64), server: Option<(u64, u64)>) -> Heartbeat {
    let (cx, cy) = client;
    let (sx, sy) = server.unwrap_or((0, 0));
    let pick = |mine: u64, theirs: u64| {
        if mine == 0 || theirs == 0 {
            None
        } else {
            Some(Duration::from_millis(mine.max(theirs)))
        }
    };
    Heartbeat { outgoing: pick(cx, sy), incoming: pick(cy, sx) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_connect() {
        let f = Frame::connect("localhost", (4000, 4000), Some("tok"));
        let text = f.encode();
        assert!(text.starts_with("CONNECT\naccept-version:1.2\nhost:localhost\nheart-beat:4000,4000\n"));
        assert!(text.contains("Authorization:Bearer tok\n"));
        assert!(text.ends_with("\n\n\0"));
    }

    #[test]
    fn test_decode_message_with_content_length() {
        let body = r#"{"cpu":{"system":1}}"#;
        let raw = format!(
            "MESSAGE\nsubscription:3\ndestination:/topic/metrics\ncontent-length:{}\n\n{}\0",
            body.len(),
            body
        );
        let items = decode(&raw).unwrap();
        assert_eq!(items.len(), 1);
        let Incoming::Frame(f) = &items[0] else { panic!("expected a frame") };
        assert_eq!(f.command, Command::Message);
        assert_eq!(f.get("subscription"), Some("3"));
        assert_eq!(f.body, body);
    }

    #[test]
    fn test_decode_body_with_nul_when_length_declared() {
        let raw = "MESSAGE\ncontent-length:3\n\na\0b\0";
        let items = decode(raw).unwrap();
        let Incoming::Frame(f) = &items[0] else { panic!("expected a frame") };
        assert_eq!(f.body, "a\0b");
    }

    #[test]
    fn test_decode_heartbeats_and_crlf() {
        let raw = "\n\r\nCONNECTED\r\nversion:1.2\r\nheart-beat:0,5000\r\n\r\n\0\n";
        let items = decode(raw).unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(items[0], Incoming::Heartbeat);
        assert_eq!(items[1], Incoming::Heartbeat);
        let Incoming::Frame(f) = &items[2] else { panic!("expected a frame") };
        assert_eq!(f.command, Command::Connected);
        assert_eq!(f.get("heart-beat"), Some("0,5000"));
        assert_eq!(items[3], Incoming::Heartbeat);
    }

    #[test]
    fn test_header_escaping() {
        let f = Frame::new(Command::Send).header("destination", "/a:b\nc\\d");
        let text = f.encode();
        assert!(text.contains("destination:/a\\cb\\nc\\\\d\n"));
        let Incoming::Frame(back) = decode(&text.replace("SEND", "MESSAGE")).unwrap().remove(0) else {
            panic!("expected a frame")
        };
        assert_eq!(back.get("destination"), Some("/a:b\nc\\d"));
    }

    #[test]
    fn test_first_header_wins() {
        let raw = "MESSAGE\nfoo:1\nfoo:2\n\n\0";
        let Incoming::Frame(f) = decode(raw).unwrap().remove(0) else { panic!("expected a frame") };
        assert_eq!(f.get("foo"), Some("1"));
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(decode("BOGUS\n\n\0"), Err(StompError::UnknownCommand("BOGUS".into())));
        assert_eq!(decode("MESSAGE\nnocolon\n\n\0"), Err(StompError::MalformedHeader("nocolon".into())));
        assert_eq!(decode("MESSAGE\n\nbody without end"), Err(StompError::Truncated));
        assert_eq!(decode("MESSAGE\nbad:\\x\n\n\0"), Err(StompError::MalformedHeader("\\x".into())));
    }

    #[test]
    fn test_error_message_fallbacks() {
        let f = Frame::new(Command::Error).header("message", "bad token");
        assert_eq!(f.error_message(), "bad token");
        let f = Frame::new(Command::Error).body(" details ");
        assert_eq!(f.error_message(), "details");
    }

    #[test]
    fn test_negotiate() {
        let hb = negotiate((4000, 4000), Some((10000, 1000)));
        assert_eq!(hb.outgoing, Some(Duration::from_millis(4000)));
        assert_eq!(hb.incoming, Some(Duration::from_millis(10000)));

        let hb = negotiate((4000, 4000), Some((0, 0)));
        assert_eq!(hb, Heartbeat::default());

        let hb = negotiate((0, 4000), None);
        assert_eq!(hb, Heartbeat::default());
    }

    #[test]
    fn test_parse_heartbeat() {
        assert_eq!(parse_heartbeat("0, 5000"), Some((0, 5000)));
        assert_eq!(parse_heartbeat("x,1"), None);
        assert_eq!(parse_heartbeat("100"), None);
    }
}
