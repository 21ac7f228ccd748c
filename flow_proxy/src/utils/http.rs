//! Incremental HTTP/1.x message framing for the proxy legs.
//!
//! Heads are collected by [`HeadReader`] and parsed with `httparse`; bodies are
//! never parsed, only delimited, so [`RequestStream`] can hand every request
//! head on a connection to a rewrite hook and pass everything else through.

use crate::{Error, Result};

use bytes::BytesMut;

/// Largest request or response head accepted.
pub const MAX_HEAD_SIZE: usize = 8192;
const MAX_HEADERS: usize = 64;

/// Collects bytes until a complete head (terminated by an empty line) is present.
#[derive(Default)]
pub struct HeadReader {
    buf: BytesMut,
    scanned: usize,
}

impl HeadReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the head, terminator included, once it is complete. Bytes after it
    /// stay buffered, see [`HeadReader::take_rest`].
    pub fn feed(&mut self, input: &[u8]) -> Result<Option<BytesMut>> {
        self.buf.extend_from_slice(input);

        let start = self.scanned.saturating_sub(3);
        match self.buf[start..].windows(4).position(|w| w == b"\r\n\r\n") {
            Some(pos) => {
                let end = start + pos + 4;
                if end > MAX_HEAD_SIZE {
                    return Err(Error::HeaderTooLong);
                }
                self.scanned = 0;
                Ok(Some(self.buf.split_to(end)))
            }
            None if self.buf.len() > MAX_HEAD_SIZE => Err(Error::HeaderTooLong),
            None => {
                self.scanned = self.buf.len();
                Ok(None)
            }
        }
    }

    pub fn take_rest(&mut self) -> BytesMut {
        self.scanned = 0;
        self.buf.split()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    /// Minor version of HTTP/1.x.
    pub version: u8,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl RequestHead {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(bytes) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) | Err(_) => return Err(Error::InvalidRequest),
        }

        Ok(Self {
            method: request.method.ok_or(Error::InvalidRequest)?.to_string(),
            target: request.path.ok_or(Error::InvalidRequest)?.to_string(),
            version: request.version.ok_or(Error::InvalidRequest)?,
            headers: request
                .headers
                .iter()
                .map(|h| (h.name.to_string(), h.value.to_vec()))
                .collect(),
        })
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.header(name)
            .and_then(|v| std::str::from_utf8(v).ok())
            .map(str::trim)
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Renames `from` to `to`, replacing any existing `to`.
    pub fn rename_header(&mut self, from: &str, to: &str) {
        if self.header(from).is_none() {
            return;
        }
        self.remove_header(to);
        for (name, _) in self.headers.iter_mut() {
            if name.eq_ignore_ascii_case(from) {
                *name = to.to_string();
            }
        }
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<Vec<u8>>) {
        self.remove_header(name);
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(
            format!("{} {} HTTP/1.{}\r\n", self.method, self.target, self.version).as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    fn has_token(&self, name: &str, token: &str) -> bool {
        self.header_str(name).is_some_and(|v| {
            v.split(',')
                .any(|t| t.trim().eq_ignore_ascii_case(token))
        })
    }

    fn framing(&self) -> Framing {
        if self.is_connect() || self.has_token("connection", "upgrade") {
            Framing::Tunnel
        } else if self.has_token("transfer-encoding", "chunked") {
            Framing::Chunked
        } else {
            match self
                .header_str("content-length")
                .and_then(|v| v.parse::<u64>().ok())
            {
                Some(len) if len > 0 => Framing::Length(len),
                _ => Framing::None,
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: u8,
    pub code: u16,
    pub reason: String,
}

impl ResponseHead {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(bytes) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) | Err(_) => return Err(Error::InvalidResponse),
        }

        Ok(Self {
            version: response.version.ok_or(Error::InvalidResponse)?,
            code: response.code.ok_or(Error::InvalidResponse)?,
            reason: response.reason.unwrap_or_default().to_string(),
        })
    }
}

enum Framing {
    None,
    Length(u64),
    Chunked,
    Tunnel,
}

enum Chunk {
    Size(Vec<u8>),
    Data(u64),
    DataEnd(Vec<u8>),
    Trailer(Vec<u8>),
}

enum State {
    Head(HeadReader),
    Body(u64),
    Chunked(Chunk),
    Tunnel,
}

/// Splits a client's byte stream into requests, rewriting each head on the way.
pub struct RequestStream {
    state: State,
}

impl Default for RequestStream {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestStream {
    pub fn new() -> Self {
        Self {
            state: State::Head(HeadReader::new()),
        }
    }

    /// Continues after `head`, whose bytes were consumed elsewhere.
    pub fn after_head(head: &RequestHead) -> Self {
        let mut stream = Self::new();
        stream.begin_body(head);
        stream
    }

    pub fn is_tunnel(&self) -> bool {
        matches!(self.state, State::Tunnel)
    }

    fn begin_body(&mut self, head: &RequestHead) {
        self.state = match head.framing() {
            Framing::None => State::Head(HeadReader::new()),
            Framing::Length(len) => State::Body(len),
            Framing::Chunked => State::Chunked(Chunk::Size(Vec::new())),
            Framing::Tunnel => State::Tunnel,
        };
    }

    /// Feeds client bytes and returns what should be sent upstream.
    pub fn feed<F>(&mut self, input: &[u8], mut on_head: F) -> Result<Vec<u8>>
    where
        F: FnMut(&mut RequestHead) -> Result<()>,
    {
        let mut out = Vec::with_capacity(input.len() + 64);
        let mut input = BytesMut::from(input);

        while !input.is_empty() {
            match &mut self.state {
                State::Head(reader) => {
                    let Some(raw) = reader.feed(&input)? else {
                        break;
                    };
                    input = reader.take_rest();
                    let mut head = RequestHead::parse(&raw)?;
                    on_head(&mut head)?;
                    out.extend_from_slice(&head.to_bytes());
                    self.begin_body(&head);
                }
                State::Body(remaining) => {
                    let n = (*remaining).min(input.len() as u64) as usize;
                    out.extend_from_slice(&input.split_to(n));
                    *remaining -= n as u64;
                    if *remaining == 0 {
                        self.state = State::Head(HeadReader::new());
                    }
                }
                State::Chunked(chunk) => {
                    let done = feed_chunked(chunk, &mut input, &mut out)?;
                    if done {
                        self.state = State::Head(HeadReader::new());
                    }
                }
                State::Tunnel => {
                    out.extend_from_slice(&input);
                    input.clear();
                }
            }
        }
        Ok(out)
    }
}

/// Takes one line (terminated by `\n`) into `line`. Returns whether it completed.
fn take_line(line: &mut Vec<u8>, input: &mut BytesMut, out: &mut Vec<u8>) -> Result<bool> {
    let (n, complete) = match input.iter().position(|b| *b == b'\n') {
        Some(pos) => (pos + 1, true),
        None => (input.len(), false),
    };
    let taken = input.split_to(n);
    line.extend_from_slice(&taken);
    out.extend_from_slice(&taken);
    if line.len() > MAX_HEAD_SIZE {
        return Err(Error::HeaderTooLong);
    }
    Ok(complete)
}

/// Advances the chunked body parser. Returns true once the message is complete.
fn feed_chunked(chunk: &mut Chunk, input: &mut BytesMut, out: &mut Vec<u8>) -> Result<bool> {
    while !input.is_empty() {
        match chunk {
            Chunk::Size(line) => {
                if !take_line(line, input, out)? {
                    return Ok(false);
                }
                let text = std::str::from_utf8(line).map_err(|_| Error::InvalidRequest)?;
                let size = text.split(';').next().unwrap_or_default().trim();
                let size = u64::from_str_radix(size, 16).map_err(|_| Error::InvalidRequest)?;
                *chunk = if size == 0 {
                    Chunk::Trailer(Vec::new())
                } else {
                    Chunk::Data(size)
                };
            }
            Chunk::Data(remaining) => {
                let n = (*remaining).min(input.len() as u64) as usize;
                out.extend_from_slice(&input.split_to(n));
                *remaining -= n as u64;
                if *remaining == 0 {
                    *chunk = Chunk::DataEnd(Vec::new());
                }
            }
            Chunk::DataEnd(line) => {
                if !take_line(line, input, out)? {
                    return Ok(false);
                }
                *chunk = Chunk::Size(Vec::new());
            }
            Chunk::Trailer(line) => {
                if !take_line(line, input, out)? {
                    return Ok(false);
                }
                if line.as_slice() == b"\r\n" || line.as_slice() == b"\n" {
                    return Ok(true);
                }
                line.clear();
            }
        }
    }
    Ok(false)
}
