// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A minimal HTTP/1 response parser, standing in for the consumed
//! "HTTP/1 response parser" collaborator (spec §6), just complete enough to
//! decode a FastCGI application's `STDOUT` bytes for the "Simple GET"
//! scenario (§8) and the crate's round-trip tests.
//!
//! CGI-style responses may omit the `HTTP/x.y` prefix on the status line
//! (`200 OK\r\n...` rather than `HTTP/1.1 200 OK\r\n...`); both forms parse.

use bytes::{Bytes, BytesMut};

/// Parser state, matching the consumed interface's documented machine
/// (`START → FIRST → HEADERS → LAST_LF → DATA | CHUNK_* → TRAILERS → DONE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No bytes consumed yet.
    Start,
    /// Accumulating the status line.
    First,
    /// Accumulating header fields.
    Headers,
    /// Consumed the blank line ending headers.
    LastLf,
    /// Reading a body of known (or absent) length.
    Data,
    /// Reading a chunk-size line.
    ChunkSize,
    /// Reading chunk payload bytes.
    ChunkData,
    /// Reading the CRLF after a chunk's payload.
    ChunkCrlf,
    /// Reading trailers after the terminal chunk.
    Trailers,
    /// The response is fully parsed.
    Done,
}

/// Failure parsing a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Http1Error {
    /// The status line was not `<code> <reason>` or `HTTP/x.y <code> <reason>`.
    #[error("malformed status line")]
    MalformedStatusLine,
    /// A header line had no `:` separator.
    #[error("malformed header line")]
    MalformedHeader,
    /// A chunk-size line was not valid hex.
    #[error("malformed chunk size")]
    MalformedChunkSize,
}

/// Parsed response headers plus parser flags, produced once `state` reaches
/// [`State::Data`] or [`State::Done`] for a headers-only check.
#[derive(Debug, Clone, Default)]
pub struct Flags {
    /// Status line declared `HTTP/1.1` (vs `1.0`, or was absent/CGI-style).
    pub version_11: bool,
    /// `Transfer-Encoding: chunked` was present.
    pub chunked: bool,
    /// `Content-Length` was present and parsed.
    pub content_length_known: bool,
}

/// Incremental HTTP/1 response parser.
#[derive(Debug)]
pub struct Http1Response {
    /// Current machine state.
    pub state: State,
    /// Parsed status code, valid once state passes `FIRST`.
    pub status: u16,
    /// Parsed reason phrase.
    pub reason: String,
    /// Parsed header fields, in order, lowercased names.
    pub headers: Vec<(String, String)>,
    /// Accumulated body bytes.
    pub body: BytesMut,
    /// Accumulated trailer fields.
    pub trailers: Vec<(String, String)>,
    flags: Flags,
    content_length: Option<usize>,
    remaining: usize,
    /// Set for a response to a `HEAD` request: no body follows the headers
    /// even if `Content-Length`/chunked framing says otherwise.
    expect_no_body: bool,
}

impl Default for Http1Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Http1Response {
    /// A fresh parser in `START`.
    pub fn new() -> Self {
        Self {
            state: State::Start,
            status: 0,
            reason: String::new(),
            headers: Vec::new(),
            body: BytesMut::new(),
            trailers: Vec::new(),
            flags: Flags::default(),
            content_length: None,
            remaining: 0,
            expect_no_body: false,
        }
    }

    /// Accumulated flags, valid once headers have been parsed.
    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    /// Marks that no body is expected regardless of `Content-Length`/
    /// `Transfer-Encoding`, for a response to a `HEAD` request.
    pub fn set_expect_no_body(&mut self, expect_no_body: bool) {
        self.expect_no_body = expect_no_body;
    }

    fn take_line<'a>(buf: &'a [u8]) -> Option<(&'a [u8], usize)> {
        let pos = buf.windows(2).position(|w| w == b"\r\n")?;
        Some((&buf[..pos], pos + 2))
    }

    /// Parses the status line and header fields starting at `buf[offset..]`,
    /// stopping at most `max` bytes in. Returns the number of bytes
    /// consumed. May leave `state` at `HEADERS` if the buffer ran out
    /// mid-block; call again with more data appended.
    pub fn parse_headers(&mut self, buf: &[u8], offset: usize, max: usize) -> Result<usize, Http1Error> {
        let window = &buf[offset..(offset + max).min(buf.len())];
        let mut consumed = 0usize;

        if self.state == State::Start {
            self.state = State::First;
        }
        if self.state == State::First {
            let Some((line, n)) = Self::take_line(&window[consumed..]) else {
                return Ok(consumed);
            };
            self.parse_status_line(line)?;
            consumed += n;
            self.state = State::Headers;
        }

        while self.state == State::Headers {
            let Some((line, n)) = Self::take_line(&window[consumed..]) else {
                return Ok(consumed);
            };
            consumed += n;
            if line.is_empty() {
                self.state = State::LastLf;
                break;
            }
            let text = std::str::from_utf8(line).map_err(|_| Http1Error::MalformedHeader)?;
            let (name, value) = text.split_once(':').ok_or(Http1Error::MalformedHeader)?;
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim().to_string();
            if name == "content-length" {
                if let Ok(len) = value.parse::<usize>() {
                    self.content_length = Some(len);
                    self.remaining = len;
                    self.flags.content_length_known = true;
                }
            } else if name == "transfer-encoding" && value.eq_ignore_ascii_case("chunked") {
                self.flags.chunked = true;
            }
            self.headers.push((name, value));
        }

        if self.state == State::LastLf {
            self.state = if self.expect_no_body {
                State::Done
            } else if self.flags.chunked {
                State::ChunkSize
            } else {
                State::Data
            };
        }
        Ok(consumed)
    }

    fn parse_status_line(&mut self, line: &[u8]) -> Result<(), Http1Error> {
        let text = std::str::from_utf8(line).map_err(|_| Http1Error::MalformedStatusLine)?;
        let mut parts = text.splitn(3, ' ');
        let first = parts.next().ok_or(Http1Error::MalformedStatusLine)?;
        if let Some(version) = first.strip_prefix("HTTP/") {
            self.flags.version_11 = version.trim() == "1.1";
            let status = parts.next().ok_or(Http1Error::MalformedStatusLine)?;
            self.status = status.parse().map_err(|_| Http1Error::MalformedStatusLine)?;
            self.reason = parts.next().unwrap_or("").to_string();
        } else {
            // CGI-style: no HTTP/x.y prefix, first token is the status code.
            self.flags.version_11 = true;
            self.status = first.parse().map_err(|_| Http1Error::MalformedStatusLine)?;
            self.reason = parts.next().unwrap_or("").to_string();
        }
        Ok(())
    }

    /// Consumes body bytes from `buf[offset..]` up to `max`, appending to
    /// [`Self::body`]. Returns the number of bytes consumed. Moves to
    /// `TRAILERS`/`DONE` once the declared length (or terminal chunk) is
    /// reached; with no declared length, consumes everything offered and
    /// stays in `DATA` until the caller signals end-of-stream externally
    /// (mirroring FastCGI's empty-STDOUT-terminates framing rather than a
    /// parser-internal EOF).
    pub fn parse_data(&mut self, buf: &[u8], offset: usize, max: usize) -> Result<usize, Http1Error> {
        let window = &buf[offset..(offset + max).min(buf.len())];
        match self.state {
            State::Data => {
                if self.flags.content_length_known {
                    let n = self.remaining.min(window.len());
                    self.body.extend_from_slice(&window[..n]);
                    self.remaining -= n;
                    if self.remaining == 0 {
                        self.state = State::Done;
                    }
                    Ok(n)
                } else {
                    self.body.extend_from_slice(window);
                    Ok(window.len())
                }
            }
            State::ChunkSize | State::ChunkData | State::ChunkCrlf => self.parse_chunked(window),
            _ => Ok(0),
        }
    }

    fn parse_chunked(&mut self, window: &[u8]) -> Result<usize, Http1Error> {
        let mut consumed = 0usize;
        loop {
            match self.state {
                State::ChunkSize => {
                    let Some((line, n)) = Self::take_line(&window[consumed..]) else { break };
                    let text = std::str::from_utf8(line).map_err(|_| Http1Error::MalformedChunkSize)?;
                    let size_str = text.split(';').next().unwrap_or("");
                    let size = usize::from_str_radix(size_str.trim(), 16)
                        .map_err(|_| Http1Error::MalformedChunkSize)?;
                    consumed += n;
                    self.remaining = size;
                    self.state = if size == 0 { State::Trailers } else { State::ChunkData };
                }
                State::ChunkData => {
                    let available = window.len() - consumed;
                    let take = self.remaining.min(available);
                    self.body.extend_from_slice(&window[consumed..consumed + take]);
                    self.remaining -= take;
                    consumed += take;
                    if self.remaining == 0 {
                        self.state = State::ChunkCrlf;
                    } else {
                        break;
                    }
                }
                State::ChunkCrlf => {
                    if window.len() - consumed < 2 {
                        break;
                    }
                    consumed += 2; // trailing CRLF after chunk data
                    self.state = State::ChunkSize;
                }
                _ => break,
            }
        }
        Ok(consumed)
    }

    /// Parses trailer fields after the terminal chunk, same shape as
    /// [`Self::parse_headers`]'s header loop.
    pub fn parse_trailers(&mut self, buf: &[u8], offset: usize, max: usize) -> Result<usize, Http1Error> {
        let window = &buf[offset..(offset + max).min(buf.len())];
        let mut consumed = 0usize;
        while self.state == State::Trailers {
            let Some((line, n)) = Self::take_line(&window[consumed..]) else { return Ok(consumed) };
            consumed += n;
            if line.is_empty() {
                self.state = State::Done;
                break;
            }
            let text = std::str::from_utf8(line).map_err(|_| Http1Error::MalformedHeader)?;
            let (name, value) = text.split_once(':').ok_or(Http1Error::MalformedHeader)?;
            self.trailers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
        Ok(consumed)
    }

    /// Whether the response has been fully parsed.
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// The accumulated body as an owned, contiguous [`Bytes`].
    pub fn body_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cgi_style_status_line_without_http_prefix() {
        let mut p = Http1Response::new();
        let input = b"200 OK\r\nContent-Length: 3\r\n\r\nabc";
        let n = p.parse_headers(input, 0, input.len()).unwrap();
        assert_eq!(p.status, 200);
        assert_eq!(p.state, State::Data);
        let consumed_data = p.parse_data(input, n, input.len() - n).unwrap();
        assert_eq!(consumed_data, 3);
        assert_eq!(&p.body[..], b"abc");
        assert!(p.is_done());
    }

    #[test]
    fn parses_standard_status_line_with_http_prefix() {
        let mut p = Http1Response::new();
        let input = b"HTTP/1.1 404 Not Found\r\n\r\n";
        p.parse_headers(input, 0, input.len()).unwrap();
        assert_eq!(p.status, 404);
        assert_eq!(p.reason, "Not Found");
        assert!(p.flags().version_11);
    }

    #[test]
    fn chunked_body_decodes_across_chunks() {
        let mut p = Http1Response::new();
        let headers = b"200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        let n = p.parse_headers(headers, 0, headers.len()).unwrap();
        assert_eq!(n, headers.len());
        assert_eq!(p.state, State::ChunkSize);
        let body = b"3\r\nabc\r\n0\r\n\r\n";
        p.parse_data(body, 0, body.len()).unwrap();
        assert_eq!(&p.body[..], b"abc");
    }
}
