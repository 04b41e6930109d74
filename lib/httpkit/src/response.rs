// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An incremental HTTP/1.x response parser.
//!
//! Sized for the responses the upload paths actually receive: a status
//! line, a handful of headers of which only `Content-Length` matters, and
//! a small body (an acknowledgment or a release URL). Bytes are fed in as
//! they arrive from the socket; the parser keeps one line of state and
//! buffers the body up to a fixed cap, eating any excess so arbitrarily
//! large responses still parse to completion.

/// Line and body buffer size. Headers longer than this are truncated
/// (tolerated); a body is kept only up to this bound.
const LINE_BUF_LEN: usize = 256;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParseError {
    /// The status line was not `HTTP/1.x <3-digit-code> ...`.
    StatusLine,
    /// A header line failed to parse (only Content-Length is examined).
    Header,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum Phase {
    StatusLine,
    Headers,
    Body,
}

pub struct ResponseParser {
    phase: Phase,
    line: [u8; LINE_BUF_LEN],
    line_len: usize,
    status_code: u16,
    content_length: usize,
    content_received: usize,
    body_len: usize,
    error: Option<ParseError>,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            phase: Phase::StatusLine,
            line: [0; LINE_BUF_LEN],
            line_len: 0,
            status_code: 0,
            content_length: 0,
            content_received: 0,
            body_len: 0,
            error: None,
        }
    }

    /// Feeds received bytes. Returns true once the response is complete
    /// (or failed); check [`error`](Self::error) afterwards.
    pub fn feed(&mut self, data: &[u8]) -> bool {
        for &c in data {
            if self.feed_byte(c) {
                return true;
            }
        }
        false
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// The buffered body prefix (up to the internal cap).
    pub fn body(&self) -> &[u8] {
        &self.line[..self.body_len]
    }

    pub fn error(&self) -> Option<ParseError> {
        self.error
    }

    fn feed_byte(&mut self, c: u8) -> bool {
        if self.phase == Phase::Body {
            self.content_received += 1;
            if self.body_len < self.line.len() {
                self.line[self.body_len] = c;
                self.body_len += 1;
            }
            return self.content_received == self.content_length;
        }

        if self.line_len < self.line.len() {
            self.line[self.line_len] = c;
            self.line_len += 1;
        } else {
            // Over-long header: shift left so the terminating CR/LF still
            // lands in the buffer. The truncated name can't match the one
            // header we care about, which is short.
            self.line.copy_within(1.., 0);
            self.line[LINE_BUF_LEN - 1] = c;
        }

        if self.line_len < 2 {
            return false;
        }
        let len = self.line_len - 2;
        if &self.line[len..self.line_len] != b"\r\n" {
            return false;
        }
        self.line_len = 0;

        match self.phase {
            Phase::StatusLine => {
                match parse_status_line(&self.line[..len]) {
                    Some(code) => {
                        self.status_code = code;
                        self.phase = Phase::Headers;
                    }
                    None => {
                        self.error = Some(ParseError::StatusLine);
                        return true;
                    }
                }
                false
            }
            Phase::Headers => {
                if len == 0 {
                    // End of headers.
                    if self.content_length == 0 {
                        return true; // no body to read
                    }
                    self.phase = Phase::Body;
                    return false;
                }
                match parse_header(&self.line[..len]) {
                    Ok(Some(content_length)) => {
                        self.content_length = content_length;
                    }
                    Ok(None) => {}
                    Err(()) => {
                        self.error = Some(ParseError::Header);
                        return true;
                    }
                }
                false
            }
            Phase::Body => unreachable!(),
        }
    }
}

fn skip_spaces(line: &[u8]) -> &[u8] {
    let n = line.iter().take_while(|&&c| c == b' ').count();
    &line[n..]
}

/// Parses leading decimal digits; returns (value, digits consumed).
fn parse_decimal(line: &[u8]) -> Option<(usize, usize)> {
    let mut value: usize = 0;
    let mut digits = 0;
    for &c in line {
        if c == b' ' {
            break;
        }
        if !c.is_ascii_digit() {
            return None;
        }
        value = value
            .checked_mul(10)?
            .checked_add(usize::from(c - b'0'))?;
        digits += 1;
    }
    Some((value, digits))
}

fn parse_status_line(line: &[u8]) -> Option<u16> {
    let rest = line.strip_prefix(b"HTTP/1.")?;
    let (minor, rest) = rest.split_first()?;
    if !minor.is_ascii_digit() {
        return None;
    }

    let trimmed = skip_spaces(rest);
    if trimmed.len() == rest.len() {
        return None; // at least one space is required
    }

    // The status code is exactly three digits; the reason phrase after it
    // doesn't matter.
    if trimmed.len() < 3 {
        return None;
    }
    let (code, digits) = parse_decimal(&trimmed[..3])?;
    if digits != 3 {
        return None;
    }
    Some(code as u16)
}

/// Returns the Content-Length value if this is that header; the only one
/// the upload paths care about.
fn parse_header(line: &[u8]) -> Result<Option<usize>, ()> {
    const NAME: &[u8] = b"content-length";
    if line.len() < NAME.len()
        || !line[..NAME.len()].eq_ignore_ascii_case(NAME)
    {
        return Ok(None);
    }

    let rest = skip_spaces(&line[NAME.len()..]);
    let Some(rest) = rest.strip_prefix(b":") else {
        return Err(());
    };
    let rest = skip_spaces(rest);
    match parse_decimal(rest) {
        Some((value, digits)) if digits > 0 => Ok(Some(value)),
        _ => Err(()),
    }
}
