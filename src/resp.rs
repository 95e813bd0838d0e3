// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! RESP3 frame codec.
//!
//! The codec is deliberately stateless: [`decode`] tokenizes whatever burst
//! of bytes the socket produced and hands back the unconsumed tail as a
//! remainder, which the caller prepends to the next burst. Reply boundaries
//! are recovered afterwards with [`frame_len`], which walks the token list
//! counting outstanding aggregate children.
//!
//! Only the protocol subset the stream commands actually produce is
//! understood: bulk strings (`$`), arrays (`*`), maps (`%`), integers (`:`),
//! simple strings (`+`), errors (`-`) and nulls (`_`). Anything else in a
//! burst is reported as a frame-integrity error and skipped; one bad frame
//! never poisons the ones behind it.

use crate::entry::{try_decode, StreamEntry};
use crate::error::StreamError;

/// One decoded RESP3 token.
///
/// Aggregates carry their declared child count; the children follow as
/// separate tokens (RESP3 is a flat prefix encoding).
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// `$<len>` bulk string with its payload.
    Bulk(String),
    /// `*<n>` array header; the next `n` frames are its elements.
    Array(usize),
    /// `%<n>` map header; the next `2n` frames are key/value pairs.
    Map(usize),
    /// `:<n>` integer.
    Int(i64),
    /// `+<text>` simple string.
    Simple(String),
    /// `-<text>` error reply. The text includes the error class prefix
    /// (`ERR`, `BUSYGROUP`, `WRONGPASS`, ...).
    Error(String),
    /// `_` null, or a negative-length bulk/aggregate.
    Null,
}

impl Token {
    /// True for error replies whose class is `ERR`.
    ///
    /// Only `-ERR` frames are surfaced as protocol errors; other classes
    /// (`BUSYGROUP` in particular) are tolerated by the callers that expect
    /// them.
    pub fn is_err_class(&self) -> bool {
        matches!(self, Token::Error(msg) if msg.starts_with("ERR"))
    }
}

/// Result of decoding one burst of bytes.
#[derive(Debug, Default)]
pub struct Decoded {
    /// Complete tokens, in wire order.
    pub tokens: Vec<Token>,
    /// Trailing bytes that did not form a complete token. Prepend to the
    /// next burst.
    pub remainder: Vec<u8>,
    /// Frame-integrity errors encountered mid-burst. The offending tokens
    /// were dropped; `tokens` holds everything that survived.
    pub errors: Vec<StreamError>,
}

fn find_crlf(input: &[u8]) -> Option<usize> {
    input.windows(2).position(|w| w == b"\r\n")
}

fn parse_int(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Tokenize a burst of RESP3 bytes.
///
/// Incomplete trailing data (a line without its CRLF, or a bulk header whose
/// payload has not fully arrived) is returned untouched in
/// [`Decoded::remainder`].
///
/// Bulk payloads are delimited by the next CRLF, not read as raw byte
/// ranges: a payload with an embedded CRLF fails the declared-length check
/// and is dropped as a frame-integrity error, with decoding resuming on the
/// following line.
pub fn decode(input: &[u8]) -> Decoded {
    let mut out = Decoded::default();
    let mut pos = 0;

    while pos < input.len() {
        let Some(line_end) = find_crlf(&input[pos..]) else {
            out.remainder = input[pos..].to_vec();
            break;
        };
        let line = &input[pos..pos + line_end];
        let after = pos + line_end + 2;

        if line.is_empty() {
            // Stray CRLF between frames; nothing to keep.
            pos = after;
            continue;
        }

        match line[0] {
            b'$' => {
                let Some(len) = parse_int(&line[1..]) else {
                    out.errors.push(StreamError::frame(format!(
                        "unparseable bulk length in {:?}",
                        String::from_utf8_lossy(line)
                    )));
                    pos = after;
                    continue;
                };
                if len < 0 {
                    out.tokens.push(Token::Null);
                    pos = after;
                    continue;
                }
                // Payload is the next CRLF-delimited line; its byte length
                // must match the declared length exactly.
                let Some(payload_end) = find_crlf(&input[after..]) else {
                    out.remainder = input[pos..].to_vec();
                    return out;
                };
                let payload = &input[after..after + payload_end];
                if payload.len() as i64 == len {
                    out.tokens
                        .push(Token::Bulk(String::from_utf8_lossy(payload).into_owned()));
                } else {
                    out.errors.push(StreamError::frame(format!(
                        "wrong length of string {:?}, expected {}",
                        String::from_utf8_lossy(payload),
                        len
                    )));
                }
                pos = after + payload_end + 2;
            }
            b'*' | b'%' => {
                let kind = line[0];
                match parse_int(&line[1..]) {
                    Some(n) if n >= 0 => out.tokens.push(if kind == b'*' {
                        Token::Array(n as usize)
                    } else {
                        Token::Map(n as usize)
                    }),
                    Some(_) => out.tokens.push(Token::Null),
                    None => out.errors.push(StreamError::frame(format!(
                        "unparseable aggregate count in {:?}",
                        String::from_utf8_lossy(line)
                    ))),
                }
                pos = after;
            }
            b':' => {
                match parse_int(&line[1..]) {
                    Some(n) => out.tokens.push(Token::Int(n)),
                    None => out.errors.push(StreamError::frame(format!(
                        "unparseable integer in {:?}",
                        String::from_utf8_lossy(line)
                    ))),
                }
                pos = after;
            }
            b'+' => {
                out.tokens
                    .push(Token::Simple(String::from_utf8_lossy(&line[1..]).into_owned()));
                pos = after;
            }
            b'-' => {
                out.tokens
                    .push(Token::Error(String::from_utf8_lossy(&line[1..]).into_owned()));
                pos = after;
            }
            b'_' => {
                out.tokens.push(Token::Null);
                pos = after;
            }
            other => {
                out.errors.push(StreamError::frame(format!(
                    "unknown frame prefix {:?}",
                    other as char
                )));
                pos = after;
            }
        }
    }

    out
}

/// Number of tokens forming the first complete reply, if one is present.
///
/// Walks the list keeping a count of outstanding frames: each aggregate
/// header retires itself and enlists its children (`2n` for maps).
pub fn frame_len(tokens: &[Token]) -> Option<usize> {
    let mut pending: usize = 1;
    for (i, token) in tokens.iter().enumerate() {
        pending -= 1;
        match token {
            // Declared counts come off the wire; saturate rather than trust.
            Token::Array(n) => pending = pending.saturating_add(*n),
            Token::Map(n) => pending = pending.saturating_add(n.saturating_mul(2)),
            _ => {}
        }
        if pending == 0 {
            return Some(i + 1);
        }
    }
    None
}

/// Encode a command as an array of bulk strings.
///
/// Lengths are byte lengths, not character counts.
pub fn encode_command(parts: &[&str]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + parts.iter().map(|p| p.len() + 16).sum::<usize>());
    buf.extend_from_slice(format!("*{}\r\n", parts.len()).as_bytes());
    for part in parts {
        buf.extend_from_slice(format!("${}\r\n", part.len()).as_bytes());
        buf.extend_from_slice(part.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf
}

/// Extract the single entry from a `COUNT 1` consumer-group read reply.
///
/// The reply shape is fixed:
///
/// ```text
/// %1  $<stream>  *1  *2  $<id>  *<2f>  $f1 $v1 ... $ff $vf
/// ```
///
/// Every structural marker is validated against that shape; any mismatch
/// (including a different stream name) yields `None` and the frame is
/// ignored rather than delivered malformed.
pub fn parse_read_reply(tokens: &[Token], stream: &str) -> Option<StreamEntry> {
    let mut it = tokens.iter();
    if !matches!(it.next()?, Token::Map(1)) {
        return None;
    }
    match it.next()? {
        Token::Bulk(name) if name == stream => {}
        _ => return None,
    }
    if !matches!(it.next()?, Token::Array(1)) {
        return None;
    }
    if !matches!(it.next()?, Token::Array(2)) {
        return None;
    }
    let id = match it.next()? {
        Token::Bulk(id) => id.clone(),
        _ => return None,
    };
    let pair_count = match it.next()? {
        Token::Array(n) if n % 2 == 0 => *n / 2,
        _ => return None,
    };
    let mut fields = Vec::with_capacity(pair_count);
    for _ in 0..pair_count {
        let name = match it.next()? {
            Token::Bulk(s) => s.clone(),
            _ => return None,
        };
        let value = match it.next()? {
            Token::Bulk(s) => try_decode(s),
            Token::Null => serde_json::Value::Null,
            _ => return None,
        };
        fields.push((name, value));
    }
    Some(StreamEntry { id, fields })
}
