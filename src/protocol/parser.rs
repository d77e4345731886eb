//! Incremental RESP decoder.
//!
//! TCP is a byte stream: a read may deliver half a command or several at
//! once. [`decode`] inspects the front of the connection buffer and either
//! consumes exactly one complete value, reports that more bytes are needed,
//! or fails the connection with a protocol error. Nothing is consumed until
//! a value is complete, so a partial command simply waits for the next
//! read.
//!
//! Plain text lines (what `telnet` or `redis-cli` in inline mode send) are
//! accepted too and decoded as an array of bulk strings.

use crate::protocol::types::RespValue;
use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Hard cap on a single bulk payload (matches the classic 512 MB limit).
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Arrays nested deeper than this are rejected outright.
pub const MAX_DEPTH: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("protocol error: invalid multibulk length")]
    BadArrayLength,

    #[error("protocol error: invalid bulk length")]
    BadBulkLength,

    #[error("protocol error: expected integer, got '{0}'")]
    BadInteger(String),

    #[error("protocol error: non-UTF-8 content in line reply")]
    NonUtf8Line,

    #[error("protocol error: bulk payload not terminated by CRLF")]
    UnterminatedBulk,

    #[error("protocol error: bulk payload of {0} bytes exceeds the limit")]
    BulkTooLarge(usize),

    #[error("protocol error: nesting deeper than {MAX_DEPTH}")]
    TooDeep,
}

/// Try to decode one complete value off the front of `buf`.
///
/// Returns `Ok(None)` when the buffer holds only a prefix of a value; call
/// again after the next read. On success the consumed bytes are removed
/// from `buf`.
pub fn decode(buf: &mut BytesMut) -> Result<Option<RespValue>, ProtoError> {
    let mut reader = Reader { buf: &buf[..], pos: 0 };
    match reader.value(0)? {
        Some(value) => {
            let consumed = reader.pos;
            buf.advance(consumed);
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Cursor over the unconsumed buffer. `pos` only moves forward; the caller
/// consumes `pos` bytes in one step once a whole value parsed.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Next CRLF-terminated line after `pos`, or None if it is not all
    /// buffered yet.
    fn line(&mut self) -> Option<&'a [u8]> {
        let rest = &self.buf[self.pos..];
        let at = rest.windows(2).position(|w| w == b"\r\n")?;
        self.pos += at + 2;
        Some(&rest[..at])
    }

    fn int_line(&mut self) -> Result<Option<i64>, ProtoError> {
        let Some(line) = self.line() else {
            return Ok(None);
        };
        let s = std::str::from_utf8(line).map_err(|_| ProtoError::NonUtf8Line)?;
        s.parse()
            .map(Some)
            .map_err(|_| ProtoError::BadInteger(s.to_string()))
    }

    fn value(&mut self, depth: usize) -> Result<Option<RespValue>, ProtoError> {
        if depth > MAX_DEPTH {
            return Err(ProtoError::TooDeep);
        }
        loop {
            let Some(&prefix) = self.buf.get(self.pos) else {
                return Ok(None);
            };
            match prefix {
                b'+' | b'-' => {
                    self.pos += 1;
                    let Some(line) = self.line() else {
                        return Ok(None);
                    };
                    let s = std::str::from_utf8(line)
                        .map_err(|_| ProtoError::NonUtf8Line)?
                        .to_string();
                    return Ok(Some(if prefix == b'+' {
                        RespValue::Simple(s)
                    } else {
                        RespValue::Error(s)
                    }));
                }
                b':' => {
                    self.pos += 1;
                    return Ok(self.int_line()?.map(RespValue::Integer));
                }
                b'$' => {
                    self.pos += 1;
                    return self.bulk();
                }
                b'*' => {
                    self.pos += 1;
                    return self.array(depth);
                }
                // Blank separator lines between inline commands are
                // skipped, then dispatch runs again on what follows.
                b'\r' => match self.buf.get(self.pos + 1) {
                    None => return Ok(None),
                    Some(b'\n') => self.pos += 2,
                    Some(_) => return self.inline(),
                },
                b'\n' => self.pos += 1,
                _ => return self.inline(),
            }
        }
    }

    fn bulk(&mut self) -> Result<Option<RespValue>, ProtoError> {
        let Some(len) = self.int_line()? else {
            return Ok(None);
        };
        if len == -1 {
            return Ok(Some(RespValue::Null));
        }
        if len < 0 {
            return Err(ProtoError::BadBulkLength);
        }
        let len = len as usize;
        if len > MAX_BULK_LEN {
            return Err(ProtoError::BulkTooLarge(len));
        }
        if self.buf.len() < self.pos + len + 2 {
            return Ok(None);
        }
        let payload = &self.buf[self.pos..self.pos + len];
        if &self.buf[self.pos + len..self.pos + len + 2] != b"\r\n" {
            return Err(ProtoError::UnterminatedBulk);
        }
        self.pos += len + 2;
        Ok(Some(RespValue::Bulk(Bytes::copy_from_slice(payload))))
    }

    fn array(&mut self, depth: usize) -> Result<Option<RespValue>, ProtoError> {
        let Some(count) = self.int_line()? else {
            return Ok(None);
        };
        if count == -1 {
            return Ok(Some(RespValue::Null));
        }
        if count < 0 {
            return Err(ProtoError::BadArrayLength);
        }
        let mut items = Vec::with_capacity((count as usize).min(1024));
        for _ in 0..count {
            match self.value(depth + 1)? {
                Some(item) => items.push(item),
                None => return Ok(None),
            }
        }
        Ok(Some(RespValue::Array(items)))
    }

    /// Whitespace-separated inline command, one line. Whitespace-only
    /// lines are skipped.
    fn inline(&mut self) -> Result<Option<RespValue>, ProtoError> {
        loop {
            let Some(line) = self.line() else {
                return Ok(None);
            };
            let s = std::str::from_utf8(line).map_err(|_| ProtoError::NonUtf8Line)?;
            let items: Vec<RespValue> = s
                .split_whitespace()
                .map(|w| RespValue::Bulk(Bytes::copy_from_slice(w.as_bytes())))
                .collect();
            if !items.is_empty() {
                return Ok(Some(RespValue::Array(items)));
            }
        }
    }
}
