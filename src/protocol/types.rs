//! RESP value model and serializer.
//!
//! RESP2 types, each introduced by a one-byte prefix and terminated by
//! CRLF:
//!
//! - `+` simple string, `-` error, `:` integer
//! - `$` bulk string (length-prefixed, binary safe; `$-1` is the null bulk)
//! - `*` array (count-prefixed; `*-1` is the null array)
//!
//! Serialization writes straight into a [`BytesMut`] so a connection can
//! batch pipelined replies into one write.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

pub const CRLF: &[u8] = b"\r\n";

/// One RESP value, either decoded from a client or built as a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Non-binary-safe line, e.g. `+OK`.
    Simple(String),
    /// Error line, e.g. `-ERR unknown command`.
    Error(String),
    /// Signed 64-bit integer.
    Integer(i64),
    /// Binary-safe string.
    Bulk(Bytes),
    /// Null bulk (`$-1`).
    Null,
    /// Array of any RESP values.
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn ok() -> Self {
        RespValue::Simple("OK".into())
    }

    pub fn pong() -> Self {
        RespValue::Simple("PONG".into())
    }

    pub fn simple(s: impl Into<String>) -> Self {
        RespValue::Simple(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn int(n: i64) -> Self {
        RespValue::Integer(n)
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        RespValue::Bulk(data.into())
    }

    pub fn array(items: Vec<RespValue>) -> Self {
        RespValue::Array(items)
    }

    /// Integer array, the shape of every per-field result-code reply.
    pub fn int_array(codes: impl IntoIterator<Item = i64>) -> Self {
        RespValue::Array(codes.into_iter().map(RespValue::Integer).collect())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Bulk or simple payload as bytes.
    pub fn as_bytes(&self) -> Option<Bytes> {
        match self {
            RespValue::Bulk(b) => Some(b.clone()),
            RespValue::Simple(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
            _ => None,
        }
    }

    /// Bulk or simple payload as UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::Simple(s) => Some(s),
            RespValue::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Integer, or a bulk/simple string parsed as one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            other => other.as_str()?.parse().ok(),
        }
    }

    /// Serialize into the connection's output buffer.
    pub fn write_to(&self, out: &mut BytesMut) {
        match self {
            RespValue::Simple(s) => {
                out.put_u8(b'+');
                out.put_slice(s.as_bytes());
                out.put_slice(CRLF);
            }
            RespValue::Error(s) => {
                out.put_u8(b'-');
                out.put_slice(s.as_bytes());
                out.put_slice(CRLF);
            }
            RespValue::Integer(n) => {
                out.put_u8(b':');
                out.put_slice(n.to_string().as_bytes());
                out.put_slice(CRLF);
            }
            RespValue::Bulk(data) => {
                out.put_u8(b'$');
                out.put_slice(data.len().to_string().as_bytes());
                out.put_slice(CRLF);
                out.put_slice(data);
                out.put_slice(CRLF);
            }
            RespValue::Null => out.put_slice(b"$-1\r\n"),
            RespValue::Array(items) => {
                out.put_u8(b'*');
                out.put_slice(items.len().to_string().as_bytes());
                out.put_slice(CRLF);
                for item in items {
                    item.write_to(out);
                }
            }
        }
    }

    /// Convenience for tests and one-off callers.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.write_to(&mut out);
        out.freeze()
    }
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::Simple(s) => write!(f, "{s}"),
            RespValue::Error(s) => write!(f, "(error) {s}"),
            RespValue::Integer(n) => write!(f, "(integer) {n}"),
            RespValue::Bulk(data) => match std::str::from_utf8(data) {
                Ok(s) => write!(f, "\"{s}\""),
                Err(_) => write!(f, "(binary, {} bytes)", data.len()),
            },
            RespValue::Null => write!(f, "(nil)"),
            RespValue::Array(items) => {
                if items.is_empty() {
                    return write!(f, "(empty array)");
                }
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {item}", i + 1)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(v: &RespValue) -> Vec<u8> {
        v.to_bytes().to_vec()
    }

    #[test]
    fn test_write_simple_and_error() {
        assert_eq!(rendered(&RespValue::ok()), b"+OK\r\n");
        assert_eq!(rendered(&RespValue::pong()), b"+PONG\r\n");
        assert_eq!(
            rendered(&RespValue::error("ERR nope")),
            b"-ERR nope\r\n"
        );
    }

    #[test]
    fn test_write_integers() {
        assert_eq!(rendered(&RespValue::int(1000)), b":1000\r\n");
        assert_eq!(rendered(&RespValue::int(-2)), b":-2\r\n");
    }

    #[test]
    fn test_write_bulk_and_null() {
        assert_eq!(rendered(&RespValue::bulk("hello")), b"$5\r\nhello\r\n");
        assert_eq!(rendered(&RespValue::Null), b"$-1\r\n");
        assert_eq!(
            rendered(&RespValue::bulk(Bytes::from_static(b"a\x00b"))),
            b"$3\r\na\x00b\r\n"
        );
    }

    #[test]
    fn test_write_arrays() {
        let v = RespValue::array(vec![RespValue::bulk("GET"), RespValue::bulk("k")]);
        assert_eq!(rendered(&v), b"*2\r\n$3\r\nGET\r\n$2\r\nk\r\n");

        assert_eq!(rendered(&RespValue::int_array([1, -2, 0])), b"*3\r\n:1\r\n:-2\r\n:0\r\n");
    }

    #[test]
    fn test_pipelined_replies_share_buffer() {
        let mut out = BytesMut::new();
        RespValue::ok().write_to(&mut out);
        RespValue::int(3).write_to(&mut out);
        assert_eq!(&out[..], b"+OK\r\n:3\r\n");
    }

    #[test]
    fn test_accessors() {
        assert_eq!(RespValue::bulk("10").as_int(), Some(10));
        assert_eq!(RespValue::int(7).as_int(), Some(7));
        assert_eq!(RespValue::bulk("abc").as_str(), Some("abc"));
        assert!(RespValue::Null.as_bytes().is_none());
        assert!(RespValue::error("x").is_error());
    }
}
