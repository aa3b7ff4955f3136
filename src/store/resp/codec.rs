//! RESP2 encoder and decoder
//!
//! Requests go out as arrays of bulk strings. Replies are decoded from a
//! buffer that may hold a partial frame; the decoder reports how many bytes a
//! complete reply consumed so the caller can advance its buffer.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::KvError;
use crate::store::connection::Request;
use crate::store::reply::Reply;

/// Largest bulk string accepted from the server
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Deepest array nesting accepted from the server
pub const MAX_NESTING_DEPTH: usize = 32;

const CRLF: &[u8] = b"\r\n";

/// Append `request` to `out` as a RESP2 array of bulk strings
pub fn encode_request(request: &Request, out: &mut BytesMut) {
    write_header(out, b'*', request.args.len() + 1);
    write_bulk(out, request.command.as_bytes());
    for arg in &request.args {
        write_bulk(out, arg);
    }
}

/// Encode a reply; used when serving RESP
pub fn encode_reply(reply: &Reply, out: &mut BytesMut) {
    match reply {
        Reply::Status(s) => {
            out.put_u8(b'+');
            out.put_slice(s.as_bytes());
            out.put_slice(CRLF);
        }
        Reply::Error(e) => {
            out.put_u8(b'-');
            out.put_slice(e.as_bytes());
            out.put_slice(CRLF);
        }
        Reply::Integer(n) => {
            out.put_u8(b':');
            out.put_slice(n.to_string().as_bytes());
            out.put_slice(CRLF);
        }
        Reply::Bulk(b) => write_bulk(out, b),
        Reply::Nil => out.put_slice(b"$-1\r\n"),
        Reply::Array(items) => {
            write_header(out, b'*', items.len());
            for item in items {
                encode_reply(item, out);
            }
        }
    }
}

fn write_header(out: &mut BytesMut, prefix: u8, len: usize) {
    out.put_u8(prefix);
    out.put_slice(len.to_string().as_bytes());
    out.put_slice(CRLF);
}

fn write_bulk(out: &mut BytesMut, data: &[u8]) {
    write_header(out, b'$', data.len());
    out.put_slice(data);
    out.put_slice(CRLF);
}

/// Decode one reply from the front of `data`.
///
/// Returns `Ok(None)` while the frame is incomplete.
pub fn decode(data: &[u8]) -> Result<Option<(Reply, usize)>, KvError> {
    decode_at(data, 0)
}

fn decode_at(data: &[u8], depth: usize) -> Result<Option<(Reply, usize)>, KvError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(protocol("maximum nesting depth exceeded"));
    }
    let Some(&prefix) = data.first() else {
        return Ok(None);
    };
    let Some(line_end) = find_crlf(&data[1..]) else {
        return Ok(None);
    };
    let line = &data[1..1 + line_end];
    // prefix + line + CRLF
    let header_len = line_end + 3;

    match prefix {
        b'+' => Ok(Some((Reply::Status(text(line)), header_len))),
        b'-' => Ok(Some((Reply::Error(text(line)), header_len))),
        b':' => Ok(Some((Reply::Integer(integer(line)?), header_len))),
        b'$' => {
            let len = integer(line)?;
            if len == -1 {
                return Ok(Some((Reply::Nil, header_len)));
            }
            let len = usize::try_from(len)
                .map_err(|_| protocol(format!("invalid bulk string length: {}", len)))?;
            if len > MAX_BULK_SIZE {
                return Err(protocol(format!(
                    "bulk string too large: {} > {}",
                    len, MAX_BULK_SIZE
                )));
            }
            let end = header_len + len;
            if data.len() < end + 2 {
                return Ok(None);
            }
            if &data[end..end + 2] != CRLF {
                return Err(protocol("missing CRLF after bulk string"));
            }
            let payload = Bytes::copy_from_slice(&data[header_len..end]);
            Ok(Some((Reply::Bulk(payload), end + 2)))
        }
        b'*' => {
            let count = integer(line)?;
            if count == -1 {
                return Ok(Some((Reply::Nil, header_len)));
            }
            let count = usize::try_from(count)
                .map_err(|_| protocol(format!("invalid array length: {}", count)))?;
            let mut items = Vec::with_capacity(count.min(1024));
            let mut offset = header_len;
            for _ in 0..count {
                match decode_at(&data[offset..], depth + 1)? {
                    Some((item, used)) => {
                        items.push(item);
                        offset += used;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Reply::Array(items), offset)))
        }
        other => Err(protocol(format!("unknown type prefix {:?}", other as char))),
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == CRLF)
}

fn text(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}

fn integer(line: &[u8]) -> Result<i64, KvError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| protocol(format!("invalid integer {:?}", text(line))))
}

fn protocol(message: impl Into<String>) -> KvError {
    KvError::Backend(format!("RESP protocol error: {}", message.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(data: &[u8]) -> Reply {
        let (reply, used) = decode(data).unwrap().unwrap();
        assert_eq!(used, data.len());
        reply
    }

    #[test]
    fn test_encode_request() {
        let mut out = BytesMut::new();
        encode_request(&Request::new("set").arg("key").arg("v\r\n"), &mut out);
        assert_eq!(&out[..], b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$3\r\nv\r\n\r\n");
    }

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode_all(b"+OK\r\n"), Reply::ok());
        assert_eq!(decode_all(b"-ERR nope\r\n"), Reply::Error("ERR nope".into()));
        assert_eq!(decode_all(b":-42\r\n"), Reply::Integer(-42));
        assert_eq!(decode_all(b"$-1\r\n"), Reply::Nil);
        assert_eq!(decode_all(b"*-1\r\n"), Reply::Nil);
        assert_eq!(decode_all(b"$0\r\n\r\n"), Reply::Bulk(Bytes::new()));
        assert_eq!(decode_all(b"$4\r\na\r\nb\r\n"), Reply::from("a\r\nb"));
    }

    #[test]
    fn test_decode_nested_array() {
        let reply = decode_all(b"*2\r\n$1\r\na\r\n*1\r\n:1\r\n");
        assert_eq!(
            reply,
            Reply::Array(vec![Reply::from("a"), Reply::Array(vec![Reply::Integer(1)])])
        );
    }

    #[test]
    fn test_decode_incomplete_frames() {
        for partial in [&b""[..], &b"+OK"[..], &b"$5\r\nhel"[..], &b"$5\r\nhello"[..], &b"*2\r\n:1\r\n"[..]] {
            assert!(decode(partial).unwrap().is_none(), "{:?}", partial);
        }
    }

    #[test]
    fn test_decode_leaves_trailing_frames() {
        let (reply, used) = decode(b":1\r\n:2\r\n").unwrap().unwrap();
        assert_eq!(reply, Reply::Integer(1));
        assert_eq!(used, 4);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(b"?what\r\n").is_err());
        assert!(decode(b":abc\r\n").is_err());
        assert!(decode(b"$3\r\nabcXY").is_err());
    }

    #[test]
    fn test_reply_encoding_decodes_back() {
        let reply = Reply::Array(vec![Reply::Nil, Reply::Status("PONG".into()), Reply::Integer(7)]);
        let mut out = BytesMut::new();
        encode_reply(&reply, &mut out);
        assert_eq!(decode_all(&out), reply);
    }
}
