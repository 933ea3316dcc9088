//! Event wire frames shared by the network sink and the ingestion server.
//!
//! Frame layout:
//! - u32 length (N) of the record body (little-endian)
//! - u32 crc32 over the body (little-endian)
//! - N bytes UTF-8 record
//!
//! The record is one comma-delimited line:
//! `1,<sequence>,<timestamp_ms>,<context_id>,<origin>,<EVENT_TYPE>,<capture_context>,<key>=<value>,...`
//!
//! `\`, `,`, `=`, LF and CR inside fields are escaped as `\\`, `\,`, `\=`,
//! `\n`, `\r`. An absent capture context is the token `\N`.

use crate::error::ProtocolError;
use crate::event::{Attributes, Event, EventType};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use uuid::Uuid;

pub const RECORD_VERSION: &str = "1";
pub const HEADER_LEN: usize = 8;
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

const NONE_TOKEN: &str = "\\N";
const FIXED_FIELDS: usize = 7;

fn escape_into(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ',' => out.push_str("\\,"),
            '=' => out.push_str("\\="),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
}

fn unescape(token: &str) -> Result<String, ProtocolError> {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some(',') => out.push(','),
            Some('=') => out.push('='),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => {
                return Err(ProtocolError::Malformed(format!("bad escape \\{}", other)))
            }
            None => return Err(ProtocolError::Malformed("dangling escape".into())),
        }
    }
    Ok(out)
}

/// Split on `delim` bytes that are not preceded by an escaping backslash.
fn split_unescaped(s: &str, delim: u8) -> Vec<&str> {
    let bytes = s.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i] == delim {
            parts.push(&s[start..i]);
            start = i + 1;
        }
        i += 1;
    }
    parts.push(&s[start.min(s.len())..]);
    parts
}

/// Encode the text record for one event.
pub fn encode_record(event: &Event) -> String {
    let mut out = String::with_capacity(128);
    out.push_str(RECORD_VERSION);
    out.push(',');
    out.push_str(&event.sequence.to_string());
    out.push(',');
    out.push_str(&event.timestamp_millis.to_string());
    out.push(',');
    out.push_str(&event.execution_context_id.to_string());
    out.push(',');
    out.push_str(&event.origin.to_string());
    out.push(',');
    out.push_str(event.event_type.as_str());
    out.push(',');
    match &event.capture_context {
        Some(ctx) => escape_into(&mut out, ctx),
        None => out.push_str(NONE_TOKEN),
    }
    for (k, v) in event.attributes.iter() {
        out.push(',');
        escape_into(&mut out, k);
        out.push('=');
        escape_into(&mut out, v);
    }
    out
}

fn number<T: std::str::FromStr>(field: &str, name: &str) -> Result<T, ProtocolError> {
    field
        .parse()
        .map_err(|_| ProtocolError::Malformed(format!("{} is not a number: {:?}", name, field)))
}

/// Decode one text record back into the exact event that was encoded.
pub fn decode_record(record: &str) -> Result<Event, ProtocolError> {
    let fields = split_unescaped(record, b',');
    if fields.len() < FIXED_FIELDS {
        return Err(ProtocolError::Malformed(format!(
            "expected at least {} fields, got {}",
            FIXED_FIELDS,
            fields.len()
        )));
    }
    if fields[0] != RECORD_VERSION {
        return Err(ProtocolError::UnsupportedVersion(fields[0].to_string()));
    }
    let origin = Uuid::parse_str(fields[4])
        .map_err(|_| ProtocolError::Malformed(format!("bad origin {:?}", fields[4])))?;
    let event_type: EventType = fields[5]
        .parse()
        .map_err(ProtocolError::UnknownEventType)?;
    let capture_context = match fields[6] {
        NONE_TOKEN => None,
        other => Some(unescape(other)?),
    };
    let mut attributes = Attributes::new();
    for field in &fields[FIXED_FIELDS..] {
        let kv = split_unescaped(field, b'=');
        if kv.len() != 2 {
            return Err(ProtocolError::Malformed(format!("bad attribute {:?}", field)));
        }
        attributes.push(unescape(kv[0])?, unescape(kv[1])?);
    }
    Ok(Event {
        sequence: number(fields[1], "sequence")?,
        timestamp_millis: number(fields[2], "timestamp")?,
        execution_context_id: number(fields[3], "execution context")?,
        origin,
        event_type,
        capture_context,
        attributes,
    })
}

/// Append one framed event to `out`.
pub fn encode_frame(event: &Event, out: &mut Vec<u8>) {
    let body = encode_record(event);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body.as_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&hasher.finalize().to_le_bytes());
    out.extend_from_slice(body.as_bytes());
}

fn check_body(body: &[u8], expected_crc: u32) -> Result<Event, ProtocolError> {
    let actual = crc32fast::hash(body);
    if actual != expected_crc {
        return Err(ProtocolError::CrcMismatch {
            expected: expected_crc,
            actual,
        });
    }
    let text = std::str::from_utf8(body).map_err(|_| ProtocolError::InvalidUtf8)?;
    decode_record(text)
}

fn check_len(len: usize, max_len: usize) -> Result<(), ProtocolError> {
    if len == 0 {
        return Err(ProtocolError::EmptyFrame);
    }
    if len > max_len {
        return Err(ProtocolError::TooLarge {
            size: len,
            max_size: max_len,
        });
    }
    Ok(())
}

/// Decode one frame from the front of `buf`. Returns the event and the number
/// of bytes consumed, or `Ok(None)` if `buf` does not hold a whole frame yet.
pub fn decode_frame(buf: &[u8], max_len: usize) -> Result<Option<(Event, usize)>, ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let crc = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    check_len(len, max_len)?;
    if buf.len() < HEADER_LEN + len {
        return Ok(None);
    }
    let event = check_body(&buf[HEADER_LEN..HEADER_LEN + len], crc)?;
    Ok(Some((event, HEADER_LEN + len)))
}

/// Read one frame. `Ok(None)` on a clean end of stream between frames.
///
/// `idle` bounds the wait for the next frame header; once a header arrives the
/// body must follow within the same bound. Nothing arriving at all is
/// [`ProtocolError::Idle`]; a stall mid-frame is [`ProtocolError::Timeout`].
pub async fn read_frame<R>(
    reader: &mut R,
    max_len: usize,
    idle: Duration,
) -> Result<Option<Event>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = timeout(idle, reader.read(&mut header[filled..]))
            .await
            .map_err(|_| {
                if filled == 0 {
                    ProtocolError::Idle
                } else {
                    ProtocolError::Timeout
                }
            })??;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(ProtocolError::Truncated)
            };
        }
        filled += n;
    }
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    check_len(len, max_len)?;

    let mut body = vec![0u8; len];
    timeout(idle, reader.read_exact(&mut body))
        .await
        .map_err(|_| ProtocolError::Timeout)?
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ProtocolError::Truncated
            } else {
                ProtocolError::Io(e)
            }
        })?;
    check_body(&body, crc).map(Some)
}
