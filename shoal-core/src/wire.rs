//! Datagram framing: space-separated ASCII header, CRLF CRLF, raw body.

use crate::identity::{FileId, NodeId};
use crate::protocol::{Message, MessageType, Version};

/// Header/body delimiter.
pub const DELIMITER: &[u8] = b"\r\n\r\n";

/// Largest datagram a channel must accept: a full chunk plus header room.
pub const MAX_DATAGRAM_LEN: usize = 65_536;

/// Encode a message into a single datagram.
pub fn encode(msg: &Message) -> Vec<u8> {
    let mut header = format!("{} {} {}", msg.version, msg.kind, msg.sender);
    if let Some(file_id) = &msg.file_id {
        header.push(' ');
        header.push_str(&file_id.to_string());
    }
    if let Some(chunk_no) = msg.chunk_no {
        header.push(' ');
        header.push_str(&chunk_no.to_string());
    }
    if let Some(degree) = msg.replication_degree {
        header.push(' ');
        header.push_str(&degree.to_string());
    }
    let body: &[u8] = if msg.kind.has_body() { &msg.body } else { &[] };
    let mut out = Vec::with_capacity(header.len() + DELIMITER.len() + body.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(DELIMITER);
    out.extend_from_slice(body);
    out
}

/// Error decoding a datagram. The datagram is dropped; processing continues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("missing header delimiter")]
    MissingDelimiter,
    #[error("header is not ASCII text")]
    NotText,
    #[error("empty header")]
    Empty,
    #[error("unknown version {0:?}")]
    UnknownVersion(String),
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("{kind} expects {expected} header fields, got {got}")]
    FieldCount {
        kind: MessageType,
        expected: usize,
        got: usize,
    },
    #[error("field {field} is not a valid number: {value:?}")]
    NotNumeric { field: &'static str, value: String },
    #[error("invalid file id {0:?}")]
    InvalidFileId(String),
}

/// Decode one datagram. The boundary is located by scanning bytes; the body is never
/// interpreted as text, since chunk payloads may contain the delimiter themselves.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let start = bytes
        .iter()
        .position(|b| !matches!(b, b' ' | b'\r' | b'\n' | b'\t'))
        .unwrap_or(bytes.len());
    let bytes = &bytes[start..];
    let end = find_delimiter(bytes).ok_or(DecodeError::MissingDelimiter)?;
    let header = std::str::from_utf8(&bytes[..end]).map_err(|_| DecodeError::NotText)?;
    if !header.is_ascii() {
        return Err(DecodeError::NotText);
    }
    let body = &bytes[end + DELIMITER.len()..];

    let fields: Vec<&str> = header.split_ascii_whitespace().collect();
    if fields.len() < 2 {
        return Err(DecodeError::Empty);
    }
    let version: Version = fields[0]
        .parse()
        .map_err(|_| DecodeError::UnknownVersion(fields[0].to_string()))?;
    let kind: MessageType = fields[1]
        .parse()
        .map_err(|_| DecodeError::UnknownType(fields[1].to_string()))?;
    if fields.len() != kind.field_count() {
        return Err(DecodeError::FieldCount {
            kind,
            expected: kind.field_count(),
            got: fields.len(),
        });
    }
    let sender = NodeId(parse_number(fields[2], "sender")?);
    let file_id = match fields.get(3) {
        Some(raw) => Some(
            raw.parse::<FileId>()
                .map_err(|_| DecodeError::InvalidFileId(raw.to_string()))?,
        ),
        None => None,
    };
    let chunk_no = match fields.get(4) {
        Some(raw) => Some(parse_number(raw, "chunk_no")?),
        None => None,
    };
    let replication_degree = match fields.get(5) {
        Some(raw) => Some(parse_number(raw, "replication_degree")?),
        None => None,
    };
    let body = if kind.has_body() {
        body.to_vec()
    } else {
        Vec::new()
    };
    Ok(Message {
        version,
        kind,
        sender,
        file_id,
        chunk_no,
        replication_degree,
        body,
    })
}

fn find_delimiter(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(DELIMITER.len())
        .position(|window| window == DELIMITER)
}

fn parse_number(raw: &str, field: &'static str) -> Result<u32, DecodeError> {
    raw.parse::<u32>().map_err(|_| DecodeError::NotNumeric {
        field,
        value: raw.to_string(),
    })
}
