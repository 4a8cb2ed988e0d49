//! MongoDB wire protocol framing.
//! - Message header parsing
//! - Framed async reads with size enforcement
//! - OP_MSG (sections, checksum), OP_COMPRESSED, legacy OP_QUERY/OP_REPLY

pub mod compress;
pub mod op_msg;

use crate::error::{Error, Result};
use bson::Document;
use tokio::io::{AsyncRead, AsyncReadExt};

pub use compress::Compressor;
pub use op_msg::{DocumentSequence, OpMsg, decode_document_strict};

// Relevant op codes
pub const OP_REPLY: i32 = 1;
pub const OP_QUERY: i32 = 2004;
pub const OP_COMPRESSED: i32 = 2012;
pub const OP_MSG: i32 = 2013;

pub const HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    pub fn parse(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        // Little-endian 32-bit fields
        let message_length = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let request_id = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let response_to = i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let op_code = i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);

        Some((
            Self {
                message_length,
                request_id,
                response_to,
                op_code,
            },
            HEADER_LEN,
        ))
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.message_length.to_le_bytes());
        out.extend_from_slice(&self.request_id.to_le_bytes());
        out.extend_from_slice(&self.response_to.to_le_bytes());
        out.extend_from_slice(&self.op_code.to_le_bytes());
    }
}

/// A decoded client request (after any decompression). Malformed payloads
/// keep the connection alive: framing stayed intact, so the caller can
/// answer with an error document and read the next message.
#[derive(Debug)]
pub enum Request {
    Msg(OpMsg),
    Query(OpQuery),
    Malformed(Error),
}

/// Legacy OP_QUERY, accepted for the handshake only.
#[derive(Debug)]
pub struct OpQuery {
    pub flags: u32,
    pub full_collection_name: String,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: Document,
}

/// Read one framed message. Returns None on a clean EOF before any bytes.
/// The returned header reflects the inner message when the wire carried
/// OP_COMPRESSED (length and opCode rewritten after decompression).
pub async fn read_message<R>(reader: &mut R, max_len: usize) -> Result<Option<(MessageHeader, Request)>>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_LEN];
    let mut filled = 0usize;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::DecodeShortInput(format!(
                "connection closed mid-header after {filled} bytes"
            )));
        }
        filled += n;
    }

    let (header, _) = MessageHeader::parse(&header_buf)
        .ok_or_else(|| Error::Wire("unparsable message header".into()))?;

    let message_length = header.message_length;
    if (message_length as usize) < HEADER_LEN || message_length < 0 {
        return Err(Error::Wire(format!(
            "invalid messageLength {message_length}"
        )));
    }
    if message_length as usize > max_len {
        return Err(Error::Wire(format!(
            "messageLength {message_length} exceeds maximum {max_len}"
        )));
    }

    let mut body = vec![0u8; message_length as usize - HEADER_LEN];
    reader.read_exact(&mut body).await.map_err(|e| {
        Error::DecodeShortInput(format!("connection closed mid-body: {e}"))
    })?;

    let (header, body) = match header.op_code {
        OP_COMPRESSED => {
            let (inner_op, inner_body) = compress::unwrap_compressed(&body, max_len)?;
            if inner_op == OP_COMPRESSED {
                return Err(Error::Wire("nested OP_COMPRESSED rejected".into()));
            }
            let inner_header = MessageHeader {
                message_length: (HEADER_LEN + inner_body.len()) as i32,
                request_id: header.request_id,
                response_to: header.response_to,
                op_code: inner_op,
            };
            (inner_header, inner_body)
        }
        _ => (header, body),
    };

    let request = match header.op_code {
        OP_MSG => match op_msg::decode_op_msg(&header, &body) {
            Ok(msg) => Request::Msg(msg),
            // Checksum and flag violations are protocol-fatal.
            Err(e @ Error::Wire(_)) => return Err(e),
            Err(e) => Request::Malformed(e),
        },
        OP_QUERY => match decode_op_query(&body) {
            Ok(query) => Request::Query(query),
            Err(e @ Error::Wire(_)) => return Err(e),
            Err(e) => Request::Malformed(e),
        },
        other => {
            return Err(Error::Wire(format!("unsupported opCode {other}")));
        }
    };

    Ok(Some((header, request)))
}

/// Decode OP_QUERY body into its fields.
pub fn decode_op_query(body: &[u8]) -> Result<OpQuery> {
    if body.len() < 4 {
        return Err(Error::DecodeShortInput("OP_QUERY missing flags".into()));
    }
    let flags = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    // cstring fullCollectionName starting at offset 4
    let mut end = 4;
    while end < body.len() && body[end] != 0 {
        end += 1;
    }
    if end >= body.len() {
        return Err(Error::DecodeShortInput(
            "OP_QUERY collection name unterminated".into(),
        ));
    }
    let full_collection_name = std::str::from_utf8(&body[4..end])
        .map_err(|_| Error::DecodeInvalidInput("OP_QUERY collection name not UTF-8".into()))?
        .to_string();
    let mut i = end + 1;
    if i + 8 > body.len() {
        return Err(Error::DecodeShortInput(
            "OP_QUERY missing skip/return fields".into(),
        ));
    }
    let number_to_skip = i32::from_le_bytes([body[i], body[i + 1], body[i + 2], body[i + 3]]);
    i += 4;
    let number_to_return = i32::from_le_bytes([body[i], body[i + 1], body[i + 2], body[i + 3]]);
    i += 4;
    let (query, consumed) = decode_document_strict(&body[i..])?;
    i += consumed;
    // An optional returnFieldsSelector document may trail; tolerated and ignored.
    if i < body.len() {
        let _ = decode_document_strict(&body[i..])?;
    }
    Ok(OpQuery {
        flags,
        full_collection_name,
        number_to_skip,
        number_to_return,
        query,
    })
}

/// Encode OP_REPLY with the provided documents.
pub fn encode_op_reply(docs: &[Document], response_to: i32, request_id: i32) -> Vec<u8> {
    let response_flags: u32 = 8; // AwaitCapable
    let cursor_id: i64 = 0; // no cursor for command replies
    let starting_from: i32 = 0;
    let number_returned: i32 = docs.len() as i32;

    let mut docs_buf = Vec::new();
    for d in docs {
        let b = bson::to_vec(d).expect("bson encode");
        docs_buf.extend_from_slice(&b);
    }

    let body_len = 4 + 8 + 4 + 4 + docs_buf.len();
    let message_length = (HEADER_LEN + body_len) as i32;

    let mut out = Vec::with_capacity(message_length as usize);
    MessageHeader {
        message_length,
        request_id,
        response_to,
        op_code: OP_REPLY,
    }
    .write_to(&mut out);

    out.extend_from_slice(&response_flags.to_le_bytes());
    out.extend_from_slice(&cursor_id.to_le_bytes());
    out.extend_from_slice(&starting_from.to_le_bytes());
    out.extend_from_slice(&number_returned.to_le_bytes());
    out.extend_from_slice(&docs_buf);
    out
}
