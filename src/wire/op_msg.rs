//! OP_MSG section codec: kind-0 body, kind-1 document sequences, flag bits,
//! optional CRC-32C trailer, strict BSON decoding.

use crate::config::DEFAULT_MAX_DOCUMENT_SIZE;
use crate::error::{Error, Result};
use crate::wire::{HEADER_LEN, MessageHeader, OP_MSG};
use bson::Document;
use std::collections::HashSet;

pub const FLAG_CHECKSUM_PRESENT: u32 = 1;
pub const FLAG_MORE_TO_COME: u32 = 1 << 1;
pub const FLAG_EXHAUST_ALLOWED: u32 = 1 << 16;

// Bits 0..16 are required-to-understand; anything we don't know there is fatal.
const KNOWN_REQUIRED_FLAGS: u32 = FLAG_CHECKSUM_PRESENT | FLAG_MORE_TO_COME;

/// A kind-1 section: an identifier naming the payload and a packed run of documents.
#[derive(Debug, Clone)]
pub struct DocumentSequence {
    pub identifier: String,
    pub documents: Vec<Document>,
}

#[derive(Debug)]
pub struct OpMsg {
    pub flags: u32,
    pub body: Document,
    pub sequences: Vec<DocumentSequence>,
}

impl OpMsg {
    pub fn more_to_come(&self) -> bool {
        self.flags & FLAG_MORE_TO_COME != 0
    }

    /// The command is named by the first field of the body.
    pub fn command_name(&self) -> Option<&str> {
        self.body.keys().next().map(|s| s.as_str())
    }

    /// Take the sequence with the given identifier, if the client sent one.
    pub fn take_sequence(&mut self, identifier: &str) -> Option<DocumentSequence> {
        let idx = self.sequences.iter().position(|s| s.identifier == identifier)?;
        Some(self.sequences.remove(idx))
    }
}

/// Strictly decode one BSON document from the front of `bytes`.
/// Returns the document and the number of bytes consumed. Rejects truncated
/// input, length mismatches, oversized documents, and duplicate top-level keys.
pub fn decode_document_strict(bytes: &[u8]) -> Result<(Document, usize)> {
    if bytes.len() < 5 {
        return Err(Error::DecodeShortInput(format!(
            "document needs at least 5 bytes, have {}",
            bytes.len()
        )));
    }
    let len = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len < 5 {
        return Err(Error::DecodeInvalidInput(format!(
            "document length {len} below minimum"
        )));
    }
    let len = len as usize;
    if len > DEFAULT_MAX_DOCUMENT_SIZE {
        return Err(Error::DecodeInvalidInput(format!(
            "document length {len} exceeds maximum {DEFAULT_MAX_DOCUMENT_SIZE}"
        )));
    }
    if len > bytes.len() {
        return Err(Error::DecodeShortInput(format!(
            "document claims {len} bytes, only {} available",
            bytes.len()
        )));
    }
    if bytes[len - 1] != 0 {
        return Err(Error::DecodeInvalidInput(
            "document missing trailing NUL".into(),
        ));
    }

    let slice = &bytes[..len];
    let raw = bson::RawDocument::from_bytes(slice)
        .map_err(|e| Error::DecodeInvalidInput(format!("malformed document: {e}")))?;

    // Dispatching keys off a document with duplicate top-level fields is a
    // protocol error; nested duplicates are preserved as-is.
    let mut seen: HashSet<&str> = HashSet::new();
    for elem in raw.iter() {
        let (key, _value) = elem
            .map_err(|e| Error::DecodeInvalidInput(format!("malformed element: {e}")))?;
        if !seen.insert(key) {
            return Err(Error::DecodeInvalidInput(format!(
                "duplicate top-level key \"{key}\""
            )));
        }
    }

    let doc = Document::from_reader(&mut std::io::Cursor::new(slice))
        .map_err(|e| Error::DecodeInvalidInput(format!("document decode: {e}")))?;
    Ok((doc, len))
}

/// Decode the OP_MSG body. `header` must describe the uncompressed message.
pub fn decode_op_msg(header: &MessageHeader, body: &[u8]) -> Result<OpMsg> {
    if body.len() < 5 {
        return Err(Error::DecodeShortInput("OP_MSG body truncated".into()));
    }
    let flags = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);

    let unknown_required = (flags & 0xFFFF) & !KNOWN_REQUIRED_FLAGS;
    if unknown_required != 0 {
        return Err(Error::Wire(format!(
            "unknown required OP_MSG flag bits {unknown_required:#x}"
        )));
    }

    let mut sections_end = body.len();
    if flags & FLAG_CHECKSUM_PRESENT != 0 {
        if body.len() < 4 + 4 {
            return Err(Error::DecodeShortInput(
                "OP_MSG too short for checksum".into(),
            ));
        }
        sections_end = body.len() - 4;
        let expected = u32::from_le_bytes([
            body[sections_end],
            body[sections_end + 1],
            body[sections_end + 2],
            body[sections_end + 3],
        ]);
        let mut covered = Vec::with_capacity(HEADER_LEN + sections_end);
        header.write_to(&mut covered);
        covered.extend_from_slice(&body[..sections_end]);
        let actual = crc32c::crc32c(&covered);
        if actual != expected {
            return Err(Error::Wire(format!(
                "checksum mismatch: expected {expected:#010x}, computed {actual:#010x}"
            )));
        }
    }

    let mut offset = 4usize;
    let mut body_doc: Option<Document> = None;
    let mut sequences: Vec<DocumentSequence> = Vec::new();
    let mut seen_idents: HashSet<String> = HashSet::new();

    while offset < sections_end {
        let kind = body[offset];
        offset += 1;
        match kind {
            0 => {
                if body_doc.is_some() {
                    return Err(Error::DecodeInvalidInput(
                        "multiple kind-0 sections".into(),
                    ));
                }
                let (doc, consumed) = decode_document_strict(&body[offset..sections_end])?;
                body_doc = Some(doc);
                offset += consumed;
            }
            1 => {
                if offset + 4 > sections_end {
                    return Err(Error::DecodeShortInput(
                        "kind-1 section size truncated".into(),
                    ));
                }
                let size = i32::from_le_bytes([
                    body[offset],
                    body[offset + 1],
                    body[offset + 2],
                    body[offset + 3],
                ]);
                if size < 5 || offset + size as usize > sections_end {
                    return Err(Error::DecodeInvalidInput(format!(
                        "kind-1 section size {size} out of bounds"
                    )));
                }
                let section_end = offset + size as usize;
                let mut pos = offset + 4;
                let ident_start = pos;
                while pos < section_end && body[pos] != 0 {
                    pos += 1;
                }
                if pos >= section_end {
                    return Err(Error::DecodeInvalidInput(
                        "kind-1 identifier unterminated".into(),
                    ));
                }
                let identifier = std::str::from_utf8(&body[ident_start..pos])
                    .map_err(|_| {
                        Error::DecodeInvalidInput("kind-1 identifier not UTF-8".into())
                    })?
                    .to_string();
                if !seen_idents.insert(identifier.clone()) {
                    return Err(Error::DecodeInvalidInput(format!(
                        "duplicate kind-1 identifier \"{identifier}\""
                    )));
                }
                pos += 1; // NUL
                let mut documents = Vec::new();
                while pos < section_end {
                    let (doc, consumed) = decode_document_strict(&body[pos..section_end])?;
                    documents.push(doc);
                    pos += consumed;
                }
                sequences.push(DocumentSequence {
                    identifier,
                    documents,
                });
                offset = section_end;
            }
            other => {
                return Err(Error::DecodeInvalidInput(format!(
                    "unknown section kind {other}"
                )));
            }
        }
    }

    let body_doc = body_doc
        .ok_or_else(|| Error::DecodeInvalidInput("OP_MSG without kind-0 section".into()))?;

    Ok(OpMsg {
        flags,
        body: body_doc,
        sequences,
    })
}

/// Encode an OP_MSG with section 0 containing a single BSON document.
/// Returns a Vec with the full wire message including the message header.
pub fn encode_op_msg(doc: &Document, response_to: i32, request_id: i32) -> Vec<u8> {
    encode_op_msg_flags(doc, response_to, request_id, 0)
}

/// Encode with explicit flag bits. A set checksumPresent bit appends the
/// CRC-32C of everything already written.
pub fn encode_op_msg_flags(
    doc: &Document,
    response_to: i32,
    request_id: i32,
    flags: u32,
) -> Vec<u8> {
    let doc_bytes = bson::to_vec(doc).expect("bson encode");
    let checksum_len = if flags & FLAG_CHECKSUM_PRESENT != 0 { 4 } else { 0 };
    let body_len = 4 /*flags*/ + 1 /*kind*/ + doc_bytes.len() + checksum_len;
    let message_length = (HEADER_LEN + body_len) as i32;

    let mut out = Vec::with_capacity(message_length as usize);
    MessageHeader {
        message_length,
        request_id,
        response_to,
        op_code: OP_MSG,
    }
    .write_to(&mut out);

    out.extend_from_slice(&flags.to_le_bytes());
    out.push(0u8); // section 0
    out.extend_from_slice(&doc_bytes);

    if checksum_len > 0 {
        let crc = crc32c::crc32c(&out);
        out.extend_from_slice(&crc.to_le_bytes());
    }
    out
}
