//! OP_COMPRESSED wrapping. A compressed message carries the inner opCode,
//! the uncompressed size, a compressor id, and the compressed inner body.

use crate::error::{Error, Result};
use crate::wire::{HEADER_LEN, MessageHeader, OP_COMPRESSED};
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    Noop,
    Snappy,
    Zlib,
    Zstd,
}

impl Compressor {
    pub const SUPPORTED: [Compressor; 4] = [
        Compressor::Noop,
        Compressor::Snappy,
        Compressor::Zlib,
        Compressor::Zstd,
    ];

    pub fn id(self) -> u8 {
        match self {
            Compressor::Noop => 0,
            Compressor::Snappy => 1,
            Compressor::Zlib => 2,
            Compressor::Zstd => 3,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Compressor::Noop),
            1 => Some(Compressor::Snappy),
            2 => Some(Compressor::Zlib),
            3 => Some(Compressor::Zstd),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Compressor::Noop => "noop",
            Compressor::Snappy => "snappy",
            Compressor::Zlib => "zlib",
            Compressor::Zstd => "zstd",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "noop" => Some(Compressor::Noop),
            "snappy" => Some(Compressor::Snappy),
            "zlib" => Some(Compressor::Zlib),
            "zstd" => Some(Compressor::Zstd),
            _ => None,
        }
    }
}

pub fn compress(data: &[u8], compressor: Compressor) -> Result<Vec<u8>> {
    match compressor {
        Compressor::Noop => Ok(data.to_vec()),
        Compressor::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| Error::Wire(format!("snappy compress: {e}"))),
        Compressor::Zlib => {
            let mut enc =
                flate2::read::ZlibEncoder::new(data, flate2::Compression::default());
            let mut out = Vec::new();
            enc.read_to_end(&mut out)
                .map_err(|e| Error::Wire(format!("zlib compress: {e}")))?;
            Ok(out)
        }
        Compressor::Zstd => zstd::bulk::compress(data, 0)
            .map_err(|e| Error::Wire(format!("zstd compress: {e}"))),
    }
}

/// Decompress and verify the result is exactly `expected_len` bytes.
pub fn decompress(data: &[u8], compressor: Compressor, expected_len: usize) -> Result<Vec<u8>> {
    let out = match compressor {
        Compressor::Noop => data.to_vec(),
        Compressor::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| Error::Wire(format!("snappy decompress: {e}")))?,
        Compressor::Zlib => {
            let mut dec = flate2::read::ZlibDecoder::new(data);
            let mut out = Vec::with_capacity(expected_len);
            dec.read_to_end(&mut out)
                .map_err(|e| Error::Wire(format!("zlib decompress: {e}")))?;
            out
        }
        Compressor::Zstd => zstd::bulk::decompress(data, expected_len)
            .map_err(|e| Error::Wire(format!("zstd decompress: {e}")))?,
    };
    if out.len() != expected_len {
        return Err(Error::Wire(format!(
            "decompressed size {} does not match declared {expected_len}",
            out.len()
        )));
    }
    Ok(out)
}

/// Unwrap an OP_COMPRESSED body into (inner opCode, inner body bytes).
pub fn unwrap_compressed(body: &[u8], max_len: usize) -> Result<(i32, Vec<u8>)> {
    if body.len() < 9 {
        return Err(Error::DecodeShortInput("OP_COMPRESSED body truncated".into()));
    }
    let inner_op = i32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let uncompressed_size = i32::from_le_bytes([body[4], body[5], body[6], body[7]]);
    if uncompressed_size < 0 || uncompressed_size as usize + HEADER_LEN > max_len {
        return Err(Error::Wire(format!(
            "declared uncompressed size {uncompressed_size} out of range"
        )));
    }
    let compressor = Compressor::from_id(body[8])
        .ok_or_else(|| Error::Wire(format!("unknown compressor id {}", body[8])))?;
    let inner = decompress(&body[9..], compressor, uncompressed_size as usize)?;
    Ok((inner_op, inner))
}

/// Wrap a fully-formed wire message (header included) in OP_COMPRESSED.
pub fn wrap_message(message: &[u8], compressor: Compressor) -> Result<Vec<u8>> {
    let (header, _) = MessageHeader::parse(message)
        .ok_or_else(|| Error::Wire("message too short to compress".into()))?;
    let inner_body = &message[HEADER_LEN..];
    let compressed = compress(inner_body, compressor)?;

    let body_len = 4 + 4 + 1 + compressed.len();
    let mut out = Vec::with_capacity(HEADER_LEN + body_len);
    MessageHeader {
        message_length: (HEADER_LEN + body_len) as i32,
        request_id: header.request_id,
        response_to: header.response_to,
        op_code: OP_COMPRESSED,
    }
    .write_to(&mut out);
    out.extend_from_slice(&header.op_code.to_le_bytes());
    out.extend_from_slice(&(inner_body.len() as i32).to_le_bytes());
    out.push(compressor.id());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Compress an outbound reply when the peer negotiated a compressor and the
/// payload clears the threshold. Returns the message to put on the wire.
pub fn maybe_compress_reply(
    message: Vec<u8>,
    negotiated: Option<Compressor>,
    threshold: usize,
) -> Vec<u8> {
    match negotiated {
        Some(c) if c != Compressor::Noop && message.len() - HEADER_LEN > threshold => {
            match wrap_message(&message, c) {
                Ok(wrapped) => wrapped,
                Err(e) => {
                    tracing::warn!(error = %e, "reply compression failed; sending uncompressed");
                    message
                }
            }
        }
        _ => message,
    }
}
