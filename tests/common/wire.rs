#![allow(dead_code)]

use bson::Document;
use oxgate::wire::{HEADER_LEN, MessageHeader, OP_COMPRESSED, OP_MSG, OP_REPLY, compress, op_msg};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub async fn send_doc(stream: &mut TcpStream, doc: &Document, request_id: i32) {
    let msg = op_msg::encode_op_msg(doc, 0, request_id);
    stream.write_all(&msg).await.unwrap();
}

/// Read one reply message; transparently unwraps OP_COMPRESSED.
pub async fn read_reply(stream: &mut TcpStream) -> (MessageHeader, Document) {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await.unwrap();
    let (hdr, _) = MessageHeader::parse(&header).unwrap();
    let mut body = vec![0u8; (hdr.message_length as usize) - HEADER_LEN];
    stream.read_exact(&mut body).await.unwrap();

    let (hdr, body) = match hdr.op_code {
        OP_COMPRESSED => {
            let (inner_op, inner) = compress::unwrap_compressed(&body, 1 << 26).unwrap();
            assert_eq!(inner_op, OP_MSG);
            (
                MessageHeader {
                    message_length: (HEADER_LEN + inner.len()) as i32,
                    request_id: hdr.request_id,
                    response_to: hdr.response_to,
                    op_code: inner_op,
                },
                inner,
            )
        }
        _ => (hdr, body),
    };
    assert_eq!(hdr.op_code, OP_MSG);

    let msg = op_msg::decode_op_msg(&hdr, &body).unwrap();
    (hdr, msg.body)
}

pub async fn roundtrip(stream: &mut TcpStream, doc: &Document, request_id: i32) -> Document {
    send_doc(stream, doc, request_id).await;
    let (hdr, reply) = read_reply(stream).await;
    assert_eq!(hdr.response_to, request_id);
    reply
}

/// Read a legacy OP_REPLY and return its first document.
pub async fn read_op_reply(stream: &mut TcpStream) -> (MessageHeader, Document) {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await.unwrap();
    let (hdr, _) = MessageHeader::parse(&header).unwrap();
    assert_eq!(hdr.op_code, OP_REPLY);
    let mut body = vec![0u8; (hdr.message_length as usize) - HEADER_LEN];
    stream.read_exact(&mut body).await.unwrap();
    // responseFlags(4) + cursorId(8) + startingFrom(4) + numberReturned(4)
    let doc = Document::from_reader(&mut std::io::Cursor::new(&body[20..])).unwrap();
    (hdr, doc)
}

/// OP_QUERY against `<db>.$cmd`, as pre-OP_MSG drivers send the handshake.
pub async fn send_op_query(stream: &mut TcpStream, db: &str, query: &Document, request_id: i32) {
    let qbytes = bson::to_vec(query).unwrap();
    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_le_bytes());
    body.extend_from_slice(format!("{db}.$cmd").as_bytes());
    body.push(0);
    body.extend_from_slice(&0i32.to_le_bytes());
    body.extend_from_slice(&(-1i32).to_le_bytes());
    body.extend_from_slice(&qbytes);

    let mut msg = Vec::new();
    MessageHeader {
        message_length: (HEADER_LEN + body.len()) as i32,
        request_id,
        response_to: 0,
        op_code: oxgate::wire::OP_QUERY,
    }
    .write_to(&mut msg);
    msg.extend_from_slice(&body);
    stream.write_all(&msg).await.unwrap();
}
