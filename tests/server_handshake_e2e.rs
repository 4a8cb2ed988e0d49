use bson::doc;
use oxgate::config::Config;
use oxgate::server::spawn_with_shutdown;
use tokio::net::TcpStream;

#[path = "common/wire.rs"]
mod wire;

#[tokio::test]
async fn e2e_hello_reports_wire_limits() {
    let mut cfg = Config::default();
    cfg.listen_addr = "127.0.0.1:0".into();

    let (_app, addr, shutdown, handle) = spawn_with_shutdown(cfg).await.unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let reply = wire::roundtrip(&mut stream, &doc! {"hello": 1i32, "$db": "admin"}, 1).await;
    assert_eq!(reply.get_bool("isWritablePrimary").unwrap(), true);
    assert_eq!(reply.get_i32("maxBsonObjectSize").unwrap(), 16777216);
    assert_eq!(reply.get_i32("maxMessageSizeBytes").unwrap(), 50331648);
    assert_eq!(reply.get_i32("maxWriteBatchSize").unwrap(), 100000);
    assert_eq!(reply.get_i32("logicalSessionTimeoutMinutes").unwrap(), 30);
    assert_eq!(reply.get_i32("minWireVersion").unwrap(), 0);
    assert_eq!(reply.get_i32("maxWireVersion").unwrap(), 21);
    assert_eq!(reply.get_bool("readOnly").unwrap(), false);
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);
    assert!(reply.get_i64("connectionId").is_ok());

    // hello without the request field must not advertise mechanisms
    assert!(reply.get_array("saslSupportedMechs").is_err());

    let reply = wire::roundtrip(
        &mut stream,
        &doc! {"hello": 1i32, "saslSupportedMechs": "admin.alice", "$db": "admin"},
        2,
    )
    .await;
    let mechs = reply.get_array("saslSupportedMechs").unwrap();
    assert!(
        mechs
            .iter()
            .any(|m| m.as_str() == Some("SCRAM-SHA-256"))
    );

    let _ = shutdown.send(true);
    let _ = handle.await.unwrap();
}

#[tokio::test]
async fn e2e_legacy_op_query_handshake() {
    let mut cfg = Config::default();
    cfg.listen_addr = "127.0.0.1:0".into();

    let (_app, addr, shutdown, handle) = spawn_with_shutdown(cfg).await.unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();

    wire::send_op_query(&mut stream, "admin", &doc! {"isMaster": 1i32}, 7).await;
    let (hdr, reply) = wire::read_op_reply(&mut stream).await;
    assert_eq!(hdr.response_to, 7);
    assert_eq!(reply.get_bool("ismaster").unwrap(), true);
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);

    // Anything beyond the handshake on the legacy path is refused.
    wire::send_op_query(&mut stream, "db", &doc! {"find": "c"}, 8).await;
    let (_, reply) = wire::read_op_reply(&mut stream).await;
    assert_eq!(reply.get_f64("ok").unwrap(), 0.0);
    assert_eq!(reply.get_i32("code").unwrap(), 59);

    let _ = shutdown.send(true);
    let _ = handle.await.unwrap();
}

#[tokio::test]
async fn e2e_ping_and_diagnostics() {
    let mut cfg = Config::default();
    cfg.listen_addr = "127.0.0.1:0".into();

    let (_app, addr, shutdown, handle) = spawn_with_shutdown(cfg).await.unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let reply = wire::roundtrip(&mut stream, &doc! {"ping": 1i32, "$db": "admin"}, 1).await;
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);

    let reply = wire::roundtrip(&mut stream, &doc! {"buildInfo": 1i32, "$db": "admin"}, 2).await;
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);
    assert!(reply.get_str("version").is_ok());
    assert_eq!(reply.get_i32("bits").unwrap(), 64);

    let reply = wire::roundtrip(
        &mut stream,
        &doc! {"whatsmyuri": 1i32, "$db": "admin"},
        3,
    )
    .await;
    assert!(reply.get_str("you").unwrap().contains("127.0.0.1"));

    let reply = wire::roundtrip(
        &mut stream,
        &doc! {"getLog": "startupWarnings", "$db": "admin"},
        4,
    )
    .await;
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);
    assert!(!reply.get_array("log").unwrap().is_empty());

    let reply = wire::roundtrip(
        &mut stream,
        &doc! {"listCommands": 1i32, "$db": "admin"},
        5,
    )
    .await;
    let commands = reply.get_document("commands").unwrap();
    assert!(commands.contains_key("find"));
    assert!(commands.contains_key("getMore"));

    let reply = wire::roundtrip(
        &mut stream,
        &doc! {"serverStatus": 1i32, "$db": "admin"},
        6,
    )
    .await;
    assert_eq!(reply.get_str("process").unwrap(), "oxgate");
    assert!(reply.get_document("connections").unwrap().get_i32("current").unwrap() >= 1);

    let _ = shutdown.send(true);
    let _ = handle.await.unwrap();
}

#[tokio::test]
async fn e2e_unknown_command_and_malformed_body() {
    let mut cfg = Config::default();
    cfg.listen_addr = "127.0.0.1:0".into();

    let (_app, addr, shutdown, handle) = spawn_with_shutdown(cfg).await.unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let reply = wire::roundtrip(
        &mut stream,
        &doc! {"definitelyNotACommand": 1i32, "$db": "admin"},
        1,
    )
    .await;
    assert_eq!(reply.get_f64("ok").unwrap(), 0.0);
    assert_eq!(reply.get_i32("code").unwrap(), 59);

    // A body with duplicate top-level keys fails the request with code 22
    // but leaves the connection usable.
    let mut payload = Vec::new();
    payload.extend_from_slice(&0i32.to_le_bytes());
    for _ in 0..2 {
        payload.push(0x10);
        payload.extend_from_slice(b"ping\0");
        payload.extend_from_slice(&1i32.to_le_bytes());
    }
    payload.push(0);
    let plen = payload.len() as i32;
    payload[..4].copy_from_slice(&plen.to_le_bytes());

    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_le_bytes());
    body.push(0u8);
    body.extend_from_slice(&payload);
    let mut msg = Vec::new();
    oxgate::wire::MessageHeader {
        message_length: (oxgate::wire::HEADER_LEN + body.len()) as i32,
        request_id: 2,
        response_to: 0,
        op_code: oxgate::wire::OP_MSG,
    }
    .write_to(&mut msg);
    msg.extend_from_slice(&body);
    use tokio::io::AsyncWriteExt;
    stream.write_all(&msg).await.unwrap();

    let (hdr, reply) = wire::read_reply(&mut stream).await;
    assert_eq!(hdr.response_to, 2);
    assert_eq!(reply.get_f64("ok").unwrap(), 0.0);
    assert_eq!(reply.get_i32("code").unwrap(), 22);

    // Connection still alive
    let reply = wire::roundtrip(&mut stream, &doc! {"ping": 1i32, "$db": "admin"}, 3).await;
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);

    let _ = shutdown.send(true);
    let _ = handle.await.unwrap();
}
