//! End-to-end CRUD against a real document-enabled PostgreSQL backend.
//! Skipped unless OXGATE_TEST_POSTGRES_URL is set.

use bson::doc;
use oxgate::config::Config;
use oxgate::server::spawn_with_shutdown;
use rand::{Rng, distributions::Alphanumeric};
use tokio::net::TcpStream;

#[path = "common/postgres.rs"]
mod pg;
#[path = "common/wire.rs"]
mod wire;

fn rand_suffix(n: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(n)
        .map(char::from)
        .collect()
}

#[tokio::test]
async fn e2e_insert_find_roundtrip() {
    let Some(testdb) = pg::TestDb::provision_from_env() else {
        eprintln!("skipping: set OXGATE_TEST_POSTGRES_URL");
        return;
    };

    let mut cfg = Config::default();
    cfg.listen_addr = "127.0.0.1:0".into();
    cfg.postgres_url = Some(testdb.url.clone());

    let (_app, addr, shutdown, handle) = spawn_with_shutdown(cfg).await.unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let dbname = format!("crud_{}", rand_suffix(6));

    let reply = wire::roundtrip(
        &mut stream,
        &doc! {
            "insert": "c",
            "documents": [{"_id": "a", "v": 1i32}],
            "$db": &dbname,
        },
        1,
    )
    .await;
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);
    assert_eq!(reply.get_i32("n").unwrap(), 1);

    let reply = wire::roundtrip(
        &mut stream,
        &doc! {"find": "c", "filter": {"v": 1i32}, "$db": &dbname},
        2,
    )
    .await;
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);
    let cursor = reply.get_document("cursor").unwrap();
    assert_eq!(cursor.get_i64("id").unwrap(), 0);
    let batch = cursor.get_array("firstBatch").unwrap();
    assert_eq!(batch.len(), 1);
    let first = batch[0].as_document().unwrap();
    assert_eq!(first.get_str("_id").unwrap(), "a");
    assert_eq!(first.get_i32("v").unwrap(), 1);

    // Second insert of the same _id: writeErrors, not a command failure.
    let reply = wire::roundtrip(
        &mut stream,
        &doc! {
            "insert": "c",
            "documents": [{"_id": "a", "v": 2i32}],
            "$db": &dbname,
        },
        3,
    )
    .await;
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);
    assert_eq!(reply.get_i32("n").unwrap(), 0);
    let errors = reply.get_array("writeErrors").unwrap();
    let first = errors[0].as_document().unwrap();
    assert_eq!(first.get_i32("code").unwrap(), 11000);
    assert!(first.get_str("errmsg").unwrap().to_lowercase().contains("duplicate"));

    let reply = wire::roundtrip(&mut stream, &doc! {"dropDatabase": 1i32, "$db": &dbname}, 4).await;
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);

    let _ = shutdown.send(true);
    let _ = handle.await.unwrap();
}

#[tokio::test]
async fn e2e_paginated_find_getmore() {
    let Some(testdb) = pg::TestDb::provision_from_env() else {
        eprintln!("skipping: set OXGATE_TEST_POSTGRES_URL");
        return;
    };

    let mut cfg = Config::default();
    cfg.listen_addr = "127.0.0.1:0".into();
    cfg.postgres_url = Some(testdb.url.clone());

    let (_app, addr, shutdown, handle) = spawn_with_shutdown(cfg).await.unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let dbname = format!("page_{}", rand_suffix(6));

    let docs: Vec<bson::Document> = (0..250).map(|i| doc! {"i": i as i32}).collect();
    let reply = wire::roundtrip(
        &mut stream,
        &doc! {"insert": "c", "documents": docs, "$db": &dbname},
        1,
    )
    .await;
    assert_eq!(reply.get_i32("n").unwrap(), 250);

    let reply = wire::roundtrip(
        &mut stream,
        &doc! {"find": "c", "batchSize": 100i32, "$db": &dbname},
        2,
    )
    .await;
    let cursor = reply.get_document("cursor").unwrap();
    let id = cursor.get_i64("id").unwrap();
    assert_ne!(id, 0);
    assert_eq!(cursor.get_array("firstBatch").unwrap().len(), 100);

    let reply = wire::roundtrip(
        &mut stream,
        &doc! {"getMore": id, "collection": "c", "batchSize": 100i32, "$db": &dbname},
        3,
    )
    .await;
    let cursor = reply.get_document("cursor").unwrap();
    assert_eq!(cursor.get_array("nextBatch").unwrap().len(), 100);
    assert_ne!(cursor.get_i64("id").unwrap(), 0);

    let reply = wire::roundtrip(
        &mut stream,
        &doc! {"getMore": id, "collection": "c", "batchSize": 100i32, "$db": &dbname},
        4,
    )
    .await;
    let cursor = reply.get_document("cursor").unwrap();
    assert_eq!(cursor.get_array("nextBatch").unwrap().len(), 50);
    assert_eq!(cursor.get_i64("id").unwrap(), 0);

    let reply = wire::roundtrip(&mut stream, &doc! {"dropDatabase": 1i32, "$db": &dbname}, 5).await;
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);

    let _ = shutdown.send(true);
    let _ = handle.await.unwrap();
}

#[tokio::test]
async fn e2e_cursor_hidden_from_other_connection() {
    let Some(testdb) = pg::TestDb::provision_from_env() else {
        eprintln!("skipping: set OXGATE_TEST_POSTGRES_URL");
        return;
    };

    let mut cfg = Config::default();
    cfg.listen_addr = "127.0.0.1:0".into();
    cfg.postgres_url = Some(testdb.url.clone());

    let (_app, addr, shutdown, handle) = spawn_with_shutdown(cfg).await.unwrap();
    let mut conn_a = TcpStream::connect(addr).await.unwrap();
    let mut conn_b = TcpStream::connect(addr).await.unwrap();

    let dbname = format!("own_{}", rand_suffix(6));

    let docs: Vec<bson::Document> = (0..10).map(|i| doc! {"i": i as i32}).collect();
    let reply = wire::roundtrip(
        &mut conn_a,
        &doc! {"insert": "c", "documents": docs, "$db": &dbname},
        1,
    )
    .await;
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);

    let reply = wire::roundtrip(
        &mut conn_a,
        &doc! {"find": "c", "batchSize": 2i32, "$db": &dbname},
        2,
    )
    .await;
    let id = reply
        .get_document("cursor")
        .unwrap()
        .get_i64("id")
        .unwrap();
    assert_ne!(id, 0);

    // B cannot kill A's cursor.
    let reply = wire::roundtrip(
        &mut conn_b,
        &doc! {"killCursors": "c", "cursors": [id], "$db": &dbname},
        1,
    )
    .await;
    assert_eq!(
        reply.get_array("cursorsNotFound").unwrap()[0]
            .as_i64()
            .unwrap(),
        id
    );

    // A's getMore still works after B's attempt.
    let reply = wire::roundtrip(
        &mut conn_a,
        &doc! {"getMore": id, "collection": "c", "batchSize": 2i32, "$db": &dbname},
        3,
    )
    .await;
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);
    assert_eq!(
        reply
            .get_document("cursor")
            .unwrap()
            .get_array("nextBatch")
            .unwrap()
            .len(),
        2
    );

    let reply = wire::roundtrip(&mut conn_a, &doc! {"dropDatabase": 1i32, "$db": &dbname}, 4).await;
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);

    let _ = shutdown.send(true);
    let _ = handle.await.unwrap();
}
