//! The stored-procedure surface of the document backend. Every call passes
//! BSON bytes through `bytea` parameters and gets a MongoDB-shaped BSON
//! reply back; cursor-producing calls also return an opaque continuation.

use crate::error::{CommandError, codes};
use bson::Document;
use deadpool_postgres::Object;
use std::time::Instant;
use tokio_postgres::error::SqlState;

/// One page of a backend cursor. `continuation` is None once drained.
pub struct CursorPage {
    pub page: Document,
    pub continuation: Option<Vec<u8>>,
}

pub fn doc_to_bytes(doc: &Document) -> Result<Vec<u8>, CommandError> {
    bson::to_vec(doc).map_err(|e| CommandError::internal(format!("encode spec: {e}")))
}

pub fn doc_from_bytes(bytes: &[u8]) -> Result<Document, CommandError> {
    Document::from_reader(&mut std::io::Cursor::new(bytes))
        .map_err(|e| CommandError::internal(format!("backend reply decode: {e}")))
}

/// Fixed SQLSTATE → wire-code table.
pub fn map_sqlstate(state: &SqlState, message: String) -> CommandError {
    if *state == SqlState::UNIQUE_VIOLATION {
        CommandError::new(codes::DUPLICATE_KEY, "DuplicateKey", message)
    } else if *state == SqlState::CHECK_VIOLATION {
        CommandError::new(
            codes::DOCUMENT_VALIDATION_FAILURE,
            "DocumentValidationFailure",
            message,
        )
    } else if *state == SqlState::UNDEFINED_FUNCTION {
        CommandError::new(
            codes::LOCATION_40415,
            "Location40415",
            format!("backend document extension missing: {message}"),
        )
    } else if *state == SqlState::INSUFFICIENT_PRIVILEGE {
        CommandError::new(codes::UNAUTHORIZED, "Unauthorized", message)
    } else if *state == SqlState::INVALID_TEXT_REPRESENTATION {
        CommandError::new(codes::BAD_VALUE, "BadValue", message)
    } else if *state == SqlState::QUERY_CANCELED {
        CommandError::new(codes::MAX_TIME_MS_EXPIRED, "MaxTimeMSExpired", message)
    } else {
        CommandError::internal(message)
    }
}

pub fn map_pg_error(e: tokio_postgres::Error) -> CommandError {
    match e.code() {
        Some(state) => {
            let err = map_sqlstate(state, e.to_string());
            tracing::debug!(sqlstate = state.code(), code = err.code, "backend error mapped");
            err
        }
        None => CommandError::internal(format!("backend: {e}")),
    }
}

/// `SELECT <func>(...)` returning a single BSON reply.
async fn call_one(
    client: &Object,
    sql: &str,
    params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
) -> Result<Document, CommandError> {
    let t = Instant::now();
    let row = client.query_one(sql, params).await.map_err(map_pg_error)?;
    let bytes: Option<Vec<u8>> = row
        .try_get(0)
        .map_err(|e| CommandError::internal(format!("backend row: {e}")))?;
    let bytes =
        bytes.ok_or_else(|| CommandError::internal("backend returned a NULL reply"))?;
    tracing::debug!(sql, elapsed_ms = ?t.elapsed().as_millis(), "backend call");
    doc_from_bytes(&bytes)
}

/// `SELECT cursor_page, continuation FROM <func>(...)`.
async fn call_page(
    client: &Object,
    sql: &str,
    params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
) -> Result<CursorPage, CommandError> {
    let t = Instant::now();
    let row = client.query_one(sql, params).await.map_err(map_pg_error)?;
    let page: Option<Vec<u8>> = row
        .try_get(0)
        .map_err(|e| CommandError::internal(format!("backend row: {e}")))?;
    let page = page.ok_or_else(|| CommandError::internal("backend returned a NULL page"))?;
    let continuation: Option<Vec<u8>> = row
        .try_get(1)
        .map_err(|e| CommandError::internal(format!("backend row: {e}")))?;
    tracing::debug!(sql, elapsed_ms = ?t.elapsed().as_millis(), more = continuation.is_some(), "backend cursor call");
    Ok(CursorPage {
        page: doc_from_bytes(&page)?,
        continuation,
    })
}

pub async fn insert(
    client: &Object,
    db: &str,
    spec: &Document,
    documents: Option<&[u8]>,
) -> Result<Document, CommandError> {
    let spec = doc_to_bytes(spec)?;
    call_one(
        client,
        "SELECT documentdb_api.insert($1, $2, $3)",
        &[&db, &spec, &documents],
    )
    .await
}

pub async fn update(
    client: &Object,
    db: &str,
    spec: &Document,
    updates: Option<&[u8]>,
) -> Result<Document, CommandError> {
    let spec = doc_to_bytes(spec)?;
    call_one(
        client,
        "SELECT documentdb_api.update($1, $2, $3)",
        &[&db, &spec, &updates],
    )
    .await
}

pub async fn delete(
    client: &Object,
    db: &str,
    spec: &Document,
    deletes: Option<&[u8]>,
) -> Result<Document, CommandError> {
    let spec = doc_to_bytes(spec)?;
    call_one(
        client,
        "SELECT documentdb_api.delete($1, $2, $3)",
        &[&db, &spec, &deletes],
    )
    .await
}

pub async fn find_and_modify(
    client: &Object,
    db: &str,
    spec: &Document,
) -> Result<Document, CommandError> {
    let spec = doc_to_bytes(spec)?;
    call_one(
        client,
        "SELECT documentdb_api.find_and_modify($1, $2)",
        &[&db, &spec],
    )
    .await
}

pub async fn count(
    client: &Object,
    db: &str,
    spec: &Document,
) -> Result<Document, CommandError> {
    let spec = doc_to_bytes(spec)?;
    call_one(
        client,
        "SELECT documentdb_api.count_query($1, $2)",
        &[&db, &spec],
    )
    .await
}

pub async fn distinct(
    client: &Object,
    db: &str,
    spec: &Document,
) -> Result<Document, CommandError> {
    let spec = doc_to_bytes(spec)?;
    call_one(
        client,
        "SELECT documentdb_api.distinct_query($1, $2)",
        &[&db, &spec],
    )
    .await
}

pub async fn find_first_page(
    client: &Object,
    db: &str,
    spec: &Document,
) -> Result<CursorPage, CommandError> {
    let spec = doc_to_bytes(spec)?;
    call_page(
        client,
        "SELECT cursor_page, continuation FROM documentdb_api.find_cursor_first_page($1, $2)",
        &[&db, &spec],
    )
    .await
}

pub async fn aggregate_first_page(
    client: &Object,
    db: &str,
    spec: &Document,
) -> Result<CursorPage, CommandError> {
    let spec = doc_to_bytes(spec)?;
    call_page(
        client,
        "SELECT cursor_page, continuation FROM documentdb_api.aggregate_cursor_first_page($1, $2)",
        &[&db, &spec],
    )
    .await
}

/// Advance a backend cursor on its pinned connection.
pub async fn cursor_get_more(
    client: &Object,
    db: &str,
    spec: &Document,
    continuation: &[u8],
) -> Result<CursorPage, CommandError> {
    let spec = doc_to_bytes(spec)?;
    call_page(
        client,
        "SELECT cursor_page, continuation FROM documentdb_api.cursor_get_more($1, $2, $3)",
        &[&db, &spec, &continuation],
    )
    .await
}

pub async fn create_collection(
    client: &Object,
    db: &str,
    coll: &str,
) -> Result<(), CommandError> {
    let t = Instant::now();
    client
        .execute("SELECT documentdb_api.create_collection($1, $2)", &[&db, &coll])
        .await
        .map_err(map_pg_error)?;
    tracing::debug!(op = "create_collection", db = %db, coll = %coll, elapsed_ms = ?t.elapsed().as_millis());
    Ok(())
}

pub async fn drop_collection(
    client: &Object,
    db: &str,
    coll: &str,
) -> Result<(), CommandError> {
    client
        .execute("SELECT documentdb_api.drop_collection($1, $2)", &[&db, &coll])
        .await
        .map_err(map_pg_error)?;
    Ok(())
}

pub async fn drop_database(client: &Object, db: &str) -> Result<(), CommandError> {
    client
        .execute("SELECT documentdb_api.drop_database($1)", &[&db])
        .await
        .map_err(map_pg_error)?;
    Ok(())
}

pub async fn create_indexes(
    client: &Object,
    db: &str,
    spec: &Document,
) -> Result<Document, CommandError> {
    let spec = doc_to_bytes(spec)?;
    call_one(
        client,
        "SELECT documentdb_api.create_indexes($1, $2)",
        &[&db, &spec],
    )
    .await
}

pub async fn drop_indexes(
    client: &Object,
    db: &str,
    spec: &Document,
) -> Result<Document, CommandError> {
    let spec = doc_to_bytes(spec)?;
    call_one(
        client,
        "SELECT documentdb_api.drop_indexes($1, $2)",
        &[&db, &spec],
    )
    .await
}

pub async fn coll_mod(
    client: &Object,
    db: &str,
    coll: &str,
    spec: &Document,
) -> Result<Document, CommandError> {
    let spec = doc_to_bytes(spec)?;
    call_one(
        client,
        "SELECT documentdb_api.coll_mod($1, $2, $3)",
        &[&db, &coll, &spec],
    )
    .await
}

pub async fn rename_collection(
    client: &Object,
    db: &str,
    from: &str,
    to: &str,
    drop_target: bool,
) -> Result<(), CommandError> {
    client
        .execute(
            "SELECT documentdb_api.rename_collection($1, $2, $3, $4)",
            &[&db, &from, &to, &drop_target],
        )
        .await
        .map_err(map_pg_error)?;
    Ok(())
}

pub async fn list_collections_first_page(
    client: &Object,
    db: &str,
    spec: &Document,
) -> Result<CursorPage, CommandError> {
    let spec = doc_to_bytes(spec)?;
    call_page(
        client,
        "SELECT cursor_page, continuation FROM documentdb_api.list_collections_cursor_first_page($1, $2)",
        &[&db, &spec],
    )
    .await
}

pub async fn list_indexes_first_page(
    client: &Object,
    db: &str,
    spec: &Document,
) -> Result<CursorPage, CommandError> {
    let spec = doc_to_bytes(spec)?;
    call_page(
        client,
        "SELECT cursor_page, continuation FROM documentdb_api.list_indexes_cursor_first_page($1, $2)",
        &[&db, &spec],
    )
    .await
}

pub async fn list_databases(
    client: &Object,
    spec: &Document,
) -> Result<Document, CommandError> {
    let spec = doc_to_bytes(spec)?;
    call_one(client, "SELECT documentdb_api.list_databases($1)", &[&spec]).await
}

pub async fn create_user(client: &Object, spec: &Document) -> Result<Document, CommandError> {
    let spec = doc_to_bytes(spec)?;
    call_one(client, "SELECT documentdb_api.create_user($1)", &[&spec]).await
}

pub async fn drop_user(client: &Object, spec: &Document) -> Result<Document, CommandError> {
    let spec = doc_to_bytes(spec)?;
    call_one(client, "SELECT documentdb_api.drop_user($1)", &[&spec]).await
}

pub async fn drop_all_users(
    client: &Object,
    spec: &Document,
) -> Result<Document, CommandError> {
    let spec = doc_to_bytes(spec)?;
    call_one(
        client,
        "SELECT documentdb_api.drop_all_users_from_database($1)",
        &[&spec],
    )
    .await
}

pub async fn update_user(client: &Object, spec: &Document) -> Result<Document, CommandError> {
    let spec = doc_to_bytes(spec)?;
    call_one(client, "SELECT documentdb_api.update_user($1)", &[&spec]).await
}

pub async fn users_info(client: &Object, spec: &Document) -> Result<Document, CommandError> {
    let spec = doc_to_bytes(spec)?;
    call_one(client, "SELECT documentdb_api.users_info($1)", &[&spec]).await
}

/// The backend extension's version string, recorded in the state file for
/// upgrade gating.
pub async fn extension_version(client: &Object) -> Result<String, CommandError> {
    let row = client
        .query_one("SELECT documentdb_api.binary_extended_version()", &[])
        .await
        .map_err(map_pg_error)?;
    row.try_get(0)
        .map_err(|e| CommandError::internal(format!("backend row: {e}")))
}
