//! CRUD commands. Each translates to one backend call; cursor-producing
//! commands register the continuation with the cursor registry and rewrite
//! the backend cursor id with the wire-visible one.

use super::{CommandCtx, backend_spec, collection_arg, db_name, numeric_arg};
use crate::backend::{self, CursorPage};
use crate::cursor::CursorStream;
use crate::error::{CommandError, codes};
use bson::{Bson, Document, doc};

pub const DEFAULT_BATCH_SIZE: i32 = 101;

/// Register the continuation (if any) and stamp the registry cursor id and
/// namespace into the reply.
pub(super) async fn finish_cursor_reply(
    ctx: &mut CommandCtx<'_>,
    client: deadpool_postgres::Object,
    page: CursorPage,
    db: &str,
    coll: &str,
    tailable: bool,
    batch_size: i32,
) -> Result<Document, CommandError> {
    let id = match page.continuation {
        Some(continuation) => {
            ctx.app
                .cursors
                .allocate(
                    ctx.conn.id,
                    db.to_string(),
                    coll.to_string(),
                    tailable,
                    batch_size,
                    CursorStream {
                        client: Some(client),
                        continuation: Some(continuation),
                    },
                )
                .await
        }
        None => 0,
    };

    let mut reply = page.page;
    match reply.get_document_mut("cursor") {
        Ok(cursor_doc) => {
            cursor_doc.insert("id", id);
            cursor_doc.insert("ns", format!("{db}.{coll}"));
        }
        Err(_) => {
            return Err(CommandError::internal(
                "backend cursor reply missing cursor document",
            ));
        }
    }
    ensure_ok(&mut reply);
    Ok(reply)
}

fn ensure_ok(reply: &mut Document) {
    if !reply.contains_key("ok") {
        reply.insert("ok", 1.0);
    }
}

/// Pull one kind-1 sequence out of the request and re-pack it as the
/// backend's concatenated-BSON parameter.
fn take_sequence_bytes(
    ctx: &mut CommandCtx<'_>,
    identifier: &str,
) -> Result<Option<Vec<u8>>, CommandError> {
    let Some(idx) = ctx
        .sequences
        .iter()
        .position(|s| s.identifier == identifier)
    else {
        return Ok(None);
    };
    let seq = ctx.sequences.remove(idx);
    let mut out = Vec::new();
    for d in &seq.documents {
        out.extend_from_slice(&backend::doc_to_bytes(d)?);
    }
    Ok(Some(out))
}

/// Shape a duplicate-key failure as per-document writeErrors, the way
/// drivers expect write commands to fail.
fn write_error_reply(e: CommandError, n_modified: Option<i32>) -> Document {
    let mut reply = doc! {
        "n": 0i32,
        "writeErrors": [{
            "index": 0i32,
            "code": e.code,
            "errmsg": e.message,
        }],
    };
    if let Some(nm) = n_modified {
        reply.insert("nModified", nm);
    }
    reply.insert("ok", 1.0);
    reply
}

pub async fn find(ctx: &mut CommandCtx<'_>, body: Document) -> Result<Document, CommandError> {
    let db = db_name(&body)?;
    let coll = collection_arg(&body, "find")?;
    let batch_size = numeric_arg(&body, "batchSize")?.unwrap_or(DEFAULT_BATCH_SIZE as i64) as i32;
    if batch_size < 0 {
        return Err(CommandError::bad_value("batchSize must be non-negative"));
    }
    let tailable = matches!(body.get("tailable"), Some(Bson::Boolean(true)));
    let spec = backend_spec(
        "find",
        &body,
        &[
            "filter",
            "sort",
            "projection",
            "hint",
            "skip",
            "limit",
            "batchSize",
            "singleBatch",
            "tailable",
            "awaitData",
            "noCursorTimeout",
            "allowDiskUse",
            "collation",
            "let",
            "min",
            "max",
            "returnKey",
            "showRecordId",
        ],
    );

    let client = ctx.backend().await?;
    let page = backend::find_first_page(&client, &db, &spec).await?;
    finish_cursor_reply(ctx, client, page, &db, &coll, tailable, batch_size).await
}

pub async fn aggregate(
    ctx: &mut CommandCtx<'_>,
    body: Document,
) -> Result<Document, CommandError> {
    let db = db_name(&body)?;
    // `aggregate: 1` targets the database rather than a collection.
    let coll = match body.get("aggregate") {
        Some(Bson::String(coll)) if !coll.is_empty() => coll.clone(),
        Some(Bson::Int32(1)) | Some(Bson::Int64(1)) => "$cmd.aggregate".to_string(),
        _ => {
            return Err(CommandError::type_mismatch(
                "aggregate requires a collection name or 1",
            ));
        }
    };
    let batch_size = body
        .get_document("cursor")
        .ok()
        .and_then(|c| numeric_arg(c, "batchSize").ok().flatten())
        .unwrap_or(DEFAULT_BATCH_SIZE as i64) as i32;
    let spec = backend_spec(
        "aggregate",
        &body,
        &[
            "pipeline",
            "cursor",
            "explain",
            "allowDiskUse",
            "bypassDocumentValidation",
            "hint",
            "collation",
            "let",
        ],
    );
    if !spec.contains_key("pipeline") {
        return Err(CommandError::type_mismatch("aggregate requires a pipeline"));
    }

    let client = ctx.backend().await?;
    let page = backend::aggregate_first_page(&client, &db, &spec).await?;
    finish_cursor_reply(ctx, client, page, &db, &coll, false, batch_size).await
}

pub async fn insert(ctx: &mut CommandCtx<'_>, body: Document) -> Result<Document, CommandError> {
    let db = db_name(&body)?;
    let _coll = collection_arg(&body, "insert")?;
    let documents = take_sequence_bytes(ctx, "documents")?;
    let spec = backend_spec(
        "insert",
        &body,
        &["documents", "ordered", "bypassDocumentValidation"],
    );
    if documents.is_none() && !spec.contains_key("documents") {
        return Err(CommandError::type_mismatch("insert requires documents"));
    }

    let client = ctx.backend().await?;
    match backend::insert(&client, &db, &spec, documents.as_deref()).await {
        Ok(mut reply) => {
            ensure_ok(&mut reply);
            Ok(reply)
        }
        Err(e) if e.code == codes::DUPLICATE_KEY => Ok(write_error_reply(e, None)),
        Err(e) => Err(e),
    }
}

pub async fn update(ctx: &mut CommandCtx<'_>, body: Document) -> Result<Document, CommandError> {
    let db = db_name(&body)?;
    let _coll = collection_arg(&body, "update")?;
    let updates = take_sequence_bytes(ctx, "updates")?;
    let spec = backend_spec(
        "update",
        &body,
        &["updates", "ordered", "bypassDocumentValidation", "let"],
    );
    if updates.is_none() && !spec.contains_key("updates") {
        return Err(CommandError::type_mismatch("update requires updates"));
    }

    let client = ctx.backend().await?;
    match backend::update(&client, &db, &spec, updates.as_deref()).await {
        Ok(mut reply) => {
            ensure_ok(&mut reply);
            Ok(reply)
        }
        Err(e) if e.code == codes::DUPLICATE_KEY => Ok(write_error_reply(e, Some(0))),
        Err(e) => Err(e),
    }
}

pub async fn delete(ctx: &mut CommandCtx<'_>, body: Document) -> Result<Document, CommandError> {
    let db = db_name(&body)?;
    let _coll = collection_arg(&body, "delete")?;
    let deletes = take_sequence_bytes(ctx, "deletes")?;
    let spec = backend_spec("delete", &body, &["deletes", "ordered", "let"]);
    if deletes.is_none() && !spec.contains_key("deletes") {
        return Err(CommandError::type_mismatch("delete requires deletes"));
    }

    let client = ctx.backend().await?;
    let mut reply = backend::delete(&client, &db, &spec, deletes.as_deref()).await?;
    ensure_ok(&mut reply);
    Ok(reply)
}

pub async fn find_and_modify(
    ctx: &mut CommandCtx<'_>,
    body: Document,
) -> Result<Document, CommandError> {
    let db = db_name(&body)?;
    let _coll = collection_arg(&body, "findAndModify")?;
    let spec = backend_spec(
        "findAndModify",
        &body,
        &[
            "query",
            "sort",
            "remove",
            "update",
            "new",
            "fields",
            "upsert",
            "bypassDocumentValidation",
            "arrayFilters",
            "collation",
            "let",
        ],
    );

    let client = ctx.backend().await?;
    let mut reply = backend::find_and_modify(&client, &db, &spec).await?;
    ensure_ok(&mut reply);
    Ok(reply)
}

pub async fn count(ctx: &mut CommandCtx<'_>, body: Document) -> Result<Document, CommandError> {
    let db = db_name(&body)?;
    let _coll = collection_arg(&body, "count")?;
    let spec = backend_spec(
        "count",
        &body,
        &["query", "limit", "skip", "hint", "collation"],
    );

    let client = ctx.backend().await?;
    let mut reply = backend::count(&client, &db, &spec).await?;
    ensure_ok(&mut reply);
    Ok(reply)
}

pub async fn distinct(
    ctx: &mut CommandCtx<'_>,
    body: Document,
) -> Result<Document, CommandError> {
    let db = db_name(&body)?;
    let _coll = collection_arg(&body, "distinct")?;
    if body.get_str("key").is_err() {
        return Err(CommandError::type_mismatch("distinct requires a string key"));
    }
    let spec = backend_spec("distinct", &body, &["key", "query", "collation"]);

    let client = ctx.backend().await?;
    let mut reply = backend::distinct(&client, &db, &spec).await?;
    ensure_ok(&mut reply);
    Ok(reply)
}
