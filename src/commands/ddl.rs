//! DDL commands, delegated to the backend catalog procedures.

use super::{CommandCtx, backend_spec, collection_arg, db_name, numeric_arg};
use crate::backend;
use crate::commands::crud::{DEFAULT_BATCH_SIZE, finish_cursor_reply};
use crate::error::CommandError;
use bson::{Document, doc};

pub async fn create(ctx: &mut CommandCtx<'_>, body: Document) -> Result<Document, CommandError> {
    let db = db_name(&body)?;
    let coll = collection_arg(&body, "create")?;
    let client = ctx.backend().await?;
    backend::create_collection(&client, &db, &coll).await?;
    Ok(doc! {"ok": 1.0})
}

pub async fn drop(ctx: &mut CommandCtx<'_>, body: Document) -> Result<Document, CommandError> {
    let db = db_name(&body)?;
    let coll = collection_arg(&body, "drop")?;
    let client = ctx.backend().await?;
    backend::drop_collection(&client, &db, &coll).await?;
    Ok(doc! {"ns": format!("{db}.{coll}"), "ok": 1.0})
}

pub async fn drop_database(
    ctx: &mut CommandCtx<'_>,
    body: Document,
) -> Result<Document, CommandError> {
    let db = db_name(&body)?;
    let client = ctx.backend().await?;
    backend::drop_database(&client, &db).await?;
    Ok(doc! {"dropped": db, "ok": 1.0})
}

pub async fn create_indexes(
    ctx: &mut CommandCtx<'_>,
    body: Document,
) -> Result<Document, CommandError> {
    let db = db_name(&body)?;
    let _coll = collection_arg(&body, "createIndexes")?;
    if body.get_array("indexes").is_err() {
        return Err(CommandError::type_mismatch(
            "createIndexes requires an indexes array",
        ));
    }
    let spec = backend_spec("createIndexes", &body, &["indexes", "commitQuorum"]);
    let client = ctx.backend().await?;
    let mut reply = backend::create_indexes(&client, &db, &spec).await?;
    if !reply.contains_key("ok") {
        reply.insert("ok", 1.0);
    }
    Ok(reply)
}

pub async fn drop_indexes(
    ctx: &mut CommandCtx<'_>,
    body: Document,
) -> Result<Document, CommandError> {
    let db = db_name(&body)?;
    let _coll = collection_arg(&body, "dropIndexes")?;
    let spec = backend_spec("dropIndexes", &body, &["index"]);
    let client = ctx.backend().await?;
    let mut reply = backend::drop_indexes(&client, &db, &spec).await?;
    if !reply.contains_key("ok") {
        reply.insert("ok", 1.0);
    }
    Ok(reply)
}

pub async fn list_collections(
    ctx: &mut CommandCtx<'_>,
    body: Document,
) -> Result<Document, CommandError> {
    let db = db_name(&body)?;
    let batch_size = body
        .get_document("cursor")
        .ok()
        .and_then(|c| numeric_arg(c, "batchSize").ok().flatten())
        .unwrap_or(DEFAULT_BATCH_SIZE as i64) as i32;
    let spec = backend_spec(
        "listCollections",
        &body,
        &["filter", "nameOnly", "authorizedCollections", "cursor"],
    );
    let client = ctx.backend().await?;
    let page = backend::list_collections_first_page(&client, &db, &spec).await?;
    finish_cursor_reply(
        ctx,
        client,
        page,
        &db,
        "$cmd.listCollections",
        false,
        batch_size,
    )
    .await
}

pub async fn list_databases(
    ctx: &mut CommandCtx<'_>,
    body: Document,
) -> Result<Document, CommandError> {
    let spec = backend_spec(
        "listDatabases",
        &body,
        &["filter", "nameOnly", "authorizedDatabases"],
    );
    let client = ctx.backend().await?;
    let mut reply = backend::list_databases(&client, &spec).await?;
    if !reply.contains_key("ok") {
        reply.insert("ok", 1.0);
    }
    Ok(reply)
}

pub async fn list_indexes(
    ctx: &mut CommandCtx<'_>,
    body: Document,
) -> Result<Document, CommandError> {
    let db = db_name(&body)?;
    let coll = collection_arg(&body, "listIndexes")?;
    let batch_size = body
        .get_document("cursor")
        .ok()
        .and_then(|c| numeric_arg(c, "batchSize").ok().flatten())
        .unwrap_or(DEFAULT_BATCH_SIZE as i64) as i32;
    let spec = backend_spec("listIndexes", &body, &["cursor"]);
    let client = ctx.backend().await?;
    let page = backend::list_indexes_first_page(&client, &db, &spec).await?;
    finish_cursor_reply(ctx, client, page, &db, &coll, false, batch_size).await
}

pub async fn coll_mod(
    ctx: &mut CommandCtx<'_>,
    body: Document,
) -> Result<Document, CommandError> {
    let db = db_name(&body)?;
    let coll = collection_arg(&body, "collMod")?;
    let spec = backend_spec(
        "collMod",
        &body,
        &["index", "validator", "validationLevel", "validationAction", "viewOn", "pipeline"],
    );
    let client = ctx.backend().await?;
    let mut reply = backend::coll_mod(&client, &db, &coll, &spec).await?;
    if !reply.contains_key("ok") {
        reply.insert("ok", 1.0);
    }
    Ok(reply)
}

/// `renameCollection` addresses both sides as full namespaces; the backend
/// renames within one database only.
pub async fn rename_collection(
    ctx: &mut CommandCtx<'_>,
    body: Document,
) -> Result<Document, CommandError> {
    let from_ns = body
        .get_str("renameCollection")
        .map_err(|_| CommandError::type_mismatch("renameCollection requires a namespace string"))?;
    let to_ns = body
        .get_str("to")
        .map_err(|_| CommandError::type_mismatch("to must be a namespace string"))?;
    let drop_target = body.get_bool("dropTarget").unwrap_or(false);

    let (from_db, from_coll) = from_ns
        .split_once('.')
        .ok_or_else(|| CommandError::bad_value(format!("invalid namespace {from_ns}")))?;
    let (to_db, to_coll) = to_ns
        .split_once('.')
        .ok_or_else(|| CommandError::bad_value(format!("invalid namespace {to_ns}")))?;
    if from_db != to_db {
        return Err(CommandError::bad_value(
            "renameCollection cannot move a collection between databases",
        ));
    }

    let client = ctx.backend().await?;
    backend::rename_collection(&client, from_db, from_coll, to_coll, drop_target).await?;
    Ok(doc! {"ok": 1.0})
}
