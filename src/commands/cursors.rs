//! Cursor lifecycle commands: getMore and killCursors.

use super::{CommandCtx, db_name, numeric_arg};
use crate::backend;
use crate::cursor::{CursorState, FetchOutcome, KillOutcome};
use crate::error::CommandError;
use bson::{Bson, Document, doc};

pub async fn get_more(
    ctx: &mut CommandCtx<'_>,
    body: Document,
) -> Result<Document, CommandError> {
    let db = db_name(&body)?;
    let id = match body.get("getMore") {
        Some(Bson::Int64(v)) => *v,
        Some(_) => {
            return Err(CommandError::type_mismatch(
                "getMore requires an int64 cursor id",
            ));
        }
        None => return Err(CommandError::type_mismatch("getMore missing cursor id")),
    };
    let coll = body
        .get_str("collection")
        .map_err(|_| CommandError::type_mismatch("collection must be a string"))?
        .to_string();
    let batch_size = numeric_arg(&body, "batchSize")?;

    let entry = ctx
        .app
        .cursors
        .fetch(id, ctx.conn.id)
        .await
        .map_err(|outcome| match outcome {
            FetchOutcome::NotFound => {
                CommandError::cursor_not_found(format!("cursor id {id} not found"))
            }
            FetchOutcome::NotOwned => CommandError::cursor_not_owned(format!(
                "cursor id {id} was created by another connection"
            )),
        })?;

    let mut cursor = entry.lock().await;
    // The cursor is addressed by (id, namespace); a wrong namespace is
    // indistinguishable from a missing cursor.
    if cursor.db != db || cursor.coll != coll {
        return Err(CommandError::cursor_not_found(format!(
            "cursor id {id} not found in {db}.{coll}"
        )));
    }
    cursor.touch();
    cursor.state = CursorState::Iterating;

    let Some(continuation) = cursor.stream.continuation.clone() else {
        // A tailable cursor with nothing to stream is idle, not dead: it
        // stays registered so the client can poll again.
        if cursor.tailable {
            cursor.state = CursorState::Open;
            return Ok(doc! {
                "cursor": {
                    "id": id,
                    "ns": format!("{db}.{coll}"),
                    "nextBatch": Bson::Array(vec![]),
                },
                "ok": 1.0,
            });
        }
        drop(cursor);
        ctx.app.cursors.remove(id).await;
        return Ok(doc! {
            "cursor": {
                "id": 0i64,
                "ns": format!("{db}.{coll}"),
                "nextBatch": Bson::Array(vec![]),
            },
            "ok": 1.0,
        });
    };

    let spec = doc! {
        "getMore": id,
        "collection": coll.clone(),
        "batchSize": batch_size.unwrap_or(cursor.batch_size as i64) as i32,
    };
    let client = cursor
        .stream
        .client
        .as_ref()
        .ok_or_else(|| CommandError::internal("cursor lost its backend connection"))?;
    let page = backend::cursor_get_more(client, &db, &spec, &continuation).await?;

    let exhausted = match page.continuation {
        Some(next) => {
            cursor.stream.continuation = Some(next);
            cursor.state = CursorState::Open;
            false
        }
        // "No new data yet" for a tailable cursor: keep the retained
        // continuation and let the next getMore poll it again.
        None if cursor.tailable => {
            cursor.state = CursorState::Open;
            false
        }
        None => {
            cursor.state = CursorState::Exhausted;
            true
        }
    };
    drop(cursor);
    if exhausted {
        ctx.app.cursors.remove(id).await;
    }

    let mut reply = page.page;
    match reply.get_document_mut("cursor") {
        Ok(cursor_doc) => {
            cursor_doc.insert("id", if exhausted { 0i64 } else { id });
            cursor_doc.insert("ns", format!("{db}.{coll}"));
        }
        Err(_) => {
            return Err(CommandError::internal(
                "backend getMore reply missing cursor document",
            ));
        }
    }
    if !reply.contains_key("ok") {
        reply.insert("ok", 1.0);
    }
    Ok(reply)
}

pub async fn kill_cursors(
    ctx: &mut CommandCtx<'_>,
    body: Document,
) -> Result<Document, CommandError> {
    if body.get_str("killCursors").is_err() {
        return Err(CommandError::type_mismatch(
            "killCursors requires a collection name string",
        ));
    }
    let ids = body
        .get_array("cursors")
        .map_err(|_| CommandError::type_mismatch("cursors must be an array"))?;
    if ids.is_empty() {
        return Err(CommandError::bad_value(
            "cursors must contain at least one id",
        ));
    }

    let mut killed = Vec::new();
    let mut not_found = Vec::new();
    for entry in ids {
        let Bson::Int64(id) = entry else {
            return Err(CommandError::type_mismatch(
                "cursors must be int64 cursor ids",
            ));
        };
        match ctx.app.cursors.kill(*id, ctx.conn.id).await {
            KillOutcome::Killed => killed.push(Bson::Int64(*id)),
            // Foreign cursors stay hidden: not-owned reads as not-found.
            KillOutcome::NotFound | KillOutcome::NotOwned => {
                not_found.push(Bson::Int64(*id));
            }
        }
    }

    Ok(doc! {
        "cursorsKilled": killed,
        "cursorsNotFound": not_found,
        "cursorsAlive": Bson::Array(vec![]),
        "cursorsUnknown": Bson::Array(vec![]),
        "ok": 1.0,
    })
}
