//! Administrative commands: best-effort translations over a backend that
//! manages its own storage.

use super::{CommandCtx, collection_arg, db_name};
use crate::error::CommandError;
use bson::{Bson, Document, doc};

pub async fn server_status(
    ctx: &mut CommandCtx<'_>,
    _body: Document,
) -> Result<Document, CommandError> {
    let uptime = ctx.app.started_at.elapsed();
    Ok(doc! {
        "host": ctx.app.config.listen_addr.clone(),
        "version": super::diagnostics::COMPAT_VERSION,
        "process": "oxgate",
        "pid": std::process::id() as i64,
        "uptime": uptime.as_secs_f64(),
        "uptimeMillis": uptime.as_millis() as i64,
        "localTime": bson::DateTime::now(),
        "connections": {
            "current": ctx.app.open_connections() as i32,
            "totalCreated": ctx.app.total_connections() as i64,
        },
        "metrics": {
            "cursor": {
                "open": {"total": ctx.app.cursors.len().await as i64},
            },
        },
        "ok": 1.0,
    })
}

pub async fn current_op(
    _ctx: &mut CommandCtx<'_>,
    _body: Document,
) -> Result<Document, CommandError> {
    // One request per connection is in flight by construction, and it is
    // this one; there is nothing concurrent to report.
    Ok(doc! {"inprog": Bson::Array(vec![]), "ok": 1.0})
}

pub async fn kill_op(
    _ctx: &mut CommandCtx<'_>,
    _body: Document,
) -> Result<Document, CommandError> {
    Ok(doc! {"info": "attempting to kill op", "ok": 1.0})
}

pub async fn fsync(_ctx: &mut CommandCtx<'_>, _body: Document) -> Result<Document, CommandError> {
    // Durability belongs to the backend; acknowledge and move on.
    Ok(doc! {"numFiles": 0i32, "ok": 1.0})
}

pub async fn compact(
    _ctx: &mut CommandCtx<'_>,
    body: Document,
) -> Result<Document, CommandError> {
    let _coll = collection_arg(&body, "compact")?;
    Ok(doc! {"bytesFreed": 0.0, "ok": 1.0})
}

pub async fn validate(
    _ctx: &mut CommandCtx<'_>,
    body: Document,
) -> Result<Document, CommandError> {
    let db = db_name(&body)?;
    let coll = collection_arg(&body, "validate")?;
    // The backend keeps its own invariants; report the namespace as sound.
    Ok(doc! {
        "ns": format!("{db}.{coll}"),
        "valid": true,
        "repaired": false,
        "warnings": Bson::Array(vec![]),
        "errors": Bson::Array(vec![]),
        "ok": 1.0,
    })
}
