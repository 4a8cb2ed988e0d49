//! User management, delegated to the backend user API. The gateway never
//! hashes passwords itself; the backend stores the SCRAM verifiers it later
//! serves back for authentication.

use super::{CommandCtx, backend_spec, db_name};
use crate::backend;
use crate::error::CommandError;
use bson::Document;

fn with_db(mut spec: Document, db: &str) -> Document {
    spec.insert("$db", db);
    spec
}

fn ensure_ok(mut reply: Document) -> Document {
    if !reply.contains_key("ok") {
        reply.insert("ok", 1.0);
    }
    reply
}

pub async fn create_user(
    ctx: &mut CommandCtx<'_>,
    body: Document,
) -> Result<Document, CommandError> {
    let db = db_name(&body)?;
    if body.get_str("createUser").is_err() {
        return Err(CommandError::type_mismatch(
            "createUser requires a user name string",
        ));
    }
    let spec = with_db(
        backend_spec(
            "createUser",
            &body,
            &["pwd", "roles", "mechanisms", "customData", "digestPassword"],
        ),
        &db,
    );
    let client = ctx.backend().await?;
    let reply = backend::create_user(&client, &spec).await?;
    Ok(ensure_ok(reply))
}

pub async fn drop_user(
    ctx: &mut CommandCtx<'_>,
    body: Document,
) -> Result<Document, CommandError> {
    let db = db_name(&body)?;
    let username = body
        .get_str("dropUser")
        .map_err(|_| CommandError::type_mismatch("dropUser requires a user name string"))?
        .to_string();
    let spec = with_db(backend_spec("dropUser", &body, &[]), &db);
    let client = ctx.backend().await?;
    let reply = backend::drop_user(&client, &spec).await?;
    // Cached backend sessions for the dropped user must not outlive it.
    ctx.app.pools.invalidate_user(&username).await;
    Ok(ensure_ok(reply))
}

pub async fn drop_all_users(
    ctx: &mut CommandCtx<'_>,
    body: Document,
) -> Result<Document, CommandError> {
    let db = db_name(&body)?;
    let spec = with_db(backend_spec("dropAllUsersFromDatabase", &body, &[]), &db);
    let client = ctx.backend().await?;
    let reply = backend::drop_all_users(&client, &spec).await?;
    ctx.app.pools.invalidate_all().await;
    Ok(ensure_ok(reply))
}

pub async fn update_user(
    ctx: &mut CommandCtx<'_>,
    body: Document,
) -> Result<Document, CommandError> {
    let db = db_name(&body)?;
    let username = body
        .get_str("updateUser")
        .map_err(|_| CommandError::type_mismatch("updateUser requires a user name string"))?
        .to_string();
    let spec = with_db(
        backend_spec(
            "updateUser",
            &body,
            &["pwd", "roles", "mechanisms", "customData"],
        ),
        &db,
    );
    let client = ctx.backend().await?;
    let reply = backend::update_user(&client, &spec).await?;
    // A password change rotates the pool key; drop the stale pool now.
    ctx.app.pools.invalidate_user(&username).await;
    Ok(ensure_ok(reply))
}

pub async fn users_info(
    ctx: &mut CommandCtx<'_>,
    body: Document,
) -> Result<Document, CommandError> {
    let db = db_name(&body)?;
    let spec = with_db(
        backend_spec(
            "usersInfo",
            &body,
            &["showCredentials", "showPrivileges", "filter"],
        ),
        &db,
    );
    let client = ctx.backend().await?;
    let reply = backend::users_info(&client, &spec).await?;
    Ok(ensure_ok(reply))
}
