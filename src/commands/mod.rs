//! Command dispatch. The table is a static match keyed by the command name
//! exactly as the wire carries it; handlers get the connection state, the
//! body document, and any kind-1 sequences that rode along.

pub mod admin;
pub mod auth;
pub mod crud;
pub mod cursors;
pub mod ddl;
pub mod diagnostics;
pub mod users;

use crate::conn::ConnState;
use crate::error::CommandError;
use crate::server::AppContext;
use crate::wire::DocumentSequence;
use bson::{Bson, Document};
use std::sync::Arc;
use std::time::Duration;

/// Every command the dispatcher knows, for `listCommands` and gating.
pub const COMMANDS: &[&str] = &[
    // handshake / diagnostics
    "hello",
    "isMaster",
    "ismaster",
    "ping",
    "buildInfo",
    "buildinfo",
    "getLog",
    "getParameter",
    "connectionStatus",
    "whatsmyuri",
    "hostInfo",
    "listCommands",
    // auth
    "saslStart",
    "saslContinue",
    "authenticate",
    "logout",
    // users
    "createUser",
    "dropUser",
    "dropAllUsersFromDatabase",
    "updateUser",
    "usersInfo",
    // crud
    "find",
    "insert",
    "update",
    "delete",
    "findAndModify",
    "count",
    "distinct",
    "aggregate",
    // cursors
    "getMore",
    "killCursors",
    // ddl
    "create",
    "drop",
    "dropDatabase",
    "createIndexes",
    "dropIndexes",
    "listCollections",
    "listDatabases",
    "listIndexes",
    "collMod",
    "renameCollection",
    // admin
    "serverStatus",
    "currentOp",
    "killOp",
    "fsync",
    "compact",
    "validate",
];

/// Commands a connection may run before authentication completes: the
/// handshake set, nothing else.
const PRE_AUTH_ALLOWED: &[&str] = &[
    "hello",
    "isMaster",
    "ismaster",
    "saslStart",
    "saslContinue",
    "ping",
    "buildInfo",
    "buildinfo",
    "getLog",
    "getParameter",
    "logout",
];

/// Generic fields every command may carry; stripped before translation and
/// exempt from unknown-field warnings.
const GENERIC_FIELDS: &[&str] = &[
    "$db",
    "$readPreference",
    "$clusterTime",
    "lsid",
    "txnNumber",
    "autocommit",
    "startTransaction",
    "apiVersion",
    "apiStrict",
    "apiDeprecationErrors",
    "maxTimeMS",
    "comment",
    "readConcern",
    "writeConcern",
];

pub fn is_supported(name: &str) -> bool {
    COMMANDS.contains(&name)
}

pub struct CommandCtx<'a> {
    pub app: Arc<AppContext>,
    pub conn: &'a mut ConnState,
    pub sequences: Vec<DocumentSequence>,
}

impl CommandCtx<'_> {
    /// A backend connection for the caller's identity (service pool when
    /// authentication is off or not yet complete).
    pub async fn backend(&self) -> Result<deadpool_postgres::Object, CommandError> {
        let result = match &self.conn.identity {
            Some(identity) => {
                self.app
                    .pools
                    .acquire(&identity.pool_key, &identity.credentials)
                    .await
            }
            None => self.app.pools.service_acquire().await,
        };
        result.map_err(|e| CommandError::internal(e.to_string()))
    }
}

/// Run one command to a reply body. Never returns a transport error: every
/// failure becomes an `{ok: 0, ...}` document.
pub async fn execute(
    app: Arc<AppContext>,
    conn: &mut ConnState,
    body: Document,
    sequences: Vec<DocumentSequence>,
) -> Document {
    let Some(name) = body.keys().next().cloned() else {
        return CommandError::bad_value("empty command document").to_document();
    };

    if app.config.auth && conn.identity.is_none() && !PRE_AUTH_ALLOWED.contains(&name.as_str())
    {
        return CommandError::authentication_failed(format!(
            "command {name} requires authentication"
        ))
        .to_document();
    }

    if !is_supported(&name) {
        tracing::warn!(conn_id = conn.id, command = %name, "unknown command");
        return CommandError::command_not_found(&name).to_document();
    }

    let deadline = match max_time_ms(&body) {
        Ok(d) => d,
        Err(e) => return e.to_document(),
    };

    let mut ctx = CommandCtx {
        app,
        conn,
        sequences,
    };

    let fut = route(&mut ctx, &name, body);
    let result = match deadline {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(r) => r,
            Err(_) => Err(CommandError::max_time_expired()),
        },
        None => fut.await,
    };

    match result {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(conn_id = ctx.conn.id, command = %name, code = e.code, error = %e.message, "command failed");
            e.to_document()
        }
    }
}

async fn route(
    ctx: &mut CommandCtx<'_>,
    name: &str,
    body: Document,
) -> Result<Document, CommandError> {
    match name {
        "hello" => diagnostics::hello(ctx, body, false).await,
        "isMaster" | "ismaster" => diagnostics::hello(ctx, body, true).await,
        "ping" => diagnostics::ping(ctx, body).await,
        "buildInfo" | "buildinfo" => diagnostics::build_info(ctx, body).await,
        "getLog" => diagnostics::get_log(ctx, body).await,
        "getParameter" => diagnostics::get_parameter(ctx, body).await,
        "connectionStatus" => diagnostics::connection_status(ctx, body).await,
        "whatsmyuri" => diagnostics::whatsmyuri(ctx, body).await,
        "hostInfo" => diagnostics::host_info(ctx, body).await,
        "listCommands" => diagnostics::list_commands(ctx, body).await,

        "saslStart" => auth::sasl_start(ctx, body).await,
        "saslContinue" => auth::sasl_continue(ctx, body).await,
        "authenticate" => auth::authenticate(ctx, body).await,
        "logout" => auth::logout(ctx, body).await,

        "createUser" => users::create_user(ctx, body).await,
        "dropUser" => users::drop_user(ctx, body).await,
        "dropAllUsersFromDatabase" => users::drop_all_users(ctx, body).await,
        "updateUser" => users::update_user(ctx, body).await,
        "usersInfo" => users::users_info(ctx, body).await,

        "find" => crud::find(ctx, body).await,
        "insert" => crud::insert(ctx, body).await,
        "update" => crud::update(ctx, body).await,
        "delete" => crud::delete(ctx, body).await,
        "findAndModify" => crud::find_and_modify(ctx, body).await,
        "count" => crud::count(ctx, body).await,
        "distinct" => crud::distinct(ctx, body).await,
        "aggregate" => crud::aggregate(ctx, body).await,

        "getMore" => cursors::get_more(ctx, body).await,
        "killCursors" => cursors::kill_cursors(ctx, body).await,

        "create" => ddl::create(ctx, body).await,
        "drop" => ddl::drop(ctx, body).await,
        "dropDatabase" => ddl::drop_database(ctx, body).await,
        "createIndexes" => ddl::create_indexes(ctx, body).await,
        "dropIndexes" => ddl::drop_indexes(ctx, body).await,
        "listCollections" => ddl::list_collections(ctx, body).await,
        "listDatabases" => ddl::list_databases(ctx, body).await,
        "listIndexes" => ddl::list_indexes(ctx, body).await,
        "collMod" => ddl::coll_mod(ctx, body).await,
        "renameCollection" => ddl::rename_collection(ctx, body).await,

        "serverStatus" => admin::server_status(ctx, body).await,
        "currentOp" => admin::current_op(ctx, body).await,
        "killOp" => admin::kill_op(ctx, body).await,
        "fsync" => admin::fsync(ctx, body).await,
        "compact" => admin::compact(ctx, body).await,
        "validate" => admin::validate(ctx, body).await,

        other => Err(CommandError::command_not_found(other)),
    }
}

/// The `$db` the command targets.
pub fn db_name(body: &Document) -> Result<String, CommandError> {
    match body.get("$db") {
        Some(Bson::String(db)) if !db.is_empty() => Ok(db.clone()),
        Some(_) => Err(CommandError::type_mismatch("$db must be a string")),
        None => Ok("admin".to_string()),
    }
}

/// The collection named by the command's first field.
pub fn collection_arg(body: &Document, command: &str) -> Result<String, CommandError> {
    match body.get(command) {
        Some(Bson::String(coll)) if !coll.is_empty() => Ok(coll.clone()),
        _ => Err(CommandError::type_mismatch(format!(
            "{command} requires a collection name string"
        ))),
    }
}

/// Accepts int32/int64/double, the numeric types drivers actually send.
pub fn numeric_arg(body: &Document, field: &str) -> Result<Option<i64>, CommandError> {
    match body.get(field) {
        None => Ok(None),
        Some(Bson::Int32(v)) => Ok(Some(*v as i64)),
        Some(Bson::Int64(v)) => Ok(Some(*v)),
        Some(Bson::Double(v)) if v.fract() == 0.0 => Ok(Some(*v as i64)),
        Some(_) => Err(CommandError::type_mismatch(format!(
            "{field} must be a number"
        ))),
    }
}

fn max_time_ms(body: &Document) -> Result<Option<Duration>, CommandError> {
    match numeric_arg(body, "maxTimeMS")? {
        None | Some(0) => Ok(None),
        Some(ms) if ms > 0 => Ok(Some(Duration::from_millis(ms as u64))),
        Some(ms) => Err(CommandError::bad_value(format!(
            "maxTimeMS must be non-negative, got {ms}"
        ))),
    }
}

/// Strip the generic fields before handing a spec to the backend, warning
/// once per unrecognized field.
pub fn backend_spec(command: &str, body: &Document, known: &[&str]) -> Document {
    let mut spec = Document::new();
    for (key, value) in body.iter() {
        if key == "$db" || GENERIC_FIELDS.contains(&key.as_str()) {
            continue;
        }
        if key != command && !known.contains(&key.as_str()) {
            tracing::warn!(command, field = %key, "ignoring unknown field");
            continue;
        }
        spec.insert(key.clone(), value.clone());
    }
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn command_table_lists_core_commands() {
        for cmd in ["hello", "find", "getMore", "killCursors", "saslStart"] {
            assert!(is_supported(cmd), "{cmd} missing");
        }
        assert!(!is_supported("mapReduce"));
        assert!(!is_supported("FIND")); // case-sensitive, as the wire carries it
    }

    #[test]
    fn db_name_defaults_to_admin() {
        assert_eq!(db_name(&doc! {"ping": 1}).unwrap(), "admin");
        assert_eq!(db_name(&doc! {"ping": 1, "$db": "app"}).unwrap(), "app");
        assert!(db_name(&doc! {"ping": 1, "$db": 3}).is_err());
    }

    #[test]
    fn collection_arg_requires_string() {
        assert_eq!(
            collection_arg(&doc! {"find": "users"}, "find").unwrap(),
            "users"
        );
        let err = collection_arg(&doc! {"find": 1}, "find").unwrap_err();
        assert_eq!(err.code, crate::error::codes::TYPE_MISMATCH);
    }

    #[test]
    fn numeric_arg_widths() {
        assert_eq!(
            numeric_arg(&doc! {"batchSize": 5i32}, "batchSize").unwrap(),
            Some(5)
        );
        assert_eq!(
            numeric_arg(&doc! {"batchSize": 5i64}, "batchSize").unwrap(),
            Some(5)
        );
        assert_eq!(
            numeric_arg(&doc! {"batchSize": 5.0}, "batchSize").unwrap(),
            Some(5)
        );
        assert!(numeric_arg(&doc! {"batchSize": "5"}, "batchSize").is_err());
    }

    #[test]
    fn max_time_ms_validation() {
        assert!(max_time_ms(&doc! {"find": "c"}).unwrap().is_none());
        assert!(max_time_ms(&doc! {"maxTimeMS": 0i32}).unwrap().is_none());
        assert_eq!(
            max_time_ms(&doc! {"maxTimeMS": 250i32}).unwrap(),
            Some(Duration::from_millis(250))
        );
        assert!(max_time_ms(&doc! {"maxTimeMS": -1i32}).is_err());
    }

    #[test]
    fn backend_spec_strips_generic_and_unknown() {
        let body = doc! {
            "find": "c",
            "filter": {"v": 1i32},
            "$db": "app",
            "lsid": {"id": 1i32},
            "mysteryKnob": true,
        };
        let spec = backend_spec("find", &body, &["filter", "batchSize"]);
        assert!(spec.contains_key("find"));
        assert!(spec.contains_key("filter"));
        assert!(!spec.contains_key("$db"));
        assert!(!spec.contains_key("lsid"));
        assert!(!spec.contains_key("mysteryKnob"));
    }
}
