//! Handshake and diagnostic commands. None of these touch the backend.

use super::{COMMANDS, CommandCtx};
use crate::error::CommandError;
use crate::scram::SUPPORTED_MECHANISMS;
use crate::wire::Compressor;
use bson::{Bson, Document, doc};

/// MongoDB server version the gateway reports to drivers.
pub const COMPAT_VERSION: &str = "7.0.0";
pub const MAX_BSON_OBJECT_SIZE: i32 = 16 * 1024 * 1024;
pub const MAX_WRITE_BATCH_SIZE: i32 = 100_000;
pub const MIN_WIRE_VERSION: i32 = 0;
pub const MAX_WIRE_VERSION: i32 = 21;

pub async fn hello(
    ctx: &mut CommandCtx<'_>,
    body: Document,
    legacy: bool,
) -> Result<Document, CommandError> {
    let mut reply = Document::new();
    if legacy {
        reply.insert("ismaster", true);
    } else {
        reply.insert("isWritablePrimary", true);
    }
    reply.insert("maxBsonObjectSize", MAX_BSON_OBJECT_SIZE);
    reply.insert(
        "maxMessageSizeBytes",
        ctx.app.config.max_message_size() as i32,
    );
    reply.insert("maxWriteBatchSize", MAX_WRITE_BATCH_SIZE);
    reply.insert("localTime", bson::DateTime::now());
    reply.insert("logicalSessionTimeoutMinutes", 30i32);
    reply.insert("connectionId", ctx.conn.id as i64);
    reply.insert("minWireVersion", MIN_WIRE_VERSION);
    reply.insert("maxWireVersion", MAX_WIRE_VERSION);
    reply.insert("readOnly", false);

    // Compression negotiation: intersect the client's offer with what we
    // speak, preserving the client's preference order.
    if let Ok(offered) = body.get_array("compression") {
        let mut accepted = Vec::new();
        for entry in offered {
            if let Bson::String(name) = entry {
                if let Some(c) = Compressor::from_name(name) {
                    accepted.push(c);
                }
            }
        }
        if let Some(first) = accepted.iter().find(|c| **c != Compressor::Noop) {
            ctx.conn.negotiated = Some(*first);
        }
        if !accepted.is_empty() {
            reply.insert(
                "compression",
                accepted
                    .iter()
                    .map(|c| Bson::String(c.name().to_string()))
                    .collect::<Vec<_>>(),
            );
        }
    }

    if body.contains_key("saslSupportedMechs") {
        reply.insert(
            "saslSupportedMechs",
            SUPPORTED_MECHANISMS
                .iter()
                .map(|m| Bson::String((*m).to_string()))
                .collect::<Vec<_>>(),
        );
    }

    reply.insert("ok", 1.0);
    Ok(reply)
}

pub async fn ping(_ctx: &mut CommandCtx<'_>, _body: Document) -> Result<Document, CommandError> {
    Ok(doc! {"ok": 1.0})
}

pub async fn build_info(
    _ctx: &mut CommandCtx<'_>,
    _body: Document,
) -> Result<Document, CommandError> {
    let (major, minor, patch) = version_triplet();
    Ok(doc! {
        "version": COMPAT_VERSION,
        "gitVersion": "",
        "modules": Bson::Array(vec![]),
        "sysInfo": "deprecated",
        "versionArray": [7i32, 0i32, 0i32, 0i32],
        "bits": 64i32,
        "debug": false,
        "maxBsonObjectSize": MAX_BSON_OBJECT_SIZE,
        "buildEnvironment": {},
        "oxgate": {
            "version": env!("CARGO_PKG_VERSION"),
            "versionArray": [major, minor, patch],
        },
        "ok": 1.0,
    })
}

pub async fn get_log(
    _ctx: &mut CommandCtx<'_>,
    body: Document,
) -> Result<Document, CommandError> {
    match body.get_str("getLog") {
        Ok("startupWarnings") => {
            let line = format!(
                "oxgate {} serving the MongoDB wire protocol over a document-enabled PostgreSQL backend",
                env!("CARGO_PKG_VERSION")
            );
            Ok(doc! {
                "totalLinesWritten": 1i32,
                "log": [line],
                "ok": 1.0,
            })
        }
        Ok("*") => Ok(doc! {
            "names": ["startupWarnings"],
            "ok": 1.0,
        }),
        Ok(other) => Err(CommandError::bad_value(format!(
            "no RamLog named: {other}"
        ))),
        Err(_) => Err(CommandError::type_mismatch("getLog requires a string")),
    }
}

pub async fn get_parameter(
    _ctx: &mut CommandCtx<'_>,
    body: Document,
) -> Result<Document, CommandError> {
    let all = matches!(body.get_str("getParameter"), Ok("*"));
    let mut reply = Document::new();
    let known: [(&str, Bson); 2] = [
        (
            "featureCompatibilityVersion",
            Bson::Document(doc! {"version": "7.0"}),
        ),
        ("quiet", Bson::Boolean(false)),
    ];
    for (name, value) in known {
        if all || body.contains_key(name) {
            reply.insert(name, value);
        }
    }
    reply.insert("ok", 1.0);
    Ok(reply)
}

pub async fn connection_status(
    ctx: &mut CommandCtx<'_>,
    _body: Document,
) -> Result<Document, CommandError> {
    let users = match &ctx.conn.identity {
        Some(identity) => vec![Bson::Document(doc! {
            "user": identity.username.clone(),
            "db": identity.source.clone(),
        })],
        None => vec![],
    };
    Ok(doc! {
        "authInfo": {
            "authenticatedUsers": users,
            "authenticatedUserRoles": Bson::Array(vec![]),
        },
        "ok": 1.0,
    })
}

pub async fn whatsmyuri(
    ctx: &mut CommandCtx<'_>,
    _body: Document,
) -> Result<Document, CommandError> {
    Ok(doc! {"you": ctx.conn.remote.clone(), "ok": 1.0})
}

pub async fn host_info(
    _ctx: &mut CommandCtx<'_>,
    _body: Document,
) -> Result<Document, CommandError> {
    Ok(doc! {
        "system": {
            "currentTime": bson::DateTime::now(),
            "cpuAddrSize": 64i32,
            "numCores": std::thread::available_parallelism().map(|n| n.get() as i32).unwrap_or(1),
        },
        "os": {
            "type": std::env::consts::OS,
        },
        "extra": {},
        "ok": 1.0,
    })
}

pub async fn list_commands(
    _ctx: &mut CommandCtx<'_>,
    _body: Document,
) -> Result<Document, CommandError> {
    let mut commands = Document::new();
    let mut sorted: Vec<&str> = COMMANDS.to_vec();
    sorted.sort_unstable();
    for name in sorted {
        commands.insert(name, doc! {"help": ""});
    }
    Ok(doc! {"commands": commands, "ok": 1.0})
}

fn version_triplet() -> (i32, i32, i32) {
    let mut parts = env!("CARGO_PKG_VERSION").split('.');
    let mut next = || {
        parts
            .next()
            .and_then(|p| p.parse::<i32>().ok())
            .unwrap_or(0)
    };
    (next(), next(), next())
}
