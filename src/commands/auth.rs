//! SASL authentication commands. The SCRAM conversation itself lives in
//! `crate::scram`; this module wires it to the connection state and the
//! backend user catalog.

use super::{CommandCtx, db_name};
use crate::backend;
use crate::conn::{Identity, SaslSession};
use crate::error::{CommandError, codes};
use crate::pool::{Credentials, PoolKey};
use crate::scram::{
    Mechanism, ScramConversation, ScramCredential, parse_client_first, parse_plain,
};
use bson::{Document, doc, spec::BinarySubtype};

fn binary(bytes: Vec<u8>) -> bson::Binary {
    bson::Binary {
        subtype: BinarySubtype::Generic,
        bytes,
    }
}

fn payload_arg(body: &Document) -> Result<Vec<u8>, CommandError> {
    body.get_binary_generic("payload")
        .map(|b| b.to_vec())
        .map_err(|_| CommandError::type_mismatch("payload must be BinData"))
}

/// Uniform failure: never tells the caller whether the user exists.
fn auth_failed() -> CommandError {
    CommandError::authentication_failed("Authentication failed.")
}

pub async fn sasl_start(
    ctx: &mut CommandCtx<'_>,
    body: Document,
) -> Result<Document, CommandError> {
    let source = db_name(&body)?;
    let mechanism_name = body
        .get_str("mechanism")
        .map_err(|_| CommandError::type_mismatch("mechanism must be a string"))?;
    let mechanism = Mechanism::from_name(mechanism_name).ok_or_else(|| {
        CommandError::new(
            codes::MECHANISM_UNAVAILABLE,
            "MechanismUnavailable",
            format!("unsupported mechanism {mechanism_name}"),
        )
    })?;
    let payload = payload_arg(&body)?;

    // A restarted handshake abandons any previous conversation.
    ctx.conn.sasl = None;

    match mechanism {
        Mechanism::Plain => {
            let (username, password) = parse_plain(&payload).map_err(|e| {
                tracing::debug!(conn_id = ctx.conn.id, error = %e, "PLAIN payload rejected");
                auth_failed()
            })?;
            let pool_key =
                PoolKey::new(&username, password.as_bytes(), Mechanism::Plain, &source);
            let credentials = Credentials::Password(password);
            // The proof of the password is a successful backend session.
            ctx.app
                .pools
                .acquire(&pool_key, &credentials)
                .await
                .map_err(|e| {
                    tracing::debug!(conn_id = ctx.conn.id, user = %username, error = %e, "PLAIN backend login failed");
                    auth_failed()
                })?;
            ctx.conn.identity = Some(Identity {
                username: username.clone(),
                source,
                mechanism,
                pool_key,
                credentials,
            });
            tracing::debug!(conn_id = ctx.conn.id, user = %username, mechanism = "PLAIN", "authenticated");
            Ok(doc! {
                "conversationId": 1i32,
                "done": true,
                "payload": binary(Vec::new()),
                "ok": 1.0,
            })
        }
        Mechanism::ScramSha1 | Mechanism::ScramSha256 => {
            let client_first = parse_client_first(&payload).map_err(|e| {
                tracing::debug!(conn_id = ctx.conn.id, error = %e, "client-first rejected");
                auth_failed()
            })?;
            let credential =
                lookup_credential(ctx, &client_first.username, &source, mechanism).await?;
            let (conversation, server_first) =
                ScramConversation::start(mechanism, &client_first, credential);
            ctx.conn.sasl = Some(SaslSession {
                mechanism,
                username: client_first.username,
                source,
                conversation,
            });
            Ok(doc! {
                "conversationId": 1i32,
                "done": false,
                "payload": binary(server_first.into_bytes()),
                "ok": 1.0,
            })
        }
    }
}

pub async fn sasl_continue(
    ctx: &mut CommandCtx<'_>,
    body: Document,
) -> Result<Document, CommandError> {
    let payload = payload_arg(&body)?;

    let Some(session) = ctx.conn.sasl.take() else {
        // The driver's closing empty exchange after a completed handshake.
        if ctx.conn.identity.is_some() && payload.is_empty() {
            return Ok(doc! {
                "conversationId": 1i32,
                "done": true,
                "payload": binary(Vec::new()),
                "ok": 1.0,
            });
        }
        return Err(CommandError::new(
            codes::PROTOCOL_ERROR,
            "ProtocolError",
            "no SASL conversation in progress",
        ));
    };

    let server_final = session.conversation.finish(&payload).map_err(|e| {
        tracing::debug!(conn_id = ctx.conn.id, user = %session.username, error = %e, "SCRAM verification failed");
        auth_failed()
    })?;

    let pool_key = PoolKey::new(
        &session.username,
        session.conversation.stored_key(),
        session.mechanism,
        &session.source,
    );
    ctx.conn.identity = Some(Identity {
        username: session.username.clone(),
        source: session.source.clone(),
        mechanism: session.mechanism,
        pool_key,
        credentials: Credentials::AssumeRole,
    });
    tracing::debug!(conn_id = ctx.conn.id, user = %session.username, mechanism = session.mechanism.name(), "authenticated");

    Ok(doc! {
        "conversationId": 1i32,
        "done": true,
        "payload": binary(server_final.into_bytes()),
        "ok": 1.0,
    })
}

pub async fn authenticate(
    _ctx: &mut CommandCtx<'_>,
    body: Document,
) -> Result<Document, CommandError> {
    let mechanism = body.get_str("mechanism").unwrap_or("MONGODB-CR");
    Err(CommandError::authentication_failed(format!(
        "mechanism {mechanism} is not supported by the authenticate command; use SASL"
    )))
}

pub async fn logout(
    ctx: &mut CommandCtx<'_>,
    _body: Document,
) -> Result<Document, CommandError> {
    if let Some(identity) = ctx.conn.identity.take() {
        tracing::debug!(conn_id = ctx.conn.id, user = %identity.username, "logged out");
    }
    ctx.conn.sasl = None;
    Ok(doc! {"ok": 1.0})
}

/// Fetch the stored SCRAM verifier from the backend user catalog.
async fn lookup_credential(
    ctx: &CommandCtx<'_>,
    username: &str,
    source: &str,
    mechanism: Mechanism,
) -> Result<ScramCredential, CommandError> {
    let client = ctx.app.pools.service_acquire().await.map_err(|e| {
        tracing::debug!(error = %e, "credential lookup: no backend");
        auth_failed()
    })?;
    let spec = doc! {
        "usersInfo": {"user": username, "db": source},
        "showCredentials": true,
    };
    let reply = backend::users_info(&client, &spec).await.map_err(|e| {
        tracing::debug!(error = %e.message, "credential lookup failed");
        auth_failed()
    })?;

    let credential_doc = reply
        .get_array("users")
        .ok()
        .and_then(|users| users.first())
        .and_then(|u| u.as_document())
        .and_then(|u| u.get_document("credentials").ok())
        .and_then(|c| c.get_document(mechanism.name()).ok())
        .ok_or_else(auth_failed)?;

    ScramCredential::from_document(credential_doc).map_err(|e| {
        tracing::debug!(error = %e, "stored credential unparsable");
        auth_failed()
    })
}
