//! One task per accepted socket: read a framed request, run it, write the
//! reply. Strictly sequential per connection, so replies always leave in
//! arrival order.

use crate::commands;
use crate::error::{CommandError, Error, Result};
use crate::pool::{Credentials, PoolKey};
use crate::scram::{Mechanism, ScramConversation};
use crate::server::AppContext;
use crate::wire::{self, Compressor, OpQuery, Request, compress, op_msg};
use bson::Document;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

/// The wire identity, immutable once set except through `logout`.
pub struct Identity {
    pub username: String,
    pub source: String,
    pub mechanism: Mechanism,
    pub pool_key: PoolKey,
    pub credentials: Credentials,
}

/// An unfinished SCRAM handshake between saslStart and saslContinue.
pub struct SaslSession {
    pub mechanism: Mechanism,
    pub username: String,
    pub source: String,
    pub conversation: ScramConversation,
}

pub struct ConnState {
    pub id: u64,
    pub remote: String,
    pub identity: Option<Identity>,
    pub negotiated: Option<Compressor>,
    pub sasl: Option<SaslSession>,
    pub last_request_id: i32,
}

impl ConnState {
    pub fn new(id: u64, remote: String) -> Self {
        Self {
            id,
            remote,
            identity: None,
            negotiated: None,
            sasl: None,
            last_request_id: 0,
        }
    }
}

/// Drive one connection until EOF, a fatal wire error, or shutdown.
pub async fn serve<S>(
    mut stream: S,
    app: Arc<AppContext>,
    conn_id: u64,
    remote: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut state = ConnState::new(conn_id, remote);
    let max_len = app.config.max_message_size();
    let threshold = app.config.compression_threshold();
    let read_timeout = app
        .config
        .read_timeout_secs
        .map(std::time::Duration::from_secs);

    loop {
        let next = tokio::select! {
            r = async {
                match read_timeout {
                    Some(limit) => {
                        match tokio::time::timeout(limit, wire::read_message(&mut stream, max_len)).await {
                            Ok(result) => result,
                            Err(_) => Err(Error::Wire("timed out waiting for a request".into())),
                        }
                    }
                    None => wire::read_message(&mut stream, max_len).await,
                }
            } => r,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::debug!(conn_id, "connection draining on shutdown");
                    break;
                }
                continue;
            }
        };

        let (header, request) = match next {
            Ok(Some(message)) => message,
            Ok(None) => break, // clean close
            Err(e) => {
                let _ = stream.shutdown().await;
                return Err(e);
            }
        };
        state.last_request_id = header.request_id;

        match request {
            Request::Msg(msg) => {
                let suppress_reply = msg.more_to_come();
                // Compression negotiated by this very request only applies
                // from the next reply on.
                let negotiated = state.negotiated;
                let reply =
                    commands::execute(app.clone(), &mut state, msg.body, msg.sequences).await;
                if suppress_reply {
                    continue;
                }
                write_op_msg_reply(
                    &mut stream,
                    &app,
                    &reply,
                    header.request_id,
                    negotiated,
                    threshold,
                )
                .await?;
            }
            Request::Query(query) => {
                let reply = handle_op_query(&app, &mut state, query).await;
                let out =
                    wire::encode_op_reply(&[reply], header.request_id, app.next_request_id());
                stream.write_all(&out).await?;
            }
            Request::Malformed(e) => {
                tracing::warn!(conn_id, request_id = header.request_id, error = %e, "malformed request body");
                let reply = CommandError::from(e).to_document();
                write_op_msg_reply(
                    &mut stream,
                    &app,
                    &reply,
                    header.request_id,
                    state.negotiated,
                    threshold,
                )
                .await?;
            }
        }
    }

    let _ = stream.shutdown().await;
    Ok(())
}

async fn write_op_msg_reply<S>(
    stream: &mut S,
    app: &AppContext,
    reply: &Document,
    response_to: i32,
    negotiated: Option<Compressor>,
    threshold: usize,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let msg = op_msg::encode_op_msg(reply, response_to, app.next_request_id());
    let out = compress::maybe_compress_reply(msg, negotiated, threshold);
    stream.write_all(&out).await.map_err(Error::Io)
}

/// Legacy OP_QUERY path: handshake commands only, always against `$cmd`.
async fn handle_op_query(
    app: &Arc<AppContext>,
    state: &mut ConnState,
    query: OpQuery,
) -> Document {
    if !query.full_collection_name.ends_with(".$cmd") {
        return CommandError::bad_value(format!(
            "legacy queries against {} are not supported",
            query.full_collection_name
        ))
        .to_document();
    }
    let name = query.query.keys().next().cloned().unwrap_or_default();
    match name.as_str() {
        "hello" | "isMaster" | "ismaster" => {
            commands::execute(app.clone(), state, query.query, Vec::new()).await
        }
        other => CommandError::command_not_found(other).to_document(),
    }
}
