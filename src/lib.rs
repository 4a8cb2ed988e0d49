//! oxgate: a MongoDB wire-protocol gateway backed by a document-enabled
//! PostgreSQL server. Clients speak OP_MSG (and the legacy handshake ops);
//! every command is translated into a stored-procedure call on the backend.

pub mod backend;
pub mod commands;
pub mod config;
pub mod conn;
pub mod cursor;
pub mod error;
pub mod pool;
pub mod scram;
pub mod server;
pub mod state;
pub mod tls;
pub mod wire;
