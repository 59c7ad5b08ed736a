use std::io;

use thiserror::Error;

use crate::msg::Kind;
use crate::store::StoreError;

/// All errors that can occur in the gateway, its brokers and clients.
#[derive(Debug, Error)]
pub enum Error {
    /// Any IO error on the transport.
    #[error("io err: {0}")]
    Io(#[from] io::Error),

    /// Timed out waiting for the connection's write lock.
    #[error("timed out waiting for write lock")]
    WriteLockTimeout,

    /// An encoded message exceeded the configured write limit. The frame
    /// is dropped whole, nothing is written to the transport.
    #[error("write limit exceeded")]
    WriteLimitExceeded,

    /// An inbound frame exceeded the configured read limit.
    #[error("read limit exceeded")]
    ReadLimitExceeded,

    /// A call or result queue reached its configured capacity.
    #[error("queue capacity exceeded")]
    CapacityExceeded,

    /// A decoded message carries an unknown `type` tag.
    #[error("unknown message type {0:?}")]
    UnknownMsgType(String),

    /// A message kind arrived in the wrong direction, e.g. a RES sent by
    /// a client.
    #[error("unexpected {0} message")]
    UnexpectedMsgKind(Kind),

    /// Malformed JSON envelope or payload.
    #[error("invalid message: {0}")]
    Json(#[from] serde_json::Error),

    /// The subprotocol handshake failed.
    #[error("subprotocol handshake failed: {0}")]
    Handshake(String),

    /// The connection, stream or transport was closed.
    #[error("connection closed")]
    Closed,

    /// Store failure underneath a broker operation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A message handler panicked; holds the panic payload.
    #[error("handler panic: {0}")]
    Panic(String),
}
