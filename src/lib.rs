//! juggler is an RPC and pub/sub gateway speaking small JSON messages
//! over a framed text transport, based on coroutines.
//!
//! Clients connect over a transport negotiating the `juggler.0`
//! subprotocol and send CALL messages to invoke named remote procedures,
//! or SUB/UNSB/PUB messages to work with event channels. Calls are not
//! executed by the gateway: they are enqueued on a per-URI queue of an
//! external broker, picked up by a pool of callee workers, and their
//! results travel back through the broker to the originating connection,
//! which delivers them as RES messages. Every call carries a timeout;
//! a call that produces no result within its budget expires and the
//! caller gets a synthetic EXP notification instead, at most once.
//!
//! Each connection runs a read loop, a results pump and a pub/sub pump
//! as separate coroutines, plus transient writers serialized by a
//! one-slot write permit, so frames on a connection are totally ordered.
//!
//! Example, entirely in-process:
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use juggler::msg::CallPayload;
//! use juggler::{Callee, Client, ClientConfig, KvBroker, MemoryStore, Server};
//! use serde_json::json;
//!
//! let store = Arc::new(MemoryStore::new());
//! let broker = Arc::new(KvBroker::new(store));
//! let srv = Arc::new(Server::new(broker.clone(), broker.clone()));
//!
//! // an echo callee with two workers
//! let callee = Callee::new(broker.clone());
//! let _pool = callee
//!     .listen(&["echo"], 2, Arc::new(|cp: &CallPayload| Ok(cp.args.clone())))
//!     .unwrap();
//!
//! // wire a client to the gateway through an in-process pipe
//! let (gw_side, client_side) = juggler::transport::pipe();
//! srv.serve(Arc::new(gw_side)).unwrap();
//! let client = Client::connect(
//!     Arc::new(client_side),
//!     ClientConfig::default(),
//!     |m| println!("<- {}", m.kind()),
//! );
//! client.call("echo", json!("hi"), Duration::from_secs(1)).unwrap();
//! ```

/// Broker capability seams and stream handles.
pub mod broker;
/// Callee worker pool.
pub mod callee;
/// Caller-side connection.
pub mod client;
/// The gateway connection object.
pub mod conn;
/// Crate error taxonomy.
pub mod errors;
/// Message handling middleware and default dispatch.
pub mod handler;
/// Wire messages and their codec.
pub mod msg;
/// The gateway server.
pub mod server;
/// The abstract key/list/pub-sub store and its in-memory realization.
pub mod store;
/// The framed text transport seam.
pub mod transport;

pub use broker::kv::KvBroker;
pub use broker::{CalleeBroker, CallerBroker, PubSubBroker};
pub use callee::Callee;
pub use client::{Client, ClientConfig};
pub use conn::{Conn, ConnState};
pub use errors::Error;
pub use handler::{Chain, Handler, PanicRecover};
pub use msg::{Kind, Msg};
pub use server::{Counter, Counters, Server, ServerConfig};
pub use store::memory::MemoryStore;
pub use transport::{TcpTransport, Transport, SUBPROTOCOL};
