//! The gateway server: owns the brokers, the configuration record and the
//! counters, and turns accepted transports into running connections.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use co_managed::Manager;
use may::go;
use uuid::Uuid;

use crate::broker::{CallerBroker, PubSubBroker};
use crate::conn::{Conn, ConnState};
use crate::errors::Error;
use crate::handler::{self, Handler};
use crate::msg::{AuthPayload, Msg};
use crate::transport::Transport;

/// Per-connection IO limits and deadlines. A zero value disables the
/// option.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Max inbound message bytes.
    pub read_limit: usize,
    /// Per-frame read deadline.
    pub read_timeout: Duration,
    /// Max outbound message bytes.
    pub write_limit: usize,
    /// Per-frame write deadline.
    pub write_timeout: Duration,
    /// Max wait for the per-connection write permit.
    pub acquire_write_lock_timeout: Duration,
}

impl ServerConfig {
    pub(crate) fn read_timeout_opt(&self) -> Option<Duration> {
        (!self.read_timeout.is_zero()).then_some(self.read_timeout)
    }

    pub(crate) fn write_timeout_opt(&self) -> Option<Duration> {
        (!self.write_timeout.is_zero()).then_some(self.write_timeout)
    }
}

/// The named server counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    ActiveConns,
    TotalConns,
    ActiveConnGoros,
    TotalConnGoros,
    CallMsgs,
    OkMsgs,
    ErrMsgs,
    ResMsgs,
    EvntMsgs,
    ReadMsgs,
    WriteMsgs,
    RecoveredPanics,
}

impl Counter {
    pub const ALL: [Counter; 12] = [
        Counter::ActiveConns,
        Counter::TotalConns,
        Counter::ActiveConnGoros,
        Counter::TotalConnGoros,
        Counter::CallMsgs,
        Counter::OkMsgs,
        Counter::ErrMsgs,
        Counter::ResMsgs,
        Counter::EvntMsgs,
        Counter::ReadMsgs,
        Counter::WriteMsgs,
        Counter::RecoveredPanics,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Counter::ActiveConns => "ActiveConns",
            Counter::TotalConns => "TotalConns",
            Counter::ActiveConnGoros => "ActiveConnGoros",
            Counter::TotalConnGoros => "TotalConnGoros",
            Counter::CallMsgs => "CallMsgs",
            Counter::OkMsgs => "OKMsgs",
            Counter::ErrMsgs => "ErrMsgs",
            Counter::ResMsgs => "ResMsgs",
            Counter::EvntMsgs => "EvntMsgs",
            Counter::ReadMsgs => "ReadMsgs",
            Counter::WriteMsgs => "WriteMsgs",
            Counter::RecoveredPanics => "RecoveredPanics",
        }
    }
}

/// Counter values, shared by every connection of a server.
#[derive(Default)]
pub struct Counters {
    vals: [AtomicI64; 12],
}

impl Counters {
    pub fn add(&self, c: Counter, delta: i64) {
        self.vals[c as usize].fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self, c: Counter) -> i64 {
        self.vals[c as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<(&'static str, i64)> {
        Counter::ALL.iter().map(|c| (c.name(), self.get(*c))).collect()
    }
}

// Tracks a connection coroutine for the goroutine counters.
pub(crate) struct GoroGuard(Arc<Counters>);

impl Drop for GoroGuard {
    fn drop(&mut self) {
        self.0.add(Counter::ActiveConnGoros, -1);
    }
}

type ConnStateFn = dyn Fn(&Conn, ConnState) + Send + Sync;
type AuthFn = dyn Fn(&Arc<Conn>, &AuthPayload) -> Result<(), Error> + Send + Sync;

/// The gateway server.
pub struct Server {
    /// Broker for the caller role: enqueuing calls, streaming results.
    pub caller_broker: Arc<dyn CallerBroker>,
    /// Broker for pub/sub. May be the same object as `caller_broker`,
    /// but nothing assumes so.
    pub pubsub_broker: Arc<dyn PubSubBroker>,

    pub config: ServerConfig,

    /// Override of the default message processing. A custom handler
    /// should call [`handler::process_msg`] at some point.
    pub handler: Option<Box<dyn Handler>>,

    pub counters: Option<Arc<Counters>>,

    /// Called when a connection starts and when it is closing.
    pub conn_state: Option<Box<ConnStateFn>>,

    /// Extension point for the reserved AUTH message. Without a hook the
    /// message is a no-op.
    pub auth: Option<Box<AuthFn>>,
}

impl Server {
    pub fn new(
        caller_broker: Arc<dyn CallerBroker>,
        pubsub_broker: Arc<dyn PubSubBroker>,
    ) -> Server {
        Server {
            caller_broker,
            pubsub_broker,
            config: ServerConfig::default(),
            handler: None,
            counters: None,
            conn_state: None,
            auth: None,
        }
    }

    pub(crate) fn dispatch(&self, conn: &Arc<Conn>, m: Msg) {
        if let Some(h) = &self.handler {
            h.handle(conn, m);
        } else {
            handler::process_msg(conn, m);
        }
    }

    pub(crate) fn count(&self, c: Counter, delta: i64) {
        if let Some(counters) = &self.counters {
            counters.add(c, delta);
        }
    }

    pub(crate) fn goro_guard(&self) -> Option<GoroGuard> {
        self.counters.as_ref().map(|counters| {
            counters.add(Counter::TotalConnGoros, 1);
            counters.add(Counter::ActiveConnGoros, 1);
            GoroGuard(counters.clone())
        })
    }

    /// Runs a freshly accepted transport as a juggler connection: opens
    /// the connection's two broker streams, starts its loops and fires
    /// the connection-state callback. Returns the connection; it lives
    /// until one of its loops fails or the client goes away, at which
    /// point the transport is torn down.
    pub fn serve(self: Arc<Self>, transport: Arc<dyn Transport>) -> Result<Arc<Conn>, Error> {
        let uuid = Uuid::new_v4();
        let psc = self.pubsub_broker.pubsub()?;
        let resc = self.caller_broker.results(uuid)?;
        let conn = Conn::new(uuid, transport.clone(), self.clone(), psc, resc);

        self.count(Counter::TotalConns, 1);
        self.count(Counter::ActiveConns, 1);
        if let Some(cb) = &self.conn_state {
            cb(&conn, ConnState::Connected);
        }

        let srv = self;
        let c = conn.clone();
        go!(move || {
            let manager = Manager::new();
            let read = c.clone();
            manager.add(move |_| read.read_loop());
            let results = c.clone();
            manager.add(move |_| results.results_loop());
            let events = c.clone();
            manager.add(move |_| events.pubsub_loop());

            c.wait_close();
            srv.count(Counter::ActiveConns, -1);
            if let Some(cb) = &srv.conn_state {
                cb(&c, ConnState::Closing);
            }
            // the transport belongs to the accept layer, not to the
            // connection: tear it down now that the connection is done
            transport.close();
            // dropping the manager cancels any loop still blocked
        });
        Ok(conn)
    }
}
