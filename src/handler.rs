//! Message handling: middleware, panic containment and the default
//! processing of client and server messages.

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use uuid::Uuid;

use crate::conn::{Conn, ConnState};
use crate::errors::Error;
use crate::msg::{
    self, CallPayload, Kind, Msg, CODE_CAPACITY_EXCEEDED, CODE_SERVER_ERROR,
    CODE_WRITE_LIMIT_EXCEEDED,
};
use crate::server::Counter;

/// Handles a message sent or received on a connection.
///
/// Cancellation is carried by the connection: long-running handlers
/// should give up once [`Conn::is_closed`] reports true.
pub trait Handler: Send + Sync {
    fn handle(&self, conn: &Arc<Conn>, m: Msg);
}

impl<F> Handler for F
where
    F: Fn(&Arc<Conn>, Msg) + Send + Sync,
{
    fn handle(&self, conn: &Arc<Conn>, m: Msg) {
        self(conn, m)
    }
}

/// Calls the wrapped handlers in order, one after the other.
pub struct Chain(pub Vec<Box<dyn Handler>>);

impl Handler for Chain {
    fn handle(&self, conn: &Arc<Conn>, m: Msg) {
        for h in &self.0 {
            h.handle(conn, m.clone());
        }
    }
}

/// Recovers from panics raised inside the wrapped handler, so a poison
/// message cannot take the process down. When `close_conn` is set the
/// connection is closed with the panic as cause.
pub struct PanicRecover<H> {
    pub inner: H,
    pub close_conn: bool,
    pub print_stack: bool,
}

impl<H: Handler> Handler for PanicRecover<H> {
    fn handle(&self, conn: &Arc<Conn>, m: Msg) {
        let (uuid, kind) = (m.uuid(), m.kind());
        if let Err(p) = panic::catch_unwind(AssertUnwindSafe(|| self.inner.handle(conn, m))) {
            let cause = panic_cause(p);
            conn.server().count(Counter::RecoveredPanics, 1);
            warn!(
                "{}: recovered from panic {:?} serving message {} {}",
                conn.uuid, cause, uuid, kind
            );
            if self.print_stack {
                warn!("{}", Backtrace::force_capture());
            }
            if self.close_conn {
                conn.close(Error::Panic(cause));
            }
        }
    }
}

fn panic_cause(p: Box<dyn Any + Send>) -> String {
    match p.downcast::<String>() {
        Ok(s) => *s,
        Err(p) => match p.downcast::<&'static str>() {
            Ok(s) => (*s).to_owned(),
            Err(_) => "panic".to_owned(),
        },
    }
}

/// Connection-state callback that logs connections and disconnections.
pub fn log_conn(c: &Conn, state: ConnState) {
    match state {
        ConnState::Connected => {
            info!("{}: connected with subprotocol {:?}", c.uuid, c.subprotocol())
        }
        ConnState::Closing => info!(
            "{}: closing with error {}",
            c.uuid,
            c.close_err().map_or_else(|| "none".to_owned(), |e| e.to_string())
        ),
    }
}

/// Handler that logs messages received or sent on the connection.
pub fn log_msg(conn: &Arc<Conn>, m: Msg) {
    let kind = m.kind();
    if kind.is_read() {
        debug!("{}: received message {} {}", conn.uuid, m.uuid(), kind);
    } else if kind.is_write() {
        debug!("{}: sending message {} {}", conn.uuid, m.uuid(), kind);
    }
}

/// The default message processing. Client messages trigger the RPC,
/// pub/sub or auth paths; server messages are encoded and written out.
/// A custom server handler should call this at some point so the
/// expected behavior happens.
pub fn process_msg(conn: &Arc<Conn>, m: Msg) {
    let srv = conn.server().clone();
    match m {
        Msg::Auth { uuid, payload } => {
            // reserved; the named hook is the extension point
            if let Some(hook) = &srv.auth {
                match hook(conn, &payload) {
                    Ok(()) => conn.send(Msg::ok_for(uuid)),
                    Err(e) => conn.send(Msg::err_for(uuid, err_code(&e), e.to_string())),
                }
            } else {
                debug!("{}: AUTH is reserved, ignoring message {}", conn.uuid, uuid);
            }
        }

        Msg::Call { uuid, payload } => {
            srv.count(Counter::CallMsgs, 1);
            let msg_uuid = if uuid.is_nil() { Uuid::new_v4() } else { uuid };
            let timeout = Duration::from_millis(payload.timeout);
            let cp = CallPayload {
                conn_uuid: conn.uuid,
                msg_uuid,
                uri: payload.uri,
                args: payload.args,
            };
            match srv.caller_broker.call(&cp, timeout) {
                Ok(()) => conn.send(Msg::ok_for(msg_uuid)),
                Err(e) => {
                    warn!("{}: call {} to {} failed: {}", conn.uuid, msg_uuid, cp.uri, e);
                    conn.send(Msg::err_for(msg_uuid, err_code(&e), e.to_string()));
                }
            }
        }

        Msg::Pub { uuid, payload } => {
            match srv.pubsub_broker.publish(&payload.channel, &payload) {
                Ok(()) => conn.send(Msg::ok_for(uuid)),
                Err(e) => {
                    warn!("{}: publish on {} failed: {}", conn.uuid, payload.channel, e);
                    conn.send(Msg::err_for(uuid, err_code(&e), e.to_string()));
                }
            }
        }

        Msg::Sub { uuid, payload } => {
            match conn.psc.subscribe(&payload.channel, payload.pattern) {
                Ok(()) => conn.send(Msg::ok_for(uuid)),
                Err(e) => conn.send(Msg::err_for(uuid, err_code(&e), e.to_string())),
            }
        }

        Msg::Unsb { uuid, payload } => {
            match conn.psc.unsubscribe(&payload.channel, payload.pattern) {
                Ok(()) => conn.send(Msg::ok_for(uuid)),
                Err(e) => conn.send(Msg::err_for(uuid, err_code(&e), e.to_string())),
            }
        }

        m @ (Msg::Ok { .. } | Msg::Err { .. } | Msg::Res { .. } | Msg::Evnt { .. }) => {
            write_out(conn, m)
        }

        m => warn!(
            "{}: unknown message in process_msg: {} {}",
            conn.uuid,
            m.uuid(),
            m.kind()
        ),
    }
}

fn err_code(e: &Error) -> i32 {
    match e {
        Error::CapacityExceeded => CODE_CAPACITY_EXCEEDED,
        Error::WriteLimitExceeded => CODE_WRITE_LIMIT_EXCEEDED,
        _ => CODE_SERVER_ERROR,
    }
}

fn write_out(conn: &Arc<Conn>, m: Msg) {
    let srv = conn.server().clone();
    match m.kind() {
        Kind::Ok => srv.count(Counter::OkMsgs, 1),
        Kind::Err => srv.count(Counter::ErrMsgs, 1),
        Kind::Res => srv.count(Counter::ResMsgs, 1),
        Kind::Evnt => srv.count(Counter::EvntMsgs, 1),
        _ => {}
    }

    match write_msg(conn, &m) {
        Ok(()) => {}

        // unable to communicate at all
        Err(Error::WriteLockTimeout) => conn.close(Error::WriteLockTimeout),

        // the message is dropped whole; tell the client what happened
        Err(Error::WriteLimitExceeded) => {
            warn!(
                "{}: write {} failed: {}",
                conn.uuid,
                m.uuid(),
                Error::WriteLimitExceeded
            );
            let err = Msg::err_for(
                m.uuid(),
                CODE_WRITE_LIMIT_EXCEEDED,
                Error::WriteLimitExceeded.to_string(),
            );
            match write_msg(conn, &err) {
                Ok(()) => srv.count(Counter::ErrMsgs, 1),
                Err(Error::WriteLockTimeout) => conn.close(Error::WriteLockTimeout),
                Err(e) => warn!(
                    "{}: write limit notification {} failed: {}",
                    conn.uuid,
                    err.uuid(),
                    e
                ),
            }
        }

        Err(e) => warn!("{}: write {} failed: {}", conn.uuid, m.uuid(), e),
    }
}

/// Encodes `m` under the server's write limit and writes it as a single
/// frame under the connection's write permit.
pub(crate) fn write_msg(conn: &Arc<Conn>, m: &Msg) -> Result<(), Error> {
    let frame = msg::encode_frame(m, conn.server().config.write_limit)?;
    conn.write_frame(frame)?;
    conn.server().count(Counter::WriteMsgs, 1);
    Ok(())
}
