//! The gateway connection: identity, exclusive write permit, close
//! discipline and the per-connection pump loops.

use std::sync::{Arc, Once, Weak};
use std::time::Duration;

use bytes::Bytes;
use log::debug;
use may::sync::{Mutex, Semphore, SyncFlag};
use uuid::Uuid;

use crate::broker::{PubSubStream, ResultsStream};
use crate::errors::Error;
use crate::msg::{self, Msg};
use crate::server::{Counter, Server};
use crate::transport::Transport;

// Holds the one-slot write permit; releasing on drop keeps the permit
// count balanced even when the transport panics mid-send.
pub(crate) struct WritePermit<'a>(&'a Semphore);

impl<'a> WritePermit<'a> {
    /// Acquires the permit, waiting at most `timeout` when nonzero.
    pub(crate) fn acquire(
        wmu: &'a Semphore,
        timeout: Duration,
    ) -> Result<WritePermit<'a>, Error> {
        if timeout.is_zero() {
            wmu.wait();
        } else if !wmu.wait_timeout(timeout) {
            return Err(Error::WriteLockTimeout);
        }
        Ok(WritePermit(wmu))
    }
}

impl Drop for WritePermit<'_> {
    fn drop(&mut self) {
        self.0.post();
    }
}

/// The states reported to the server's connection callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connected,
    Closing,
}

/// A gateway connection.
///
/// Safe to share across coroutines. Four things run against it
/// concurrently: the read loop, the results pump, the pub/sub pump, and
/// transient writers driven by dispatch; the write permit serializes the
/// writers so frames are never interleaved.
pub struct Conn {
    /// Unique identifier of the connection.
    pub uuid: Uuid,

    transport: Arc<dyn Transport>,
    srv: Arc<Server>,

    // one-slot write permit; a semaphore rather than a mutex so that
    // acquisition can carry a timeout
    wmu: Semphore,

    pub(crate) psc: PubSubStream,
    pub(crate) resc: ResultsStream,

    close_once: Once,
    kill: SyncFlag,
    close_err: Mutex<Option<Arc<Error>>>,

    // handle on our own Arc, for handing &Arc<Conn> to the handler chain
    me: Weak<Conn>,
}

impl Conn {
    pub(crate) fn new(
        uuid: Uuid,
        transport: Arc<dyn Transport>,
        srv: Arc<Server>,
        psc: PubSubStream,
        resc: ResultsStream,
    ) -> Arc<Conn> {
        Arc::new_cyclic(|me| Conn {
            uuid,
            transport,
            srv,
            wmu: Semphore::new(1),
            psc,
            resc,
            close_once: Once::new(),
            kill: SyncFlag::new(),
            close_err: Mutex::new(None),
            me: me.clone(),
        })
    }

    /// The server this connection belongs to.
    pub fn server(&self) -> &Arc<Server> {
        &self.srv
    }

    /// The subprotocol negotiated at accept time.
    pub fn subprotocol(&self) -> &str {
        self.transport.subprotocol()
    }

    /// Blocks until the connection is closed.
    pub fn wait_close(&self) {
        self.kill.wait();
    }

    /// Like `wait_close` with a bound; true when the connection closed.
    pub fn wait_close_timeout(&self, timeout: Duration) -> bool {
        self.kill.wait_timeout(timeout)
    }

    pub fn is_closed(&self) -> bool {
        self.kill.is_fired()
    }

    /// The cause of the close. Only meaningful after the close
    /// notification; the first `close` call sets it, once.
    pub fn close_err(&self) -> Option<Arc<Error>> {
        self.close_err.lock().unwrap().clone()
    }

    /// Closes the connection with `cause`. Idempotent; only the first
    /// call records its cause. Closes both broker streams, which unblocks
    /// the pump loops, and fires the close notification. The transport is
    /// left open, tearing it down belongs to whoever accepted it.
    pub fn close(&self, cause: Error) {
        self.close_once.call_once(|| {
            debug!("{}: closing: {}", self.uuid, cause);
            *self.close_err.lock().unwrap() = Some(Arc::new(cause));
            self.psc.close();
            self.resc.close();
            self.kill.fire();
        });
    }

    /// Sends `m` through the server's handler, or default processing when
    /// none is set.
    pub fn send(&self, m: Msg) {
        if let Some(me) = self.me.upgrade() {
            self.srv.dispatch(&me, m);
        }
    }

    /// Writes one encoded frame under the write permit.
    ///
    /// Acquisition is bounded by the server's configured lock timeout;
    /// on overrun nothing is written and `WriteLockTimeout` is returned.
    /// The permit is released on every exit path, a panicking transport
    /// included.
    ///
    /// A coroutine that already holds the permit (a transport calling
    /// back into the connection, say) must not acquire again with a zero
    /// lock timeout: that deadlocks. Let the first write finish before
    /// asking for another one, and prefer a nonzero timeout.
    pub(crate) fn write_frame(&self, frame: Bytes) -> Result<(), Error> {
        let _permit =
            WritePermit::acquire(&self.wmu, self.srv.config.acquire_write_lock_timeout)?;
        self.transport
            .send(&frame, self.srv.config.write_timeout_opt())
    }

    /// The read loop. Blocks on the transport, resetting the read
    /// deadline frame by frame; any read or decode failure closes the
    /// connection.
    pub(crate) fn read_loop(&self) {
        let _goros = self.srv.goro_guard();
        let read_limit = self.srv.config.read_limit;
        loop {
            let frame = match self.transport.receive(self.srv.config.read_timeout_opt()) {
                Ok(frame) => frame,
                Err(e) => return self.close(e),
            };
            if read_limit > 0 && frame.len() > read_limit {
                return self.close(Error::ReadLimitExceeded);
            }
            let m = match msg::decode_request(&frame) {
                Ok(m) => m,
                Err(e) => return self.close(e),
            };
            self.srv.count(Counter::ReadMsgs, 1);
            let Some(me) = self.me.upgrade() else { return };
            self.srv.dispatch(&me, m);
        }
    }

    /// Drains the results stream, sending a RES per result.
    pub(crate) fn results_loop(&self) {
        let _goros = self.srv.goro_guard();
        while let Some(rp) = self.resc.recv() {
            self.send(Msg::res(rp));
        }
        // stream ended: close the connection if it isn't already
        self.close(self.resc.take_err().unwrap_or(Error::Closed));
    }

    /// Drains the pub/sub stream, sending an EVNT per event.
    pub(crate) fn pubsub_loop(&self) {
        let _goros = self.srv.goro_guard();
        while let Some(ep) = self.psc.recv() {
            self.send(Msg::evnt(ep));
        }
        self.close(self.psc.take_err().unwrap_or(Error::Closed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::kv::KvBroker;
    use crate::server::{Server, ServerConfig};
    use crate::store::memory::MemoryStore;
    use crate::transport;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    // a transport whose sends stall, to wedge the write permit
    struct StallTransport(Duration);

    impl Transport for StallTransport {
        fn receive(&self, _timeout: Option<Duration>) -> Result<Bytes, Error> {
            may::coroutine::sleep(Duration::from_secs(3600));
            Err(Error::Closed)
        }
        fn send(&self, _frame: &[u8], _timeout: Option<Duration>) -> Result<(), Error> {
            may::coroutine::sleep(self.0);
            Ok(())
        }
        fn subprotocol(&self) -> &str {
            transport::SUBPROTOCOL
        }
        fn close(&self) {}
    }

    fn test_conn(t: Arc<dyn Transport>, config: ServerConfig) -> Arc<Conn> {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(KvBroker::new(store));
        let mut srv = Server::new(broker.clone(), broker);
        srv.config = config;
        let srv = Arc::new(srv);
        let uuid = Uuid::new_v4();
        let psc = srv.pubsub_broker.pubsub().unwrap();
        let resc = srv.caller_broker.results(uuid).unwrap();
        Conn::new(uuid, t, srv, psc, resc)
    }

    #[test]
    fn write_permit_acquisition_is_bounded() {
        let config = ServerConfig {
            acquire_write_lock_timeout: ms(20),
            ..ServerConfig::default()
        };
        let conn = test_conn(Arc::new(StallTransport(ms(300))), config);

        let slow = conn.clone();
        let h = may::go!(move || slow.write_frame(Bytes::from_static(b"{}")));
        std::thread::sleep(ms(50));

        match conn.write_frame(Bytes::from_static(b"{}")) {
            Err(Error::WriteLockTimeout) => {}
            other => panic!("expected WriteLockTimeout, got {other:?}"),
        }
        // the stalled writer still completes and releases the permit
        h.join().unwrap().unwrap();
        conn.write_frame(Bytes::from_static(b"{}")).unwrap();
    }

    #[test]
    fn close_is_idempotent_and_keeps_the_first_cause() {
        let (a, _b) = transport::pipe();
        let conn = test_conn(Arc::new(a), ServerConfig::default());
        assert!(!conn.is_closed());
        assert!(conn.close_err().is_none());

        conn.close(Error::WriteLockTimeout);
        conn.close(Error::Closed);

        assert!(conn.is_closed());
        let cause = conn.close_err().unwrap();
        assert!(matches!(*cause, Error::WriteLockTimeout));
        assert!(conn.wait_close_timeout(ms(10)));
    }
}
