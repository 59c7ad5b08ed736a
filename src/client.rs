//! The caller-side connection, for callers outside the gateway process.
//!
//! A client owns its transport, keeps a pending-call map keyed by call
//! UUID, and hands every incoming message to the user handler. When a
//! call's deadline lapses without a result, a synthetic EXP notification
//! is emitted instead, exactly once; a result arriving later is dropped.
//! A single expirer coroutine drives the deadlines from an
//! ordered-by-deadline heap.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Once, Weak};
use std::time::{Duration, Instant};

use log::debug;
use may::sync::{mpsc, Mutex, Semphore, SyncFlag};
use may::{coroutine, go};
use serde_json::Value;
use uuid::Uuid;

use crate::broker::DEFAULT_CALL_TIMEOUT;
use crate::conn::WritePermit;
use crate::errors::Error;
use crate::msg::{self, Msg};
use crate::transport::Transport;

/// Client-side IO limits and deadlines. A zero value disables the option.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Max outbound message bytes.
    pub write_limit: usize,
    /// Per-frame write deadline.
    pub write_timeout: Duration,
    /// Max wait for the write permit.
    pub acquire_write_lock_timeout: Duration,
}

impl ClientConfig {
    fn write_timeout_opt(&self) -> Option<Duration> {
        (!self.write_timeout.is_zero()).then_some(self.write_timeout)
    }
}

struct PendingCall {
    uri: String,
    args: Value,
    deadline: Instant,
}

/// A juggler client connection.
pub struct Client {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    handler: Box<dyn Fn(Msg) + Send + Sync>,

    wmu: Semphore,
    pending: Mutex<HashMap<Uuid, PendingCall>>,
    exp_tx: Mutex<Option<mpsc::Sender<(Instant, Uuid)>>>,

    close_once: Once,
    kill: SyncFlag,
    close_err: Mutex<Option<Arc<Error>>>,
    loops: Mutex<Vec<coroutine::JoinHandle<()>>>,
}

impl Client {
    /// Starts a client over `transport`. `handler` receives every
    /// incoming message plus the synthetic EXP notifications.
    pub fn connect(
        transport: Arc<dyn Transport>,
        config: ClientConfig,
        handler: impl Fn(Msg) + Send + Sync + 'static,
    ) -> Arc<Client> {
        let (exp_tx, exp_rx) = mpsc::channel();
        let client = Arc::new(Client {
            transport,
            config,
            handler: Box::new(handler),
            wmu: Semphore::new(1),
            pending: Mutex::new(HashMap::new()),
            exp_tx: Mutex::new(Some(exp_tx)),
            close_once: Once::new(),
            kill: SyncFlag::new(),
            close_err: Mutex::new(None),
            loops: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&client);
        let reader = go!(move || Client::read_loop(weak));
        let weak = Arc::downgrade(&client);
        let expirer = go!(move || Client::expire_loop(weak, exp_rx));
        client.loops.lock().unwrap().extend([reader, expirer]);
        client
    }

    // The loops hold the client only through a Weak, so dropping the last
    // user handle tears everything down.
    fn read_loop(weak: Weak<Client>) {
        loop {
            let transport = match weak.upgrade() {
                Some(c) => c.transport.clone(),
                None => return,
            };
            let frame = transport.receive(None);
            let Some(c) = weak.upgrade() else { return };
            match frame {
                Err(e) => return c.close(e),
                Ok(frame) => match msg::decode_response(&frame) {
                    Err(e) => return c.close(e),
                    Ok(m) => c.process_incoming(m),
                },
            }
        }
    }

    fn process_incoming(&self, m: Msg) {
        match &m {
            Msg::Res { payload, .. } => {
                // resolve at most once; a late result is dropped here
                if self
                    .pending
                    .lock()
                    .unwrap()
                    .remove(&payload.call_uuid)
                    .is_none()
                {
                    debug!(
                        "dropping result for unknown or expired call {}",
                        payload.call_uuid
                    );
                    return;
                }
            }
            // an ERR about a pending call resolves it, no EXP follows
            Msg::Err { payload, .. } => {
                self.pending.lock().unwrap().remove(&payload.for_uuid);
            }
            _ => {}
        }
        (self.handler)(m);
    }

    fn expire_loop(weak: Weak<Client>, rx: mpsc::Receiver<(Instant, Uuid)>) {
        let mut heap: BinaryHeap<Reverse<(Instant, Uuid)>> = BinaryHeap::new();
        loop {
            let now = Instant::now();
            while let Some(&Reverse((deadline, uuid))) = heap.peek() {
                if deadline > now {
                    break;
                }
                heap.pop();
                let Some(c) = weak.upgrade() else { return };
                c.expire(uuid);
            }

            let next = match heap.peek() {
                Some(&Reverse((deadline, _))) => {
                    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                        Ok(entry) => Some(entry),
                        // either the wait lapsed or the client closed and
                        // dropped the sender
                        Err(_) => None,
                    }
                }
                None => match rx.recv() {
                    Ok(entry) => Some(entry),
                    // sender dropped: the client closed
                    Err(_) => return,
                },
            };
            match next {
                Some(entry) => heap.push(Reverse(entry)),
                None => {
                    let Some(c) = weak.upgrade() else { return };
                    if c.kill.is_fired() {
                        return;
                    }
                }
            }
        }
    }

    fn expire(&self, uuid: Uuid) {
        let pc = self.pending.lock().unwrap().remove(&uuid);
        if let Some(pc) = pc {
            debug!("call {} to {} expired", uuid, pc.uri);
            (self.handler)(Msg::exp(uuid, pc.uri, pc.args));
        }
    }

    /// Issues a CALL; the result, or its expiration, comes back through
    /// the handler. Returns the call UUID. A zero timeout means the
    /// broker default.
    pub fn call(&self, uri: &str, args: Value, timeout: Duration) -> Result<Uuid, Error> {
        let m = Msg::call(uri, args.clone(), timeout);
        let uuid = m.uuid();
        let effective = if timeout.is_zero() {
            DEFAULT_CALL_TIMEOUT
        } else {
            timeout
        };
        let deadline = Instant::now() + effective;
        self.pending.lock().unwrap().insert(
            uuid,
            PendingCall {
                uri: uri.to_owned(),
                args,
                deadline,
            },
        );
        {
            let tx = self.exp_tx.lock().unwrap();
            match tx.as_ref() {
                Some(tx) => {
                    let _ = tx.send((deadline, uuid));
                }
                None => {
                    self.pending.lock().unwrap().remove(&uuid);
                    return Err(Error::Closed);
                }
            }
        }
        if let Err(e) = self.write(&m) {
            self.pending.lock().unwrap().remove(&uuid);
            return Err(e);
        }
        Ok(uuid)
    }

    /// Subscribes to `channel`, treated as a glob when `pattern`.
    pub fn subscribe(&self, channel: &str, pattern: bool) -> Result<Uuid, Error> {
        let m = Msg::sub(channel, pattern);
        self.write(&m)?;
        Ok(m.uuid())
    }

    pub fn unsubscribe(&self, channel: &str, pattern: bool) -> Result<Uuid, Error> {
        let m = Msg::unsb(channel, pattern);
        self.write(&m)?;
        Ok(m.uuid())
    }

    /// Publishes `args` on `channel`.
    pub fn publish(&self, channel: &str, args: Value) -> Result<Uuid, Error> {
        let m = Msg::publish(channel, args);
        self.write(&m)?;
        Ok(m.uuid())
    }

    /// Sends the reserved AUTH message.
    pub fn auth(&self, args: Value) -> Result<Uuid, Error> {
        let m = Msg::auth(args);
        self.write(&m)?;
        Ok(m.uuid())
    }

    /// Encodes and writes one frame under the write permit, bounded by
    /// the configured lock timeout. The permit is released on every exit
    /// path, a panicking transport included.
    ///
    /// A coroutine that already holds the permit must not acquire again
    /// with a zero lock timeout: that deadlocks. Let the first write
    /// finish before asking for another one, and prefer a nonzero
    /// timeout.
    fn write(&self, m: &Msg) -> Result<(), Error> {
        let frame = msg::encode_frame(m, self.config.write_limit)?;
        let _permit =
            WritePermit::acquire(&self.wmu, self.config.acquire_write_lock_timeout)?;
        self.transport.send(&frame, self.config.write_timeout_opt())
    }

    /// Closes the client with `cause`. Idempotent; the first caller's
    /// cause wins. The client owns its transport and tears it down.
    pub fn close(&self, cause: Error) {
        self.close_once.call_once(|| {
            debug!("client closing: {}", cause);
            *self.close_err.lock().unwrap() = Some(Arc::new(cause));
            self.kill.fire();
            self.exp_tx.lock().unwrap().take();
            self.transport.close();
        });
    }

    pub fn is_closed(&self) -> bool {
        self.kill.is_fired()
    }

    pub fn wait_close(&self) {
        self.kill.wait();
    }

    pub fn wait_close_timeout(&self, timeout: Duration) -> bool {
        self.kill.wait_timeout(timeout)
    }

    /// The cause of the close; meaningful only after the close.
    pub fn close_err(&self) -> Option<Arc<Error>> {
        self.close_err.lock().unwrap().clone()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close(Error::Closed);
        for h in self.loops.lock().unwrap().drain(..) {
            unsafe { h.coroutine().cancel() };
            h.join().ok();
        }
    }
}
