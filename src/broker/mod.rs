//! Broker capability seams and the stream handles they hand out.
//!
//! The three capabilities are deliberately split so a deployment can route
//! calls to one store and pub/sub to another. A single object may
//! implement all of them, but consumers must not assume a shared
//! connection.

use std::sync::{Arc, Once};
use std::time::Duration;

use may::go;
use may::sync::{mpmc, Mutex, SyncFlag};
use uuid::Uuid;

use crate::errors::Error;
use crate::msg::{CallPayload, EvntPayload, PubPayload, ResPayload};
use crate::store::Subscriber;

pub mod kv;

/// Call expiration used when the caller passes a zero timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Broker methods used by the gateway on behalf of callers.
pub trait CallerBroker: Send + Sync {
    /// Opens the stream of call results destined to `conn_uuid`.
    fn results(&self, conn_uuid: Uuid) -> Result<ResultsStream, Error>;

    /// Registers a call request. A zero timeout means
    /// [`DEFAULT_CALL_TIMEOUT`].
    fn call(&self, cp: &CallPayload, timeout: Duration) -> Result<(), Error>;
}

/// Broker methods used by callees.
pub trait CalleeBroker: Send + Sync {
    /// Opens the stream of pending call requests for the given URIs. All
    /// clones of the returned stream share one sequence, so a pool of
    /// workers can drain it together.
    fn calls(&self, uris: &[&str]) -> Result<CallsStream, Error>;

    /// Stores a call result. The stored result expires with the remaining
    /// budget of the originating call; when `timeout` is nonzero it caps
    /// that budget. A result whose call already expired is silently
    /// discarded.
    fn result(&self, rp: &ResPayload, timeout: Duration) -> Result<(), Error>;
}

/// Broker methods for event publication and subscription.
pub trait PubSubBroker: Send + Sync {
    /// Opens a dedicated pub/sub stream with its own subscription set.
    fn pubsub(&self) -> Result<PubSubStream, Error>;

    /// Publishes `pp` on `channel`.
    fn publish(&self, channel: &str, pp: &PubPayload) -> Result<(), Error>;
}

pub type CallsStream = BrokerStream<CallPayload>;
pub type ResultsStream = BrokerStream<ResPayload>;

struct Shared {
    start: Once,
    job: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    stop: SyncFlag,
    err: Mutex<Option<Error>>,
}

/// The pump side of a [`BrokerStream`], handed to the closure that feeds
/// it. Returning from the closure ends the stream.
pub(crate) struct Pump<T> {
    tx: mpmc::Sender<T>,
    shared: Arc<Shared>,
}

impl<T> Pump<T> {
    /// True once the stream was closed; poll it between bounded waits.
    pub(crate) fn stopped(&self) -> bool {
        self.shared.stop.is_fired()
    }

    /// Delivers an item; false when every stream handle is gone.
    pub(crate) fn deliver(&self, item: T) -> bool {
        self.tx.send(item).is_ok()
    }

    /// Records the terminal error, observable through `take_err` once the
    /// stream has drained.
    pub(crate) fn fail(&self, e: Error) {
        *self.shared.err.lock().unwrap() = Some(e);
    }
}

/// A lazy stream of broker items.
///
/// The first `recv` (from any clone) starts the single background pump;
/// clones share one sequence, each item going to exactly one consumer.
/// `close` is idempotent and stops the pump within its bounded polling
/// interval, after which `recv` drains the channel and returns `None`.
pub struct BrokerStream<T> {
    rx: Mutex<mpmc::Receiver<T>>,
    shared: Arc<Shared>,
}

impl<T: Send + 'static> BrokerStream<T> {
    pub(crate) fn new<F>(pump: F) -> Self
    where
        F: FnOnce(Pump<T>) + Send + 'static,
    {
        let (tx, rx) = mpmc::channel();
        let shared = Arc::new(Shared {
            start: Once::new(),
            job: Mutex::new(None),
            stop: SyncFlag::new(),
            err: Mutex::new(None),
        });
        let p = Pump {
            tx,
            shared: shared.clone(),
        };
        *shared.job.lock().unwrap() = Some(Box::new(move || pump(p)));
        BrokerStream {
            rx: Mutex::new(rx),
            shared,
        }
    }

    fn ensure_started(&self) {
        self.shared.start.call_once(|| {
            if let Some(job) = self.shared.job.lock().unwrap().take() {
                go!(move || job());
            }
        });
    }

    /// Blocking receive. Returns `None` once the stream has terminated;
    /// check `take_err` then for the cause.
    pub fn recv(&self) -> Option<T> {
        self.ensure_started();
        let rx = self.rx.lock().unwrap();
        rx.recv().ok()
    }

    /// The error that terminated the stream, if any. Only meaningful once
    /// `recv` has returned `None`.
    pub fn take_err(&self) -> Option<Error> {
        self.shared.err.lock().unwrap().take()
    }

    /// Stops the pump. Idempotent; safe to call from any clone.
    pub fn close(&self) {
        self.shared.stop.fire();
    }
}

impl<T> Clone for BrokerStream<T> {
    fn clone(&self) -> Self {
        let rx = self.rx.lock().unwrap().clone();
        BrokerStream {
            rx: Mutex::new(rx),
            shared: self.shared.clone(),
        }
    }
}

/// The pub/sub stream of a connection: an event stream plus the handle
/// managing its subscription set.
#[derive(Clone)]
pub struct PubSubStream {
    events: BrokerStream<EvntPayload>,
    sub: Arc<dyn Subscriber>,
}

impl PubSubStream {
    pub(crate) fn new(events: BrokerStream<EvntPayload>, sub: Arc<dyn Subscriber>) -> Self {
        PubSubStream { events, sub }
    }

    pub fn subscribe(&self, channel: &str, pattern: bool) -> Result<(), Error> {
        self.sub.subscribe(channel, pattern).map_err(Error::from)
    }

    pub fn unsubscribe(&self, channel: &str, pattern: bool) -> Result<(), Error> {
        self.sub.unsubscribe(channel, pattern).map_err(Error::from)
    }

    /// Blocking receive of the next event; `None` once terminated.
    pub fn recv(&self) -> Option<EvntPayload> {
        self.events.recv()
    }

    pub fn take_err(&self) -> Option<Error> {
        self.events.take_err()
    }

    /// Closes the event stream and tears down the subscription set.
    pub fn close(&self) {
        self.events.close();
        self.sub.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn counting_stream(n: u32, started: Arc<AtomicBool>) -> BrokerStream<u32> {
        BrokerStream::new(move |pump| {
            started.store(true, Ordering::SeqCst);
            for i in 0..n {
                if pump.stopped() || !pump.deliver(i) {
                    return;
                }
            }
        })
    }

    #[test]
    fn pump_starts_on_first_recv_only() {
        let started = Arc::new(AtomicBool::new(false));
        let s = counting_stream(1, started.clone());
        std::thread::sleep(Duration::from_millis(20));
        assert!(!started.load(Ordering::SeqCst));
        assert_eq!(s.recv(), Some(0));
        assert!(started.load(Ordering::SeqCst));
        assert_eq!(s.recv(), None);
    }

    #[test]
    fn clones_share_one_sequence() {
        let s = counting_stream(100, Arc::new(AtomicBool::new(false)));
        let s2 = s.clone();
        let h = may::go!(move || {
            let mut got = vec![];
            while let Some(i) = s2.recv() {
                got.push(i);
            }
            got
        });
        let mut got = vec![];
        while let Some(i) = s.recv() {
            got.push(i);
        }
        let mut all = got;
        all.extend(h.join().unwrap());
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn close_stops_the_pump() {
        let s: BrokerStream<u32> = BrokerStream::new(|pump| {
            while !pump.stopped() {
                may::coroutine::sleep(Duration::from_millis(5));
            }
            pump.fail(Error::Closed);
        });
        assert!(s.take_err().is_none());
        let s2 = s.clone();
        may::go!(move || {
            may::coroutine::sleep(Duration::from_millis(20));
            s2.close();
            s2.close();
        });
        assert_eq!(s.recv(), None);
        assert!(matches!(s.take_err(), Some(Error::Closed)));
    }
}
