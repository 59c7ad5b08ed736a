//! The broker capabilities over an abstract key/list/pub-sub [`Store`].
//!
//! Key schema, hash-tagged for shard affinity:
//!
//! ```text
//! juggler:calls:{URI}                          pending call payloads
//! juggler:calls:timeout:{URI}:{CALL_UUID}      expiring key, the call's validity
//! juggler:results:{CALLER_UUID}                pending result payloads
//! juggler:results:timeout:{CALLER_UUID}:{CALL_UUID}
//! ```
//!
//! A call lives as two keys on purpose: expiration is observable without
//! mutating the queue, and the caller's check-and-delete of the result
//! timeout key is what makes delivery at-most-once.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::debug;
use uuid::Uuid;

use crate::broker::{
    BrokerStream, CallerBroker, CalleeBroker, CallsStream, PubSubBroker, PubSubStream,
    ResultsStream, DEFAULT_CALL_TIMEOUT,
};
use crate::errors::Error;
use crate::msg::{CallPayload, EvntPayload, PubPayload, ResPayload};
use crate::store::{Store, StoreError, Subscriber};

/// Default bounded wait of blocking dequeues and event polls, so pumps
/// can observe their stop signal.
pub const DEFAULT_BLOCKING_TIMEOUT: Duration = Duration::from_secs(5);

fn call_key(uri: &str) -> String {
    format!("juggler:calls:{{{uri}}}")
}

fn call_timeout_key(uri: &str, call_uuid: Uuid) -> String {
    format!("juggler:calls:timeout:{{{uri}}}:{call_uuid}")
}

fn result_key(caller_uuid: Uuid) -> String {
    format!("juggler:results:{{{caller_uuid}}}")
}

fn result_timeout_key(caller_uuid: Uuid, call_uuid: Uuid) -> String {
    format!("juggler:results:timeout:{{{caller_uuid}}}:{call_uuid}")
}

fn cap_err(e: StoreError) -> Error {
    match e {
        StoreError::CapacityExceeded => Error::CapacityExceeded,
        e => Error::Store(e),
    }
}

/// Broker over a [`Store`], implementing all three capabilities.
pub struct KvBroker<S> {
    store: Arc<S>,
    /// Bound of the blocking store polls.
    pub blocking_timeout: Duration,
    /// Capacity of each per-URI call queue, 0 = unbounded.
    pub call_cap: u32,
    /// Capacity of each per-caller result queue, 0 = unbounded.
    pub result_cap: u32,
}

impl<S: Store> KvBroker<S> {
    pub fn new(store: Arc<S>) -> Self {
        KvBroker {
            store,
            blocking_timeout: DEFAULT_BLOCKING_TIMEOUT,
            call_cap: 0,
            result_cap: 0,
        }
    }
}

impl<S: Store> CallerBroker for KvBroker<S> {
    fn call(&self, cp: &CallPayload, timeout: Duration) -> Result<(), Error> {
        let timeout = if timeout.is_zero() {
            DEFAULT_CALL_TIMEOUT
        } else {
            timeout
        };
        let payload = Bytes::from(serde_json::to_vec(cp)?);
        self.store
            .enqueue(
                &call_timeout_key(&cp.uri, cp.msg_uuid),
                timeout,
                &call_key(&cp.uri),
                payload,
                self.call_cap,
            )
            .map_err(cap_err)
    }

    fn results(&self, conn_uuid: Uuid) -> Result<ResultsStream, Error> {
        let store = self.store.clone();
        let block = self.blocking_timeout;
        let keys = [result_key(conn_uuid)];
        Ok(BrokerStream::new(move |pump| {
            while !pump.stopped() {
                let payload = match store.dequeue(&keys, block) {
                    Ok(None) => continue,
                    Ok(Some((_, payload))) => payload,
                    Err(e) => return pump.fail(e.into()),
                };
                let rp: ResPayload = match serde_json::from_slice(&payload) {
                    Ok(rp) => rp,
                    Err(e) => return pump.fail(e.into()),
                };
                // at-most-once: the result is only delivered while its
                // timeout key lives, and taking the key prevents a retry
                // from delivering it twice
                match store.take_key(&result_timeout_key(rp.caller_uuid, rp.call_uuid)) {
                    Ok(true) => {
                        if !pump.deliver(rp) {
                            return;
                        }
                    }
                    Ok(false) => {
                        debug!(
                            "dropping expired result {} for caller {}",
                            rp.call_uuid, rp.caller_uuid
                        );
                    }
                    Err(e) => return pump.fail(e.into()),
                }
            }
        }))
    }
}

impl<S: Store> CalleeBroker for KvBroker<S> {
    fn calls(&self, uris: &[&str]) -> Result<CallsStream, Error> {
        let store = self.store.clone();
        let block = self.blocking_timeout;
        let keys: Vec<String> = uris.iter().map(|uri| call_key(uri)).collect();
        Ok(BrokerStream::new(move |pump| {
            while !pump.stopped() {
                let payload = match store.dequeue(&keys, block) {
                    Ok(None) => continue,
                    Ok(Some((_, payload))) => payload,
                    Err(e) => return pump.fail(e.into()),
                };
                match serde_json::from_slice::<CallPayload>(&payload) {
                    Ok(cp) => {
                        if !pump.deliver(cp) {
                            return;
                        }
                    }
                    Err(e) => return pump.fail(e.into()),
                }
            }
        }))
    }

    fn result(&self, rp: &ResPayload, timeout: Duration) -> Result<(), Error> {
        // the remaining budget of the originating call, measured now
        let mut remaining = match self
            .store
            .ttl_remaining(&call_timeout_key(&rp.uri, rp.call_uuid))?
        {
            Some(d) if !d.is_zero() => d,
            _ => {
                debug!(
                    "discarding result of expired call {} for caller {}",
                    rp.call_uuid, rp.caller_uuid
                );
                return Ok(());
            }
        };
        if !timeout.is_zero() && timeout < remaining {
            remaining = timeout;
        }
        let payload = Bytes::from(serde_json::to_vec(rp)?);
        self.store
            .enqueue(
                &result_timeout_key(rp.caller_uuid, rp.call_uuid),
                remaining,
                &result_key(rp.caller_uuid),
                payload,
                self.result_cap,
            )
            .map_err(cap_err)
    }
}

impl<S: Store> PubSubBroker for KvBroker<S> {
    fn publish(&self, channel: &str, pp: &PubPayload) -> Result<(), Error> {
        let payload = Bytes::from(serde_json::to_vec(pp)?);
        self.store.publish(channel, payload).map_err(Error::from)
    }

    fn pubsub(&self) -> Result<PubSubStream, Error> {
        let sub: Arc<dyn Subscriber> = Arc::from(self.store.subscriber()?);
        let pump_sub = sub.clone();
        let block = self.blocking_timeout;
        let events = BrokerStream::new(move |pump| {
            while !pump.stopped() {
                let ev = match pump_sub.next_event(block) {
                    Ok(None) => continue,
                    Ok(Some(ev)) => ev,
                    // the subscription was torn down under us: clean end
                    Err(StoreError::Closed) => return,
                    Err(e) => return pump.fail(e.into()),
                };
                let pp: PubPayload = match serde_json::from_slice(&ev.payload) {
                    Ok(pp) => pp,
                    Err(e) => return pump.fail(e.into()),
                };
                let ep = EvntPayload {
                    channel: ev.channel,
                    pattern: ev.pattern,
                    args: pp.args,
                };
                if !pump.deliver(ep) {
                    return;
                }
            }
        });
        Ok(PubSubStream::new(events, sub))
    }
}
