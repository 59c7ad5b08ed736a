//! The callee worker pool: pulls pending calls off the broker, runs the
//! user function and stores the outcome as the call's result.

use std::sync::Arc;
use std::time::Duration;

use log::warn;
use may::{coroutine, go};
use serde_json::{json, Value};

use crate::broker::{CalleeBroker, CallsStream};
use crate::errors::Error;
use crate::msg::{CallPayload, ResPayload};

/// The user function invoked for each call. An error return is still a
/// result: it is encoded into the RES args and delivered to the caller.
pub type Thunk =
    dyn Fn(&CallPayload) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> + Send + Sync;

/// A callee, processing calls for a set of URIs.
pub struct Callee {
    broker: Arc<dyn CalleeBroker>,
}

impl Callee {
    pub fn new(broker: Arc<dyn CalleeBroker>) -> Callee {
        Callee { broker }
    }

    /// Invokes `thunk` for `cp` and stores the outcome as the call's
    /// result within the call's remaining budget. A result whose call
    /// already expired is discarded by the broker.
    pub fn invoke_and_store_result(&self, cp: &CallPayload, thunk: &Thunk) -> Result<(), Error> {
        let args = match thunk(cp) {
            Ok(v) => v,
            Err(e) => json!({ "error": e.to_string() }),
        };
        let rp = ResPayload {
            call_uuid: cp.msg_uuid,
            caller_uuid: cp.conn_uuid,
            uri: cp.uri.clone(),
            args,
        };
        self.broker.result(&rp, Duration::ZERO)
    }

    /// Starts `workers` coroutines draining one shared calls stream for
    /// `uris`. Ordering across workers is unspecified.
    pub fn listen(
        &self,
        uris: &[&str],
        workers: usize,
        thunk: Arc<Thunk>,
    ) -> Result<CalleePool, Error> {
        let stream = self.broker.calls(uris)?;
        let mut handles = Vec::new();
        for i in 0..workers.max(1) {
            let stream = stream.clone();
            let broker = self.broker.clone();
            let thunk = thunk.clone();
            handles.push(go!(move || {
                let callee = Callee::new(broker);
                while let Some(cp) = stream.recv() {
                    if let Err(e) = callee.invoke_and_store_result(&cp, thunk.as_ref()) {
                        warn!("worker {}: storing result of {} failed: {}", i, cp.msg_uuid, e);
                    }
                }
            }));
        }
        Ok(CalleePool { stream, handles })
    }
}

/// Handle on a running worker pool. Dropping it stops the workers.
pub struct CalleePool {
    stream: CallsStream,
    handles: Vec<coroutine::JoinHandle<()>>,
}

impl CalleePool {
    /// Stops the shared calls stream; the workers drain it and exit.
    pub fn close(&self) {
        self.stream.close();
    }
}

impl Drop for CalleePool {
    fn drop(&mut self) {
        self.stream.close();
        for h in self.handles.drain(..) {
            unsafe { h.coroutine().cancel() };
            h.join().ok();
        }
    }
}
