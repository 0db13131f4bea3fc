//! Client-side call bookkeeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use muxrpc_common::{Result, RpcError, Seq};

/// Capacity of the done channel [`Client::call`] allocates for itself.
///
/// [`Client::call`]: crate::Client::call
pub const DONE_BUFFER: usize = 10;

/// One in-flight invocation, shared between the submitting task and the
/// receive loop.
///
/// Completion delivers the call on its done channel exactly once — after
/// a successful response, a header-reported error, a write failure, or
/// engine teardown. After delivery the outcome slots belong to whoever
/// received it.
pub struct Call {
    pub service_method: String,
    seq: AtomicU64,
    pub(crate) args: Value,
    reply: Mutex<Value>,
    error: Mutex<Option<RpcError>>,
    done: mpsc::Sender<Arc<Call>>,
}

impl Call {
    pub(crate) fn new(service_method: String, args: Value, done: mpsc::Sender<Arc<Call>>) -> Arc<Call> {
        Arc::new(Call {
            service_method,
            seq: AtomicU64::new(0),
            args,
            reply: Mutex::new(Value::Null),
            error: Mutex::new(None),
            done,
        })
    }

    /// Sequence number assigned at registration; 0 until then.
    pub fn seq(&self) -> Seq {
        self.seq.load(Ordering::Acquire)
    }

    pub(crate) fn set_seq(&self, seq: Seq) {
        self.seq.store(seq, Ordering::Release);
    }

    pub(crate) fn set_reply(&self, value: Value) {
        *self.reply.lock() = value;
    }

    pub(crate) fn set_error(&self, err: RpcError) {
        *self.error.lock() = Some(err);
    }

    /// Raw reply value; null until the call completes successfully.
    pub fn reply_value(&self) -> Value {
        self.reply.lock().clone()
    }

    /// Takes the outcome: the recorded error if there is one, otherwise
    /// the reply decoded as `R`. Meant to be consumed once, after the
    /// call's single done delivery.
    pub fn result<R: DeserializeOwned>(&self) -> Result<R> {
        if let Some(err) = self.error.lock().take() {
            return Err(err);
        }
        Ok(serde_json::from_value(self.reply.lock().clone())?)
    }

    /// Delivers the call on its done channel. A full channel means the
    /// caller under-buffered a shared channel; the delivery is dropped
    /// with a warning rather than blocking the receive loop.
    pub(crate) fn complete(self: &Arc<Self>) {
        if let Err(err) = self.done.try_send(Arc::clone(self)) {
            warn!(
                service_method = %self.service_method,
                "done channel unavailable, dropping completion: {err}"
            );
        }
    }

    pub(crate) fn fail(self: &Arc<Self>, err: RpcError) {
        self.set_error(err);
        self.complete();
    }
}
