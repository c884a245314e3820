//! Bookkeeping for calls this side has issued and not yet seen resolved.

use crate::body::BodyReader;
use crate::error::RpcError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;

/// What a successful call delivers to its caller.
#[derive(Debug)]
pub enum Delivered<V> {
    /// A decoded result value.
    Value(V),
    /// A download body; the caller now owns the read half until it is
    /// drained or dropped.
    Body(BodyReader),
}

pub type CallResult<V> = Result<Delivered<V>, RpcError>;

/// Completion side of a pending call.
#[derive(Debug)]
pub struct PendingCall<V> {
    pub id: u64,
    completion: oneshot::Sender<CallResult<V>>,
    /// Whether the caller asked for the response body rather than a value.
    pub expects_body: bool,
    /// Whether the request carried an upload body.
    pub uploads: bool,
}

impl<V> PendingCall<V> {
    /// Resolves the call. The record is consumed, so a call resolves once.
    ///
    /// Returns false if the caller stopped waiting; a body handed back that
    /// way is dropped here, which releases it.
    pub fn complete(self, result: CallResult<V>) -> bool {
        self.completion.send(result).is_ok()
    }
}

/// Concurrent map of pending calls keyed by call id.
#[derive(Debug)]
pub struct CallTable<V> {
    pending: DashMap<u64, PendingCall<V>>,
}

impl<V> CallTable<V> {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Registers a pending call and returns the receiver its caller awaits.
    pub fn register(
        &self,
        id: u64,
        expects_body: bool,
    ) -> Result<oneshot::Receiver<CallResult<V>>, RpcError> {
        self.insert(id, expects_body, false)
    }

    /// Registers a call whose request is followed by an upload body.
    pub fn register_upload(&self, id: u64) -> Result<oneshot::Receiver<CallResult<V>>, RpcError> {
        self.insert(id, false, true)
    }

    fn insert(
        &self,
        id: u64,
        expects_body: bool,
        uploads: bool,
    ) -> Result<oneshot::Receiver<CallResult<V>>, RpcError> {
        match self.pending.entry(id) {
            Entry::Occupied(_) => Err(RpcError::DuplicateCallId(id)),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(PendingCall {
                    id,
                    completion: tx,
                    expects_body,
                    uploads,
                });
                Ok(rx)
            }
        }
    }

    /// Removes and resolves the record for `id`. Returns false if the id is
    /// unknown, which covers calls already resolved or canceled.
    pub fn resolve(&self, id: u64, result: CallResult<V>) -> bool {
        match self.remove(id) {
            Some(call) => {
                call.complete(result);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: u64) -> Option<PendingCall<V>> {
        self.pending.remove(&id).map(|(_, call)| call)
    }

    /// Removes every record, failing each with an error built by `failure`.
    /// Returns how many calls were failed.
    pub fn drain_all(&self, failure: impl Fn() -> RpcError) -> usize {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if self.resolve(id, Err(failure())) {
                failed += 1;
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }

    /// Pending ids in ascending order.
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }
}

impl<V> Default for CallTable<V> {
    fn default() -> Self {
        Self::new()
    }
}
