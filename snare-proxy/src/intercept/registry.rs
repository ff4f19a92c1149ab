use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::InterceptError;
use crate::exchange::{ExchangeContext, ExchangeId};

#[derive(Debug)]
pub(crate) enum Decision<T> {
    Modified(T),
    Discard,
}

struct PendingEntry<T> {
    original: Arc<T>,
    cancel: CancellationToken,
    handoff: Mutex<Option<oneshot::Sender<Decision<T>>>>,
}

impl<T> PendingEntry<T> {
    /// Marks the entry complete. Returns false if a decision already took
    /// the handoff.
    fn close(&self) -> bool {
        self.handoff.lock().take().is_some()
    }

    /// Still waiting on a decision: the handoff is unused and the exchange
    /// is alive.
    fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && self.handoff.lock().is_some()
    }

    /// Hands over a decision unless the entry is complete. A cancelled
    /// exchange counts as complete even before its waiter has woken up.
    fn deliver(&self, decision: Decision<T>) -> Result<(), InterceptError> {
        let mut handoff = self.handoff.lock();
        if self.cancel.is_cancelled() {
            handoff.take();
            return Err(InterceptError::Done);
        }
        let sender = handoff.take().ok_or(InterceptError::Done)?;
        sender.send(decision).map_err(|_| InterceptError::Done)
    }
}

/// Map of exchanges waiting on an operator decision. The lock guards map
/// operations only; waiting happens outside it.
pub(crate) struct PendingRegistry<T> {
    entries: RwLock<BTreeMap<ExchangeId, Arc<PendingEntry<T>>>>,
}

impl<T> Default for PendingRegistry<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

struct Cleanup<'a, T> {
    registry: &'a PendingRegistry<T>,
    id: ExchangeId,
    entry: Arc<PendingEntry<T>>,
}

impl<T> Drop for Cleanup<'_, T> {
    fn drop(&mut self) {
        self.entry.close();
        self.registry.remove(self.id, &self.entry);
    }
}

impl<T> PendingRegistry<T> {
    /// Parks `original` under the exchange id until a decision arrives or
    /// the exchange is cancelled. The entry is gone by the time this returns.
    pub(crate) async fn intercept(
        &self,
        ctx: &ExchangeContext,
        original: T,
    ) -> Result<T, InterceptError> {
        let id = ctx.id();
        let (sender, mut receiver) = oneshot::channel();
        let entry = Arc::new(PendingEntry {
            original: Arc::new(original),
            cancel: ctx.cancellation().clone(),
            handoff: Mutex::new(Some(sender)),
        });

        {
            let mut entries = self.entries.write();
            if entries.contains_key(&id) {
                return Err(InterceptError::AlreadyPending);
            }
            entries.insert(id, entry.clone());
        }
        let _cleanup = Cleanup {
            registry: self,
            id,
            entry: entry.clone(),
        };

        let received = tokio::select! {
            biased;
            received = &mut receiver => received.ok(),
            _ = ctx.cancelled() => {
                entry.close();
                receiver.try_recv().ok()
            }
        };

        match received {
            Some(Decision::Modified(value)) => Ok(value),
            Some(Decision::Discard) => Err(InterceptError::Aborted),
            None if ctx.is_cancelled() => Err(InterceptError::Cancelled),
            None => Err(InterceptError::Aborted),
        }
    }

    pub(crate) fn submit(&self, id: ExchangeId, decision: Decision<T>) -> Result<(), InterceptError> {
        let entry = self
            .entries
            .read()
            .get(&id)
            .cloned()
            .ok_or(InterceptError::NotFound)?;
        let delivered = entry.deliver(decision);
        self.remove(id, &entry);
        delivered
    }

    /// Sends a discard to every entry still waiting. Completed entries are
    /// skipped.
    pub(crate) fn discard_all(&self) -> usize {
        let entries: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect();
        entries
            .iter()
            .filter(|(id, entry)| {
                let delivered = entry.deliver(Decision::Discard).is_ok();
                self.remove(*id, entry);
                delivered
            })
            .count()
    }

    pub(crate) fn list(&self) -> Vec<(ExchangeId, Arc<T>)> {
        self.entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.is_open())
            .map(|(id, entry)| (*id, entry.original.clone()))
            .collect()
    }

    pub(crate) fn get(&self, id: ExchangeId) -> Option<Arc<T>> {
        self.entries
            .read()
            .get(&id)
            .filter(|entry| entry.is_open())
            .map(|entry| entry.original.clone())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|entry| entry.is_open())
            .count()
    }

    /// Drops `entry` from the map unless a newer entry has taken its id.
    fn remove(&self, id: ExchangeId, entry: &Arc<PendingEntry<T>>) {
        let mut entries = self.entries.write();
        if entries
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            entries.remove(&id);
        }
    }
}
