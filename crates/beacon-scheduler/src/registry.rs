//! Per-instance execution handles.
//!
//! Each instance id maps to at most one armed [`ExecutionTicket`] plus a run
//! gate. Arming a new ticket atomically cancels the previous one and bumps the
//! epoch, so a superseded run can always tell it lost. The gate is an async
//! mutex held from the moment a run starts until its result is persisted; it
//! is what keeps two runs of the same instance from ever overlapping.
//!
//! The map is a [`DashMap`], so operations on unrelated instances only
//! contend when their ids hash to the same shard.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use beacon_core::InstanceId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Monotonic scheduling generation. Higher means newer intent.
pub type Epoch = u64;

/// Handed to the task armed for one scheduling intent.
#[derive(Debug, Clone)]
pub struct ExecutionTicket {
    pub instance_id: InstanceId,
    pub epoch: Epoch,
    /// Fires when the ticket is replaced or cancelled.
    pub cancel: CancellationToken,
}

#[derive(Debug)]
struct Handle {
    epoch: Epoch,
    cancel: CancellationToken,
    fires_at: Instant,
}

#[derive(Debug, Default)]
struct Slot {
    handle: Option<Handle>,
    gate: Arc<Mutex<()>>,
}

impl Slot {
    fn is_idle(&self) -> bool {
        self.handle.is_none() && Arc::strong_count(&self.gate) == 1
    }
}

#[derive(Debug, Default)]
pub struct ExecutionRegistry {
    slots: DashMap<InstanceId, Slot>,
    epochs: AtomicU64,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `job` to run after `delay`, replacing any handle for `instance_id`.
    ///
    /// The replaced ticket's token is cancelled; its in-flight run, if any,
    /// is expected to notice and stop. Returns the new epoch.
    pub fn schedule<F, Fut>(&self, instance_id: InstanceId, delay: Duration, job: F) -> Epoch
    where
        F: FnOnce(ExecutionTicket) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (ticket, replaced) = {
            let mut slot = self.slots.entry(instance_id).or_default();
            let (ticket, handle) = self.issue(instance_id, delay);
            (ticket, slot.handle.replace(handle))
        };
        if let Some(old) = replaced {
            debug!(instance_id, old_epoch = old.epoch, new_epoch = ticket.epoch, "execution handle replaced");
            old.cancel.cancel();
        }
        let epoch = ticket.epoch;
        spawn_armed(ticket, delay, job);
        epoch
    }

    /// Like [`schedule`](Self::schedule), but only when `expected` is still
    /// the current epoch. Returns `None` if a newer intent got there first.
    pub fn reschedule<F, Fut>(
        &self,
        instance_id: InstanceId,
        expected: Epoch,
        delay: Duration,
        job: F,
    ) -> Option<Epoch>
    where
        F: FnOnce(ExecutionTicket) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (ticket, replaced) = match self.slots.entry(instance_id) {
            Entry::Occupied(mut entry) => {
                let current = entry.get().handle.as_ref().map(|h| h.epoch);
                if current != Some(expected) {
                    return None;
                }
                let (ticket, handle) = self.issue(instance_id, delay);
                (ticket, entry.get_mut().handle.replace(handle))
            }
            Entry::Vacant(_) => return None,
        };
        if let Some(old) = replaced {
            old.cancel.cancel();
        }
        let epoch = ticket.epoch;
        spawn_armed(ticket, delay, job);
        Some(epoch)
    }

    /// Invalidate and drop the handle. Returns `false` (and does nothing)
    /// when no handle exists.
    pub fn cancel(&self, instance_id: InstanceId) -> bool {
        let removed = self
            .slots
            .get_mut(&instance_id)
            .and_then(|mut slot| slot.handle.take());
        self.prune(instance_id);
        match removed {
            Some(handle) => {
                debug!(instance_id, epoch = handle.epoch, "execution handle cancelled");
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the handle only if it still belongs to `epoch`.
    /// Used when a recurrence ends on its own (FATAL result, instance gone).
    pub fn retire(&self, instance_id: InstanceId, epoch: Epoch) -> bool {
        let retired = match self.slots.get_mut(&instance_id) {
            Some(mut slot) if slot.handle.as_ref().is_some_and(|h| h.epoch == epoch) => {
                slot.handle.take().is_some()
            }
            _ => false,
        };
        self.prune(instance_id);
        retired
    }

    /// Cancel every handle. Returns how many were armed.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<InstanceId> = self.slots.iter().map(|e| *e.key()).collect();
        ids.into_iter().filter(|id| self.cancel(*id)).count()
    }

    /// Wait for exclusive right to run `instance_id`.
    pub async fn acquire(&self, instance_id: InstanceId) -> OwnedMutexGuard<()> {
        // Clone out of the map before awaiting; never hold a shard lock across `.await`.
        let gate = Arc::clone(&self.slots.entry(instance_id).or_default().gate);
        gate.lock_owned().await
    }

    /// Forget the slot if nothing is armed and nobody holds or awaits its gate.
    pub fn prune(&self, instance_id: InstanceId) {
        self.slots.remove_if(&instance_id, |_, slot| slot.is_idle());
    }

    /// Run `persist` only if `epoch` still holds the handle, keeping the slot
    /// locked until it returns.
    ///
    /// [`cancel`](Self::cancel) and [`schedule`](Self::schedule) for the same
    /// instance wait for `persist` to finish, so once `cancel` returns no
    /// result of the cancelled epoch can still be written. `persist` must not
    /// touch this registry.
    pub fn commit_if_current<R>(
        &self,
        instance_id: InstanceId,
        epoch: Epoch,
        persist: impl FnOnce() -> R,
    ) -> Option<R> {
        let slot = self.slots.get(&instance_id)?;
        match &slot.handle {
            Some(handle) if handle.epoch == epoch && !handle.cancel.is_cancelled() => {
                Some(persist())
            }
            _ => None,
        }
    }

    pub fn is_current(&self, instance_id: InstanceId, epoch: Epoch) -> bool {
        self.current_epoch(instance_id) == Some(epoch)
    }

    pub fn current_epoch(&self, instance_id: InstanceId) -> Option<Epoch> {
        self.slots
            .get(&instance_id)
            .and_then(|slot| slot.handle.as_ref().map(|h| h.epoch))
    }

    pub fn has_handle(&self, instance_id: InstanceId) -> bool {
        self.current_epoch(instance_id).is_some()
    }

    /// When the current handle was (or will be) due.
    pub fn fires_at(&self, instance_id: InstanceId) -> Option<Instant> {
        self.slots
            .get(&instance_id)
            .and_then(|slot| slot.handle.as_ref().map(|h| h.fires_at))
    }

    /// Number of armed handles.
    pub fn armed(&self) -> usize {
        self.slots.iter().filter(|e| e.handle.is_some()).count()
    }

    fn issue(&self, instance_id: InstanceId, delay: Duration) -> (ExecutionTicket, Handle) {
        let epoch = self.epochs.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let ticket = ExecutionTicket {
            instance_id,
            epoch,
            cancel: cancel.clone(),
        };
        let handle = Handle {
            epoch,
            cancel,
            fires_at: Instant::now() + delay,
        };
        (ticket, handle)
    }
}

fn spawn_armed<F, Fut>(ticket: ExecutionTicket, delay: Duration, job: F)
where
    F: FnOnce(ExecutionTicket) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let cancel = ticket.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => job(ticket).await,
        }
    });
}
