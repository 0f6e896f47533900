//! The model-wide synchronization point and deadlock monitor.
//!
//! Every rendezvous object in one model — channels, transactional channels,
//! controllers, process records — lives behind a single mutex owned by the
//! [`Director`], with one condition variable for all blocking waits. The
//! coarse lock is load-bearing: deadlock detection compares the number of
//! blocked processes against the number of active ones, and that comparison
//! is only meaningful if every state transition is serialized with every
//! other.
//!
//! # Accounting
//!
//! A process reports itself blocked before any condition wait. Whichever
//! process completes a transfer marks the *peer* unblocked in its own
//! execution context, rather than leaving the peer to fix the counters when
//! it is eventually rescheduled. Block/unblock transitions are idempotent
//! per process record, so eager sibling releases cannot double-count.
//!
//! # Termination
//!
//! When every active process is blocked, the model cannot make progress.
//! The blocking transition that closes the gap requests a finish: the
//! finish flag is set and every waiter is woken. Each wait loop observes
//! the flag on wake and unwinds with [`RendezvousError::Terminated`].

use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use slab::Slab;

use crate::barrier::BarrierState;
use crate::channel::ChannelState;
use crate::choice::ControllerState;
use crate::transaction::TxChannelState;
use crate::types::{ProcessIdx, Token, TxChannelIdx};

/// A registered unit of control, as seen by the deadlock monitor.
pub(crate) struct ProcessRecord {
    pub name: String,
    /// Whether this process currently counts as blocked.
    pub blocked: bool,
    /// Token delivered by a peer completing a two-party rendezvous.
    pub handoff: Option<Token>,
    /// Result map delivered by a committed transaction.
    pub released: Option<FxHashMap<TxChannelIdx, Token>>,
}

/// All rendezvous state of one model. Guarded by the director's mutex.
pub(crate) struct ModelState {
    pub channels: Slab<ChannelState>,
    pub tx_channels: Slab<TxChannelState>,
    pub controllers: Slab<ControllerState>,
    pub barriers: Slab<BarrierState>,
    pub processes: Slab<ProcessRecord>,
    pub active: usize,
    pub blocked: usize,
    pub finish_requested: bool,
    pub deadlock_detected: bool,
}

impl ModelState {
    pub fn process(&self, idx: ProcessIdx) -> &ProcessRecord {
        &self.processes[idx]
    }

    pub fn process_mut(&mut self, idx: ProcessIdx) -> &mut ProcessRecord {
        &mut self.processes[idx]
    }
}

/// The shared lock, condition variable, and counters of one model.
///
/// One director exists per model run. Channels and controllers hold an
/// `Arc<Director>` and never lock anything else.
pub struct Director {
    shared: Mutex<ModelState>,
    changed: Condvar,
}

/// Handle identifying a registered process.
///
/// Not `Clone`: the handle is the process's identity, created by
/// [`Director::process_started`] and retired by
/// [`Director::process_stopped`].
pub struct Process {
    director: Arc<Director>,
    idx: ProcessIdx,
    name: String,
}

impl Process {
    pub fn idx(&self) -> ProcessIdx {
        self.idx
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn director(&self) -> &Arc<Director> {
        &self.director
    }
}

impl Director {
    pub fn new() -> Arc<Self> {
        Arc::new(Director {
            shared: Mutex::new(ModelState {
                channels: Slab::new(),
                tx_channels: Slab::new(),
                controllers: Slab::new(),
                barriers: Slab::new(),
                processes: Slab::new(),
                active: 0,
                blocked: 0,
                finish_requested: false,
                deadlock_detected: false,
            }),
            changed: Condvar::new(),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ModelState> {
        self.shared.lock()
    }

    pub(crate) fn notify_all(&self) {
        self.changed.notify_all();
    }

    /// Register a new process and count it active.
    ///
    /// Every process of a model must be registered before any of them
    /// starts communicating; a process that blocks while siblings are
    /// still unregistered would otherwise trip the deadlock check early.
    pub fn process_started(self: &Arc<Self>, name: &str) -> Process {
        let mut state = self.lock();
        let idx = state.processes.insert(ProcessRecord {
            name: name.to_string(),
            blocked: false,
            handoff: None,
            released: None,
        });
        state.active += 1;
        log::debug!("process {} ({}) started, {} active", idx, name, state.active);
        Process {
            director: self.clone(),
            idx,
            name: name.to_string(),
        }
    }

    /// Retire a process. An exit can expose a deadlock among the
    /// remaining processes, so the check runs here too.
    pub fn process_stopped(&self, process: Process) {
        let mut state = self.lock();
        let record = state.processes.remove(process.idx);
        if record.blocked {
            state.blocked -= 1;
        }
        state.active -= 1;
        log::debug!(
            "process {} ({}) stopped, {} active / {} blocked",
            process.idx,
            record.name,
            state.active,
            state.blocked
        );
        self.check_deadlock(&mut state);
        self.notify_all();
    }

    /// Count the given process blocked and re-check for deadlock.
    pub fn process_blocked(&self, process: &Process) {
        let mut state = self.lock();
        self.thread_blocked(&mut state, process.idx);
    }

    /// Count the given process unblocked.
    pub fn process_unblocked(&self, process: &Process) {
        let mut state = self.lock();
        self.thread_unblocked(&mut state, process.idx);
    }

    pub fn is_finish_requested(&self) -> bool {
        self.lock().finish_requested
    }

    /// True if the finish was triggered by the deadlock check rather than
    /// an explicit [`Director::request_finish`].
    pub fn deadlock_detected(&self) -> bool {
        self.lock().deadlock_detected
    }

    /// Ask every process in the model to terminate.
    ///
    /// Every blocked wait observes the flag and unwinds with
    /// [`RendezvousError::Terminated`]; processes between rendezvous
    /// observe it on their next operation.
    pub fn request_finish(&self) {
        let mut state = self.lock();
        self.finish(&mut state);
    }

    /// Clear counters, flags, and stale process records between runs.
    /// Channels and controllers stay registered; their pending-operation
    /// flags are reset.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.processes.clear();
        state.active = 0;
        state.blocked = 0;
        state.finish_requested = false;
        state.deadlock_detected = false;
        for (_, channel) in state.channels.iter_mut() {
            channel.reset();
        }
        for (_, channel) in state.tx_channels.iter_mut() {
            channel.reset();
        }
        for (_, controller) in state.controllers.iter_mut() {
            controller.reset_invocation(0, 0);
        }
        for (_, barrier) in state.barriers.iter_mut() {
            barrier.reset_invocation(0, 0);
        }
        self.notify_all();
    }

    /// Number of processes currently registered as active.
    pub fn active_count(&self) -> usize {
        self.lock().active
    }

    /// Number of processes currently counted blocked.
    pub fn blocked_count(&self) -> usize {
        self.lock().blocked
    }

    /// Register a transient controller worker while the lock is already
    /// held. Workers count as processes for the deadlock check exactly
    /// like scheduler-owned ones.
    pub(crate) fn worker_started(&self, state: &mut ModelState, name: String) -> ProcessIdx {
        let idx = state.processes.insert(ProcessRecord {
            name,
            blocked: false,
            handoff: None,
            released: None,
        });
        state.active += 1;
        log::trace!("worker {} started, {} active", idx, state.active);
        idx
    }

    pub(crate) fn worker_stopped(&self, state: &mut ModelState, idx: ProcessIdx) {
        let record = state.processes.remove(idx);
        if record.blocked {
            state.blocked -= 1;
        }
        state.active -= 1;
        log::trace!("worker {} stopped, {} active", idx, state.active);
        self.check_deadlock(state);
    }

    pub(crate) fn thread_blocked(&self, state: &mut ModelState, idx: ProcessIdx) {
        let record = state.process_mut(idx);
        if record.blocked {
            return;
        }
        record.blocked = true;
        state.blocked += 1;
        log::trace!(
            "process {} blocked, {} / {} active",
            idx,
            state.blocked,
            state.active
        );
        self.check_deadlock(state);
    }

    pub(crate) fn thread_unblocked(&self, state: &mut ModelState, idx: ProcessIdx) {
        let Some(record) = state.processes.get_mut(idx) else {
            return;
        };
        if !record.blocked {
            return;
        }
        record.blocked = false;
        state.blocked -= 1;
        log::trace!(
            "process {} unblocked, {} / {} active",
            idx,
            state.blocked,
            state.active
        );
    }

    /// Wait until some rendezvous state changes.
    ///
    /// Deliberately blind to the finish flag: every wait loop in the
    /// kernel re-checks its own completion condition *before* honoring a
    /// termination request, so a transfer that committed in the same
    /// instant as a finish is never lost, and controller owners keep
    /// waiting for worker exits even while the model is finishing.
    pub(crate) fn wait_raw(&self, state: &mut MutexGuard<'_, ModelState>) {
        self.changed.wait(state);
    }

    fn check_deadlock(&self, state: &mut ModelState) {
        if state.active > 0 && state.blocked == state.active && !state.finish_requested {
            log::info!(
                "deadlock: all {} active processes are blocked, finishing model",
                state.active
            );
            state.deadlock_detected = true;
            self.finish(state);
        }
    }

    fn finish(&self, state: &mut ModelState) {
        state.finish_requested = true;
        self.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_registration() {
        let director = Director::new();
        let p1 = director.process_started("a");
        let p2 = director.process_started("b");
        assert_eq!(director.active_count(), 2);
        director.process_stopped(p1);
        director.process_stopped(p2);
        assert_eq!(director.active_count(), 0);
    }

    #[test]
    fn blocking_everyone_requests_finish_once() {
        let director = Director::new();
        let p1 = director.process_started("a");
        let p2 = director.process_started("b");
        director.process_blocked(&p1);
        assert!(!director.is_finish_requested());
        director.process_blocked(&p2);
        assert!(director.is_finish_requested());
        assert!(director.deadlock_detected());
    }

    #[test]
    fn block_unblock_is_idempotent() {
        let director = Director::new();
        let p1 = director.process_started("a");
        let _p2 = director.process_started("b");
        director.process_blocked(&p1);
        director.process_blocked(&p1);
        assert_eq!(director.blocked_count(), 1);
        director.process_unblocked(&p1);
        director.process_unblocked(&p1);
        assert_eq!(director.blocked_count(), 0);
    }

    #[test]
    fn stopping_the_last_runnable_process_exposes_deadlock() {
        let director = Director::new();
        let p1 = director.process_started("a");
        let p2 = director.process_started("b");
        let p3 = director.process_started("c");
        director.process_blocked(&p1);
        director.process_blocked(&p2);
        assert!(!director.is_finish_requested());
        director.process_stopped(p3);
        assert!(director.is_finish_requested());
    }

    #[test]
    fn reset_clears_finish_state() {
        let director = Director::new();
        let p1 = director.process_started("a");
        director.request_finish();
        assert!(director.is_finish_requested());
        drop(p1);
        director.reset();
        assert!(!director.is_finish_requested());
        assert_eq!(director.active_count(), 0);
    }
}
