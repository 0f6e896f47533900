//! All-or-nothing multiway rendezvous.
//!
//! A [`BarrierController`] succeeds only if every enabled branch in the
//! group completes its transfer; the transfers commit together, in one
//! critical section, once a scan of the whole group finds every branch's
//! counterpart present. There is no first-trying token here — readiness
//! of the *group* replaces readiness of a single branch — but a branch
//! whose counterpart is a choice-conditional offer still claims that
//! offer's controller during the commit, so the exactly-one-winner rule
//! on the choice side is preserved.

use std::sync::Arc;

use crossbeam_utils::thread;
use fxhash::{FxHashMap, FxHashSet};

use crate::branch::{BranchKind, GuardedBranch};
use crate::channel::{BranchHome, BranchRef};
use crate::choice::{claimable_from_outside, commit_other, commit_send_on, take_outgoing};
use crate::director::{Director, ModelState, Process};
use crate::error::RendezvousError;
use crate::types::{BarrierIdx, BranchIdx, ChannelIdx, ProcessIdx, Token};

pub(crate) struct BarrierSlot {
    pub alive: bool,
    pub done: bool,
    pub value: Option<Token>,
}

/// One branch of the group, as the readiness scan sees it.
#[derive(Clone)]
pub(crate) struct BarrierBranch {
    pub id: BranchIdx,
    pub kind: BranchKind,
    pub channels: Vec<ChannelIdx>,
    pub worker: ProcessIdx,
}

/// Shared state of one barrier controller, guarded by the model lock.
pub(crate) struct BarrierState {
    pub owner: ProcessIdx,
    pub branches_active: usize,
    pub failed: bool,
    pub slots: FxHashMap<BranchIdx, BarrierSlot>,
    pub shape: Vec<BarrierBranch>,
}

impl BarrierState {
    pub fn new() -> Self {
        BarrierState {
            owner: 0,
            branches_active: 0,
            failed: false,
            slots: FxHashMap::default(),
            shape: Vec::new(),
        }
    }

    pub fn reset_invocation(&mut self, owner: ProcessIdx, branches: usize) {
        self.owner = owner;
        self.branches_active = branches;
        self.failed = false;
        self.slots.clear();
        self.shape.clear();
    }

    fn all_done(&self) -> bool {
        !self.slots.is_empty() && self.slots.values().all(|slot| slot.done)
    }
}

/// Controller resolving all-succeed multiway rendezvous for one owning
/// process.
pub struct BarrierController {
    director: Arc<Director>,
    idx: BarrierIdx,
}

impl BarrierController {
    pub fn new(director: &Arc<Director>) -> Self {
        let idx = director.lock().barriers.insert(BarrierState::new());
        BarrierController {
            director: director.clone(),
            idx,
        }
    }

    /// Run every enabled branch to completion as one unit.
    ///
    /// Returns `true` when all enabled branches transferred, `false` when
    /// the group failed because the model is finishing. Received tokens
    /// land in the receive branches' value slots.
    pub fn execute_all(
        &mut self,
        process: &Process,
        branches: &mut [GuardedBranch],
    ) -> Result<bool, RendezvousError> {
        let mut seen = FxHashSet::default();
        for branch in branches.iter() {
            if !seen.insert(branch.id()) {
                return Err(RendezvousError::DuplicateBranch(branch.id()));
            }
        }

        let enabled: Vec<usize> = branches
            .iter()
            .enumerate()
            .filter(|(_, b)| b.guard())
            .map(|(i, _)| i)
            .collect();

        match enabled.len() {
            0 => Ok(true),
            1 => self.execute_direct(process, branches, enabled[0]),
            _ => self.execute_multi(process, branches, &enabled),
        }
    }

    /// One enabled branch: its transfer alone decides the call.
    fn execute_direct(
        &mut self,
        process: &Process,
        branches: &mut [GuardedBranch],
        pos: usize,
    ) -> Result<bool, RendezvousError> {
        let result = match branches[pos].kind() {
            BranchKind::Receive => match branches[pos].channels()[0].receive(process) {
                Ok(token) => {
                    branches[pos].set_value(Some(token));
                    Ok(true)
                }
                Err(err) => Err(err),
            },
            BranchKind::Send if branches[pos].channels().len() == 1 => {
                let token = branches[pos]
                    .take_value()
                    .expect("send branch carries a token");
                branches[pos].channels()[0].send(process, token).map(|_| true)
            }
            BranchKind::Send => {
                // Multicast fan-out: run the group protocol inline on the
                // calling process, with a group of one.
                self.reset_for(process.idx(), branches, &[pos], &[process.idx()]);
                let branch = self.director.lock().barriers[self.idx].shape[0].clone();
                Ok(run_barrier_branch(&self.director, self.idx, &branch))
            }
        };
        match result {
            Ok(done) => Ok(done),
            Err(RendezvousError::Terminated) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn reset_for(
        &self,
        owner: ProcessIdx,
        branches: &[GuardedBranch],
        enabled: &[usize],
        workers: &[ProcessIdx],
    ) {
        let mut state = self.director.lock();
        let staged: Vec<(BranchIdx, BranchKind, Vec<ChannelIdx>, Option<Token>)> = enabled
            .iter()
            .map(|&pos| {
                let b = &branches[pos];
                (
                    b.id(),
                    b.kind(),
                    b.channels().iter().map(|c| c.idx()).collect(),
                    b.outgoing().cloned(),
                )
            })
            .collect();
        let barrier = &mut state.barriers[self.idx];
        barrier.reset_invocation(owner, enabled.len());
        for ((id, kind, channels, value), &worker) in staged.into_iter().zip(workers) {
            barrier.slots.insert(
                id,
                BarrierSlot {
                    alive: true,
                    done: false,
                    value,
                },
            );
            barrier.shape.push(BarrierBranch {
                id,
                kind,
                channels,
                worker,
            });
        }
    }

    fn execute_multi(
        &mut self,
        process: &Process,
        branches: &mut [GuardedBranch],
        enabled: &[usize],
    ) -> Result<bool, RendezvousError> {
        let owner = process.idx();
        let director = self.director.clone();
        let bar_idx = self.idx;

        // Register every worker before any runs, as in choice.
        let workers: Vec<ProcessIdx> = {
            let mut state = director.lock();
            if state.finish_requested {
                return Err(RendezvousError::Terminated);
            }
            enabled
                .iter()
                .map(|&pos| {
                    director.worker_started(
                        &mut state,
                        format!("{}:barrier-{}", process.name(), branches[pos].id()),
                    )
                })
                .collect()
        };
        self.reset_for(owner, branches, enabled, &workers);

        let shape: Vec<BarrierBranch> = director.lock().barriers[bar_idx].shape.clone();
        let result = thread::scope(|scope| {
            for branch in shape.iter().cloned() {
                let director = &director;
                scope.spawn(move |_| {
                    let success = run_barrier_branch(director, bar_idx, &branch);
                    let mut state = director.lock();
                    log::trace!(
                        "barrier {}: branch {} exiting, success={}",
                        bar_idx,
                        branch.id,
                        success
                    );
                    let barrier = &mut state.barriers[bar_idx];
                    barrier.branches_active -= 1;
                    if barrier.branches_active == 0 {
                        let owner = barrier.owner;
                        director.thread_unblocked(&mut state, owner);
                    }
                    director.worker_stopped(&mut state, branch.worker);
                    director.notify_all();
                });
            }

            let mut state = director.lock();
            // Count the owner blocked only while it genuinely waits; the
            // group may already have committed before we get here.
            while state.barriers[bar_idx].branches_active > 0 {
                director.thread_blocked(&mut state, owner);
                director.wait_raw(&mut state);
            }
            director.thread_unblocked(&mut state, owner);
            let barrier = &mut state.barriers[bar_idx];
            let succeeded = !barrier.failed && barrier.all_done();
            let values: Vec<(BranchIdx, Option<Token>)> = barrier
                .slots
                .iter_mut()
                .map(|(id, slot)| (*id, slot.value.take()))
                .collect();
            (succeeded, values)
        })
        .expect("barrier worker panicked");

        let (succeeded, values) = result;
        if succeeded {
            for (id, value) in values {
                if let Some(pos) = branches.iter().position(|b| b.id() == id) {
                    if branches[pos].kind() == BranchKind::Receive {
                        branches[pos].set_value(value);
                    }
                }
            }
        }
        log::debug!("barrier {}: group result {}", bar_idx, succeeded);
        Ok(succeeded)
    }
}

/// Arrival protocol for one barrier branch.
///
/// Every branch stages grouped offers on its channels and scans the whole
/// group; whichever branch first observes the group ready commits every
/// sibling's transfer in the same critical section and releases all of
/// them at once.
fn run_barrier_branch(director: &Arc<Director>, bar: BarrierIdx, branch: &BarrierBranch) -> bool {
    let id = branch.id;
    let worker = branch.worker;
    let mut state = director.lock();
    loop {
        if state.barriers[bar].slots[&id].done {
            return true;
        }
        if state.finish_requested || state.barriers[bar].failed
            || !state.barriers[bar].slots[&id].alive
        {
            return fail_barrier_branch(director, &mut state, bar, branch);
        }

        if group_ready(&state, bar) {
            commit_group(director, &mut state, bar);
            return true;
        }

        // Not ready: make sure our offer is visible on every channel, then
        // wait for something to move.
        for &c in &branch.channels {
            let marker = BranchRef {
                home: BranchHome::Barrier(bar),
                branch: id,
                worker,
                grouped: true,
            };
            let ch = &mut state.channels[c];
            match branch.kind {
                BranchKind::Send => {
                    if ch.cond_send.is_none() {
                        ch.cond_send = Some(marker);
                    }
                }
                BranchKind::Receive => {
                    if ch.cond_recv.is_none() {
                        ch.cond_recv = Some(marker);
                    }
                }
            }
        }
        director.thread_blocked(&mut state, worker);
        director.notify_all();
        // Blocking this worker can itself fire the deadlock check; the
        // finish notification precedes our wait, so re-check the flag.
        if !state.finish_requested {
            director.wait_raw(&mut state);
        }
        director.thread_unblocked(&mut state, worker);
    }
}

/// Whether every branch of the group has a counterpart on every one of
/// its channels, all at this instant.
fn group_ready(state: &ModelState, bar: BarrierIdx) -> bool {
    state.barriers[bar].shape.iter().all(|branch| {
        branch.channels.iter().all(|&c| {
            let ch = &state.channels[c];
            match branch.kind {
                BranchKind::Send => {
                    ch.get_waiting.is_some()
                        || ch
                            .cond_recv
                            .map(|other| claimable_from_outside(state, &other))
                            == Some(true)
                }
                BranchKind::Receive => {
                    ch.put_waiting.is_some()
                        || ch
                            .cond_send
                            .map(|other| claimable_from_outside(state, &other))
                            == Some(true)
                }
            }
        })
    })
}

/// Commit every branch of a group verified ready, releasing the owner and
/// every sibling worker before anyone leaves the critical section.
fn commit_group(director: &Arc<Director>, state: &mut ModelState, bar: BarrierIdx) {
    let shape = state.barriers[bar].shape.clone();
    for branch in &shape {
        match branch.kind {
            BranchKind::Send => {
                let token = state.barriers[bar]
                    .slots
                    .get_mut(&branch.id)
                    .and_then(|slot| slot.value.take())
                    .expect("send branch stages its token");
                for &c in &branch.channels {
                    clear_barrier_marker(state, bar, branch, c);
                    commit_send_on(director, state, c, token.clone());
                }
            }
            BranchKind::Receive => {
                let c = branch.channels[0];
                clear_barrier_marker(state, bar, branch, c);
                let token = if let Some(sender) = state.channels[c].put_waiting.take() {
                    let token = state.channels[c]
                        .token
                        .take()
                        .expect("pending unconditional send must stage a token");
                    director.thread_unblocked(state, sender);
                    token
                } else {
                    let other = state.channels[c]
                        .cond_send
                        .take()
                        .expect("group readiness guarantees a counterpart");
                    let token = take_outgoing(state, &other);
                    commit_other(director, state, &other, None);
                    token
                };
                state.barriers[bar].slots.get_mut(&branch.id).unwrap().value = Some(token);
            }
        }
        state.barriers[bar].slots.get_mut(&branch.id).unwrap().done = true;
        // Release siblings eagerly: a worker still parked between here and
        // its wakeup must not read as blocked to the deadlock check.
        director.thread_unblocked(state, branch.worker);
    }
    let owner = state.barriers[bar].owner;
    director.thread_unblocked(state, owner);
    log::debug!("barrier {}: group of {} committed", bar, shape.len());
    director.notify_all();
}

fn clear_barrier_marker(state: &mut ModelState, bar: BarrierIdx, branch: &BarrierBranch, c: ChannelIdx) {
    let mine = |r: BranchRef| {
        matches!(r.home, BranchHome::Barrier(b2) if b2 == bar) && r.branch == branch.id
    };
    let ch = &mut state.channels[c];
    match branch.kind {
        BranchKind::Send => {
            if ch.cond_send.map(mine) == Some(true) {
                ch.cond_send = None;
            }
        }
        BranchKind::Receive => {
            if ch.cond_recv.map(mine) == Some(true) {
                ch.cond_recv = None;
            }
        }
    }
}

/// Failure path: mark the group failed so every sibling gives up too,
/// withdraw our markers, and fix our own accounting.
fn fail_barrier_branch(
    director: &Arc<Director>,
    state: &mut parking_lot::MutexGuard<'_, ModelState>,
    bar: BarrierIdx,
    branch: &BarrierBranch,
) -> bool {
    state.barriers[bar].failed = true;
    for &c in &branch.channels {
        clear_barrier_marker(state, bar, branch, c);
    }
    director.thread_unblocked(state, branch.worker);
    director.notify_all();
    false
}
