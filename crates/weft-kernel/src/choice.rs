//! Nondeterministic guarded choice (CSP "ALT").
//!
//! A [`ChoiceController`] resolves a set of guarded branches down to
//! exactly one completed communication. Each enabled branch runs an
//! arrival protocol against its channel on a transient worker thread; the
//! first branch to claim the controller's first-trying token *and* find a
//! committed or agreeing counterpart wins, and every other branch is told
//! to abort.
//!
//! The first-trying token is the tie-break that keeps two branches of one
//! controller from both committing, and what lets a second-arriving
//! conditional branch verify that the opposite side independently made
//! the same claim before the pair commits.

use std::sync::Arc;

use crossbeam_utils::thread;
use fxhash::{FxHashMap, FxHashSet};

use crate::branch::{BranchKind, GuardedBranch};
use crate::channel::{BranchHome, BranchRef};
use crate::director::{Director, ModelState, Process};
use crate::error::RendezvousError;
use crate::types::{BranchIdx, ChannelIdx, ControllerIdx, ProcessIdx, Token};

/// Per-invocation record of one branch inside its controller.
pub(crate) struct BranchSlot {
    /// True until another branch wins or the group aborts; set false
    /// exactly once, by the controller.
    pub alive: bool,
    /// The outgoing token of a send branch, or the received token of a
    /// receive branch once its transfer commits.
    pub value: Option<Token>,
}

/// Shared state of one choice controller, guarded by the model lock.
///
/// Valid only between the start of an invocation and its return;
/// exactly one invocation may be in flight per controller.
pub(crate) struct ControllerState {
    pub owner: ProcessIdx,
    /// The branch currently holding the first-trying claim.
    pub trying: Option<BranchIdx>,
    /// The branch whose transfer completed.
    pub winner: Option<BranchIdx>,
    /// Workers still running.
    pub branches_active: usize,
    pub slots: FxHashMap<BranchIdx, BranchSlot>,
}

impl ControllerState {
    pub fn new() -> Self {
        ControllerState {
            owner: 0,
            trying: None,
            winner: None,
            branches_active: 0,
            slots: FxHashMap::default(),
        }
    }

    pub fn reset_invocation(&mut self, owner: ProcessIdx, branches: usize) {
        self.owner = owner;
        self.trying = None;
        self.winner = None;
        self.branches_active = branches;
        self.slots.clear();
    }

    pub fn slot_alive(&self, branch: BranchIdx) -> bool {
        self.slots.get(&branch).map(|s| s.alive).unwrap_or(false)
    }

    /// Claim the first-trying token. Succeeds iff nobody holds it, the
    /// same branch already holds it, and no winner exists yet.
    pub fn try_to_be_first(&mut self, branch: BranchIdx) -> bool {
        if self.winner.is_some() || !self.slot_alive(branch) {
            return false;
        }
        match self.trying {
            None => {
                self.trying = Some(branch);
                true
            }
            Some(holder) => holder == branch,
        }
    }

    /// Whether `branch` could claim the token right now. Used by the
    /// opposite side of a channel to verify mutual agreement.
    pub fn can_be_first(&self, branch: BranchIdx) -> bool {
        self.winner.is_none()
            && self.slot_alive(branch)
            && (self.trying.is_none() || self.trying == Some(branch))
    }

    /// Release the claim. Calling this without holding the claim is a
    /// protocol-invariant violation.
    pub fn release_first(&mut self, branch: BranchIdx) {
        if self.trying != Some(branch) {
            panic!(
                "first-trying claim released by branch {} which does not hold it",
                branch
            );
        }
        self.trying = None;
    }

    /// Record the winning branch. The branch must hold the claim.
    pub fn branch_succeeded(&mut self, branch: BranchIdx, value: Option<Token>) {
        if self.trying != Some(branch) {
            panic!(
                "success reported for branch {} which is not the trying branch",
                branch
            );
        }
        self.trying = None;
        self.winner = Some(branch);
        if let Some(slot) = self.slots.get_mut(&branch) {
            if value.is_some() {
                slot.value = value;
            }
        }
    }
}

/// Everything a branch worker needs, copied out of the guarded branch
/// before the workers start.
#[derive(Clone)]
pub(crate) struct BranchDesc {
    pub id: BranchIdx,
    pub kind: BranchKind,
    pub channels: Vec<ChannelIdx>,
    pub worker: ProcessIdx,
}

/// Controller resolving nondeterministic choice for one owning process.
pub struct ChoiceController {
    director: Arc<Director>,
    idx: ControllerIdx,
}

impl ChoiceController {
    pub fn new(director: &Arc<Director>) -> Self {
        let idx = director.lock().controllers.insert(ControllerState::new());
        ChoiceController {
            director: director.clone(),
            idx,
        }
    }

    /// Resolve a choice among the given branches.
    ///
    /// Returns the id of the branch that completed a transfer, or `None`
    /// if no guard was true. A winning receive branch's value slot holds
    /// the token it took. All other branches end the call dead.
    pub fn choose(
        &mut self,
        process: &Process,
        branches: &mut [GuardedBranch],
    ) -> Result<Option<BranchIdx>, RendezvousError> {
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
            0 => Ok(None),
            1 => self.choose_direct(process, branches, enabled[0]),
            _ => self.choose_multi(process, branches, &enabled),
        }
    }

    /// One enabled branch: perform its channel operation directly on the
    /// calling process, with no worker concurrency.
    fn choose_direct(
        &mut self,
        process: &Process,
        branches: &mut [GuardedBranch],
        pos: usize,
    ) -> Result<Option<BranchIdx>, RendezvousError> {
        let id = branches[pos].id();
        match branches[pos].kind() {
            BranchKind::Receive => {
                let token = branches[pos].channels()[0].receive(process)?;
                branches[pos].set_value(Some(token));
            }
            BranchKind::Send if branches[pos].channels().len() == 1 => {
                let token = branches[pos]
                    .take_value()
                    .expect("send branch carries a token");
                branches[pos].channels()[0].send(process, token)?;
            }
            BranchKind::Send => {
                // Multicast fan-out still needs the atomic group commit,
                // run inline on the calling process.
                self.reset_for(process.idx(), branches, &[pos]);
                let desc = BranchDesc {
                    id,
                    kind: BranchKind::Send,
                    channels: branches[pos].channels().iter().map(|c| c.idx()).collect(),
                    worker: process.idx(),
                };
                if !run_multicast_send(&self.director, self.idx, &desc) {
                    return Err(RendezvousError::Terminated);
                }
            }
        }
        Ok(Some(id))
    }

    fn reset_for(&self, owner: ProcessIdx, branches: &[GuardedBranch], enabled: &[usize]) {
        let mut state = self.director.lock();
        let converted: Vec<(BranchIdx, Option<Token>)> = enabled
            .iter()
            .map(|&pos| (branches[pos].id(), branches[pos].outgoing().cloned()))
            .collect();
        let ctrl = &mut state.controllers[self.idx];
        ctrl.reset_invocation(owner, enabled.len());
        for (id, value) in converted {
            ctrl.slots.insert(id, BranchSlot { alive: true, value });
        }
    }

    /// Two or more enabled branches: one worker per branch.
    fn choose_multi(
        &mut self,
        process: &Process,
        branches: &mut [GuardedBranch],
        enabled: &[usize],
    ) -> Result<Option<BranchIdx>, RendezvousError> {
        let owner = process.idx();
        let director = self.director.clone();
        let ctrl_idx = self.idx;

        // Stage slots and register every worker before any of them runs,
        // so the deadlock counters never see a half-started group.
        let mut descs: Vec<BranchDesc> = Vec::with_capacity(enabled.len());
        {
            self.reset_for(owner, branches, enabled);
            let mut state = director.lock();
            if state.finish_requested {
                return Err(RendezvousError::Terminated);
            }
            for &pos in enabled {
                let branch = &branches[pos];
                let worker = director.worker_started(
                    &mut state,
                    format!("{}:branch-{}", process.name(), branch.id()),
                );
                descs.push(BranchDesc {
                    id: branch.id(),
                    kind: branch.kind(),
                    channels: branch.channels().iter().map(|c| c.idx()).collect(),
                    worker,
                });
            }
        }

        let outcome = thread::scope(|scope| {
            for desc in descs.iter().cloned() {
                let director = &director;
                scope.spawn(move |_| run_branch(director, ctrl_idx, desc));
            }

            let mut state = director.lock();
            // Count the owner blocked only while it genuinely waits; a
            // winner may already have committed before we get here.
            while state.controllers[ctrl_idx].winner.is_none()
                && state.controllers[ctrl_idx].branches_active > 0
            {
                director.thread_blocked(&mut state, owner);
                director.wait_raw(&mut state);
            }
            director.thread_unblocked(&mut state, owner);

            // Losers learn their fate through the alive flag.
            let ctrl = &mut state.controllers[ctrl_idx];
            let winner = ctrl.winner;
            for (id, slot) in ctrl.slots.iter_mut() {
                if Some(*id) != winner {
                    slot.alive = false;
                }
            }
            director.notify_all();

            // Do not return while any worker is still unwinding: the
            // monitor's counts would momentarily look deadlocked.
            while state.controllers[ctrl_idx].branches_active > 0 {
                director.wait_raw(&mut state);
            }
            let ctrl = &mut state.controllers[ctrl_idx];
            ctrl.winner
                .map(|id| (id, ctrl.slots.get_mut(&id).and_then(|s| s.value.take())))
        })
        .expect("branch worker panicked");

        match outcome {
            Some((id, value)) => {
                let pos = branches
                    .iter()
                    .position(|b| b.id() == id)
                    .expect("winner is one of the given branches");
                if branches[pos].kind() == BranchKind::Receive {
                    branches[pos].set_value(value);
                }
                log::debug!("choice {}: branch {} won", ctrl_idx, id);
                Ok(Some(id))
            }
            // Every branch failed; that only happens when the model is
            // finishing.
            None => Err(RendezvousError::Terminated),
        }
    }
}

/// Worker entry point: run the arrival protocol, then do exit
/// bookkeeping.
fn run_branch(director: &Arc<Director>, ctrl: ControllerIdx, desc: BranchDesc) {
    let success = match desc.kind {
        BranchKind::Receive => run_receive(director, ctrl, &desc),
        BranchKind::Send if desc.channels.len() == 1 => run_send(director, ctrl, &desc),
        BranchKind::Send => run_multicast_send(director, ctrl, &desc),
    };
    let mut state = director.lock();
    log::trace!(
        "choice {}: branch {} exiting, success={}",
        ctrl,
        desc.id,
        success
    );
    let ctrl_state = &mut state.controllers[ctrl];
    ctrl_state.branches_active -= 1;
    if ctrl_state.branches_active == 0 {
        let owner = ctrl_state.owner;
        director.thread_unblocked(&mut state, owner);
    }
    director.worker_stopped(&mut state, desc.worker);
    director.notify_all();
}

/// Record the branch's own success and wake its owner, in the context of
/// the committing thread.
fn commit_self(
    director: &Arc<Director>,
    state: &mut ModelState,
    ctrl: ControllerIdx,
    branch: BranchIdx,
    value: Option<Token>,
) {
    let ctrl_state = &mut state.controllers[ctrl];
    ctrl_state.branch_succeeded(branch, value);
    let owner = ctrl_state.owner;
    director.thread_unblocked(state, owner);
}

/// Whether a conditional offer recorded on a channel may be committed by
/// the opposite side right now. Grouped offers (multicast, barrier) are
/// resolved only by their own group's scan.
pub(crate) fn claimable_from_outside(state: &ModelState, other: &BranchRef) -> bool {
    if other.grouped {
        return false;
    }
    match other.home {
        BranchHome::Choice(ctrl) => state.controllers[ctrl].can_be_first(other.branch),
        BranchHome::Barrier(_) => false,
    }
}

/// Commit the opposite side of a conditional pair: claim its first-trying
/// token (the caller has verified it is claimable), record its success,
/// and release its owner and worker.
pub(crate) fn commit_other(
    director: &Arc<Director>,
    state: &mut ModelState,
    other: &BranchRef,
    value: Option<Token>,
) {
    let BranchHome::Choice(ctrl) = other.home else {
        panic!("grouped offer committed from outside its own group");
    };
    let ctrl_state = &mut state.controllers[ctrl];
    ctrl_state.trying = Some(other.branch);
    ctrl_state.branch_succeeded(other.branch, value);
    let owner = ctrl_state.owner;
    director.thread_unblocked(state, owner);
    director.thread_unblocked(state, other.worker);
}

/// Take the staged outgoing token of a conditional send branch.
pub(crate) fn take_outgoing(state: &mut ModelState, other: &BranchRef) -> Token {
    let BranchHome::Choice(ctrl) = other.home else {
        panic!("grouped offer committed from outside its own group");
    };
    state.controllers[ctrl]
        .slots
        .get_mut(&other.branch)
        .and_then(|slot| slot.value.take())
        .expect("conditional send branch stages its token")
}

/// Block the worker, wait for any state change, and unaccount the block
/// on wake. The retry loops below always re-check their condition.
///
/// Blocking this worker can itself complete the deadlock condition and
/// request the finish; the notification fires before we reach the
/// condition wait, so the flag must be re-checked in between.
fn pause(
    director: &Arc<Director>,
    state: &mut parking_lot::MutexGuard<'_, ModelState>,
    worker: ProcessIdx,
) {
    director.thread_blocked(state, worker);
    director.notify_all();
    if !state.finish_requested {
        director.wait_raw(state);
    }
    director.thread_unblocked(state, worker);
}

/// Arrival protocol for a conditional receive branch.
fn run_receive(director: &Arc<Director>, ctrl: ControllerIdx, desc: &BranchDesc) -> bool {
    let channel = desc.channels[0];
    let id = desc.id;
    let worker = desc.worker;
    let mut state = director.lock();
    'top: loop {
        if state.finish_requested || !state.controllers[ctrl].slot_alive(id) {
            return fail_branch(director, &mut state, ctrl, desc);
        }

        if state.channels[channel].put_waiting.is_some() {
            // A committed sender is pending; it cannot withdraw, so keep
            // retrying for the claim until we get it or the branch dies.
            loop {
                if state.finish_requested || !state.controllers[ctrl].slot_alive(id) {
                    return fail_branch(director, &mut state, ctrl, desc);
                }
                if state.channels[channel].put_waiting.is_none() {
                    // Another controller's branch consumed the sender.
                    continue 'top;
                }
                if state.controllers[ctrl].try_to_be_first(id) {
                    let ch = &mut state.channels[channel];
                    let token = ch
                        .token
                        .take()
                        .expect("pending unconditional send must stage a token");
                    let sender = ch.put_waiting.take().expect("checked above");
                    director.thread_unblocked(&mut state, sender);
                    commit_self(director, &mut state, ctrl, id, Some(token));
                    director.notify_all();
                    return true;
                }
                pause(director, &mut state, worker);
            }
        }

        let competing = state.channels[channel]
            .cond_send
            .filter(|other| !other.grouped);
        if let Some(other) = competing {
            // We arrived second, so we own the mutual-agreement check.
            if state.controllers[ctrl].try_to_be_first(id) {
                if claimable_from_outside(&state, &other) {
                    let token = take_outgoing(&mut state, &other);
                    state.channels[channel].cond_send = None;
                    commit_other(director, &mut state, &other, None);
                    commit_self(director, &mut state, ctrl, id, Some(token));
                    director.notify_all();
                    return true;
                }
                // The other side might still change its mind: give the
                // claim back and retry from the top once something moves.
                state.controllers[ctrl].release_first(id);
                director.notify_all();
            }
            pause(director, &mut state, worker);
            continue 'top;
        }

        // First arrival: leave a marker for a later opposite conditional
        // and wait.
        state.channels[channel].cond_recv = Some(BranchRef {
            home: BranchHome::Choice(ctrl),
            branch: id,
            worker,
            grouped: false,
        });
        director.thread_blocked(&mut state, worker);
        director.notify_all();
        loop {
            if state.controllers[ctrl].winner == Some(id) {
                // The second-arriving side committed our transfer and did
                // all the bookkeeping, including our unblock.
                return true;
            }
            if state.finish_requested || !state.controllers[ctrl].slot_alive(id) {
                return fail_branch(director, &mut state, ctrl, desc);
            }
            if state.channels[channel].put_waiting.is_some() {
                // A committed sender appeared: withdraw the marker before
                // consuming anything, then rejoin the first case.
                clear_markers(&mut state, ctrl, desc);
                director.thread_unblocked(&mut state, worker);
                continue 'top;
            }
            if state.controllers[ctrl].trying == Some(id) {
                state.controllers[ctrl].release_first(id);
                director.notify_all();
            }
            director.wait_raw(&mut state);
        }
    }
}

/// Arrival protocol for a single-channel conditional send branch; mirror
/// image of [`run_receive`].
fn run_send(director: &Arc<Director>, ctrl: ControllerIdx, desc: &BranchDesc) -> bool {
    let channel = desc.channels[0];
    let id = desc.id;
    let worker = desc.worker;
    let mut state = director.lock();
    'top: loop {
        if state.finish_requested || !state.controllers[ctrl].slot_alive(id) {
            return fail_branch(director, &mut state, ctrl, desc);
        }

        if state.channels[channel].get_waiting.is_some() {
            loop {
                if state.finish_requested || !state.controllers[ctrl].slot_alive(id) {
                    return fail_branch(director, &mut state, ctrl, desc);
                }
                if state.channels[channel].get_waiting.is_none() {
                    continue 'top;
                }
                if state.controllers[ctrl].try_to_be_first(id) {
                    let token = state.controllers[ctrl]
                        .slots
                        .get_mut(&id)
                        .and_then(|slot| slot.value.take())
                        .expect("send branch stages its token");
                    let ch = &mut state.channels[channel];
                    let receiver = ch.get_waiting.take().expect("checked above");
                    state.process_mut(receiver).handoff = Some(token);
                    director.thread_unblocked(&mut state, receiver);
                    commit_self(director, &mut state, ctrl, id, None);
                    director.notify_all();
                    return true;
                }
                pause(director, &mut state, worker);
            }
        }

        let competing = state.channels[channel]
            .cond_recv
            .filter(|other| !other.grouped);
        if let Some(other) = competing {
            if state.controllers[ctrl].try_to_be_first(id) {
                if claimable_from_outside(&state, &other) {
                    let token = state.controllers[ctrl]
                        .slots
                        .get_mut(&id)
                        .and_then(|slot| slot.value.take())
                        .expect("send branch stages its token");
                    state.channels[channel].cond_recv = None;
                    commit_other(director, &mut state, &other, Some(token));
                    commit_self(director, &mut state, ctrl, id, None);
                    director.notify_all();
                    return true;
                }
                state.controllers[ctrl].release_first(id);
                director.notify_all();
            }
            pause(director, &mut state, worker);
            continue 'top;
        }

        state.channels[channel].cond_send = Some(BranchRef {
            home: BranchHome::Choice(ctrl),
            branch: id,
            worker,
            grouped: false,
        });
        director.thread_blocked(&mut state, worker);
        director.notify_all();
        loop {
            if state.controllers[ctrl].winner == Some(id) {
                return true;
            }
            if state.finish_requested || !state.controllers[ctrl].slot_alive(id) {
                return fail_branch(director, &mut state, ctrl, desc);
            }
            if state.channels[channel].get_waiting.is_some() {
                clear_markers(&mut state, ctrl, desc);
                director.thread_unblocked(&mut state, worker);
                continue 'top;
            }
            if state.controllers[ctrl].trying == Some(id) {
                state.controllers[ctrl].release_first(id);
                director.notify_all();
            }
            director.wait_raw(&mut state);
        }
    }
}

/// Arrival protocol for a multicast send branch: all target channels
/// transfer together or not at all. Readiness is a scan over every
/// target; grouped markers keep opposite sides from committing a single
/// channel out of the group.
fn run_multicast_send(director: &Arc<Director>, ctrl: ControllerIdx, desc: &BranchDesc) -> bool {
    let id = desc.id;
    let worker = desc.worker;
    let mut state = director.lock();
    loop {
        if state.finish_requested || !state.controllers[ctrl].slot_alive(id) {
            return fail_branch(director, &mut state, ctrl, desc);
        }
        if state.controllers[ctrl].winner == Some(id) {
            return true;
        }

        let all_ready = desc
            .channels
            .iter()
            .all(|&c| ready_for_send(&state, ctrl, c));
        if all_ready && state.controllers[ctrl].try_to_be_first(id) {
            let token = state.controllers[ctrl]
                .slots
                .get_mut(&id)
                .and_then(|slot| slot.value.take())
                .expect("send branch stages its token");
            // Withdraw our own offers before delivering, so no channel is
            // left pointing at a completed branch.
            clear_markers(&mut state, ctrl, desc);
            for &c in &desc.channels {
                commit_send_on(director, &mut state, c, token.clone());
            }
            commit_self(director, &mut state, ctrl, id, None);
            director.notify_all();
            return true;
        }

        // Not ready yet: make sure every target carries our offer so late
        // receivers can find the group, then wait.
        for &c in &desc.channels {
            if state.channels[c].cond_send.is_none() {
                state.channels[c].cond_send = Some(BranchRef {
                    home: BranchHome::Choice(ctrl),
                    branch: id,
                    worker,
                    grouped: true,
                });
            }
        }
        pause(director, &mut state, worker);
    }
}

/// Whether one channel could accept a send from the given controller's
/// group right now.
pub(crate) fn ready_for_send(state: &ModelState, from: ControllerIdx, channel: ChannelIdx) -> bool {
    let ch = &state.channels[channel];
    if ch.get_waiting.is_some() {
        return true;
    }
    match ch.cond_recv {
        Some(other) => {
            !matches!(other.home, BranchHome::Choice(c) if c == from)
                && claimable_from_outside(state, &other)
        }
        None => false,
    }
}

/// Deliver a token on a channel known to be ready for a send.
pub(crate) fn commit_send_on(
    director: &Arc<Director>,
    state: &mut ModelState,
    channel: ChannelIdx,
    token: Token,
) {
    if let Some(receiver) = state.channels[channel].get_waiting.take() {
        state.process_mut(receiver).handoff = Some(token);
        director.thread_unblocked(state, receiver);
        return;
    }
    let other = state.channels[channel]
        .cond_recv
        .take()
        .expect("channel was ready for a send");
    commit_other(director, state, &other, Some(token));
}

/// Remove this branch's conditional markers from its channels.
fn clear_markers(state: &mut ModelState, ctrl: ControllerIdx, desc: &BranchDesc) {
    let mine = |r: BranchRef| {
        matches!(r.home, BranchHome::Choice(c2) if c2 == ctrl) && r.branch == desc.id
    };
    for &c in &desc.channels {
        let ch = &mut state.channels[c];
        if ch.cond_recv.map(mine) == Some(true) {
            ch.cond_recv = None;
        }
        if ch.cond_send.map(mine) == Some(true) {
            ch.cond_send = None;
        }
    }
}

/// Common failure path: withdraw markers, give back any claim, fix the
/// worker's own accounting, and wake anyone who was watching us.
fn fail_branch(
    director: &Arc<Director>,
    state: &mut parking_lot::MutexGuard<'_, ModelState>,
    ctrl: ControllerIdx,
    desc: &BranchDesc,
) -> bool {
    clear_markers(state, ctrl, desc);
    if state.controllers[ctrl].trying == Some(desc.id) {
        state.controllers[ctrl].release_first(desc.id);
    }
    director.thread_unblocked(state, desc.worker);
    director.notify_all();
    false
}
