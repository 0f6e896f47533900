//! The two-party synchronous rendezvous primitive.
//!
//! A channel carries no buffer. `send` and `receive` block their calling
//! process until the counterpart operation arrives, then hand the token
//! over in the context of whichever process completed the match. At most
//! one unconditional sender, one unconditional receiver, one conditional
//! sender, and one conditional receiver may be pending on a channel at any
//! instant; a completed transfer clears both matched flags before the next
//! operation may begin.

use std::sync::Arc;

use crate::director::{Director, Process};
use crate::error::RendezvousError;
use crate::types::{BarrierIdx, BranchIdx, ChannelIdx, ControllerIdx, ProcessIdx, Token, TokenKind};

/// Which controller a conditional offer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BranchHome {
    Choice(ControllerIdx),
    Barrier(BarrierIdx),
}

/// Back-reference from a channel to a conditional branch pending on it.
///
/// Lookup only: the committing side uses the home/branch pair to verify
/// the other side's first-trying claim and the worker index to release
/// its blocked state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BranchRef {
    pub home: BranchHome,
    pub branch: BranchIdx,
    pub worker: ProcessIdx,
    /// Grouped offers (multicast fan-out, barrier membership) commit only
    /// through their own group's readiness scan, never through the
    /// opposite side's claim.
    pub grouped: bool,
}

/// Pending-operation flags of one channel.
pub(crate) struct ChannelState {
    pub kind: Option<TokenKind>,
    /// Token staged by the pending unconditional sender.
    pub token: Option<Token>,
    pub put_waiting: Option<ProcessIdx>,
    pub get_waiting: Option<ProcessIdx>,
    pub cond_send: Option<BranchRef>,
    pub cond_recv: Option<BranchRef>,
}

impl ChannelState {
    pub fn new(kind: Option<TokenKind>) -> Self {
        ChannelState {
            kind,
            token: None,
            put_waiting: None,
            get_waiting: None,
            cond_send: None,
            cond_recv: None,
        }
    }

    pub fn reset(&mut self) {
        self.token = None;
        self.put_waiting = None;
        self.get_waiting = None;
        self.cond_send = None;
        self.cond_recv = None;
    }
}

/// Handle to a two-party rendezvous channel.
///
/// Cheap to clone; all state lives in the model behind the director's
/// lock. Channels are created at model-build time and live for the
/// model's duration.
#[derive(Clone)]
pub struct Channel {
    director: Arc<Director>,
    idx: ChannelIdx,
}

impl Channel {
    pub fn new(director: &Arc<Director>) -> Self {
        Self::with_kind(director, None)
    }

    /// Create a channel that only carries tokens of the given kind.
    /// Sends convert (integer widening) or fail synchronously.
    pub fn with_kind(director: &Arc<Director>, kind: Option<TokenKind>) -> Self {
        let idx = director.lock().channels.insert(ChannelState::new(kind));
        Channel {
            director: director.clone(),
            idx,
        }
    }

    pub(crate) fn idx(&self) -> ChannelIdx {
        self.idx
    }

    /// True if a get or a conditional receive is pending on this channel.
    pub fn is_read_blocked(&self) -> bool {
        let state = self.director.lock();
        let ch = &state.channels[self.idx];
        ch.get_waiting.is_some() || ch.cond_recv.is_some()
    }

    /// True if a put or a conditional send is pending on this channel.
    pub fn is_write_blocked(&self) -> bool {
        let state = self.director.lock();
        let ch = &state.channels[self.idx];
        ch.put_waiting.is_some() || ch.cond_send.is_some()
    }

    /// Send a token, blocking the calling process until a receiver takes
    /// it. Returns when the rendezvous is complete.
    pub fn send(&self, process: &Process, token: Token) -> Result<(), RendezvousError> {
        let me = process.idx();
        let mut state = self.director.lock();
        if state.finish_requested {
            return Err(RendezvousError::Terminated);
        }
        let token = token.convert(state.channels[self.idx].kind)?;

        let ch = &mut state.channels[self.idx];
        if let Some(receiver) = ch.get_waiting {
            // A committed receiver is already waiting: complete the match in
            // our context, including its unblock accounting.
            ch.get_waiting = None;
            state.process_mut(receiver).handoff = Some(token);
            self.director.thread_unblocked(&mut state, receiver);
            log::trace!("channel {}: send matched waiting receiver {}", self.idx, receiver);
            self.director.notify_all();
            return Ok(());
        }

        // No receiver yet: stage the token, report blocked, and let a
        // later-arriving receiver (or a conditional branch) complete us.
        ch.token = Some(token);
        ch.put_waiting = Some(me);
        self.director.thread_blocked(&mut state, me);
        self.director.notify_all();
        loop {
            // A cleared flag means the receiver consumed the token and
            // unblocked us; that completion outranks a finish request that
            // lands in the same instant.
            if state.channels[self.idx].put_waiting != Some(me) {
                return Ok(());
            }
            if state.finish_requested {
                let ch = &mut state.channels[self.idx];
                ch.put_waiting = None;
                ch.token = None;
                self.director.thread_unblocked(&mut state, me);
                self.director.notify_all();
                return Err(RendezvousError::Terminated);
            }
            self.director.wait_raw(&mut state);
        }
    }

    /// Receive a token, blocking the calling process until a sender
    /// provides one.
    pub fn receive(&self, process: &Process) -> Result<Token, RendezvousError> {
        let me = process.idx();
        let mut state = self.director.lock();
        if state.finish_requested {
            return Err(RendezvousError::Terminated);
        }

        let ch = &mut state.channels[self.idx];
        if let Some(sender) = ch.put_waiting {
            // A committed sender is already waiting: take its token, clear
            // both flags, and unblock it in our context.
            let token = ch
                .token
                .take()
                .expect("pending unconditional send must stage a token");
            ch.put_waiting = None;
            self.director.thread_unblocked(&mut state, sender);
            log::trace!("channel {}: receive matched waiting sender {}", self.idx, sender);
            self.director.notify_all();
            return Ok(token);
        }

        // No sender yet. Recording ourselves and waking waiters also covers
        // the pending-conditional-send case: the conditional branch owns
        // responsibility for checking mutual agreement, and will find this
        // unconditional receiver when it retries.
        ch.get_waiting = Some(me);
        self.director.thread_blocked(&mut state, me);
        self.director.notify_all();
        loop {
            // A delivered handoff outranks a finish request that lands in
            // the same instant: the sender already returned success.
            if let Some(token) = state.process_mut(me).handoff.take() {
                return Ok(token);
            }
            if state.finish_requested {
                let ch = &mut state.channels[self.idx];
                if ch.get_waiting == Some(me) {
                    ch.get_waiting = None;
                }
                self.director.thread_unblocked(&mut state, me);
                self.director.notify_all();
                return Err(RendezvousError::Terminated);
            }
            self.director.wait_raw(&mut state);
        }
    }

    /// Send a sequence of tokens, one rendezvous at a time.
    pub fn send_array(&self, process: &Process, tokens: &[Token]) -> Result<(), RendezvousError> {
        for token in tokens {
            self.send(process, token.clone())?;
        }
        Ok(())
    }
}
