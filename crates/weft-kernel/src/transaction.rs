//! N-way atomic transfers over transactional channels.
//!
//! A [`TxChannel`] generalizes the two-party channel: one call may put to
//! several channels at once (multicast), get from several at once
//! (gather), or offer a conditional put/get over a set of candidates and
//! let exactly one commit. Every call records itself as the pending
//! get/put on each channel it touches, together with the full set of
//! channels it is simultaneously trying, then searches for a
//! **transaction**: a set of channels on which every member has both a
//! pending get and a pending put.
//!
//! The search walks the offer graph depth-first: a channel evaluated as a
//! put target that already has a pending get recursively tests that
//! get's own peer channels as puts, and symmetrically for gets. A
//! channel already on the current path closes a cycle and counts as
//! self-consistent, so mutually-referencing conditional groups resolve
//! instead of recursing forever. A conditional offer needs one candidate
//! to close; an unconditional offer needs all of them, or the caller
//! blocks and the search re-runs in the context of each later arrival.

use std::sync::Arc;

use fxhash::{FxHashMap, FxHashSet};

use crate::director::{Director, ModelState, Process};
use crate::error::RendezvousError;
use crate::types::{ProcessIdx, Token, TokenKind, TxChannelIdx};

/// Pending-operation record of one transactional channel.
pub(crate) struct TxChannelState {
    pub kind: Option<TokenKind>,
    /// Token staged by the pending put.
    pub token: Option<Token>,
    pub get_waiting: Option<ProcessIdx>,
    pub put_waiting: Option<ProcessIdx>,
    pub get_conditional: bool,
    pub put_conditional: bool,
    /// The channels the pending getter is simultaneously trying.
    pub get_peers: Vec<TxChannelIdx>,
    /// The channels the pending putter is simultaneously trying.
    pub put_peers: Vec<TxChannelIdx>,
}

impl TxChannelState {
    pub fn new(kind: Option<TokenKind>) -> Self {
        TxChannelState {
            kind,
            token: None,
            get_waiting: None,
            put_waiting: None,
            get_conditional: false,
            put_conditional: false,
            get_peers: Vec::new(),
            put_peers: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.reset_get();
        self.reset_put();
    }

    fn reset_get(&mut self) {
        self.get_waiting = None;
        self.get_conditional = false;
        self.get_peers.clear();
    }

    fn reset_put(&mut self) {
        self.token = None;
        self.put_waiting = None;
        self.put_conditional = false;
        self.put_peers.clear();
    }
}

/// Handle to a transactional rendezvous channel.
#[derive(Clone)]
pub struct TxChannel {
    director: Arc<Director>,
    idx: TxChannelIdx,
}

/// Which side of a call records and searches.
enum Side {
    Get { conditional: bool },
    Put { conditional: bool, token: Token },
}

impl TxChannel {
    pub fn new(director: &Arc<Director>) -> Self {
        Self::with_kind(director, None)
    }

    pub fn with_kind(director: &Arc<Director>, kind: Option<TokenKind>) -> Self {
        let idx = director.lock().tx_channels.insert(TxChannelState::new(kind));
        TxChannel {
            director: director.clone(),
            idx,
        }
    }

    pub(crate) fn idx(&self) -> TxChannelIdx {
        self.idx
    }

    /// True if a get is pending on this channel.
    pub fn is_read_blocked(&self) -> bool {
        self.director.lock().tx_channels[self.idx].get_waiting.is_some()
    }

    /// True if a put is pending on this channel.
    pub fn is_write_blocked(&self) -> bool {
        self.director.lock().tx_channels[self.idx].put_waiting.is_some()
    }

    /// Two-party rendezvous receive: the degenerate gather of one.
    pub fn receive(&self, process: &Process) -> Result<Token, RendezvousError> {
        let mut tokens = Self::get_from_all(process, std::slice::from_ref(self))?;
        Ok(tokens.remove(0))
    }

    /// Two-party rendezvous send: the degenerate multicast of one.
    pub fn send(&self, process: &Process, token: Token) -> Result<(), RendezvousError> {
        Self::send_to_all(process, token, std::slice::from_ref(self))
    }

    /// Get from every channel. Does not return until all gets complete,
    /// together.
    pub fn get_from_all(
        process: &Process,
        channels: &[TxChannel],
    ) -> Result<Vec<Token>, RendezvousError> {
        let result = transact(process, channels, Side::Get { conditional: false })?;
        Ok(channels
            .iter()
            .map(|ch| {
                result
                    .get(&ch.idx)
                    .cloned()
                    .expect("unconditional get covers every channel")
            })
            .collect())
    }

    /// Get from exactly one of the channels. Returns the index of the
    /// channel that transferred along with the token.
    pub fn get_from_any(
        process: &Process,
        channels: &[TxChannel],
    ) -> Result<(usize, Token), RendezvousError> {
        let result = transact(process, channels, Side::Get { conditional: true })?;
        for (i, ch) in channels.iter().enumerate() {
            if let Some(token) = result.get(&ch.idx) {
                return Ok((i, token.clone()));
            }
        }
        panic!("committed conditional get transferred on none of its channels");
    }

    /// Put the token to every channel as one atomic step.
    pub fn send_to_all(
        process: &Process,
        token: Token,
        channels: &[TxChannel],
    ) -> Result<(), RendezvousError> {
        transact(
            process,
            channels,
            Side::Put {
                conditional: false,
                token,
            },
        )?;
        Ok(())
    }

    /// Put the token to exactly one of the channels. Returns the index of
    /// the channel that took it.
    pub fn send_to_any(
        process: &Process,
        token: Token,
        channels: &[TxChannel],
    ) -> Result<usize, RendezvousError> {
        let result = transact(
            process,
            channels,
            Side::Put {
                conditional: true,
                token,
            },
        )?;
        for (i, ch) in channels.iter().enumerate() {
            if result.contains_key(&ch.idx) {
                return Ok(i);
            }
        }
        panic!("committed conditional put transferred on none of its channels");
    }

    /// Put a sequence of tokens to every channel, one rendezvous per
    /// token.
    pub fn send_array_to_all(
        process: &Process,
        tokens: &[Token],
        channels: &[TxChannel],
    ) -> Result<(), RendezvousError> {
        for token in tokens {
            Self::send_to_all(process, token.clone(), channels)?;
        }
        Ok(())
    }
}

/// Record the calling side on its channels, then either commit a
/// transaction found immediately or block until another arrival commits
/// one that releases us.
fn transact(
    process: &Process,
    channels: &[TxChannel],
    side: Side,
) -> Result<FxHashMap<TxChannelIdx, Token>, RendezvousError> {
    if channels.is_empty() {
        return Err(RendezvousError::NoChannels);
    }
    let director = channels[0].director.clone();
    let me = process.idx();
    let idxs: Vec<TxChannelIdx> = channels.iter().map(|ch| ch.idx).collect();

    let mut state = director.lock();
    if state.finish_requested {
        return Err(RendezvousError::Terminated);
    }

    let is_put = match side {
        Side::Get { conditional } => {
            for &c in &idxs {
                let ch = &mut state.tx_channels[c];
                ch.get_waiting = Some(me);
                ch.get_conditional = conditional;
                ch.get_peers = idxs.clone();
            }
            false
        }
        Side::Put { conditional, token } => {
            // Convert before recording anything: a mismatch must leave
            // every channel untouched.
            let staged: Vec<(TxChannelIdx, Token)> = idxs
                .iter()
                .map(|&c| {
                    token
                        .clone()
                        .convert(state.tx_channels[c].kind)
                        .map(|t| (c, t))
                })
                .collect::<Result<_, _>>()?;
            for (c, converted) in staged {
                let ch = &mut state.tx_channels[c];
                ch.put_waiting = Some(me);
                ch.put_conditional = conditional;
                ch.put_peers = idxs.clone();
                ch.token = Some(converted);
            }
            true
        }
    };
    let conditional = side_conditional(&state, idxs[0], is_put);

    let mut visited = FxHashSet::default();
    match search(&state, &idxs, conditional, is_put, &mut visited) {
        Some(ready) => {
            commit(&director, &mut state, &ready);
        }
        None => {
            log::trace!("process {}: no transaction yet, blocking", me);
            director.thread_blocked(&mut state, me);
            loop {
                // A commit that released us outranks a finish request that
                // lands in the same instant: the rest of the transaction
                // already went through.
                if state.process(me).released.is_some() {
                    break;
                }
                if state.finish_requested {
                    // Withdraw cleanly: nothing may keep pointing at a
                    // terminated process.
                    for &c in &idxs {
                        let ch = &mut state.tx_channels[c];
                        if is_put && ch.put_waiting == Some(me) {
                            ch.reset_put();
                        }
                        if !is_put && ch.get_waiting == Some(me) {
                            ch.reset_get();
                        }
                    }
                    director.thread_unblocked(&mut state, me);
                    director.notify_all();
                    return Err(RendezvousError::Terminated);
                }
                director.wait_raw(&mut state);
            }
        }
    }
    let result = state
        .process_mut(me)
        .released
        .take()
        .expect("commit populates the released slot");
    Ok(result)
}

fn side_conditional(state: &ModelState, idx: TxChannelIdx, is_put: bool) -> bool {
    let ch = &state.tx_channels[idx];
    if is_put {
        ch.put_conditional
    } else {
        ch.get_conditional
    }
}

/// Try to close a transaction over the given channels.
///
/// A conditional side closes on the first candidate that works; an
/// unconditional side needs every candidate, or nothing.
fn search(
    state: &ModelState,
    channels: &[TxChannelIdx],
    conditional: bool,
    is_put: bool,
    visited: &mut FxHashSet<TxChannelIdx>,
) -> Option<FxHashSet<TxChannelIdx>> {
    if conditional {
        for &c in channels {
            if let Some(ready) = close_one(state, c, is_put, visited) {
                return Some(ready);
            }
        }
        None
    } else {
        let mut all = FxHashSet::default();
        for &c in channels {
            match close_one(state, c, is_put, visited) {
                Some(ready) => all.extend(ready),
                None => return None,
            }
        }
        Some(all)
    }
}

/// Test one channel, recursing into the far side's peer set.
fn close_one(
    state: &ModelState,
    idx: TxChannelIdx,
    is_put: bool,
    visited: &mut FxHashSet<TxChannelIdx>,
) -> Option<FxHashSet<TxChannelIdx>> {
    if visited.contains(&idx) {
        // Already on the current path: the cycle is self-consistent.
        let mut ready = FxHashSet::default();
        ready.insert(idx);
        return Some(ready);
    }
    let ch = &state.tx_channels[idx];
    if ch.put_waiting.is_none() || ch.get_waiting.is_none() {
        return None;
    }
    // The far side of a put is the getter and its peers, and vice versa.
    let (far, far_conditional) = if is_put {
        (ch.get_peers.clone(), ch.get_conditional)
    } else {
        (ch.put_peers.clone(), ch.put_conditional)
    };
    visited.insert(idx);
    let nested = search(state, &far, far_conditional, !is_put, visited);
    visited.remove(&idx);
    nested.map(|mut ready| {
        ready.insert(idx);
        ready
    })
}

/// Commit a transaction: snapshot the tokens, release every participating
/// process with the shared result map, and clear the flags of every
/// channel involved, propagating through conditional peer sets.
fn commit(director: &Arc<Director>, state: &mut ModelState, ready: &FxHashSet<TxChannelIdx>) {
    let mut result = FxHashMap::default();
    for &c in ready {
        let token = state.tx_channels[c]
            .token
            .clone()
            .expect("ready channel has a staged token");
        result.insert(c, token);
    }

    for &c in ready {
        let getter = state.tx_channels[c]
            .get_waiting
            .expect("ready channel has a pending get");
        let putter = state.tx_channels[c]
            .put_waiting
            .expect("ready channel has a pending put");
        for p in [getter, putter] {
            if state.process(p).released.is_none() {
                director.thread_unblocked(state, p);
                state.process_mut(p).released = Some(result.clone());
            }
        }
    }

    for &c in ready {
        let (get_conditional, get_peers) = {
            let ch = &state.tx_channels[c];
            (ch.get_conditional, ch.get_peers.clone())
        };
        if get_conditional {
            for &peer in &get_peers {
                state.tx_channels[peer].reset_get();
            }
        }
        let (put_conditional, put_peers) = {
            let ch = &state.tx_channels[c];
            (ch.put_conditional, ch.put_peers.clone())
        };
        if put_conditional {
            for &peer in &put_peers {
                state.tx_channels[peer].reset_put();
            }
        }
        let ch = &mut state.tx_channels[c];
        ch.reset_get();
        ch.reset_put();
    }

    log::debug!("transaction committed over {} channels", ready.len());
    director.notify_all();
}
