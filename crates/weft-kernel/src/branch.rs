//! Guarded branches: one candidate communication inside a choice or
//! barrier group.

use crate::channel::Channel;
use crate::types::{BranchIdx, Token};

/// Direction of a branch's communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    Send,
    Receive,
}

/// One candidate send or receive, enabled only if its guard is true.
///
/// Branches are created fresh for each controller invocation and carry no
/// concurrency of their own; the arrival protocol lives in the
/// controllers. A send branch may target several channels (multicast
/// fan-out, committed atomically); a receive branch targets exactly one.
/// After a call returns, a winning receive branch's value slot holds the
/// token it took.
pub struct GuardedBranch {
    id: BranchIdx,
    guard: bool,
    kind: BranchKind,
    channels: Vec<Channel>,
    token: Option<Token>,
}

impl GuardedBranch {
    pub fn send(id: BranchIdx, guard: bool, channel: &Channel, token: Token) -> Self {
        GuardedBranch {
            id,
            guard,
            kind: BranchKind::Send,
            channels: vec![channel.clone()],
            token: Some(token),
        }
    }

    /// A multicast send branch: the token goes to every channel, all
    /// transfers committed together or not at all.
    pub fn send_to_all(id: BranchIdx, guard: bool, channels: &[Channel], token: Token) -> Self {
        GuardedBranch {
            id,
            guard,
            kind: BranchKind::Send,
            channels: channels.to_vec(),
            token: Some(token),
        }
    }

    pub fn receive(id: BranchIdx, guard: bool, channel: &Channel) -> Self {
        GuardedBranch {
            id,
            guard,
            kind: BranchKind::Receive,
            channels: vec![channel.clone()],
            token: None,
        }
    }

    pub fn id(&self) -> BranchIdx {
        self.id
    }

    pub fn guard(&self) -> bool {
        self.guard
    }

    pub fn kind(&self) -> BranchKind {
        self.kind
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// The branch's value slot: the outgoing token of a send branch, or
    /// the received token of a receive branch that won.
    pub fn value(&self) -> Option<&Token> {
        self.token.as_ref()
    }

    pub fn take_value(&mut self) -> Option<Token> {
        self.token.take()
    }

    pub(crate) fn set_value(&mut self, token: Option<Token>) {
        self.token = token;
    }

    pub(crate) fn outgoing(&self) -> Option<&Token> {
        match self.kind {
            BranchKind::Send => self.token.as_ref(),
            BranchKind::Receive => None,
        }
    }
}
