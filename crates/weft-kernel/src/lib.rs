//! Weft: a rendezvous-based CSP concurrency engine.
//!
//! This crate implements synchronous, unbuffered message handoff between
//! independently scheduled processes, in the style of Hoare's
//! Communicating Sequential Processes:
//!
//! - [`Channel`]: the two-party rendezvous primitive — `send` and
//!   `receive` block until both parties are present.
//! - [`GuardedBranch`]: one candidate communication inside a choice or
//!   barrier group, enabled only if its guard is true.
//! - [`ChoiceController`]: nondeterministic selection of exactly one
//!   enabled branch (CSP "ALT").
//! - [`BarrierController`]: all-or-nothing multiway rendezvous.
//! - [`TxChannel`]: N-way atomic transfers — multicast send, gather
//!   receive, send-to-any, get-from-any — resolved by a recursive
//!   transaction search over the graph of simultaneously-offered
//!   operations.
//! - [`Director`]: the model-wide lock, condition variable, and
//!   deadlock monitor every one of the above synchronizes on.
//!
//! # Concurrency model
//!
//! One process per thread, scheduled by the caller (see `weft-model` for
//! a ready-made harness). All rendezvous state of one model lives behind
//! a single mutex; every blocking wait is a condition wait against that
//! mutex inside a re-check loop. The coarse lock is what makes the
//! deadlock invariant checkable: when every active process is blocked,
//! the model is finished and every waiter unwinds with
//! [`RendezvousError::Terminated`].

mod barrier;
mod branch;
mod channel;
mod choice;
mod director;
mod error;
mod transaction;
mod types;

pub use barrier::BarrierController;
pub use branch::{BranchKind, GuardedBranch};
pub use channel::Channel;
pub use choice::ChoiceController;
pub use director::{Director, Process};
pub use error::RendezvousError;
pub use transaction::TxChannel;
pub use types::{BranchIdx, Token, TokenKind};
