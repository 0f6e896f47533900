//! Thread-per-process harness for the weft rendezvous kernel.
//!
//! The kernel assumes an external component schedules processes as
//! independent units of control; this crate is the smallest such
//! component: each process body runs on its own thread, every process is
//! registered with the model's [`Director`] before any of them starts,
//! and the run joins all of them before reporting how it ended.

mod model;

pub use model::{Model, RunOutcome};

// Re-export the kernel surface so model-level code needs one import.
pub use weft_kernel::{
    BarrierController, BranchIdx, BranchKind, Channel, ChoiceController, Director, GuardedBranch,
    Process, RendezvousError, Token, TokenKind, TxChannel,
};
