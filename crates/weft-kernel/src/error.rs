use thiserror::Error;

use crate::types::TokenKind;

/// Errors surfaced by the rendezvous kernel.
///
/// Protocol-invariant violations (releasing a first-trying claim held by
/// another branch, reporting success for a branch that is not trying) are
/// bugs in the kernel itself and panic instead of returning a variant.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RendezvousError {
    #[error("process terminated: model finish requested")]
    Terminated,

    #[error("channel expects {expected:?} tokens, got {actual:?}")]
    TypeMismatch {
        expected: TokenKind,
        actual: TokenKind,
    },

    #[error("operation requires at least one channel")]
    NoChannels,

    #[error("branch ids within one controller call must be unique, got duplicate {0}")]
    DuplicateBranch(usize),
}
