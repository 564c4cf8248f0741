//! Configuration errors raised while building or sizing a chain.
//!
//! Everything here is fatal: the engine has no retry path, and an error from
//! setup or from the first size query means the run cannot proceed. Internal
//! invariant violations (a task invoked without its upstream storage, a
//! row-stash write past capacity) are defects rather than runtime conditions
//! and panic with the offending node label instead.

use thiserror::Error;

/// Fatal configuration error detected at chain construction or sizing time.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Two output components in one fused chain disagree on the task-domain
    /// size. Detected when the evaluation plan is built, never mid-loop.
    #[error("mismatched task counts in fused chain: {label} runs over {found} tasks but the chain head runs over {expected}")]
    TaskCountMismatch {
        label: String,
        expected: usize,
        found: usize,
    },

    /// A chain join would place `later` ahead of a node it must follow.
    #[error("{later} must be evaluated after {earlier}, but the requested chain orders them the other way")]
    OrderViolation { earlier: String, later: String },

    /// A node may belong to at most one chain.
    #[error("node {label} is already fused into another chain")]
    AlreadyChained { label: String },

    /// Every node label in a graph must be unique.
    #[error("a node labelled {label} already exists in this graph")]
    DuplicateLabel { label: String },

    /// An argument's rank or derivative mode is not supported by the
    /// consuming node.
    #[error("node {label} cannot consume argument {argument}: {reason}")]
    UnsupportedArgument {
        label: String,
        argument: String,
        reason: String,
    },

    /// Arguments that should share a shape do not.
    #[error("node {label} has mismatched argument shapes: {reason}")]
    ArgumentMismatch { label: String, reason: String },

    /// Derivatives were requested from a function that declares them
    /// unimplemented.
    #[error("derivatives have not been implemented for {label}")]
    DerivativesUnimplemented { label: String },
}
