//! Collective reduction seam.
//!
//! The runner never talks to a message-passing library directly; it sums its
//! local accumulation buffer through this trait. The default [`Serial`]
//! communicator is a single-rank no-op. A distributed build plugs in its own
//! implementation; tests simulate multiple ranks by summing local buffers by
//! hand.

use crate::float::Float;

/// One collective domain the task loop is striped over.
pub trait Communicator<F: Float>: Send + Sync {
    /// Number of ranks sharing the task domain.
    fn size(&self) -> usize {
        1
    }

    /// This process's rank, `0 <= rank < size`.
    fn rank(&self) -> usize {
        0
    }

    /// In-place all-reduce sum over every rank's buffer.
    fn sum(&self, _buffer: &mut [F]) {}
}

/// Single-process communicator.
#[derive(Clone, Copy, Debug, Default)]
pub struct Serial;

impl<F: Float> Communicator<F> for Serial {}
