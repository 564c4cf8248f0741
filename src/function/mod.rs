//! Elementwise functions lifted over vectors and matrices.
//!
//! An [`ElementFunction`] computes one output element (and its partial
//! derivatives) from one element of each argument. [`FunctionOfVector`]
//! lifts it over a task domain of vector entries and [`FunctionOfMatrix`]
//! over matrix rows; both fuse with the chains producing their arguments
//! whenever chain construction allows it. Zero-rank functions reduce the
//! whole task domain to a scalar carrying a dense derivative block.

mod arithmetic;
mod of_matrix;
mod of_vector;
mod source;
mod stack;

pub use arithmetic::{Combine, Mean, Sum};
pub use of_matrix::FunctionOfMatrix;
pub use of_vector::FunctionOfVector;
pub use source::{SourceMatrix, SourceVector};
pub use stack::VStack;

use crate::float::Float;

/// One scalar-in, scalar-out kernel applied per task or per matrix element.
pub trait ElementFunction<F: Float>: Send + Sync {
    fn name(&self) -> &str;

    /// Number of output components per element.
    fn num_components(&self) -> usize {
        1
    }

    /// Reduce the task domain to scalars instead of mapping over it.
    fn zero_rank(&self) -> bool {
        false
    }

    /// Functions without derivatives cannot sit in a differentiated chain.
    fn derivatives_implemented(&self) -> bool {
        true
    }

    /// Evaluate one element. `values` holds `num_components` outputs and
    /// `derivatives` the row-major `num_components x args.len()` partials.
    fn calc(&self, args: &[F], values: &mut [F], derivatives: &mut [F]);

    /// Factor applied to zero-rank outputs after the reduction (e.g. `1/n`
    /// for a mean).
    fn finish_scale(&self, _num_tasks: usize) -> F {
        F::one()
    }

    /// Half-open periodic domain of the outputs, if any.
    fn periodic_domain(&self) -> Option<(F, F)> {
        None
    }
}
