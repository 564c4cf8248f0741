pub mod adjoint;
pub mod comm;
pub mod error;
pub mod float;
pub mod function;
pub mod graph;
pub mod node;
pub mod plan;
pub mod runner;
pub mod stash;
pub mod value;
pub mod workspace;

pub use adjoint::{apply, apply_with};
pub use comm::{Communicator, Serial};
pub use error::ChainError;
pub use float::Float;
pub use function::{
    Combine, ElementFunction, FunctionOfMatrix, FunctionOfVector, Mean, SourceMatrix,
    SourceVector, Sum, VStack,
};
pub use graph::Graph;
pub use node::{EvalContext, MatrixNode, Node, NodeId};
pub use plan::{DerivRange, DerivSource, EvalPlan};
pub use runner::{local_buffer, run_all, run_with, RunOptions};
pub use value::{Periodicity, Value, ValueKind, ValueRef, ValueSpec};
pub use workspace::Workspace;

/// Type alias for a graph over `f64`.
pub type Graph64 = Graph<f64>;
/// Type alias for a graph over `f32`.
pub type Graph32 = Graph<f32>;
