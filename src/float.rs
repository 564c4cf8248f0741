use std::fmt::{Debug, Display};
use std::ops::AddAssign;

use num_traits::{Float as NumFloat, FromPrimitive};

/// Marker trait for the base floating-point types (`f32`, `f64`).
///
/// Bundles the numeric and utility traits the engine needs everywhere:
/// buffers are accumulated with `+=`, workspaces are sent across rayon
/// workers, and plans are sized from `usize` counts.
pub trait Float:
    NumFloat + FromPrimitive + AddAssign + Copy + Send + Sync + Default + Debug + Display + 'static
{
}

impl Float for f32 {}
impl Float for f64 {}
