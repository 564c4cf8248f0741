//! Stock element functions.

use super::ElementFunction;
use crate::float::Float;

/// Reduce a single argument to its sum over the task domain.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sum;

impl<F: Float> ElementFunction<F> for Sum {
    fn name(&self) -> &str {
        "sum"
    }

    fn zero_rank(&self) -> bool {
        true
    }

    fn calc(&self, args: &[F], values: &mut [F], derivatives: &mut [F]) {
        debug_assert_eq!(args.len(), 1, "sum reduces a single argument");
        values[0] = args[0];
        derivatives[0] = F::one();
    }
}

/// Reduce a single argument to its mean over the task domain.
#[derive(Clone, Copy, Debug, Default)]
pub struct Mean;

impl<F: Float> ElementFunction<F> for Mean {
    fn name(&self) -> &str {
        "mean"
    }

    fn zero_rank(&self) -> bool {
        true
    }

    fn calc(&self, args: &[F], values: &mut [F], derivatives: &mut [F]) {
        debug_assert_eq!(args.len(), 1, "mean reduces a single argument");
        values[0] = args[0];
        derivatives[0] = F::one();
    }

    fn finish_scale(&self, num_tasks: usize) -> F {
        F::one()
            / F::from_usize(num_tasks.max(1)).unwrap_or_else(F::one)
    }
}

/// Elementwise polynomial combination `sum_i c_i * x_i^p_i`.
#[derive(Clone, Debug)]
pub struct Combine<F: Float> {
    coefficients: Vec<F>,
    powers: Vec<i32>,
}

impl<F: Float> Combine<F> {
    pub fn new(coefficients: Vec<F>, powers: Vec<i32>) -> Self {
        assert_eq!(
            coefficients.len(),
            powers.len(),
            "combine needs one power per coefficient"
        );
        Combine {
            coefficients,
            powers,
        }
    }

    /// Plain weighted sum of the arguments.
    pub fn linear(coefficients: Vec<F>) -> Self {
        let powers = vec![1; coefficients.len()];
        Combine::new(coefficients, powers)
    }
}

impl<F: Float> ElementFunction<F> for Combine<F> {
    fn name(&self) -> &str {
        "combine"
    }

    fn calc(&self, args: &[F], values: &mut [F], derivatives: &mut [F]) {
        debug_assert_eq!(args.len(), self.coefficients.len());
        let mut total = F::zero();
        for (i, &x) in args.iter().enumerate() {
            let c = self.coefficients[i];
            let p = self.powers[i];
            total += c * x.powi(p);
            derivatives[i] = if p == 0 {
                F::zero()
            } else {
                c * F::from_i32(p).unwrap_or_else(F::one) * x.powi(p - 1)
            };
        }
        values[0] = total;
    }
}
