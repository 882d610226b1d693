//! Core data types shared by the fluid solver and the coupling cache.

use nalgebra::{Matrix2, Vector2};

/// A point in the 2-D computational domain.
pub type Point2 = Vector2<f64>;

/// A 2-D vector (velocity, force, acceleration).
pub type Vec2 = Vector2<f64>;

/// A rank-2 tensor in 2-D. Symmetric tensors (stress) store their full
/// matrix; symmetry is the writer's responsibility.
pub type Tensor2 = Matrix2<f64>;

/// Build a symmetric rank-2 tensor from its independent components.
pub fn sym_tensor(xx: f64, yy: f64, xy: f64) -> Tensor2 {
    Matrix2::new(xx, xy, xy, yy)
}

/// Frobenius inner product of two rank-2 tensors.
#[inline]
pub fn double_contract(a: &Tensor2, b: &Tensor2) -> f64 {
    a[(0, 0)] * b[(0, 0)] + a[(0, 1)] * b[(0, 1)] + a[(1, 0)] * b[(1, 0)] + a[(1, 1)] * b[(1, 1)]
}
