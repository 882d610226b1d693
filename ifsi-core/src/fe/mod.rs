//! Finite-element evaluation capability.
//!
//! This module provides "evaluate basis functions and gradients at the
//! quadrature points of a cell" for the Taylor-Hood Q2/Q1 pair, consumed by
//! assembly, the error indicator, and solution transfer.
//!
//! # Submodules
//!
//! - [`gauss`] - Gauss quadrature rules for numerical integration
//! - [`shape`] - scalar Q1/Q2 Lagrange shape functions

pub mod gauss;
pub mod shape;

pub use gauss::{gauss_1d, gauss_quad, GaussPoint};
pub use shape::{N_Q1, N_Q2};

use crate::types::{Point2, Tensor2, Vec2};
use nalgebra::Matrix2;

/// Velocity DoFs per cell (9 Q2 nodes x 2 components).
pub const N_VEL_DOFS: usize = 2 * N_Q2;
/// Pressure DoFs per cell.
pub const N_PRES_DOFS: usize = N_Q1;
/// Total local DoFs per cell.
pub const N_CELL_DOFS: usize = N_VEL_DOFS + N_PRES_DOFS;

/// Per-cell finite element values at quadrature points.
///
/// Reference-space shape values and gradients are tabulated once at
/// construction; `reinit` maps gradients and weights to a concrete cell
/// through the bilinear geometry mapping (2x2 Jacobian).
pub struct FeValues {
    quadrature: Vec<GaussPoint>,
    // Tabulated reference values: [qp][node]
    q2_values: Vec<[f64; N_Q2]>,
    q2_ref_grads: Vec<[[f64; 2]; N_Q2]>,
    q1_values: Vec<[f64; N_Q1]>,
    q1_ref_grads: Vec<[[f64; 2]; N_Q1]>,
    // Per-cell mapped state, filled by `reinit`
    jxw: Vec<f64>,
    q2_grads: Vec<[Vec2; N_Q2]>,
    q1_grads: Vec<[Vec2; N_Q1]>,
    q_points: Vec<Point2>,
}

impl FeValues {
    /// Tabulate reference values on an `n`-point-per-direction Gauss rule.
    pub fn new(n_gauss: usize) -> Self {
        let quadrature = gauss_quad(n_gauss);
        let nq = quadrature.len();

        let mut q2_values = Vec::with_capacity(nq);
        let mut q2_ref_grads = Vec::with_capacity(nq);
        let mut q1_values = Vec::with_capacity(nq);
        let mut q1_ref_grads = Vec::with_capacity(nq);
        for gp in &quadrature {
            q2_values.push(shape::q2_values(gp.xi(), gp.eta()));
            q2_ref_grads.push(shape::q2_gradients(gp.xi(), gp.eta()));
            q1_values.push(shape::q1_values(gp.xi(), gp.eta()));
            q1_ref_grads.push(shape::q1_gradients(gp.xi(), gp.eta()));
        }

        Self {
            quadrature,
            q2_values,
            q2_ref_grads,
            q1_values,
            q1_ref_grads,
            jxw: vec![0.0; nq],
            q2_grads: vec![[Vec2::zeros(); N_Q2]; nq],
            q1_grads: vec![[Vec2::zeros(); N_Q1]; nq],
            q_points: vec![Point2::zeros(); nq],
        }
    }

    /// Number of quadrature points.
    pub fn n_q_points(&self) -> usize {
        self.quadrature.len()
    }

    /// Recompute mapped gradients, quadrature points and JxW weights for a
    /// cell given by its four vertices in counter-clockwise order.
    ///
    /// # Panics
    ///
    /// Panics if the cell geometry is degenerate (non-positive Jacobian
    /// determinant).
    pub fn reinit(&mut self, vertices: &[Point2; 4]) {
        for q in 0..self.quadrature.len() {
            // Bilinear geometry mapping: x(xi) = sum_i N_i^{Q1}(xi) v_i
            let n = &self.q1_values[q];
            let dn = &self.q1_ref_grads[q];

            let mut x = Point2::zeros();
            let mut jac = Matrix2::<f64>::zeros();
            for i in 0..N_Q1 {
                x += n[i] * vertices[i];
                // J[r][c] = d x_r / d xi_c
                jac[(0, 0)] += dn[i][0] * vertices[i][0];
                jac[(0, 1)] += dn[i][1] * vertices[i][0];
                jac[(1, 0)] += dn[i][0] * vertices[i][1];
                jac[(1, 1)] += dn[i][1] * vertices[i][1];
            }

            let det = jac[(0, 0)] * jac[(1, 1)] - jac[(0, 1)] * jac[(1, 0)];
            assert!(det > 0.0, "degenerate cell: Jacobian determinant {}", det);
            let jac_inv_t = Matrix2::new(jac[(1, 1)], -jac[(1, 0)], -jac[(0, 1)], jac[(0, 0)]) / det;

            self.q_points[q] = x;
            self.jxw[q] = det * self.quadrature[q].weight;
            for i in 0..N_Q2 {
                let g = &self.q2_ref_grads[q][i];
                self.q2_grads[q][i] = jac_inv_t * Vec2::new(g[0], g[1]);
            }
            for i in 0..N_Q1 {
                let g = &self.q1_ref_grads[q][i];
                self.q1_grads[q][i] = jac_inv_t * Vec2::new(g[0], g[1]);
            }
        }
    }

    /// JxW weight at quadrature point `q`.
    #[inline]
    pub fn jxw(&self, q: usize) -> f64 {
        self.jxw[q]
    }

    /// Physical location of quadrature point `q`.
    #[inline]
    pub fn quadrature_point(&self, q: usize) -> Point2 {
        self.q_points[q]
    }

    /// Value of the velocity-space scalar shape `i` at quadrature point `q`.
    #[inline]
    pub fn q2_value(&self, i: usize, q: usize) -> f64 {
        self.q2_values[q][i]
    }

    /// Physical gradient of the velocity-space scalar shape `i` at `q`.
    #[inline]
    pub fn q2_grad(&self, i: usize, q: usize) -> Vec2 {
        self.q2_grads[q][i]
    }

    /// Value of the pressure-space shape `i` at quadrature point `q`.
    #[inline]
    pub fn q1_value(&self, i: usize, q: usize) -> f64 {
        self.q1_values[q][i]
    }

    /// Physical gradient of the pressure-space shape `i` at `q`.
    #[inline]
    pub fn q1_grad(&self, i: usize, q: usize) -> Vec2 {
        self.q1_grads[q][i]
    }

    /// Velocity value at quadrature point `q` from local velocity DoF
    /// values (node-major: [u0x, u0y, u1x, u1y, ...]).
    pub fn velocity_value(&self, local_u: &[f64], q: usize) -> Vec2 {
        let mut u = Vec2::zeros();
        for i in 0..N_Q2 {
            let n = self.q2_values[q][i];
            u[0] += n * local_u[2 * i];
            u[1] += n * local_u[2 * i + 1];
        }
        u
    }

    /// Velocity gradient at `q`: grad[(r, c)] = d u_r / d x_c.
    pub fn velocity_gradient(&self, local_u: &[f64], q: usize) -> Tensor2 {
        let mut grad = Tensor2::zeros();
        for i in 0..N_Q2 {
            let g = self.q2_grads[q][i];
            grad[(0, 0)] += local_u[2 * i] * g[0];
            grad[(0, 1)] += local_u[2 * i] * g[1];
            grad[(1, 0)] += local_u[2 * i + 1] * g[0];
            grad[(1, 1)] += local_u[2 * i + 1] * g[1];
        }
        grad
    }

    /// Velocity divergence at `q`.
    pub fn velocity_divergence(&self, local_u: &[f64], q: usize) -> f64 {
        let mut div = 0.0;
        for i in 0..N_Q2 {
            let g = self.q2_grads[q][i];
            div += local_u[2 * i] * g[0] + local_u[2 * i + 1] * g[1];
        }
        div
    }

    /// Pressure value at `q` from local pressure DoF values.
    pub fn pressure_value(&self, local_p: &[f64], q: usize) -> f64 {
        (0..N_Q1).map(|i| self.q1_values[q][i] * local_p[i]).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn unit_square() -> [Point2; 4] {
        [
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(1.0, 1.0),
            Point2::new(0.0, 1.0),
        ]
    }

    #[test]
    fn test_jxw_sums_to_cell_area() {
        let mut fe = FeValues::new(3);
        fe.reinit(&unit_square());
        let area: f64 = (0..fe.n_q_points()).map(|q| fe.jxw(q)).sum();
        assert_relative_eq!(area, 1.0, epsilon = 1e-14);

        let stretched = [
            Point2::new(0.0, 0.0),
            Point2::new(2.0, 0.0),
            Point2::new(2.0, 0.5),
            Point2::new(0.0, 0.5),
        ];
        fe.reinit(&stretched);
        let area: f64 = (0..fe.n_q_points()).map(|q| fe.jxw(q)).sum();
        assert_relative_eq!(area, 1.0, epsilon = 1e-14);
    }

    #[test]
    fn test_linear_field_gradient_exact() {
        // u(x, y) = (2x + y, -3y); grad and div must be exact
        let mut fe = FeValues::new(3);
        fe.reinit(&unit_square());

        let mut local_u = [0.0; N_VEL_DOFS];
        for (i, &(a, b)) in shape::Q2_NODES.iter().enumerate() {
            // reference == physical scaled: x = (a+1)/2, y = (b+1)/2
            let (x, y) = (0.5 * (a + 1.0), 0.5 * (b + 1.0));
            local_u[2 * i] = 2.0 * x + y;
            local_u[2 * i + 1] = -3.0 * y;
        }

        for q in 0..fe.n_q_points() {
            let grad = fe.velocity_gradient(&local_u, q);
            assert_relative_eq!(grad[(0, 0)], 2.0, epsilon = 1e-12);
            assert_relative_eq!(grad[(0, 1)], 1.0, epsilon = 1e-12);
            assert_relative_eq!(grad[(1, 0)], 0.0, epsilon = 1e-12);
            assert_relative_eq!(grad[(1, 1)], -3.0, epsilon = 1e-12);
            assert_relative_eq!(fe.velocity_divergence(&local_u, q), -1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_quadrature_points_inside_cell() {
        let mut fe = FeValues::new(2);
        let verts = [
            Point2::new(1.0, 2.0),
            Point2::new(3.0, 2.0),
            Point2::new(3.0, 4.0),
            Point2::new(1.0, 4.0),
        ];
        fe.reinit(&verts);
        for q in 0..fe.n_q_points() {
            let p = fe.quadrature_point(q);
            assert!(p[0] > 1.0 && p[0] < 3.0);
            assert!(p[1] > 2.0 && p[1] < 4.0);
        }
    }

    #[test]
    fn test_pressure_interpolation() {
        let mut fe = FeValues::new(2);
        fe.reinit(&unit_square());
        // p(x, y) = 3 - x: exactly representable in Q1
        let local_p = [3.0, 2.0, 2.0, 3.0];
        for q in 0..fe.n_q_points() {
            let x = fe.quadrature_point(q)[0];
            assert_relative_eq!(fe.pressure_value(&local_p, q), 3.0 - x, epsilon = 1e-13);
        }
    }
}
