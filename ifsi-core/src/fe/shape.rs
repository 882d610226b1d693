//! Scalar Lagrange shape functions on the reference square [-1, 1]^2.
//!
//! Two spaces are provided, matching the Taylor-Hood pair:
//! - Q2 (biquadratic, 9 nodes) for each velocity component
//! - Q1 (bilinear, 4 nodes) for pressure
//!
//! # Node ordering
//!
//! Vertices are counter-clockwise from the bottom-left corner. Q2 adds the
//! four edge midside nodes (bottom, right, top, left) and the cell center:
//!
//! ```text
//!   3---6---2
//!   |       |
//!   7   8   5
//!   |       |
//!   0---4---1
//! ```

/// Number of Q2 nodes per cell.
pub const N_Q2: usize = 9;
/// Number of Q1 nodes per cell.
pub const N_Q1: usize = 4;

/// Reference coordinates (xi, eta) of the Q2 nodes, in local order.
pub const Q2_NODES: [(f64, f64); N_Q2] = [
    (-1.0, -1.0),
    (1.0, -1.0),
    (1.0, 1.0),
    (-1.0, 1.0),
    (0.0, -1.0),
    (1.0, 0.0),
    (0.0, 1.0),
    (-1.0, 0.0),
    (0.0, 0.0),
];

/// Reference coordinates of the Q1 nodes (the cell vertices).
pub const Q1_NODES: [(f64, f64); N_Q1] = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];

/// 1D quadratic Lagrange basis on [-1, 1] with nodes at -1, 0, 1,
/// selected by the node coordinate `a`.
#[inline]
fn l2(a: f64, x: f64) -> f64 {
    if a < -0.5 {
        0.5 * x * (x - 1.0)
    } else if a > 0.5 {
        0.5 * x * (x + 1.0)
    } else {
        1.0 - x * x
    }
}

#[inline]
fn l2_deriv(a: f64, x: f64) -> f64 {
    if a < -0.5 {
        x - 0.5
    } else if a > 0.5 {
        x + 0.5
    } else {
        -2.0 * x
    }
}

/// Q2 shape function values at a reference point.
pub fn q2_values(xi: f64, eta: f64) -> [f64; N_Q2] {
    let mut values = [0.0; N_Q2];
    for (i, &(a, b)) in Q2_NODES.iter().enumerate() {
        values[i] = l2(a, xi) * l2(b, eta);
    }
    values
}

/// Q2 shape function gradients (d/dxi, d/deta) at a reference point.
pub fn q2_gradients(xi: f64, eta: f64) -> [[f64; 2]; N_Q2] {
    let mut grads = [[0.0; 2]; N_Q2];
    for (i, &(a, b)) in Q2_NODES.iter().enumerate() {
        grads[i] = [l2_deriv(a, xi) * l2(b, eta), l2(a, xi) * l2_deriv(b, eta)];
    }
    grads
}

/// Q1 shape function values at a reference point.
pub fn q1_values(xi: f64, eta: f64) -> [f64; N_Q1] {
    let mut values = [0.0; N_Q1];
    for (i, &(a, b)) in Q1_NODES.iter().enumerate() {
        values[i] = 0.25 * (1.0 + a * xi) * (1.0 + b * eta);
    }
    values
}

/// Q1 shape function gradients (d/dxi, d/deta) at a reference point.
pub fn q1_gradients(xi: f64, eta: f64) -> [[f64; 2]; N_Q1] {
    let mut grads = [[0.0; 2]; N_Q1];
    for (i, &(a, b)) in Q1_NODES.iter().enumerate() {
        grads[i] = [0.25 * a * (1.0 + b * eta), 0.25 * b * (1.0 + a * xi)];
    }
    grads
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_q2_kronecker_delta() {
        for (i, &(xi, eta)) in Q2_NODES.iter().enumerate() {
            let values = q2_values(xi, eta);
            for (j, &v) in values.iter().enumerate() {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(v, expected, epsilon = 1e-14);
            }
        }
    }

    #[test]
    fn test_q1_kronecker_delta() {
        for (i, &(xi, eta)) in Q1_NODES.iter().enumerate() {
            let values = q1_values(xi, eta);
            for (j, &v) in values.iter().enumerate() {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(v, expected, epsilon = 1e-14);
            }
        }
    }

    #[test]
    fn test_partition_of_unity() {
        let samples = [(-0.7, 0.3), (0.2, -0.9), (0.0, 0.0), (0.5, 0.5)];
        for &(xi, eta) in &samples {
            let s2: f64 = q2_values(xi, eta).iter().sum();
            let s1: f64 = q1_values(xi, eta).iter().sum();
            assert_relative_eq!(s2, 1.0, epsilon = 1e-14);
            assert_relative_eq!(s1, 1.0, epsilon = 1e-14);
        }
    }

    #[test]
    fn test_gradients_sum_to_zero() {
        // The gradient of the constant-1 function is zero
        let (xi, eta) = (0.31, -0.64);
        let g2 = q2_gradients(xi, eta);
        let gx: f64 = g2.iter().map(|g| g[0]).sum();
        let gy: f64 = g2.iter().map(|g| g[1]).sum();
        assert_relative_eq!(gx, 0.0, epsilon = 1e-13);
        assert_relative_eq!(gy, 0.0, epsilon = 1e-13);
    }

    #[test]
    fn test_q2_reproduces_quadratic() {
        // Q2 must reproduce f(xi, eta) = xi^2 exactly
        let f = |x: f64, _y: f64| x * x;
        let (xi, eta) = (0.37, -0.21);
        let values = q2_values(xi, eta);
        let interp: f64 = Q2_NODES
            .iter()
            .zip(values.iter())
            .map(|(&(a, b), &n)| f(a, b) * n)
            .sum();
        assert_relative_eq!(interp, f(xi, eta), epsilon = 1e-14);
    }
}
