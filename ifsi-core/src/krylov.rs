//! Iterative Krylov solvers.
//!
//! Both solvers operate on raw slices and take the matrix action and the
//! preconditioner as closures, with inner products routed through an
//! [`InnerProduct`] implementation. In the serial solver the inner product
//! is a plain dot product; the distributed variant supplies an
//! implementation whose dot products are global reductions, so the same
//! iteration code runs in both deployments.
//!
//! - [`cg`]: conjugate gradients with optional Jacobi preconditioning,
//!   used for the inner solves of the block preconditioner.
//! - [`fgmres`]: restarted flexible GMRES. Flexibility matters because the
//!   block Schur preconditioner applies inner iterative solves and is
//!   therefore not a fixed linear operator; the solver stores the
//!   preconditioned basis Z and forms the update from it.

/// Iteration controls: cap and absolute tolerance on the residual norm.
#[derive(Debug, Clone, Copy)]
pub struct SolverControl {
    pub max_iter: usize,
    pub tol: f64,
}

/// Outcome of an iterative solve.
///
/// Non-convergence is reported, not raised: `iterations` equals the cap
/// and `residual` is the last residual norm. The caller decides whether
/// that is fatal.
#[derive(Debug, Clone, Copy)]
pub struct SolveInfo {
    pub iterations: usize,
    pub residual: f64,
    pub initial_residual: f64,
    pub converged: bool,
}

/// Inner products over solver state. Distributed implementations reduce
/// across ranks; every rank must call them in lockstep.
pub trait InnerProduct {
    fn dot(&self, a: &[f64], b: &[f64]) -> f64;

    fn norm(&self, a: &[f64]) -> f64 {
        self.dot(a, a).sqrt()
    }
}

/// Serial inner product.
pub struct SerialOps;

impl InnerProduct for SerialOps {
    fn dot(&self, a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }
}

#[inline]
fn axpy(alpha: f64, x: &[f64], y: &mut [f64]) {
    for (yi, &xi) in y.iter_mut().zip(x.iter()) {
        *yi += alpha * xi;
    }
}

/// Preconditioned conjugate gradients for symmetric positive definite
/// operators. `diag` supplies a Jacobi preconditioner; `None` runs plain
/// CG.
pub fn cg<O, A>(
    ops: &O,
    apply: A,
    diag: Option<&[f64]>,
    b: &[f64],
    x: &mut [f64],
    control: &SolverControl,
) -> SolveInfo
where
    O: InnerProduct,
    A: Fn(&[f64], &mut [f64]),
{
    let n = b.len();
    let mut r = vec![0.0; n];
    let mut z = vec![0.0; n];
    let mut q = vec![0.0; n];

    apply(x, &mut r);
    for i in 0..n {
        r[i] = b[i] - r[i];
    }
    let initial_residual = ops.norm(&r);
    if initial_residual <= control.tol || control.max_iter == 0 {
        return SolveInfo {
            iterations: 0,
            residual: initial_residual,
            initial_residual,
            converged: initial_residual <= control.tol,
        };
    }

    let precondition = |r: &[f64], z: &mut [f64]| match diag {
        Some(d) => {
            for i in 0..r.len() {
                z[i] = if d[i].abs() > 1e-300 { r[i] / d[i] } else { r[i] };
            }
        }
        None => z.copy_from_slice(r),
    };

    precondition(&r, &mut z);
    let mut p = z.clone();
    let mut rho = ops.dot(&r, &z);
    let mut residual = initial_residual;

    for iter in 0..control.max_iter {
        apply(&p, &mut q);
        let p_q = ops.dot(&p, &q);
        if p_q.abs() < 1e-300 {
            return SolveInfo {
                iterations: iter,
                residual,
                initial_residual,
                converged: false,
            };
        }
        let alpha = rho / p_q;
        axpy(alpha, &p, x);
        axpy(-alpha, &q, &mut r);

        residual = ops.norm(&r);
        if residual <= control.tol {
            return SolveInfo {
                iterations: iter + 1,
                residual,
                initial_residual,
                converged: true,
            };
        }

        precondition(&r, &mut z);
        let rho_new = ops.dot(&r, &z);
        let beta = rho_new / rho;
        rho = rho_new;
        for i in 0..n {
            p[i] = z[i] + beta * p[i];
        }
    }

    SolveInfo {
        iterations: control.max_iter,
        residual,
        initial_residual,
        converged: false,
    }
}

/// A single Givens rotation (c, s) zeroing the second component.
#[derive(Clone, Copy)]
struct GivensRotation {
    c: f64,
    s: f64,
}

impl GivensRotation {
    fn compute(a: f64, b: f64) -> Self {
        if b.abs() < 1e-300 {
            GivensRotation { c: 1.0, s: 0.0 }
        } else if b.abs() > a.abs() {
            let tau = -a / b;
            let s = 1.0 / (1.0 + tau * tau).sqrt();
            GivensRotation { c: s * tau, s }
        } else {
            let tau = -b / a;
            let c = 1.0 / (1.0 + tau * tau).sqrt();
            GivensRotation { c, s: c * tau }
        }
    }

    #[inline]
    fn apply(&self, a: &mut f64, b: &mut f64) {
        let (ta, tb) = (*a, *b);
        *a = self.c * ta - self.s * tb;
        *b = self.s * ta + self.c * tb;
    }
}

/// Restart length of the flexible GMRES cycles.
pub const FGMRES_RESTART: usize = 30;

/// Restarted flexible GMRES with right preconditioning.
///
/// Builds an Arnoldi basis with modified Gram-Schmidt and solves the
/// projected least-squares problem via Givens rotations. The residual
/// estimate carried by the rotations is the true (unpreconditioned)
/// residual norm, so `control.tol` bounds `||b - A x||`.
///
/// `max_iter` caps the total number of inner iterations across restarts;
/// a cap of zero reports the initial residual without iterating.
pub fn fgmres<O, A, P>(
    ops: &O,
    apply: A,
    precondition: P,
    b: &[f64],
    x: &mut [f64],
    control: &SolverControl,
) -> SolveInfo
where
    O: InnerProduct,
    A: Fn(&[f64], &mut [f64]),
    P: Fn(&[f64], &mut [f64]),
{
    let n = b.len();
    let mut r = vec![0.0; n];
    let mut w = vec![0.0; n];

    apply(x, &mut r);
    for i in 0..n {
        r[i] = b[i] - r[i];
    }
    let initial_residual = ops.norm(&r);
    if initial_residual <= control.tol || control.max_iter == 0 {
        return SolveInfo {
            iterations: 0,
            residual: initial_residual,
            initial_residual,
            converged: initial_residual <= control.tol,
        };
    }

    let mut total_iters = 0;
    let mut residual = initial_residual;

    'outer: loop {
        apply(x, &mut r);
        for i in 0..n {
            r[i] = b[i] - r[i];
        }
        let beta = ops.norm(&r);
        if beta <= control.tol {
            residual = beta;
            break;
        }

        let m = FGMRES_RESTART;
        let h_rows = m + 1;
        // Arnoldi basis V and preconditioned basis Z (flexible variant)
        let mut v_basis: Vec<Vec<f64>> = Vec::with_capacity(m + 1);
        let mut z_basis: Vec<Vec<f64>> = Vec::with_capacity(m);
        let mut h = vec![0.0; h_rows * m];
        let mut givens: Vec<GivensRotation> = Vec::with_capacity(m);
        let mut g = vec![0.0; m + 1];
        g[0] = beta;

        v_basis.push(r.iter().map(|ri| ri / beta).collect());

        let mut k = 0;
        for j in 0..m {
            if total_iters >= control.max_iter {
                break;
            }
            total_iters += 1;
            k = j + 1;

            // z_j = M^{-1} v_j, w = A z_j
            let mut z = vec![0.0; n];
            precondition(&v_basis[j], &mut z);
            apply(&z, &mut w);
            z_basis.push(z);

            // Modified Gram-Schmidt
            for i in 0..=j {
                let h_ij = ops.dot(&w, &v_basis[i]);
                h[j * h_rows + i] = h_ij;
                axpy(-h_ij, &v_basis[i], &mut w);
            }
            let h_next = ops.norm(&w);
            h[j * h_rows + j + 1] = h_next;

            if h_next > 1e-300 {
                v_basis.push(w.iter().map(|wi| wi / h_next).collect());
            } else {
                v_basis.push(vec![0.0; n]);
            }

            // Apply accumulated rotations to the new column, then zero the
            // subdiagonal with a fresh one.
            for (i, rot) in givens.iter().enumerate() {
                let (lo, hi) = (j * h_rows + i, j * h_rows + i + 1);
                let (mut a, mut b2) = (h[lo], h[hi]);
                rot.apply(&mut a, &mut b2);
                h[lo] = a;
                h[hi] = b2;
            }
            let rot = GivensRotation::compute(h[j * h_rows + j], h[j * h_rows + j + 1]);
            {
                let (lo, hi) = (j * h_rows + j, j * h_rows + j + 1);
                let (mut a, mut b2) = (h[lo], h[hi]);
                rot.apply(&mut a, &mut b2);
                h[lo] = a;
                h[hi] = b2;
            }
            {
                let (mut a, mut b2) = (g[j], g[j + 1]);
                rot.apply(&mut a, &mut b2);
                g[j] = a;
                g[j + 1] = b2;
            }
            givens.push(rot);

            residual = g[j + 1].abs();
            if residual <= control.tol || h_next <= 1e-300 {
                break;
            }
        }

        // Back-substitute H y = g and update x from the Z basis.
        let mut y = vec![0.0; k];
        for i in (0..k).rev() {
            let mut sum = g[i];
            for jj in (i + 1)..k {
                sum -= h[jj * h_rows + i] * y[jj];
            }
            let diag = h[i * h_rows + i];
            y[i] = if diag.abs() > 1e-300 { sum / diag } else { 0.0 };
        }
        for i in 0..k {
            axpy(y[i], &z_basis[i], x);
        }

        if residual <= control.tol {
            break 'outer;
        }
        if total_iters >= control.max_iter {
            break 'outer;
        }
    }

    SolveInfo {
        iterations: total_iters,
        residual,
        initial_residual,
        converged: residual <= control.tol,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::{csr_matvec, TripletMatrix};
    use approx::assert_relative_eq;

    fn spd_matrix() -> crate::sparse::CsrMatrix {
        // Tridiagonal SPD: diag 4, off-diag -1
        let n = 20;
        let mut t = TripletMatrix::new(n, n);
        for i in 0..n {
            t.add(i, i, 4.0);
            if i + 1 < n {
                t.add(i, i + 1, -1.0);
                t.add(i + 1, i, -1.0);
            }
        }
        t.to_csr()
    }

    #[test]
    fn test_cg_converges_on_spd() {
        let a = spd_matrix();
        let n = a.nrows();
        let b = vec![1.0; n];
        let mut x = vec![0.0; n];
        let info = cg(
            &SerialOps,
            |src, dst| csr_matvec(&a, src, dst),
            None,
            &b,
            &mut x,
            &SolverControl {
                max_iter: 200,
                tol: 1e-12,
            },
        );
        assert!(info.converged);

        let mut res = vec![0.0; n];
        csr_matvec(&a, &x, &mut res);
        for i in 0..n {
            assert_relative_eq!(res[i], b[i], epsilon = 1e-9);
        }
    }

    #[test]
    fn test_cg_jacobi_preconditioning_helps() {
        let a = spd_matrix();
        let n = a.nrows();
        let diag = crate::sparse::csr_diagonal(&a);
        let b: Vec<f64> = (0..n).map(|i| (i as f64).sin()).collect();
        let control = SolverControl {
            max_iter: 200,
            tol: 1e-12,
        };

        let mut x_plain = vec![0.0; n];
        let plain = cg(
            &SerialOps,
            |src, dst| csr_matvec(&a, src, dst),
            None,
            &b,
            &mut x_plain,
            &control,
        );
        let mut x_pc = vec![0.0; n];
        let pc = cg(
            &SerialOps,
            |src, dst| csr_matvec(&a, src, dst),
            Some(diag.as_slice()),
            &b,
            &mut x_pc,
            &control,
        );
        assert!(plain.converged && pc.converged);
        assert!(pc.iterations <= plain.iterations);
    }

    #[test]
    fn test_fgmres_solves_nonsymmetric() {
        let n = 12;
        let mut t = TripletMatrix::new(n, n);
        for i in 0..n {
            t.add(i, i, 3.0 + i as f64 * 0.1);
            if i + 1 < n {
                t.add(i, i + 1, -1.0);
                t.add(i + 1, i, 0.5);
            }
        }
        let a = t.to_csr();
        let b = vec![1.0; n];
        let mut x = vec![0.0; n];
        let info = fgmres(
            &SerialOps,
            |src, dst| csr_matvec(&a, src, dst),
            |src, dst| dst.copy_from_slice(src),
            &b,
            &mut x,
            &SolverControl {
                max_iter: 100,
                tol: 1e-11,
            },
        );
        assert!(info.converged, "residual {}", info.residual);
        let mut res = vec![0.0; n];
        csr_matvec(&a, &x, &mut res);
        for i in 0..n {
            assert_relative_eq!(res[i], b[i], epsilon = 1e-8);
        }
    }

    #[test]
    fn test_fgmres_with_iterative_preconditioner() {
        // A preconditioner that is itself a few CG sweeps: only the
        // flexible variant is correct with such a non-constant operator.
        let a = spd_matrix();
        let n = a.nrows();
        let b: Vec<f64> = (0..n).map(|i| 1.0 + (i % 3) as f64).collect();
        let mut x = vec![0.0; n];
        let info = fgmres(
            &SerialOps,
            |src, dst| csr_matvec(&a, src, dst),
            |src, dst| {
                dst.iter_mut().for_each(|v| *v = 0.0);
                let _ = cg(
                    &SerialOps,
                    |s, d| csr_matvec(&a, s, d),
                    None,
                    src,
                    dst,
                    &SolverControl {
                        max_iter: 4,
                        tol: 1e-14,
                    },
                );
            },
            &b,
            &mut x,
            &SolverControl {
                max_iter: 60,
                tol: 1e-11,
            },
        );
        assert!(info.converged);
        assert!(info.residual <= 1e-11);
    }

    #[test]
    fn test_zero_max_iter_reports_initial_residual() {
        let a = spd_matrix();
        let n = a.nrows();
        let b = vec![2.0; n];
        let mut x = vec![0.0; n];
        let info = fgmres(
            &SerialOps,
            |src, dst| csr_matvec(&a, src, dst),
            |src, dst| dst.copy_from_slice(src),
            &b,
            &mut x,
            &SolverControl {
                max_iter: 0,
                tol: 1e-30,
            },
        );
        assert_eq!(info.iterations, 0);
        assert!(!info.converged);
        assert_relative_eq!(
            info.residual,
            (n as f64 * 4.0).sqrt(),
            epsilon = 1e-12
        );
        // x untouched
        assert!(x.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_fgmres_idempotent_reporting() {
        let a = spd_matrix();
        let n = a.nrows();
        let b = vec![1.0; n];
        let control = SolverControl {
            max_iter: 100,
            tol: 1e-10,
        };
        let run = || {
            let mut x = vec![0.0; n];
            fgmres(
                &SerialOps,
                |src, dst| csr_matvec(&a, src, dst),
                |src, dst| dst.copy_from_slice(src),
                &b,
                &mut x,
                &control,
            )
        };
        let a_info = run();
        let b_info = run();
        assert_eq!(a_info.iterations, b_info.iterations);
        assert_relative_eq!(a_info.residual, b_info.residual, epsilon = 0.0);
    }
}
