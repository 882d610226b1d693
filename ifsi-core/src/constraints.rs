//! Algebraic constraints on degrees of freedom.
//!
//! A constraint line expresses one DoF as an affine combination of others:
//! `x_d = sum_i w_i x_{m_i} + c`. Two kinds arise here:
//! - Dirichlet constraints (no entries, `c` is the boundary value),
//! - hanging-node constraints on 1-irregular edges (entries interpolate
//!   the coarse edge, `c = 0`).
//!
//! The "nonzero" and "zero" constraint sets of the solver constrain the
//! same DoFs and differ only in the inhomogeneities: the nonzero set
//! carries true boundary values for the first solve, the zero set carries
//! homogeneous values for increment solves.
//!
//! `distribute_local_to_global` eliminates constrained rows and columns
//! while scattering local contributions, moving inhomogeneities to the
//! right-hand side and pinning constrained diagonals so the global matrix
//! stays nonsingular. After a solve, `distribute` re-imposes the exact
//! constrained values.

use nalgebra::DMatrix;
use std::collections::HashMap;

/// One constraint line: `x_d = sum_i w_i x_{m_i} + inhomogeneity`.
#[derive(Debug, Clone, Default)]
pub struct ConstraintLine {
    pub entries: Vec<(usize, f64)>,
    pub inhomogeneity: f64,
}

/// Sink for global matrix contributions.
pub trait GlobalMatrix {
    fn add_value(&mut self, row: usize, col: usize, value: f64);
}

impl GlobalMatrix for crate::sparse::TripletMatrix {
    fn add_value(&mut self, row: usize, col: usize, value: f64) {
        self.add(row, col, value);
    }
}

/// Sink for global vector contributions.
pub trait GlobalVector {
    fn add_value(&mut self, index: usize, value: f64);
    fn get_value(&self, index: usize) -> f64;
    fn set_value(&mut self, index: usize, value: f64);
}

impl GlobalVector for crate::sparse::BlockVector {
    fn add_value(&mut self, index: usize, value: f64) {
        self.add(index, value);
    }
    fn get_value(&self, index: usize) -> f64 {
        self.get(index)
    }
    fn set_value(&mut self, index: usize, value: f64) {
        self.set(index, value);
    }
}

/// A set of constraint lines over the global DoF numbering.
#[derive(Debug, Clone, Default)]
pub struct Constraints {
    lines: HashMap<usize, ConstraintLine>,
    closed: bool,
}

impl Constraints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Constrain `dof` to a fixed value (Dirichlet). Replaces any existing
    /// line for this DoF.
    pub fn constrain_dirichlet(&mut self, dof: usize, value: f64) {
        debug_assert!(!self.closed, "constraints already closed");
        self.lines.insert(
            dof,
            ConstraintLine {
                entries: Vec::new(),
                inhomogeneity: value,
            },
        );
    }

    /// Constrain `dof` to an affine combination of other DoFs. Does not
    /// overwrite an existing (e.g. Dirichlet) line.
    pub fn constrain_affine(&mut self, dof: usize, entries: Vec<(usize, f64)>) {
        debug_assert!(!self.closed, "constraints already closed");
        self.lines.entry(dof).or_insert(ConstraintLine {
            entries,
            inhomogeneity: 0.0,
        });
    }

    /// Whether `dof` carries a constraint line.
    pub fn is_constrained(&self, dof: usize) -> bool {
        self.lines.contains_key(&dof)
    }

    /// Number of constrained DoFs.
    pub fn n_constraints(&self) -> usize {
        self.lines.len()
    }

    /// The constraint line of a DoF, if any.
    pub fn line(&self, dof: usize) -> Option<&ConstraintLine> {
        self.lines.get(&dof)
    }

    /// Sorted list of constrained DoFs.
    pub fn constrained_dofs(&self) -> Vec<usize> {
        let mut dofs: Vec<usize> = self.lines.keys().copied().collect();
        dofs.sort_unstable();
        dofs
    }

    /// Resolve chains so that no entry references a constrained DoF, merge
    /// duplicate entries and drop zero weights.
    ///
    /// # Panics
    ///
    /// Panics on cyclic constraints (cannot arise from Dirichlet plus
    /// 1-irregular hanging nodes).
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        for _pass in 0..32 {
            let mut changed = false;
            let keys: Vec<usize> = self.lines.keys().copied().collect();
            for dof in keys {
                let line = self.lines[&dof].clone();
                if !line.entries.iter().any(|(m, _)| self.lines.contains_key(m)) {
                    continue;
                }
                let mut resolved: HashMap<usize, f64> = HashMap::new();
                let mut inhomogeneity = line.inhomogeneity;
                for (m, w) in line.entries {
                    if let Some(inner) = self.lines.get(&m) {
                        inhomogeneity += w * inner.inhomogeneity;
                        for &(mm, ww) in &inner.entries {
                            *resolved.entry(mm).or_insert(0.0) += w * ww;
                        }
                    } else {
                        *resolved.entry(m).or_insert(0.0) += w;
                    }
                }
                let entries: Vec<(usize, f64)> = resolved
                    .into_iter()
                    .filter(|&(_, w)| w != 0.0)
                    .collect();
                self.lines.insert(
                    dof,
                    ConstraintLine {
                        entries,
                        inhomogeneity,
                    },
                );
                changed = true;
            }
            if !changed {
                // Normalize entry ordering for reproducibility.
                for line in self.lines.values_mut() {
                    line.entries.sort_unstable_by_key(|&(m, _)| m);
                }
                self.closed = true;
                return;
            }
        }
        panic!("cyclic constraints detected");
    }

    /// Scatter a local matrix and right-hand side into global structures,
    /// eliminating constrained rows and columns symmetrically.
    pub fn distribute_local_to_global<M: GlobalMatrix, V: GlobalVector>(
        &self,
        local_matrix: &DMatrix<f64>,
        local_rhs: &[f64],
        dofs: &[usize],
        matrix: &mut M,
        rhs: &mut V,
    ) {
        debug_assert!(self.closed, "close() must be called before distribution");
        let n = dofs.len();
        debug_assert_eq!(local_matrix.nrows(), n);
        debug_assert_eq!(local_rhs.len(), n);

        for i in 0..n {
            let gi = dofs[i];
            let row_line = self.lines.get(&gi);

            // Right-hand side: unconstrained rows get f_i directly,
            // constrained rows distribute it onto their masters.
            match row_line {
                None => rhs.add_value(gi, local_rhs[i]),
                Some(line) => {
                    for &(m, w) in &line.entries {
                        rhs.add_value(m, w * local_rhs[i]);
                    }
                }
            }

            for j in 0..n {
                let k = local_matrix[(i, j)];
                if k == 0.0 {
                    continue;
                }
                let gj = dofs[j];
                let col_line = self.lines.get(&gj);

                match (row_line, col_line) {
                    (None, None) => matrix.add_value(gi, gj, k),
                    (None, Some(cl)) => {
                        for &(m, w) in &cl.entries {
                            matrix.add_value(gi, m, k * w);
                        }
                        rhs.add_value(gi, -k * cl.inhomogeneity);
                    }
                    (Some(rl), None) => {
                        for &(m, w) in &rl.entries {
                            matrix.add_value(m, gj, k * w);
                        }
                    }
                    (Some(rl), Some(cl)) => {
                        for &(mr, wr) in &rl.entries {
                            for &(mc, wc) in &cl.entries {
                                matrix.add_value(mr, mc, k * wr * wc);
                            }
                            rhs.add_value(mr, -k * wr * cl.inhomogeneity);
                        }
                        // Pin the constrained diagonal so the matrix stays
                        // invertible; the solve leaves these rows inert and
                        // `distribute` sets their final values.
                        if gi == gj {
                            matrix.add_value(gi, gi, k);
                        }
                    }
                }
            }
        }
    }

    /// Scatter a local matrix only (no right-hand side), with the same
    /// symmetric elimination. Used for the mass matrix, whose inhomogeneity
    /// terms never enter the system right-hand side.
    pub fn distribute_local_matrix<M: GlobalMatrix>(
        &self,
        local_matrix: &DMatrix<f64>,
        dofs: &[usize],
        matrix: &mut M,
    ) {
        debug_assert!(self.closed, "close() must be called before distribution");
        let n = dofs.len();
        for i in 0..n {
            let gi = dofs[i];
            let row_line = self.lines.get(&gi);
            for j in 0..n {
                let k = local_matrix[(i, j)];
                if k == 0.0 {
                    continue;
                }
                let gj = dofs[j];
                let col_line = self.lines.get(&gj);
                match (row_line, col_line) {
                    (None, None) => matrix.add_value(gi, gj, k),
                    (None, Some(cl)) => {
                        for &(m, w) in &cl.entries {
                            matrix.add_value(gi, m, k * w);
                        }
                    }
                    (Some(rl), None) => {
                        for &(m, w) in &rl.entries {
                            matrix.add_value(m, gj, k * w);
                        }
                    }
                    (Some(rl), Some(cl)) => {
                        for &(mr, wr) in &rl.entries {
                            for &(mc, wc) in &cl.entries {
                                matrix.add_value(mr, mc, k * wr * wc);
                            }
                        }
                        if gi == gj {
                            matrix.add_value(gi, gi, k);
                        }
                    }
                }
            }
        }
    }

    /// Scatter only a local right-hand side (matrix unchanged). Valid for
    /// homogeneous constraint sets; inhomogeneity elimination needs the
    /// matrix path.
    pub fn distribute_local_rhs<V: GlobalVector>(
        &self,
        local_rhs: &[f64],
        dofs: &[usize],
        rhs: &mut V,
    ) {
        debug_assert!(self.closed, "close() must be called before distribution");
        for (i, &gi) in dofs.iter().enumerate() {
            match self.lines.get(&gi) {
                None => rhs.add_value(gi, local_rhs[i]),
                Some(line) => {
                    for &(m, w) in &line.entries {
                        rhs.add_value(m, w * local_rhs[i]);
                    }
                }
            }
        }
    }

    /// Overwrite constrained entries of `v` with their exact constrained
    /// values.
    pub fn distribute<V: GlobalVector>(&self, v: &mut V) {
        debug_assert!(self.closed, "close() must be called before distribution");
        for (&dof, line) in &self.lines {
            let mut value = line.inhomogeneity;
            for &(m, w) in &line.entries {
                value += w * v.get_value(m);
            }
            v.set_value(dof, value);
        }
    }

}
