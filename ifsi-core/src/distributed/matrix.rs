//! Row-distributed sparse matrices.
//!
//! During assembly each rank accumulates triplets; contributions to rows
//! owned elsewhere are buffered per destination rank and shipped in
//! `compress` - a rank never writes another rank's rows directly. The
//! compressed result is a CSR over the locally owned rows whose column
//! indices are positions in the column-space relevant set, so the
//! matrix-vector product reads straight from a ghosted vector.

use super::comm::Communicator;
use super::partition::IndexSet;
use super::vector::DistributedVector;
use crate::constraints::GlobalMatrix;
use std::sync::Arc;

/// Assembly-side triplet accumulator honoring row ownership.
pub struct DistributedTriplets {
    rank: usize,
    dof_owner: Arc<Vec<usize>>,
    local: Vec<(usize, usize, f64)>,
    foreign: Vec<Vec<(usize, usize, f64)>>,
}

impl DistributedTriplets {
    pub fn new(rank: usize, n_ranks: usize, dof_owner: Arc<Vec<usize>>) -> Self {
        Self {
            rank,
            dof_owner,
            local: Vec::new(),
            foreign: (0..n_ranks).map(|_| Vec::new()).collect(),
        }
    }

    /// Exchange foreign contributions; returns all triplets whose rows
    /// this rank owns, with global indices. Collective.
    pub fn compress(mut self, comm: &Communicator) -> Vec<(usize, usize, f64)> {
        let foreign = std::mem::take(&mut self.foreign);
        let incoming = comm.exchange_triplets(&foreign);
        let mut merged = std::mem::take(&mut self.local);
        for (r, triplets) in incoming.into_iter().enumerate() {
            if r == self.rank {
                continue;
            }
            merged.extend(triplets);
        }
        merged
    }
}

impl GlobalMatrix for DistributedTriplets {
    fn add_value(&mut self, row: usize, col: usize, value: f64) {
        if value == 0.0 {
            return;
        }
        let owner = self.dof_owner[row];
        if owner == self.rank {
            self.local.push((row, col, value));
        } else {
            self.foreign[owner].push((row, col, value));
        }
    }
}

/// CSR over locally owned rows; columns indexed into a relevant set.
#[derive(Debug, Clone)]
pub struct DistRowMatrix {
    rows: IndexSet,
    cols: IndexSet,
    row_offsets: Vec<usize>,
    col_positions: Vec<usize>,
    values: Vec<f64>,
}

impl DistRowMatrix {
    /// Build from globally indexed triplets (duplicates are summed).
    ///
    /// # Panics
    ///
    /// Panics if a triplet references a row outside `rows` or a column
    /// outside `cols`: that means the relevant halo was computed too
    /// small, which is a partitioning bug.
    pub fn from_triplets(rows: IndexSet, cols: IndexSet, triplets: &[(usize, usize, f64)]) -> Self {
        let n_rows = rows.n_elements();
        let mut per_row: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n_rows];
        for &(r, c, v) in triplets {
            let row = rows
                .position(r)
                .unwrap_or_else(|| panic!("row {} is not owned here", r));
            let col = cols
                .position(c)
                .unwrap_or_else(|| panic!("column {} is not locally relevant", c));
            per_row[row].push((col, v));
        }

        let mut row_offsets = Vec::with_capacity(n_rows + 1);
        let mut col_positions = Vec::new();
        let mut values = Vec::new();
        row_offsets.push(0);
        for entries in per_row.iter_mut() {
            entries.sort_unstable_by_key(|&(c, _)| c);
            let mut last: Option<usize> = None;
            for &(c, v) in entries.iter() {
                if last == Some(c) {
                    *values.last_mut().expect("entry exists") += v;
                } else {
                    col_positions.push(c);
                    values.push(v);
                    last = Some(c);
                }
            }
            row_offsets.push(col_positions.len());
        }

        Self {
            rows,
            cols,
            row_offsets,
            col_positions,
            values,
        }
    }

    /// Owned row index set.
    pub fn rows(&self) -> &IndexSet {
        &self.rows
    }

    /// y = A x over the owned rows; `x` must have fresh ghost values.
    pub fn matvec(&self, x: &DistributedVector, y: &mut [f64]) {
        debug_assert_eq!(y.len(), self.rows.n_elements());
        debug_assert_eq!(x.relevant(), &self.cols);
        for row in 0..self.rows.n_elements() {
            let mut sum = 0.0;
            for idx in self.row_offsets[row]..self.row_offsets[row + 1] {
                sum += self.values[idx] * x.get(self.cols.nth(self.col_positions[idx]));
            }
            y[row] = sum;
        }
    }

    /// Diagonal entries in owned-row order (zero where absent).
    pub fn diagonal(&self) -> Vec<f64> {
        let mut diag = vec![0.0; self.rows.n_elements()];
        for row in 0..self.rows.n_elements() {
            let global_row = self.rows.nth(row);
            for idx in self.row_offsets[row]..self.row_offsets[row + 1] {
                if self.cols.nth(self.col_positions[idx]) == global_row {
                    diag[row] = self.values[idx];
                    break;
                }
            }
        }
        diag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::run_spmd;
    use approx::assert_relative_eq;

    #[test]
    fn test_from_triplets_sums_duplicates() {
        let rows = IndexSet::from_indices(vec![0, 1]);
        let cols = IndexSet::from_indices(vec![0, 1, 2]);
        let m = DistRowMatrix::from_triplets(
            rows.clone(),
            cols.clone(),
            &[(0, 0, 1.0), (0, 0, 2.0), (1, 2, 4.0)],
        );
        assert_eq!(m.diagonal(), vec![3.0, 0.0]);

        let mut x = DistributedVector::new(cols.clone(), cols);
        x.set(0, 1.0);
        x.set(2, 0.5);
        let mut y = vec![0.0; 2];
        m.matvec(&x, &mut y);
        assert_relative_eq!(y[0], 3.0);
        assert_relative_eq!(y[1], 2.0);
    }

    #[test]
    fn test_distributed_add_protocol() {
        // Rank 0 owns row 0, rank 1 owns row 1; both ranks contribute to
        // both rows, so the foreign parts must travel through compress.
        let results = run_spmd(2, |comm| {
            let dof_owner = Arc::new(vec![0, 1]);
            let mut triplets = DistributedTriplets::new(comm.rank(), comm.size(), dof_owner);
            triplets.add_value(0, 0, 1.0);
            triplets.add_value(1, 1, 10.0);
            let merged = triplets.compress(&comm);
            let rows = IndexSet::from_indices(vec![comm.rank()]);
            let cols = IndexSet::from_indices(vec![0, 1]);
            (comm.rank(), DistRowMatrix::from_triplets(rows, cols, &merged))
        });
        // Each row accumulated one contribution from each rank
        assert_relative_eq!(results[0].1.diagonal()[0], 2.0);
        assert_relative_eq!(results[1].1.diagonal()[0], 20.0);
    }

    #[test]
    #[should_panic(expected = "not owned here")]
    fn test_foreign_row_panics() {
        let rows = IndexSet::from_indices(vec![0]);
        let cols = IndexSet::from_indices(vec![0, 1]);
        DistRowMatrix::from_triplets(rows, cols, &[(1, 0, 1.0)]);
    }
}
