//! Sparse matrix and block container operations.
//!
//! Uses CSR (Compressed Sparse Row) storage via `nalgebra-sparse` for
//! compatibility with the direct and iterative solvers. The saddle-point
//! system is stored as a 2x2 block matrix consistent with the block-wise
//! DoF numbering (velocity block first, then pressure).

use nalgebra_sparse::coo::CooMatrix;
use nalgebra_sparse::csr::CsrMatrix as NalgebraCsr;

/// Compressed Sparse Row matrix.
pub type CsrMatrix = NalgebraCsr<f64>;

/// Builder for assembling a sparse matrix from triplets (COO format).
///
/// Accumulates (row, col, value) triplets and converts to CSR when
/// complete. Duplicates are summed during conversion.
pub struct TripletMatrix {
    n_rows: usize,
    n_cols: usize,
    rows: Vec<usize>,
    cols: Vec<usize>,
    values: Vec<f64>,
}

impl TripletMatrix {
    /// Create a new triplet matrix builder.
    pub fn new(n_rows: usize, n_cols: usize) -> Self {
        Self {
            n_rows,
            n_cols,
            rows: Vec::new(),
            cols: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Create with estimated capacity.
    pub fn with_capacity(n_rows: usize, n_cols: usize, nnz_estimate: usize) -> Self {
        Self {
            n_rows,
            n_cols,
            rows: Vec::with_capacity(nnz_estimate),
            cols: Vec::with_capacity(nnz_estimate),
            values: Vec::with_capacity(nnz_estimate),
        }
    }

    /// Add a value at (row, col).
    pub fn add(&mut self, row: usize, col: usize, value: f64) {
        debug_assert!(row < self.n_rows, "row index out of bounds");
        debug_assert!(col < self.n_cols, "column index out of bounds");

        if value != 0.0 {
            self.rows.push(row);
            self.cols.push(col);
            self.values.push(value);
        }
    }

    /// Number of stored triplets.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Drain the stored triplets.
    pub fn into_triplets(self) -> Vec<(usize, usize, f64)> {
        self.rows
            .into_iter()
            .zip(self.cols)
            .zip(self.values)
            .map(|((r, c), v)| (r, c, v))
            .collect()
    }

    /// Convert to CSR format, summing duplicate entries.
    pub fn to_csr(self) -> CsrMatrix {
        let coo = CooMatrix::try_from_triplets(
            self.n_rows,
            self.n_cols,
            self.rows,
            self.cols,
            self.values,
        )
        .expect("invalid triplet data");
        CsrMatrix::from(&coo)
    }
}

/// y = A x for a CSR matrix.
pub fn csr_matvec(a: &CsrMatrix, x: &[f64], y: &mut [f64]) {
    debug_assert_eq!(x.len(), a.ncols());
    debug_assert_eq!(y.len(), a.nrows());
    let offsets = a.row_offsets();
    let cols = a.col_indices();
    let values = a.values();
    for row in 0..a.nrows() {
        let mut sum = 0.0;
        for idx in offsets[row]..offsets[row + 1] {
            sum += values[idx] * x[cols[idx]];
        }
        y[row] = sum;
    }
}

/// Extract the diagonal of a square CSR matrix (zeros for empty slots).
pub fn csr_diagonal(a: &CsrMatrix) -> Vec<f64> {
    debug_assert_eq!(a.nrows(), a.ncols());
    let offsets = a.row_offsets();
    let cols = a.col_indices();
    let values = a.values();
    let mut diag = vec![0.0; a.nrows()];
    for row in 0..a.nrows() {
        for idx in offsets[row]..offsets[row + 1] {
            if cols[idx] == row {
                diag[row] = values[idx];
                break;
            }
        }
    }
    diag
}

/// Block vector matching the (velocity, pressure) DoF split.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockVector {
    /// Velocity block (block 0).
    pub u: Vec<f64>,
    /// Pressure block (block 1).
    pub p: Vec<f64>,
}

impl BlockVector {
    /// Zero vector with the given block sizes.
    pub fn zeros(n_u: usize, n_p: usize) -> Self {
        Self {
            u: vec![0.0; n_u],
            p: vec![0.0; n_p],
        }
    }

    /// Total length.
    pub fn len(&self) -> usize {
        self.u.len() + self.p.len()
    }

    /// Whether the vector has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value at a global (block-wise) index.
    #[inline]
    pub fn get(&self, index: usize) -> f64 {
        if index < self.u.len() {
            self.u[index]
        } else {
            self.p[index - self.u.len()]
        }
    }

    /// Set the value at a global index.
    #[inline]
    pub fn set(&mut self, index: usize, value: f64) {
        if index < self.u.len() {
            self.u[index] = value;
        } else {
            let n_u = self.u.len();
            self.p[index - n_u] = value;
        }
    }

    /// Add into the value at a global index.
    #[inline]
    pub fn add(&mut self, index: usize, value: f64) {
        if index < self.u.len() {
            self.u[index] += value;
        } else {
            let n_u = self.u.len();
            self.p[index - n_u] += value;
        }
    }

    /// Fill both blocks with zeros.
    pub fn set_zero(&mut self) {
        self.u.iter_mut().for_each(|v| *v = 0.0);
        self.p.iter_mut().for_each(|v| *v = 0.0);
    }

    /// Euclidean norm over both blocks.
    pub fn l2_norm(&self) -> f64 {
        let s: f64 = self.u.iter().chain(self.p.iter()).map(|v| v * v).sum();
        s.sqrt()
    }

    /// self += other.
    pub fn add_assign(&mut self, other: &BlockVector) {
        debug_assert_eq!(self.u.len(), other.u.len());
        debug_assert_eq!(self.p.len(), other.p.len());
        for (a, b) in self.u.iter_mut().zip(&other.u) {
            *a += *b;
        }
        for (a, b) in self.p.iter_mut().zip(&other.p) {
            *a += *b;
        }
    }

    /// Copy both blocks into one flat vector (velocity first).
    pub fn to_flat(&self) -> Vec<f64> {
        let mut flat = Vec::with_capacity(self.len());
        flat.extend_from_slice(&self.u);
        flat.extend_from_slice(&self.p);
        flat
    }

    /// Rebuild from a flat vector (velocity first).
    pub fn from_flat(flat: &[f64], n_u: usize) -> Self {
        Self {
            u: flat[..n_u].to_vec(),
            p: flat[n_u..].to_vec(),
        }
    }
}

/// 2x2 block sparse matrix over the (velocity, pressure) split.
///
/// Block (0,0) is the velocity operator, (0,1)/(1,0) the pressure-velocity
/// coupling, (1,1) the pressure block (mass or zero).
#[derive(Debug, Clone)]
pub struct BlockMatrix {
    pub uu: CsrMatrix,
    pub up: CsrMatrix,
    pub pu: CsrMatrix,
    pub pp: CsrMatrix,
}

impl BlockMatrix {
    /// Build the four blocks by splitting global triplets at the block
    /// boundary `n_u`.
    pub fn from_triplets(n_u: usize, n_p: usize, triplets: &[(usize, usize, f64)]) -> Self {
        let mut uu = TripletMatrix::new(n_u, n_u);
        let mut up = TripletMatrix::new(n_u, n_p);
        let mut pu = TripletMatrix::new(n_p, n_u);
        let mut pp = TripletMatrix::new(n_p, n_p);
        for &(i, j, v) in triplets {
            match (i < n_u, j < n_u) {
                (true, true) => uu.add(i, j, v),
                (true, false) => up.add(i, j - n_u, v),
                (false, true) => pu.add(i - n_u, j, v),
                (false, false) => pp.add(i - n_u, j - n_u, v),
            }
        }
        Self {
            uu: uu.to_csr(),
            up: up.to_csr(),
            pu: pu.to_csr(),
            pp: pp.to_csr(),
        }
    }

    /// Velocity-block size.
    pub fn n_u(&self) -> usize {
        self.uu.nrows()
    }

    /// Pressure-block size.
    pub fn n_p(&self) -> usize {
        self.pp.nrows()
    }

    /// dst = A src over the full block system.
    pub fn vmult(&self, dst: &mut BlockVector, src: &BlockVector) {
        let mut tmp_u = vec![0.0; self.n_u()];
        let mut tmp_p = vec![0.0; self.n_p()];
        csr_matvec(&self.uu, &src.u, &mut dst.u);
        csr_matvec(&self.up, &src.p, &mut tmp_u);
        for (d, t) in dst.u.iter_mut().zip(&tmp_u) {
            *d += *t;
        }
        csr_matvec(&self.pu, &src.u, &mut dst.p);
        csr_matvec(&self.pp, &src.p, &mut tmp_p);
        for (d, t) in dst.p.iter_mut().zip(&tmp_p) {
            *d += *t;
        }
    }

    /// Entry lookup across the block structure (zero for empty slots).
    pub fn get(&self, i: usize, j: usize) -> f64 {
        let n_u = self.n_u();
        let (block, bi, bj) = match (i < n_u, j < n_u) {
            (true, true) => (&self.uu, i, j),
            (true, false) => (&self.up, i, j - n_u),
            (false, true) => (&self.pu, i - n_u, j),
            (false, false) => (&self.pp, i - n_u, j - n_u),
        };
        let offsets = block.row_offsets();
        let cols = block.col_indices();
        let values = block.values();
        for idx in offsets[bi]..offsets[bi + 1] {
            if cols[idx] == bj {
                return values[idx];
            }
        }
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_triplet_to_csr() {
        let mut triplet = TripletMatrix::new(3, 3);
        triplet.add(0, 0, 1.0);
        triplet.add(1, 1, 2.0);
        triplet.add(2, 2, 3.0);
        triplet.add(0, 1, 0.5);
        triplet.add(1, 0, 0.5);

        let csr = triplet.to_csr();
        assert_eq!(csr.nrows(), 3);
        assert_eq!(csr.ncols(), 3);
        assert_eq!(csr.nnz(), 5);
    }

    #[test]
    fn test_duplicate_summation() {
        let mut triplet = TripletMatrix::new(2, 2);
        triplet.add(0, 0, 1.0);
        triplet.add(0, 0, 2.0);
        triplet.add(0, 0, 3.0);

        let csr = triplet.to_csr();
        let diag = csr_diagonal(&csr);
        assert_relative_eq!(diag[0], 6.0, epsilon = 1e-14);
    }

    #[test]
    fn test_csr_matvec() {
        let mut triplet = TripletMatrix::new(2, 3);
        triplet.add(0, 0, 2.0);
        triplet.add(0, 2, 1.0);
        triplet.add(1, 1, -1.0);
        let csr = triplet.to_csr();

        let x = [1.0, 2.0, 3.0];
        let mut y = [0.0; 2];
        csr_matvec(&csr, &x, &mut y);
        assert_relative_eq!(y[0], 5.0, epsilon = 1e-14);
        assert_relative_eq!(y[1], -2.0, epsilon = 1e-14);
    }

    #[test]
    fn test_block_vector_indexing() {
        let mut v = BlockVector::zeros(3, 2);
        v.set(1, 2.0);
        v.set(4, -1.0);
        v.add(1, 0.5);
        assert_relative_eq!(v.u[1], 2.5, epsilon = 1e-14);
        assert_relative_eq!(v.p[1], -1.0, epsilon = 1e-14);
        assert_relative_eq!(v.get(1), 2.5, epsilon = 1e-14);
        assert_relative_eq!(v.get(4), -1.0, epsilon = 1e-14);
    }

    #[test]
    fn test_block_vector_flat_roundtrip() {
        let mut v = BlockVector::zeros(2, 2);
        v.set(0, 1.0);
        v.set(3, 4.0);
        let flat = v.to_flat();
        let w = BlockVector::from_flat(&flat, 2);
        assert_eq!(v, w);
    }

    #[test]
    fn test_block_matrix_vmult() {
        // [1 0 | 2]   [1]   [7]
        // [0 3 | 0] * [2] = [6]
        // [---+--]    [3]
        // [4 0 | 5]         [19]
        let triplets = [
            (0usize, 0usize, 1.0),
            (0, 2, 2.0),
            (1, 1, 3.0),
            (2, 0, 4.0),
            (2, 2, 5.0),
        ];
        let m = BlockMatrix::from_triplets(2, 1, &triplets);
        let src = BlockVector {
            u: vec![1.0, 2.0],
            p: vec![3.0],
        };
        let mut dst = BlockVector::zeros(2, 1);
        m.vmult(&mut dst, &src);
        assert_relative_eq!(dst.u[0], 7.0, epsilon = 1e-14);
        assert_relative_eq!(dst.u[1], 6.0, epsilon = 1e-14);
        assert_relative_eq!(dst.p[0], 19.0, epsilon = 1e-14);
        assert_relative_eq!(m.get(2, 2), 5.0, epsilon = 1e-14);
        assert_relative_eq!(m.get(1, 2), 0.0, epsilon = 1e-14);
    }
}
