//! DoF and cell ownership for the distributed solver.
//!
//! The mesh is replicated; ownership is partitioned. Active cells are
//! striped into contiguous chunks by id order, and a DoF is owned by the
//! lowest rank among the cells touching it. Each rank derives, per block:
//!
//! - its owned index set (disjoint across ranks, union covers all DoFs),
//! - its relevant index set: owned plus the ghost halo a rank reads
//!   during assembly and matrix-vector products (DoFs of cells within a
//!   two-cell vertex adjacency of the owned cells, plus all constraint
//!   masters of those DoFs).
//!
//! Construction is deterministic, so every rank can reproduce every other
//! rank's partition without communication.

use crate::constraints::Constraints;
use crate::dofs::DofHandler;
use crate::mesh::{CellId, Mesh};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Sorted set of global indices with O(log n) membership queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSet {
    indices: Vec<usize>,
}

impl IndexSet {
    /// Build from arbitrary indices (sorted and deduplicated).
    pub fn from_indices(mut indices: Vec<usize>) -> Self {
        indices.sort_unstable();
        indices.dedup();
        Self { indices }
    }

    /// Number of elements.
    pub fn n_elements(&self) -> usize {
        self.indices.len()
    }

    /// Whether `index` is an element.
    pub fn is_element(&self, index: usize) -> bool {
        self.indices.binary_search(&index).is_ok()
    }

    /// Position of `index` within the set.
    pub fn position(&self, index: usize) -> Option<usize> {
        self.indices.binary_search(&index).ok()
    }

    /// The `n`-th element.
    pub fn nth(&self, n: usize) -> usize {
        self.indices[n]
    }

    /// Iterate over the elements in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.indices.iter().copied()
    }

    /// Union with another set.
    pub fn union(&self, other: &IndexSet) -> IndexSet {
        let mut merged = self.indices.clone();
        merged.extend_from_slice(&other.indices);
        IndexSet::from_indices(merged)
    }

    /// Whether the intersection with another set is empty.
    pub fn is_disjoint(&self, other: &IndexSet) -> bool {
        self.indices.iter().all(|&i| !other.is_element(i))
    }
}

/// Per-rank ownership state.
#[derive(Debug, Clone)]
pub struct Partition {
    pub rank: usize,
    pub n_ranks: usize,
    /// Owning rank of every global DoF (replicated).
    pub dof_owner: Arc<Vec<usize>>,
    /// Cells assembled by this rank.
    pub owned_cells: Vec<CellId>,
    /// Owned DoFs per block (velocity, pressure).
    pub owned_partitioning: [IndexSet; 2],
    /// Owned-plus-ghost DoFs per block.
    pub relevant_partitioning: [IndexSet; 2],
    /// Union of the relevant blocks.
    pub locally_relevant_dofs: IndexSet,
}

impl Partition {
    /// Deterministically partition cells and DoFs for `rank` of
    /// `n_ranks`. The constraint set supplies the masters that must join
    /// the ghost halo.
    pub fn build(
        mesh: &Mesh,
        dof_handler: &DofHandler,
        constraints: &Constraints,
        rank: usize,
        n_ranks: usize,
    ) -> Self {
        let cells = mesh.active_cells();
        let n_cells = cells.len();
        let cell_owner: HashMap<CellId, usize> = cells
            .iter()
            .enumerate()
            .map(|(i, &c)| (c, i * n_ranks / n_cells.max(1)))
            .collect();
        let owned_cells: Vec<CellId> = cells
            .iter()
            .copied()
            .filter(|c| cell_owner[c] == rank)
            .collect();

        // DoF owner: lowest rank among the touching cells.
        let n_dofs = dof_handler.n_dofs();
        let mut dof_owner = vec![usize::MAX; n_dofs];
        for &cell in &cells {
            let owner = cell_owner[&cell];
            for &dof in dof_handler.cell_dofs(cell) {
                dof_owner[dof] = dof_owner[dof].min(owner);
            }
        }
        debug_assert!(dof_owner.iter().all(|&o| o < n_ranks));

        let n_u = dof_handler.n_velocity_dofs();
        let owned: Vec<usize> = (0..n_dofs).filter(|&d| dof_owner[d] == rank).collect();
        let owned_u = IndexSet::from_indices(owned.iter().copied().filter(|&d| d < n_u).collect());
        let owned_p = IndexSet::from_indices(owned.into_iter().filter(|&d| d >= n_u).collect());

        // Relevant halo: two layers of vertex adjacency around the owned
        // cells, then the constraint masters of everything collected.
        let mut vertex_cells: HashMap<u32, Vec<CellId>> = HashMap::new();
        for &cell in &cells {
            for v in mesh.cell_vertex_ids(cell) {
                vertex_cells.entry(v).or_default().push(cell);
            }
        }
        let mut halo: HashSet<CellId> = owned_cells.iter().copied().collect();
        for _ in 0..2 {
            let frontier: Vec<CellId> = halo.iter().copied().collect();
            for cell in frontier {
                for v in mesh.cell_vertex_ids(cell) {
                    for &neighbor in &vertex_cells[&v] {
                        halo.insert(neighbor);
                    }
                }
            }
        }

        let mut relevant: HashSet<usize> = HashSet::new();
        for &cell in &halo {
            relevant.extend(dof_handler.cell_dofs(cell).iter().copied());
        }
        let snapshot: Vec<usize> = relevant.iter().copied().collect();
        for dof in snapshot {
            if let Some(line) = constraints.line(dof) {
                relevant.extend(line.entries.iter().map(|&(m, _)| m));
            }
        }

        let relevant_u =
            IndexSet::from_indices(relevant.iter().copied().filter(|&d| d < n_u).collect());
        let relevant_p =
            IndexSet::from_indices(relevant.into_iter().filter(|&d| d >= n_u).collect());
        let relevant_u = relevant_u.union(&owned_u);
        let relevant_p = relevant_p.union(&owned_p);
        let locally_relevant_dofs = relevant_u.union(&relevant_p);

        Self {
            rank,
            n_ranks,
            dof_owner: Arc::new(dof_owner),
            owned_cells,
            owned_partitioning: [owned_u, owned_p],
            relevant_partitioning: [relevant_u, relevant_p],
            locally_relevant_dofs,
        }
    }

    /// Number of locally owned DoFs across both blocks.
    pub fn n_owned(&self) -> usize {
        self.owned_partitioning[0].n_elements() + self.owned_partitioning[1].n_elements()
    }
}
