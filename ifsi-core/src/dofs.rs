//! Degree-of-freedom enumeration for the Taylor-Hood Q2/Q1 pair.
//!
//! DoFs are numbered block-wise: all velocity unknowns first (two
//! components per scalar Q2 entity), then all pressure unknowns (one per
//! Q1 vertex). Entities (vertices, edges, cell interiors) shared between
//! cells receive one scalar DoF each, so continuity holds by construction
//! on conforming edges; hanging edges are handled by constraints.
//!
//! The enumeration must be rebuilt whenever the mesh changes; every global
//! structure (sparsity, vectors, constraints) follows it.

use crate::fe::{N_CELL_DOFS, N_Q2};
use crate::mesh::{edge_key, CellId, EdgeKey, Mesh, VertexId};
use crate::types::Point2;
use std::collections::HashMap;

/// Block-wise DoF enumeration over the active cells of a mesh.
#[derive(Debug, Clone)]
pub struct DofHandler {
    n_q2: usize,
    n_q1: usize,
    cell_dofs: HashMap<CellId, [usize; N_CELL_DOFS]>,
    vertex_q2: HashMap<VertexId, usize>,
    edge_q2: HashMap<EdgeKey, usize>,
    interior_q2: HashMap<CellId, usize>,
    vertex_q1: HashMap<VertexId, usize>,
}

impl DofHandler {
    /// Enumerate DoFs over the active cells of `mesh`. Deterministic:
    /// cells are visited in ascending id order.
    pub fn distribute(mesh: &Mesh) -> Self {
        let mut handler = Self {
            n_q2: 0,
            n_q1: 0,
            cell_dofs: HashMap::new(),
            vertex_q2: HashMap::new(),
            edge_q2: HashMap::new(),
            interior_q2: HashMap::new(),
            vertex_q1: HashMap::new(),
        };

        // First pass: assign scalar entity indices.
        for cell in mesh.active_cells() {
            let verts = mesh.cell_vertex_ids(cell);
            for &v in &verts {
                if !handler.vertex_q2.contains_key(&v) {
                    handler.vertex_q2.insert(v, handler.n_q2);
                    handler.n_q2 += 1;
                }
            }
            for (a, b) in mesh.cell_edges(cell) {
                let key = edge_key(a, b);
                if !handler.edge_q2.contains_key(&key) {
                    handler.edge_q2.insert(key, handler.n_q2);
                    handler.n_q2 += 1;
                }
            }
            handler.interior_q2.insert(cell, handler.n_q2);
            handler.n_q2 += 1;
            for &v in &verts {
                if !handler.vertex_q1.contains_key(&v) {
                    handler.vertex_q1.insert(v, handler.n_q1);
                    handler.n_q1 += 1;
                }
            }
        }

        // Second pass: per-cell global dof lists in local order.
        let n_u = 2 * handler.n_q2;
        for cell in mesh.active_cells() {
            let verts = mesh.cell_vertex_ids(cell);
            let edges = mesh.cell_edges(cell);
            let mut scalar = [0usize; N_Q2];
            for i in 0..4 {
                scalar[i] = handler.vertex_q2[&verts[i]];
            }
            for (e, &(a, b)) in edges.iter().enumerate() {
                scalar[4 + e] = handler.edge_q2[&edge_key(a, b)];
            }
            scalar[8] = handler.interior_q2[&cell];

            let mut dofs = [0usize; N_CELL_DOFS];
            for (i, &s) in scalar.iter().enumerate() {
                dofs[2 * i] = 2 * s;
                dofs[2 * i + 1] = 2 * s + 1;
            }
            for (i, &v) in verts.iter().enumerate() {
                dofs[2 * N_Q2 + i] = n_u + handler.vertex_q1[&v];
            }
            handler.cell_dofs.insert(cell, dofs);
        }

        handler
    }

    /// Total number of unknowns.
    pub fn n_dofs(&self) -> usize {
        2 * self.n_q2 + self.n_q1
    }

    /// Number of velocity unknowns (block 0).
    pub fn n_velocity_dofs(&self) -> usize {
        2 * self.n_q2
    }

    /// Number of pressure unknowns (block 1).
    pub fn n_pressure_dofs(&self) -> usize {
        self.n_q1
    }

    /// Unknowns per block: `[velocity, pressure]`.
    pub fn dofs_per_block(&self) -> [usize; 2] {
        [self.n_velocity_dofs(), self.n_pressure_dofs()]
    }

    /// Global DoF indices of a cell in local order (18 velocity DoFs
    /// node-major, then 4 pressure DoFs).
    ///
    /// # Panics
    ///
    /// Panics if `cell` was not active when the handler was distributed.
    pub fn cell_dofs(&self, cell: CellId) -> &[usize; N_CELL_DOFS] {
        self.cell_dofs
            .get(&cell)
            .unwrap_or_else(|| panic!("cell {} has no distributed dofs", cell))
    }

    /// Scalar Q2 index of a vertex, if the vertex carries one.
    pub fn vertex_q2_scalar(&self, v: VertexId) -> Option<usize> {
        self.vertex_q2.get(&v).copied()
    }

    /// Scalar Q2 index of an edge midside node.
    pub fn edge_q2_scalar(&self, key: EdgeKey) -> Option<usize> {
        self.edge_q2.get(&key).copied()
    }

    /// Pressure DoF (global index) of a vertex.
    pub fn vertex_pressure_dof(&self, v: VertexId) -> Option<usize> {
        self.vertex_q1.get(&v).map(|&i| self.n_velocity_dofs() + i)
    }

    /// Global velocity DoF of a scalar Q2 entity and component.
    #[inline]
    pub fn velocity_dof(&self, scalar: usize, comp: usize) -> usize {
        2 * scalar + comp
    }

    /// Physical positions of all DoFs, indexed by global DoF. Velocity
    /// components share their node's position.
    pub fn dof_positions(&self, mesh: &Mesh) -> Vec<Point2> {
        let mut positions = vec![Point2::zeros(); self.n_dofs()];
        for (&v, &s) in &self.vertex_q2 {
            let p = mesh.vertex(v);
            positions[2 * s] = p;
            positions[2 * s + 1] = p;
        }
        for (&(a, b), &s) in &self.edge_q2 {
            let p = (mesh.vertex(a) + mesh.vertex(b)) * 0.5;
            positions[2 * s] = p;
            positions[2 * s + 1] = p;
        }
        for (&cell, &s) in &self.interior_q2 {
            let v = mesh.cell_vertices(cell);
            let p = (v[0] + v[1] + v[2] + v[3]) * 0.25;
            positions[2 * s] = p;
            positions[2 * s + 1] = p;
        }
        let n_u = self.n_velocity_dofs();
        for (&v, &i) in &self.vertex_q1 {
            positions[n_u + i] = mesh.vertex(v);
        }
        positions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_mesh(nx: usize, ny: usize) -> Mesh {
        Mesh::rectangle(nx, ny, Point2::new(0.0, 0.0), Point2::new(1.0, 1.0)).unwrap()
    }

    #[test]
    fn test_single_cell_counts() {
        let mesh = unit_mesh(1, 1);
        let dofs = DofHandler::distribute(&mesh);
        // Q2: 4 vertices + 4 edges + 1 interior = 9 scalars -> 18 velocity
        assert_eq!(dofs.n_velocity_dofs(), 18);
        assert_eq!(dofs.n_pressure_dofs(), 4);
        assert_eq!(dofs.n_dofs(), 22);
        assert_eq!(dofs.dofs_per_block(), [18, 4]);
    }

    #[test]
    fn test_two_cells_share_edge_entities() {
        let mesh = unit_mesh(2, 1);
        let dofs = DofHandler::distribute(&mesh);
        // Q2 scalars: 6 vertices + 7 edges + 2 interiors = 15
        assert_eq!(dofs.n_velocity_dofs(), 30);
        // Q1: 6 vertices
        assert_eq!(dofs.n_pressure_dofs(), 6);
    }

    #[test]
    fn test_block_numbering() {
        let mesh = unit_mesh(2, 2);
        let dofs = DofHandler::distribute(&mesh);
        let n_u = dofs.n_velocity_dofs();
        for cell in mesh.active_cells() {
            let cd = dofs.cell_dofs(cell);
            for &d in &cd[..2 * N_Q2] {
                assert!(d < n_u, "velocity dof {} outside block 0", d);
            }
            for &d in &cd[2 * N_Q2..] {
                assert!(d >= n_u && d < dofs.n_dofs(), "pressure dof {} outside block 1", d);
            }
        }
    }

    #[test]
    fn test_shared_dofs_match_between_cells() {
        let mesh = unit_mesh(2, 1);
        let dofs = DofHandler::distribute(&mesh);
        let cells = mesh.active_cells();
        let left = dofs.cell_dofs(cells[0]);
        let right = dofs.cell_dofs(cells[1]);
        // Local vertex 1 of the left cell is local vertex 0 of the right
        assert_eq!(left[2 * 1], right[2 * 0]);
        assert_eq!(left[2 * 1 + 1], right[2 * 0 + 1]);
        // Shared pressure vertex
        assert_eq!(left[2 * N_Q2 + 1], right[2 * N_Q2]);
    }

    #[test]
    fn test_dof_positions_cover_all() {
        let mesh = unit_mesh(2, 2);
        let dofs = DofHandler::distribute(&mesh);
        let positions = dofs.dof_positions(&mesh);
        assert_eq!(positions.len(), dofs.n_dofs());
        // All positions are inside the closed unit square
        for p in positions {
            assert!((-1e-12..=1.0 + 1e-12).contains(&p[0]));
            assert!((-1e-12..=1.0 + 1e-12).contains(&p[1]));
        }
    }

    #[test]
    #[should_panic(expected = "has no distributed dofs")]
    fn test_missing_cell_panics() {
        let mesh = unit_mesh(1, 1);
        let dofs = DofHandler::distribute(&mesh);
        dofs.cell_dofs(999);
    }
}
