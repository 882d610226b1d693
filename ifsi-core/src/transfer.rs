//! Solution and cache transfer across mesh refinement.
//!
//! Refinement invalidates the DoF layout, so the present solution and the
//! per-cell coupling cache are serialized onto a mesh-independent
//! representation (per-cell local values plus geometry) *before* the mesh
//! changes, and interpolated back afterwards:
//!
//! - children pull from their parent by evaluating the parent's FE
//!   expansion at the child node locations (prolongation is exact for
//!   fields in the FE space),
//! - a coarsened parent pulls from whichever child contains each node
//!   (injection),
//! - surviving cells copy their values verbatim.
//!
//! Cache records transfer by nearest quadrature point of the source cell,
//! so an indicator-1 parent always yields indicator-1 children.

use crate::cache::{CellDataStorage, CellProperty};
use crate::constraints::GlobalVector;
use crate::dofs::DofHandler;
use crate::fe::{shape, FeValues, N_Q1, N_Q2, N_VEL_DOFS};
use crate::mesh::{CellId, Mesh, RefinementMap};
use crate::sparse::BlockVector;
use crate::types::Point2;
use std::collections::HashMap;

/// Frozen state of one active cell before refinement.
#[derive(Debug, Clone)]
struct CellSnapshot {
    vertices: [Point2; 4],
    local_u: [f64; N_VEL_DOFS],
    local_p: [f64; N_Q1],
    records: Vec<CellProperty>,
    q_points: Vec<Point2>,
}

impl CellSnapshot {
    fn contains(&self, p: &Point2) -> bool {
        let tol = 1e-10 * (self.vertices[2] - self.vertices[0]).norm();
        p[0] >= self.vertices[0][0] - tol
            && p[0] <= self.vertices[1][0] + tol
            && p[1] >= self.vertices[0][1] - tol
            && p[1] <= self.vertices[3][1] + tol
    }

    fn reference_coords(&self, p: &Point2) -> (f64, f64) {
        let hx = self.vertices[1][0] - self.vertices[0][0];
        let hy = self.vertices[3][1] - self.vertices[0][1];
        (
            2.0 * (p[0] - self.vertices[0][0]) / hx - 1.0,
            2.0 * (p[1] - self.vertices[0][1]) / hy - 1.0,
        )
    }

    /// Velocity components of the stored expansion at a physical point.
    fn velocity_at(&self, p: &Point2) -> [f64; 2] {
        let (xi, eta) = self.reference_coords(p);
        let n = shape::q2_values(xi, eta);
        let mut u = [0.0; 2];
        for i in 0..N_Q2 {
            u[0] += n[i] * self.local_u[2 * i];
            u[1] += n[i] * self.local_u[2 * i + 1];
        }
        u
    }

    /// Pressure of the stored expansion at a physical point.
    fn pressure_at(&self, p: &Point2) -> f64 {
        let (xi, eta) = self.reference_coords(p);
        let n = shape::q1_values(xi, eta);
        (0..N_Q1).map(|i| n[i] * self.local_p[i]).sum()
    }

    /// Record at the quadrature point nearest to `p`.
    fn record_near(&self, p: &Point2) -> CellProperty {
        let mut best = 0;
        let mut best_d = f64::INFINITY;
        for (i, q) in self.q_points.iter().enumerate() {
            let d = (q - p).norm_squared();
            if d < best_d {
                best_d = d;
                best = i;
            }
        }
        self.records[best]
    }
}

/// Transfers the block solution and the coupling cache across one
/// refinement event.
pub struct SolutionTransfer {
    cells: HashMap<CellId, CellSnapshot>,
}

impl SolutionTransfer {
    /// Serialize every active cell before the mesh is altered.
    pub fn prepare(
        mesh: &Mesh,
        dof_handler: &DofHandler,
        solution: &BlockVector,
        cache: &CellDataStorage,
        n_gauss: usize,
    ) -> Self {
        let mut fe = FeValues::new(n_gauss);
        let mut cells = HashMap::new();
        for cell in mesh.active_cells() {
            let vertices = mesh.cell_vertices(cell);
            fe.reinit(&vertices);
            let dofs = dof_handler.cell_dofs(cell);
            let mut local_u = [0.0; N_VEL_DOFS];
            for (i, value) in local_u.iter_mut().enumerate() {
                *value = solution.get(dofs[i]);
            }
            let mut local_p = [0.0; N_Q1];
            for (i, value) in local_p.iter_mut().enumerate() {
                *value = solution.get(dofs[N_VEL_DOFS + i]);
            }
            let q_points: Vec<Point2> = (0..fe.n_q_points())
                .map(|q| fe.quadrature_point(q))
                .collect();
            cells.insert(
                cell,
                CellSnapshot {
                    vertices,
                    local_u,
                    local_p,
                    records: cache.get(cell).to_vec(),
                    q_points,
                },
            );
        }
        Self { cells }
    }

    /// Source snapshot for a point of a new active cell.
    fn source<'a>(
        &'a self,
        cell: CellId,
        p: &Point2,
        child_to_parent: &HashMap<CellId, CellId>,
        parent_to_children: &HashMap<CellId, [CellId; 4]>,
    ) -> Option<&'a CellSnapshot> {
        // Survivor
        if let Some(snapshot) = self.cells.get(&cell) {
            return Some(snapshot);
        }
        // New child: use the parent's expansion
        if let Some(parent) = child_to_parent.get(&cell) {
            return self.cells.get(parent);
        }
        // Re-activated parent: use whichever removed child contains p
        if let Some(children) = parent_to_children.get(&cell) {
            return children
                .iter()
                .filter_map(|c| self.cells.get(c))
                .find(|s| s.contains(p));
        }
        None
    }

    /// Interpolate the stored state onto the refined mesh. The new DoF
    /// layout must already be distributed; `solution` must already have
    /// the new block sizes. Hanging DoFs receive whatever the writing
    /// order leaves and are fixed by a subsequent constraint distribution.
    pub fn interpolate(
        &self,
        map: &RefinementMap,
        mesh: &Mesh,
        dof_handler: &DofHandler,
        solution: &mut BlockVector,
        cache: &mut CellDataStorage,
        n_gauss: usize,
    ) {
        let mut child_to_parent = HashMap::new();
        for &(parent, children) in &map.refined {
            for &c in &children {
                child_to_parent.insert(c, parent);
            }
        }
        let mut parent_to_children = HashMap::new();
        for &(parent, children) in &map.coarsened {
            parent_to_children.insert(parent, children);
        }

        let mut fe = FeValues::new(n_gauss);
        for cell in mesh.active_cells() {
            let vertices = mesh.cell_vertices(cell);
            let dofs = dof_handler.cell_dofs(cell);

            // Scalar Q2 node positions in local order.
            let node_pos = q2_node_positions(&vertices);
            for (i, p) in node_pos.iter().enumerate() {
                if let Some(src) = self.source(cell, p, &child_to_parent, &parent_to_children) {
                    let u = src.velocity_at(p);
                    solution.set_value(dofs[2 * i], u[0]);
                    solution.set_value(dofs[2 * i + 1], u[1]);
                }
            }
            for i in 0..N_Q1 {
                let p = &vertices[i];
                if let Some(src) = self.source(cell, p, &child_to_parent, &parent_to_children) {
                    solution.set_value(dofs[N_VEL_DOFS + i], src.pressure_at(p));
                }
            }

            // Cache records by nearest source quadrature point.
            fe.reinit(&vertices);
            let records: Vec<CellProperty> = (0..fe.n_q_points())
                .map(|q| {
                    let p = fe.quadrature_point(q);
                    self.source(cell, &p, &child_to_parent, &parent_to_children)
                        .map(|src| src.record_near(&p))
                        .unwrap_or_default()
                })
                .collect();
            cache.insert(cell, records);
        }
    }
}

/// Physical positions of the nine scalar Q2 nodes of a rectangle, in
/// local node order.
pub fn q2_node_positions(vertices: &[Point2; 4]) -> [Point2; N_Q2] {
    let v = vertices;
    [
        v[0],
        v[1],
        v[2],
        v[3],
        (v[0] + v[1]) * 0.5,
        (v[1] + v[2]) * 0.5,
        (v[3] + v[2]) * 0.5,
        (v[0] + v[3]) * 0.5,
        (v[0] + v[1] + v[2] + v[3]) * 0.25,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn setup(nx: usize, ny: usize) -> (Mesh, DofHandler) {
        let mesh = Mesh::rectangle(nx, ny, Point2::new(0.0, 0.0), Point2::new(1.0, 1.0)).unwrap();
        let dofs = DofHandler::distribute(&mesh);
        (mesh, dofs)
    }

    /// Fill a solution with u = (x + 2y, x*y), p = 1 - x, all inside the
    /// FE space, so transfer must reproduce them exactly.
    fn analytic_fill(mesh: &Mesh, dofs: &DofHandler, v: &mut BlockVector) {
        let positions = dofs.dof_positions(mesh);
        let n_u = dofs.n_velocity_dofs();
        for (d, p) in positions.iter().enumerate() {
            if d < n_u {
                let value = if d % 2 == 0 {
                    p[0] + 2.0 * p[1]
                } else {
                    p[0] * p[1]
                };
                v.set(d, value);
            } else {
                v.set(d, 1.0 - p[0]);
            }
        }
    }

    #[test]
    fn test_refinement_transfer_exact_for_fe_fields() {
        let (mut mesh, dofs) = setup(2, 2);
        let mut solution = BlockVector::zeros(dofs.n_velocity_dofs(), dofs.n_pressure_dofs());
        analytic_fill(&mesh, &dofs, &mut solution);

        let mut cache = CellDataStorage::new();
        for cell in mesh.active_cells() {
            cache.initialize(cell, 9);
        }

        let transfer = SolutionTransfer::prepare(&mesh, &dofs, &solution, &cache, 3);
        for cell in mesh.active_cells() {
            mesh.set_refine_flag(cell);
        }
        mesh.prepare_coarsening_and_refinement(0, 5);
        let map = mesh.execute_coarsening_and_refinement();

        let new_dofs = DofHandler::distribute(&mesh);
        let mut new_solution =
            BlockVector::zeros(new_dofs.n_velocity_dofs(), new_dofs.n_pressure_dofs());
        transfer.interpolate(&map, &mesh, &new_dofs, &mut new_solution, &mut cache, 3);

        let mut expected =
            BlockVector::zeros(new_dofs.n_velocity_dofs(), new_dofs.n_pressure_dofs());
        analytic_fill(&mesh, &new_dofs, &mut expected);
        for d in 0..new_dofs.n_dofs() {
            assert_relative_eq!(new_solution.get(d), expected.get(d), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_indicator_preserved_on_children() {
        let (mut mesh, dofs) = setup(2, 1);
        let solution = BlockVector::zeros(dofs.n_velocity_dofs(), dofs.n_pressure_dofs());

        let mut cache = CellDataStorage::new();
        let cells = mesh.active_cells();
        for &cell in &cells {
            cache.initialize(cell, 9);
        }
        // Mark the left cell entirely artificial
        for record in cache.get_mut(cells[0]) {
            record.indicator = 1;
            record.fsi_stress = crate::types::sym_tensor(1.0, 2.0, 0.5);
        }

        let transfer = SolutionTransfer::prepare(&mesh, &dofs, &solution, &cache, 3);
        for &cell in &cells {
            mesh.set_refine_flag(cell);
        }
        mesh.prepare_coarsening_and_refinement(0, 5);
        let map = mesh.execute_coarsening_and_refinement();
        let new_dofs = DofHandler::distribute(&mesh);
        let mut new_solution =
            BlockVector::zeros(new_dofs.n_velocity_dofs(), new_dofs.n_pressure_dofs());
        transfer.interpolate(&map, &mesh, &new_dofs, &mut new_solution, &mut cache, 3);

        let left_children = map.refined.iter().find(|(p, _)| *p == cells[0]).unwrap().1;
        for &child in &left_children {
            for record in cache.get(child) {
                assert_eq!(record.indicator, 1, "child {} lost its indicator", child);
                assert_relative_eq!(record.fsi_stress[(0, 1)], 0.5, epsilon = 1e-14);
            }
        }
        let right_children = map.refined.iter().find(|(p, _)| *p == cells[1]).unwrap().1;
        for &child in &right_children {
            for record in cache.get(child) {
                assert_eq!(record.indicator, 0);
            }
        }
    }

    #[test]
    fn test_coarsening_injects_child_values() {
        let (mut mesh, dofs) = setup(1, 1);
        let mut solution = BlockVector::zeros(dofs.n_velocity_dofs(), dofs.n_pressure_dofs());
        analytic_fill(&mesh, &dofs, &mut solution);
        let mut cache = CellDataStorage::new();
        for cell in mesh.active_cells() {
            cache.initialize(cell, 9);
        }

        // Refine once, transfer, then coarsen back and transfer again.
        let transfer = SolutionTransfer::prepare(&mesh, &dofs, &solution, &cache, 3);
        let map = mesh.refine_global();
        let fine_dofs = DofHandler::distribute(&mesh);
        let mut fine_solution =
            BlockVector::zeros(fine_dofs.n_velocity_dofs(), fine_dofs.n_pressure_dofs());
        transfer.interpolate(&map, &mesh, &fine_dofs, &mut fine_solution, &mut cache, 3);

        let transfer = SolutionTransfer::prepare(&mesh, &fine_dofs, &fine_solution, &cache, 3);
        for cell in mesh.active_cells() {
            mesh.set_coarsen_flag(cell);
        }
        mesh.prepare_coarsening_and_refinement(0, 5);
        let map = mesh.execute_coarsening_and_refinement();
        assert_eq!(map.coarsened.len(), 1);

        let coarse_dofs = DofHandler::distribute(&mesh);
        let mut coarse_solution =
            BlockVector::zeros(coarse_dofs.n_velocity_dofs(), coarse_dofs.n_pressure_dofs());
        transfer.interpolate(
            &map,
            &mesh,
            &coarse_dofs,
            &mut coarse_solution,
            &mut cache,
            3,
        );

        let mut expected =
            BlockVector::zeros(coarse_dofs.n_velocity_dofs(), coarse_dofs.n_pressure_dofs());
        analytic_fill(&mesh, &coarse_dofs, &mut expected);
        for d in 0..coarse_dofs.n_dofs() {
            assert_relative_eq!(coarse_solution.get(d), expected.get(d), epsilon = 1e-12);
        }
    }
}
