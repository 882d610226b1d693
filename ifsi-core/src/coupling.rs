//! Explicit mutation interface for FSI coupling drivers.
//!
//! The partitioned FSI driver alternates fluid and solid solves, writing
//! the domain indicator and FSI forcing into the fluid solver's per-cell
//! cache and reading the fluid state back. Instead of blanket access to
//! the solver's internals, the driver works through this scoped exchange
//! handle.
//!
//! Single-writer discipline: the driver must finish its writes before the
//! next `assemble`/`run_one_step`. The exchange borrows the solver
//! mutably, so the borrow checker enforces exactly that ordering within
//! one thread of control.

use crate::cache::CellProperty;
use crate::fluid::InsImex;
use crate::mesh::CellId;
use crate::sparse::BlockVector;
use crate::types::{Point2, Tensor2, Vec2};

/// Scoped read/write access to the fluid solver's coupling state.
pub struct FsiExchange<'a> {
    solver: &'a mut InsImex,
}

impl InsImex {
    /// Open the coupling exchange.
    pub fn coupling(&mut self) -> FsiExchange<'_> {
        FsiExchange { solver: self }
    }
}

impl<'a> FsiExchange<'a> {
    /// Active cells of the fluid mesh, the units the driver iterates.
    pub fn active_cells(&self) -> Vec<CellId> {
        self.solver.mesh.active_cells()
    }

    /// Vertex coordinates of a cell, for geometric overlap queries.
    pub fn cell_vertices(&self, cell: CellId) -> [Point2; 4] {
        self.solver.mesh.cell_vertices(cell)
    }

    /// Coupling records of a cell, one per quadrature point.
    ///
    /// # Panics
    ///
    /// Panics for cells without allocated records (never the case for
    /// cells reported by [`Self::active_cells`]).
    pub fn records(&self, cell: CellId) -> &[CellProperty] {
        self.solver.cell_property.get(cell)
    }

    /// Mutable coupling records of a cell.
    pub fn records_mut(&mut self, cell: CellId) -> &mut [CellProperty] {
        self.solver.cell_property.get_mut(cell)
    }

    /// Mark every quadrature point of a cell as artificial fluid and set
    /// its forcing terms.
    pub fn mark_artificial(&mut self, cell: CellId, acceleration: Vec2, stress: Tensor2) {
        for record in self.solver.cell_property.get_mut(cell) {
            record.indicator = 1;
            record.fsi_acceleration = acceleration;
            record.fsi_stress = stress;
        }
    }

    /// Reset every quadrature point of a cell to real fluid.
    pub fn mark_real(&mut self, cell: CellId) {
        for record in self.solver.cell_property.get_mut(cell) {
            *record = CellProperty::default();
        }
    }

    /// Read-only snapshot of the fluid solution.
    pub fn current_solution(&self) -> BlockVector {
        self.solver.get_current_solution()
    }

    /// Fluid velocity at a physical point (e.g. a solid boundary node).
    pub fn velocity_at(&self, p: &Point2) -> Option<Vec2> {
        self.solver.sample_velocity(p)
    }
}
