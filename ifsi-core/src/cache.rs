//! Per-cell coupling cache.
//!
//! Caches the real/artificial fluid indicator, FSI stress and FSI
//! acceleration at the quadrature points of every cell. The coupling
//! driver writes these records between fluid and solid solves; fluid
//! assembly reads them to add the FSI forcing terms. Records are keyed by
//! stable cell identity and must be re-associated with cells after mesh
//! refinement (see the transfer module).
//!
//! Ordering is enforced by the caller's step sequencing: the driver
//! completes its writes before the next assembly begins. There is no
//! internal locking.

use crate::mesh::CellId;
use crate::types::{Tensor2, Vec2};
use std::collections::HashMap;

/// Quadrature-point record of the FSI coupling state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellProperty {
    /// Domain indicator: 1 for artificial (solid-overlapped) fluid,
    /// 0 for real fluid.
    pub indicator: i32,
    /// The acceleration term in the FSI force.
    pub fsi_acceleration: Vec2,
    /// The stress term in the FSI force.
    pub fsi_stress: Tensor2,
}

impl Default for CellProperty {
    fn default() -> Self {
        Self {
            indicator: 0,
            fsi_acceleration: Vec2::zeros(),
            fsi_stress: Tensor2::zeros(),
        }
    }
}

/// Sparse storage of per-quadrature-point records, keyed by cell.
#[derive(Debug, Clone, Default)]
pub struct CellDataStorage {
    data: HashMap<CellId, Vec<CellProperty>>,
}

impl CellDataStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `n_q_points` default records for a cell. Existing records
    /// are preserved.
    pub fn initialize(&mut self, cell: CellId, n_q_points: usize) {
        self.data
            .entry(cell)
            .or_insert_with(|| vec![CellProperty::default(); n_q_points]);
    }

    /// Whether a cell has allocated records.
    pub fn contains(&self, cell: CellId) -> bool {
        self.data.contains_key(&cell)
    }

    /// Number of cells with allocated records.
    pub fn n_cells(&self) -> usize {
        self.data.len()
    }

    /// Records of a cell, one per quadrature point.
    ///
    /// # Panics
    ///
    /// Panics if the cell has no allocated records; every cell that passed
    /// through `setup_cell_property` has them, so this is a programming
    /// invariant, not a recoverable condition.
    pub fn get(&self, cell: CellId) -> &[CellProperty] {
        self.data
            .get(&cell)
            .unwrap_or_else(|| panic!("no cell property allocated for cell {}", cell))
    }

    /// Mutable records of a cell.
    ///
    /// # Panics
    ///
    /// Panics if the cell has no allocated records.
    pub fn get_mut(&mut self, cell: CellId) -> &mut [CellProperty] {
        self.data
            .get_mut(&cell)
            .unwrap_or_else(|| panic!("no cell property allocated for cell {}", cell))
    }

    /// Remove the records of a cell, returning them if present.
    pub fn remove(&mut self, cell: CellId) -> Option<Vec<CellProperty>> {
        self.data.remove(&cell)
    }

    /// Insert records for a cell, replacing existing ones.
    pub fn insert(&mut self, cell: CellId, records: Vec<CellProperty>) {
        self.data.insert(cell, records);
    }

    /// Drop all records.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Iterate over (cell, records).
    pub fn iter(&self) -> impl Iterator<Item = (&CellId, &Vec<CellProperty>)> {
        self.data.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_initialize_allocates_defaults() {
        let mut storage = CellDataStorage::new();
        storage.initialize(3, 4);
        let records = storage.get(3);
        assert_eq!(records.len(), 4);
        for r in records {
            assert_eq!(r.indicator, 0);
            assert_relative_eq!(r.fsi_acceleration.norm(), 0.0);
            assert_relative_eq!(r.fsi_stress.norm(), 0.0);
        }
    }

    #[test]
    fn test_initialize_preserves_existing() {
        let mut storage = CellDataStorage::new();
        storage.initialize(1, 2);
        storage.get_mut(1)[0].indicator = 1;
        storage.initialize(1, 2);
        assert_eq!(storage.get(1)[0].indicator, 1);
    }

    #[test]
    fn test_driver_writes_are_visible() {
        let mut storage = CellDataStorage::new();
        storage.initialize(7, 1);
        {
            let records = storage.get_mut(7);
            records[0].indicator = 1;
            records[0].fsi_acceleration = Vec2::new(0.5, -0.25);
        }
        let r = &storage.get(7)[0];
        assert_eq!(r.indicator, 1);
        assert_relative_eq!(r.fsi_acceleration[0], 0.5);
    }

    #[test]
    #[should_panic(expected = "no cell property allocated")]
    fn test_missing_cell_panics() {
        let storage = CellDataStorage::new();
        storage.get(42);
    }
}
