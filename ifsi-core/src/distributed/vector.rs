//! Ghosted distributed vectors.
//!
//! A [`DistributedVector`] stores values for the locally relevant index
//! set of one block: the owned slice is authoritative, the ghost slice is
//! a read cache refreshed by [`GhostExchange::update`]. Assembly may also
//! accumulate into ghost slots; [`GhostExchange::compress_add`] ships
//! those contributions to their owners (the distributed-add protocol) and
//! zeroes the ghosts.

use super::comm::Communicator;
use super::partition::IndexSet;
use std::sync::Arc;

/// Values over a relevant index set, partitioned into owned and ghost.
#[derive(Debug, Clone)]
pub struct DistributedVector {
    relevant: IndexSet,
    owned: IndexSet,
    values: Vec<f64>,
}

impl DistributedVector {
    /// Zero vector over the given owned/relevant sets.
    pub fn new(owned: IndexSet, relevant: IndexSet) -> Self {
        debug_assert!(owned.iter().all(|d| relevant.is_element(d)));
        let n = relevant.n_elements();
        Self {
            relevant,
            owned,
            values: vec![0.0; n],
        }
    }

    /// The owned index set.
    pub fn owned(&self) -> &IndexSet {
        &self.owned
    }

    /// The relevant index set.
    pub fn relevant(&self) -> &IndexSet {
        &self.relevant
    }

    /// Value at a global index.
    ///
    /// # Panics
    ///
    /// Panics for indices outside the relevant set: reading them would be
    /// a stale-halo bug, not a recoverable condition.
    #[inline]
    pub fn get(&self, global: usize) -> f64 {
        let pos = self
            .relevant
            .position(global)
            .unwrap_or_else(|| panic!("dof {} is not locally relevant", global));
        self.values[pos]
    }

    /// Set the value at a global (relevant) index.
    #[inline]
    pub fn set(&mut self, global: usize, value: f64) {
        let pos = self
            .relevant
            .position(global)
            .unwrap_or_else(|| panic!("dof {} is not locally relevant", global));
        self.values[pos] = value;
    }

    /// Add into the value at a global (relevant) index.
    #[inline]
    pub fn add(&mut self, global: usize, value: f64) {
        let pos = self
            .relevant
            .position(global)
            .unwrap_or_else(|| panic!("dof {} is not locally relevant", global));
        self.values[pos] += value;
    }

    /// Copy of the owned values, in owned-set order.
    pub fn owned_values(&self) -> Vec<f64> {
        self.owned
            .iter()
            .map(|d| self.values[self.relevant.position(d).expect("owned is relevant")])
            .collect()
    }

    /// Overwrite the owned slice from owned-set-ordered values.
    pub fn set_owned(&mut self, values: &[f64]) {
        debug_assert_eq!(values.len(), self.owned.n_elements());
        for (i, d) in self.owned.iter().enumerate() {
            let pos = self.relevant.position(d).expect("owned is relevant");
            self.values[pos] = values[i];
        }
    }

    /// Zero all values.
    pub fn set_zero(&mut self) {
        self.values.iter_mut().for_each(|v| *v = 0.0);
    }
}

/// Precomputed ghost communication plan for one block.
pub struct GhostExchange {
    /// Owner rank of every global DoF.
    dof_owner: Arc<Vec<usize>>,
    /// Per peer: the global ids this rank sends (they requested them).
    send_ids: Vec<Vec<usize>>,
    /// Per peer: the global ids this rank receives (its ghosts).
    recv_ids: Vec<Vec<usize>>,
}

impl GhostExchange {
    /// Negotiate the exchange lists. Collective.
    pub fn new(comm: &Communicator, vector: &DistributedVector, dof_owner: Arc<Vec<usize>>) -> Self {
        let size = comm.size();
        let mut requests: Vec<Vec<usize>> = (0..size).map(|_| Vec::new()).collect();
        for d in vector.relevant().iter() {
            if !vector.owned().is_element(d) {
                requests[dof_owner[d]].push(d);
            }
        }
        let send_ids = comm.exchange_indices(&requests);
        Self {
            dof_owner,
            send_ids,
            recv_ids: requests,
        }
    }

    /// Refresh ghost values from their owners. Collective.
    pub fn update(&self, comm: &Communicator, vector: &mut DistributedVector) {
        let outgoing: Vec<Vec<f64>> = self
            .send_ids
            .iter()
            .map(|ids| ids.iter().map(|&d| vector.get(d)).collect())
            .collect();
        let incoming = comm.exchange_values(&outgoing);
        for (r, values) in incoming.iter().enumerate() {
            debug_assert_eq!(values.len(), self.recv_ids[r].len());
            for (&d, &v) in self.recv_ids[r].iter().zip(values) {
                vector.set(d, v);
            }
        }
    }

    /// Ship ghost-slot contributions to their owners, add them there and
    /// zero the local ghosts. Collective. Ghost values are stale
    /// afterwards; call [`Self::update`] when they are needed again.
    pub fn compress_add(&self, comm: &Communicator, vector: &mut DistributedVector) {
        let outgoing: Vec<Vec<f64>> = self
            .recv_ids
            .iter()
            .map(|ids| ids.iter().map(|&d| vector.get(d)).collect())
            .collect();
        for ids in &self.recv_ids {
            for &d in ids {
                vector.set(d, 0.0);
            }
        }
        let incoming = comm.exchange_values(&outgoing);
        for (r, values) in incoming.iter().enumerate() {
            debug_assert_eq!(values.len(), self.send_ids[r].len());
            for (&d, &v) in self.send_ids[r].iter().zip(values) {
                debug_assert_eq!(self.dof_owner[d], comm.rank());
                vector.add(d, v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::run_spmd;
    use approx::assert_relative_eq;

    /// Two ranks over 4 dofs: rank 0 owns {0, 1}, rank 1 owns {2, 3};
    /// each rank's relevant set adds one ghost from the other.
    fn toy_vector(rank: usize) -> (DistributedVector, Arc<Vec<usize>>) {
        let dof_owner = Arc::new(vec![0, 0, 1, 1]);
        let (owned, relevant) = if rank == 0 {
            (vec![0, 1], vec![0, 1, 2])
        } else {
            (vec![2, 3], vec![1, 2, 3])
        };
        (
            DistributedVector::new(
                IndexSet::from_indices(owned),
                IndexSet::from_indices(relevant),
            ),
            dof_owner,
        )
    }

    #[test]
    fn test_ghost_update() {
        let results = run_spmd(2, |comm| {
            let (mut v, owner) = toy_vector(comm.rank());
            let exchange = GhostExchange::new(&comm, &v, owner);
            // Each rank writes its owned dofs as 10 * dof
            for d in v.owned().iter().collect::<Vec<_>>() {
                v.set(d, 10.0 * d as f64);
            }
            exchange.update(&comm, &mut v);
            (comm.rank(), v)
        });
        let v0 = &results[0].1;
        assert_relative_eq!(v0.get(2), 20.0); // ghost from rank 1
        let v1 = &results[1].1;
        assert_relative_eq!(v1.get(1), 10.0); // ghost from rank 0
    }

    #[test]
    fn test_compress_add_ships_to_owner() {
        let results = run_spmd(2, |comm| {
            let (mut v, owner) = toy_vector(comm.rank());
            let exchange = GhostExchange::new(&comm, &v, owner);
            // Both ranks contribute 1.0 to dof 1 (owned by rank 0) and
            // dof 2 (owned by rank 1).
            v.add(1, 1.0);
            v.add(2, 1.0);
            exchange.compress_add(&comm, &mut v);
            (comm.rank(), v)
        });
        assert_relative_eq!(results[0].1.get(1), 2.0);
        assert_relative_eq!(results[1].1.get(2), 2.0);
        // Ghost slots were zeroed by the compression
        assert_relative_eq!(results[0].1.get(2), 0.0);
        assert_relative_eq!(results[1].1.get(1), 0.0);
    }

    #[test]
    fn test_owned_values_roundtrip() {
        let (mut v, _) = toy_vector(0);
        v.set_owned(&[3.0, 4.0]);
        assert_eq!(v.owned_values(), vec![3.0, 4.0]);
        assert_relative_eq!(v.get(0), 3.0);
    }

    #[test]
    #[should_panic(expected = "not locally relevant")]
    fn test_non_relevant_access_panics() {
        let (v, _) = toy_vector(0);
        v.get(3);
    }
}
