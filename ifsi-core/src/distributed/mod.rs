//! Distributed (SPMD) variant of the fluid solver.
//!
//! The solver of [`crate::fluid`] re-expressed over a partitioned DoF
//! space: every rank executes the same run-loop steps in lockstep, owns a
//! disjoint slice of the unknowns, assembles only its owned cells, and
//! meets the other ranks at collective operations (assembly compression,
//! ghost updates, the global dot products inside the Krylov solvers,
//! synchronized refinement). No rank may skip a collective - a rank with
//! zero owned cells still participates.
//!
//! Ranks are threads connected by a channel/barrier communicator; the
//! mesh is replicated (shared-mesh discipline) while vectors and matrix
//! rows are partitioned by ownership.
//!
//! # Submodules
//!
//! - [`comm`] - rank-to-rank channels, barrier, reductions, all-to-all
//! - [`partition`] - index sets, cell/DoF ownership, relevant halos
//! - [`vector`] - ghosted vectors and the ghost-exchange plan
//! - [`matrix`] - row-distributed matrices and the triplet compression
//! - [`solver`] - the distributed IMEX solver itself

pub mod comm;
pub mod matrix;
pub mod partition;
pub mod solver;
pub mod vector;

pub use comm::Communicator;
pub use partition::{IndexSet, Partition};
pub use solver::DistInsImex;
pub use vector::{DistributedVector, GhostExchange};

use std::thread;

/// Run one closure per rank on its own thread, SPMD style, and collect
/// the per-rank results in rank order.
pub fn run_spmd<F, R>(n_ranks: usize, f: F) -> Vec<R>
where
    F: Fn(Communicator) -> R + Send + Sync,
    R: Send,
{
    let comms = Communicator::create(n_ranks);
    thread::scope(|scope| {
        let mut handles = Vec::new();
        for comm in comms {
            let f = &f;
            handles.push(scope.spawn(move || f(comm)));
        }
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    })
}
