//! Distributed incompressible Navier-Stokes IMEX solver.
//!
//! Mirrors [`crate::fluid::InsImex`] step for step over a partitioned DoF
//! space: the mesh, DoF enumeration and constraint sets are replicated
//! (they are deterministic), while matrices, vectors and the assembly loop
//! are partitioned by ownership. Every rank executes the same sequence of
//! collectives; a rank that owns no cells still participates in all of
//! them.
//!
//! The block Schur preconditioner keeps its structure: the pressure-mass
//! and velocity inner solves run as distributed Jacobi-CG, while the
//! explicit `B diag(Mu)^{-1} B^T` matrix is gathered and factorized
//! redundantly on every rank (the pressure coupling is the small block;
//! the gather is the documented synchronization boundary of a
//! preconditioner reset).

use super::comm::Communicator;
use super::matrix::{DistRowMatrix, DistributedTriplets};
use super::partition::Partition;
use super::vector::{DistributedVector, GhostExchange};
use crate::boundary::BoundaryFunction;
use crate::cache::{CellDataStorage, CellProperty};
use crate::config::SimulationConfig;
use crate::constraints::{Constraints, GlobalVector};
use crate::dofs::DofHandler;
use crate::error::Result;
use crate::fe::{FeValues, N_PRES_DOFS, N_VEL_DOFS};
use crate::fluid::{
    assemble_local_cell, build_constraint_sets, estimate_velocity_jump_error,
    flag_fixed_fractions, AssemblyParams, N_Q_POINTS,
};
use crate::krylov::{cg, fgmres, InnerProduct, SolverControl};
use crate::mesh::Mesh;
use crate::preconditioner::{assemble_mass_schur, factorize_llt, llt_solve};
use crate::sparse::BlockVector;
use crate::time::Time;
use crate::transfer::SolutionTransfer;
use crate::types::Vec2;
use faer::sparse::linalg::solvers::Cholesky;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

const N_GAUSS: usize = 3;
const INNER_MAX_ITER: usize = 1000;
const INNER_TOL: f64 = 1e-6;

/// Inner products reduced across all ranks. Every rank must call them in
/// lockstep; the reduction is rank-ordered, so the result is identical
/// everywhere and the Krylov control flow cannot diverge between ranks.
pub struct DistOps<'a> {
    pub comm: &'a Communicator,
}

impl InnerProduct for DistOps<'_> {
    fn dot(&self, a: &[f64], b: &[f64]) -> f64 {
        let local: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        self.comm.all_reduce_sum(local)
    }
}

/// Owned rows of the assembled operators, split into blocks.
struct DistBlocks {
    uu: DistRowMatrix,
    up: DistRowMatrix,
    pu: DistRowMatrix,
    pp: DistRowMatrix,
    mass_pp: DistRowMatrix,
    /// Diagonal of the velocity mass block, owned-row order.
    mass_uu_diag: Vec<f64>,
    /// Owned triplets of the system (0,1) block, kept for the Schur gather.
    up_triplets: Vec<(usize, usize, f64)>,
}

/// Distributed block Schur preconditioner state.
struct DistSchurPc {
    gamma: f64,
    viscosity: f64,
    rho: f64,
    dt: f64,
    blocks: Arc<DistBlocks>,
    uu_diag: Vec<f64>,
    mass_pp_diag: Vec<f64>,
    schur_llt: Cholesky<usize, f64>,
    n_u_total: usize,
    n_p_total: usize,
    /// Owned pressure DoFs of every rank, for reassembling gathered data.
    all_owned_p: Vec<Vec<usize>>,
}

impl DistSchurPc {
    /// Gather the pressure coupling and build the replicated Schur
    /// factorization. Collective.
    #[allow(clippy::too_many_arguments)]
    fn new(
        comm: &Communicator,
        partition: &Partition,
        blocks: Arc<DistBlocks>,
        gamma: f64,
        viscosity: f64,
        rho: f64,
        dt: f64,
        n_u_total: usize,
        n_p_total: usize,
    ) -> Result<Self> {
        // Gather the full B^T and the full velocity-mass diagonal.
        let gathered_bt = comm.all_gather_triplets(blocks.up_triplets.clone());
        let owned_u_ids: Vec<usize> = partition.owned_partitioning[0].iter().collect();
        let all_owned_u = comm.exchange_indices(&vec![owned_u_ids; comm.size()]);
        let all_mass_diag = comm.all_gather_values(blocks.mass_uu_diag.clone());
        let owned_p_ids: Vec<usize> = partition.owned_partitioning[1].iter().collect();
        let all_owned_p = comm.exchange_indices(&vec![owned_p_ids; comm.size()]);

        let mut inv_mu_diag = vec![0.0; n_u_total];
        for (ids, values) in all_owned_u.iter().zip(&all_mass_diag) {
            for (&d, &v) in ids.iter().zip(values) {
                inv_mu_diag[d] = if v.abs() > 1e-300 { 1.0 / v } else { 0.0 };
            }
        }

        // Sort so every rank sums the product in the identical order.
        let mut bt_triplets: Vec<(usize, usize, f64)> = gathered_bt
            .into_iter()
            .flatten()
            .map(|(r, c, v)| (r, c - n_u_total, v))
            .collect();
        bt_triplets.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        let schur = assemble_mass_schur(&bt_triplets, &inv_mu_diag, n_p_total);
        let schur_llt = factorize_llt(&schur)?;

        Ok(Self {
            gamma,
            viscosity,
            rho,
            dt,
            uu_diag: blocks.uu.diagonal(),
            mass_pp_diag: blocks.mass_pp.diagonal(),
            blocks,
            schur_llt,
            n_u_total,
            n_p_total,
            all_owned_p,
        })
    }

    /// Apply the approximate inverse to owned-ordered `src`, writing
    /// owned-ordered `dst`. Collective; every rank calls it the same
    /// number of times per outer iteration.
    #[allow(clippy::too_many_arguments)]
    fn vmult(
        &self,
        comm: &Communicator,
        ghost_u: &GhostExchange,
        ghost_p: &GhostExchange,
        scratch_u: &RefCell<DistributedVector>,
        scratch_p: &RefCell<DistributedVector>,
        src: &[f64],
        dst: &mut [f64],
        n_owned_u: usize,
    ) {
        let ops = DistOps { comm };
        let src_u = &src[..n_owned_u];
        let src_p = &src[n_owned_u..];
        let n_owned_p = src_p.len();

        // Pressure mass part: tmp = -(nu + gamma rho) Mp^{-1} src_p
        let mut tmp = vec![0.0; n_owned_p];
        let src_p_norm = ops.norm(src_p);
        if src_p_norm > 0.0 {
            let control = SolverControl {
                max_iter: INNER_MAX_ITER,
                tol: INNER_TOL * src_p_norm,
            };
            let _ = cg(
                &ops,
                |x, y| {
                    let mut sp = scratch_p.borrow_mut();
                    sp.set_owned(x);
                    ghost_p.update(comm, &mut sp);
                    self.blocks.mass_pp.matvec(&sp, y);
                },
                Some(self.mass_pp_diag.as_slice()),
                src_p,
                &mut tmp,
                &control,
            );
        }
        let factor = -(self.viscosity + self.gamma * self.rho);
        for t in tmp.iter_mut() {
            *t *= factor;
        }

        // Schur part on the gathered pressure vector.
        let gathered = comm.all_gather_values(src_p.to_vec());
        let mut full_p = vec![0.0; self.n_p_total];
        for (ids, values) in self.all_owned_p.iter().zip(&gathered) {
            for (&d, &v) in ids.iter().zip(values) {
                full_p[d - self.n_u_total] = v;
            }
        }
        let schur_sol = llt_solve(&self.schur_llt, &full_p);
        let scale = -self.rho / self.dt;
        let dst_p: Vec<f64> = self.all_owned_p[comm.rank()]
            .iter()
            .enumerate()
            .map(|(i, &d)| scale * schur_sol[d - self.n_u_total] + tmp[i])
            .collect();

        // Velocity right-hand side: u_rhs = src_u - B^T dst_p
        let mut u_rhs = vec![0.0; n_owned_u];
        {
            let mut sp = scratch_p.borrow_mut();
            sp.set_owned(&dst_p);
            ghost_p.update(comm, &mut sp);
            self.blocks.up.matvec(&sp, &mut u_rhs);
        }
        for (r, s) in u_rhs.iter_mut().zip(src_u) {
            *r = s - *r;
        }

        // Velocity block by tolerance-bounded distributed CG.
        let mut dst_u = vec![0.0; n_owned_u];
        let u_norm = ops.norm(&u_rhs);
        if u_norm > 0.0 {
            let control = SolverControl {
                max_iter: INNER_MAX_ITER,
                tol: INNER_TOL * u_norm,
            };
            let _ = cg(
                &ops,
                |x, y| {
                    let mut su = scratch_u.borrow_mut();
                    su.set_owned(x);
                    ghost_u.update(comm, &mut su);
                    self.blocks.uu.matvec(&su, y);
                },
                Some(self.uu_diag.as_slice()),
                &u_rhs,
                &mut dst_u,
                &control,
            );
        }

        dst[..n_owned_u].copy_from_slice(&dst_u);
        dst[n_owned_u..].copy_from_slice(&dst_p);
    }
}

/// RHS accumulator spanning both ghosted blocks under global indices.
struct GhostedBlockRhs<'a> {
    u: &'a mut DistributedVector,
    p: &'a mut DistributedVector,
    n_u: usize,
}

impl GlobalVector for GhostedBlockRhs<'_> {
    fn add_value(&mut self, index: usize, value: f64) {
        if index < self.n_u {
            self.u.add(index, value);
        } else {
            self.p.add(index, value);
        }
    }
    fn get_value(&self, index: usize) -> f64 {
        if index < self.n_u {
            self.u.get(index)
        } else {
            self.p.get(index)
        }
    }
    fn set_value(&mut self, index: usize, value: f64) {
        if index < self.n_u {
            self.u.set(index, value);
        } else {
            self.p.set(index, value);
        }
    }
}

/// Distributed IMEX fluid solver (one instance per rank).
pub struct DistInsImex {
    viscosity: f64,
    rho: f64,
    gamma: f64,
    body_force: Vec2,

    mesh: Mesh,
    dof_handler: DofHandler,
    zero_constraints: Constraints,
    nonzero_constraints: Constraints,

    comm: Communicator,
    partition: Partition,
    ghost_u: GhostExchange,
    ghost_p: GhostExchange,

    present_u: DistributedVector,
    present_p: DistributedVector,

    blocks: Option<Arc<DistBlocks>>,
    schur: Option<DistSchurPc>,
    rhs_u: Vec<f64>,
    rhs_p: Vec<f64>,
    increment_u: Vec<f64>,
    increment_p: Vec<f64>,

    time: Time,
    config: SimulationConfig,
    cell_property: CellDataStorage,
    boundary_values: HashMap<u32, Box<dyn BoundaryFunction>>,
    mesh_changed: bool,
}

impl DistInsImex {
    /// Create this rank's solver instance. Collective (ghost-plan
    /// negotiation); all ranks must construct with identical mesh and
    /// configuration.
    pub fn new(
        mesh: Mesh,
        config: &SimulationConfig,
        boundary_values: HashMap<u32, Box<dyn BoundaryFunction>>,
        comm: Communicator,
    ) -> Result<Self> {
        config.validate()?;
        let time = Time::new(
            config.end_time,
            config.dt,
            config.output_interval,
            config.refinement_interval,
        );
        let dof_handler = DofHandler::distribute(&mesh);
        let (nonzero_constraints, zero_constraints) =
            build_constraint_sets(&mesh, &dof_handler, &boundary_values);
        let partition = Partition::build(
            &mesh,
            &dof_handler,
            &zero_constraints,
            comm.rank(),
            comm.size(),
        );

        let present_u = DistributedVector::new(
            partition.owned_partitioning[0].clone(),
            partition.relevant_partitioning[0].clone(),
        );
        let present_p = DistributedVector::new(
            partition.owned_partitioning[1].clone(),
            partition.relevant_partitioning[1].clone(),
        );
        let ghost_u = GhostExchange::new(&comm, &present_u, Arc::clone(&partition.dof_owner));
        let ghost_p = GhostExchange::new(&comm, &present_p, Arc::clone(&partition.dof_owner));

        let mut cell_property = CellDataStorage::new();
        for &cell in &partition.owned_cells {
            cell_property.initialize(cell, N_Q_POINTS);
        }

        Ok(Self {
            viscosity: config.viscosity,
            rho: config.rho,
            gamma: config.gamma,
            body_force: Vec2::new(config.body_force[0], config.body_force[1]),
            mesh,
            dof_handler,
            zero_constraints,
            nonzero_constraints,
            comm,
            partition,
            ghost_u,
            ghost_p,
            present_u,
            present_p,
            blocks: None,
            schur: None,
            rhs_u: Vec::new(),
            rhs_p: Vec::new(),
            increment_u: Vec::new(),
            increment_p: Vec::new(),
            time,
            config: config.clone(),
            cell_property,
            boundary_values,
            mesh_changed: false,
        })
    }

    /// Assemble owned cells into the distributed system. Collective.
    pub fn assemble(&mut self, use_nonzero_constraints: bool, assemble_system: bool) {
        debug_assert!(assemble_system || !use_nonzero_constraints);
        let constraints = if use_nonzero_constraints {
            &self.nonzero_constraints
        } else {
            &self.zero_constraints
        };
        let n_u = self.dof_handler.n_velocity_dofs();
        let params = AssemblyParams {
            viscosity: self.viscosity,
            rho: self.rho,
            gamma: self.gamma,
            dt: self.time.dt(),
            body_force: self.body_force,
        };

        let mut system_triplets = DistributedTriplets::new(
            self.comm.rank(),
            self.comm.size(),
            Arc::clone(&self.partition.dof_owner),
        );
        let mut mass_triplets = DistributedTriplets::new(
            self.comm.rank(),
            self.comm.size(),
            Arc::clone(&self.partition.dof_owner),
        );
        let mut rhs_u = DistributedVector::new(
            self.partition.owned_partitioning[0].clone(),
            self.partition.relevant_partitioning[0].clone(),
        );
        let mut rhs_p = DistributedVector::new(
            self.partition.owned_partitioning[1].clone(),
            self.partition.relevant_partitioning[1].clone(),
        );

        let mut fe = FeValues::new(N_GAUSS);
        {
            let mut rhs = GhostedBlockRhs {
                u: &mut rhs_u,
                p: &mut rhs_p,
                n_u,
            };
            for &cell in &self.partition.owned_cells {
                fe.reinit(&self.mesh.cell_vertices(cell));
                let dofs = self.dof_handler.cell_dofs(cell);
                let mut local_u = [0.0; N_VEL_DOFS];
                for (i, v) in local_u.iter_mut().enumerate() {
                    *v = self.present_u.get(dofs[i]);
                }
                let mut local_p = [0.0; N_PRES_DOFS];
                for (i, v) in local_p.iter_mut().enumerate() {
                    *v = self.present_p.get(dofs[N_VEL_DOFS + i]);
                }
                let properties = self.cell_property.get(cell);

                let local = assemble_local_cell(
                    &fe,
                    &local_u,
                    &local_p,
                    properties,
                    &params,
                    assemble_system,
                );
                if assemble_system {
                    constraints.distribute_local_to_global(
                        &local.matrix,
                        &local.rhs,
                        dofs,
                        &mut system_triplets,
                        &mut rhs,
                    );
                    constraints.distribute_local_matrix(&local.mass, dofs, &mut mass_triplets);
                } else {
                    constraints.distribute_local_rhs(&local.rhs, dofs, &mut rhs);
                }
            }
        }

        // Distributed-add: ship contributions to their owning ranks.
        self.ghost_u.compress_add(&self.comm, &mut rhs_u);
        self.ghost_p.compress_add(&self.comm, &mut rhs_p);
        self.rhs_u = rhs_u.owned_values();
        self.rhs_p = rhs_p.owned_values();

        if assemble_system {
            let system = system_triplets.compress(&self.comm);
            let mass = mass_triplets.compress(&self.comm);

            let mut uu = Vec::new();
            let mut up = Vec::new();
            let mut pu = Vec::new();
            let mut pp = Vec::new();
            for (r, c, v) in system {
                match (r < n_u, c < n_u) {
                    (true, true) => uu.push((r, c, v)),
                    (true, false) => up.push((r, c, v)),
                    (false, true) => pu.push((r, c, v)),
                    (false, false) => pp.push((r, c, v)),
                }
            }
            let mut mass_uu = Vec::new();
            let mut mass_pp = Vec::new();
            for (r, c, v) in mass {
                match (r < n_u, c < n_u) {
                    (true, true) => mass_uu.push((r, c, v)),
                    (false, false) => mass_pp.push((r, c, v)),
                    _ => {}
                }
            }

            let owned_u = self.partition.owned_partitioning[0].clone();
            let owned_p = self.partition.owned_partitioning[1].clone();
            let relevant_u = self.partition.relevant_partitioning[0].clone();
            let relevant_p = self.partition.relevant_partitioning[1].clone();

            let mass_uu_matrix =
                DistRowMatrix::from_triplets(owned_u.clone(), relevant_u.clone(), &mass_uu);
            // Sort the retained coupling triplets for the replicated
            // Schur product.
            let mut up_triplets = up.clone();
            up_triplets.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

            self.blocks = Some(Arc::new(DistBlocks {
                uu: DistRowMatrix::from_triplets(owned_u.clone(), relevant_u.clone(), &uu),
                up: DistRowMatrix::from_triplets(owned_u.clone(), relevant_p.clone(), &up),
                pu: DistRowMatrix::from_triplets(owned_p.clone(), relevant_u, &pu),
                pp: DistRowMatrix::from_triplets(owned_p.clone(), relevant_p.clone(), &pp),
                mass_pp: DistRowMatrix::from_triplets(owned_p, relevant_p, &mass_pp),
                mass_uu_diag: mass_uu_matrix.diagonal(),
                up_triplets,
            }));
        }
    }

    /// Distributed FGMRES solve; returns `(iterations, residual)`,
    /// identical on every rank. Collective.
    pub fn solve(
        &mut self,
        use_nonzero_constraints: bool,
        assemble_system: bool,
    ) -> Result<(usize, f64)> {
        let blocks = Arc::clone(self.blocks.as_ref().expect("assemble must run before solve"));
        if assemble_system || self.schur.is_none() {
            self.schur = Some(DistSchurPc::new(
                &self.comm,
                &self.partition,
                Arc::clone(&blocks),
                self.gamma,
                self.viscosity,
                self.rho,
                self.time.dt(),
                self.dof_handler.n_velocity_dofs(),
                self.dof_handler.n_pressure_dofs(),
            )?);
        }

        let n_owned_u = self.partition.owned_partitioning[0].n_elements();
        let ops = DistOps { comm: &self.comm };
        let mut b = Vec::with_capacity(self.partition.n_owned());
        b.extend_from_slice(&self.rhs_u);
        b.extend_from_slice(&self.rhs_p);
        let rhs_norm = ops.norm(&b);
        let control = SolverControl {
            max_iter: self.config.max_iteration,
            tol: self.config.tolerance * rhs_norm.max(1e-300),
        };

        let scratch_u = RefCell::new(DistributedVector::new(
            self.partition.owned_partitioning[0].clone(),
            self.partition.relevant_partitioning[0].clone(),
        ));
        let scratch_p = RefCell::new(DistributedVector::new(
            self.partition.owned_partitioning[1].clone(),
            self.partition.relevant_partitioning[1].clone(),
        ));

        let mut x = vec![0.0; b.len()];
        let schur = self.schur.as_ref().expect("preconditioner built");
        let comm = &self.comm;
        let ghost_u = &self.ghost_u;
        let ghost_p = &self.ghost_p;
        let info = fgmres(
            &ops,
            |src, dst| {
                let mut su = scratch_u.borrow_mut();
                let mut sp = scratch_p.borrow_mut();
                su.set_owned(&src[..n_owned_u]);
                sp.set_owned(&src[n_owned_u..]);
                ghost_u.update(comm, &mut su);
                ghost_p.update(comm, &mut sp);

                let n_owned_p = src.len() - n_owned_u;
                let mut y_u = vec![0.0; n_owned_u];
                let mut t_u = vec![0.0; n_owned_u];
                blocks.uu.matvec(&su, &mut y_u);
                blocks.up.matvec(&sp, &mut t_u);
                let mut y_p = vec![0.0; n_owned_p];
                let mut t_p = vec![0.0; n_owned_p];
                blocks.pu.matvec(&su, &mut y_p);
                blocks.pp.matvec(&sp, &mut t_p);
                for (d, (a, b2)) in dst[..n_owned_u].iter_mut().zip(y_u.iter().zip(&t_u)) {
                    *d = a + b2;
                }
                for (d, (a, b2)) in dst[n_owned_u..].iter_mut().zip(y_p.iter().zip(&t_p)) {
                    *d = a + b2;
                }
            },
            |src, dst| {
                schur.vmult(
                    comm, ghost_u, ghost_p, &scratch_u, &scratch_p, src, dst, n_owned_u,
                );
            },
            &b,
            &mut x,
            &control,
        );

        // Re-impose constraints on the increment.
        let mut inc_u = scratch_u.into_inner();
        let mut inc_p = scratch_p.into_inner();
        inc_u.set_owned(&x[..n_owned_u]);
        inc_p.set_owned(&x[n_owned_u..]);
        self.ghost_u.update(&self.comm, &mut inc_u);
        self.ghost_p.update(&self.comm, &mut inc_p);
        let constraints = if use_nonzero_constraints {
            &self.nonzero_constraints
        } else {
            &self.zero_constraints
        };
        distribute_constraints_ghosted(
            constraints,
            &mut inc_u,
            &mut inc_p,
            self.dof_handler.n_velocity_dofs(),
        );
        self.increment_u = inc_u.owned_values();
        self.increment_p = inc_p.owned_values();

        Ok((info.iterations, info.residual))
    }

    /// Advance one time step. Collective.
    pub fn run_one_step(&mut self) -> Result<()> {
        self.time.increment();
        let step = self.time.step();
        let use_nonzero = step == 1;
        let full_assembly = use_nonzero || self.mesh_changed;

        self.assemble(use_nonzero, full_assembly);
        let (iterations, residual) = self.solve(use_nonzero, full_assembly)?;
        self.mesh_changed = false;

        // present += increment on owned entries, then refresh ghosts.
        let mut u = self.present_u.owned_values();
        for (a, b) in u.iter_mut().zip(&self.increment_u) {
            *a += *b;
        }
        self.present_u.set_owned(&u);
        let mut p = self.present_p.owned_values();
        for (a, b) in p.iter_mut().zip(&self.increment_p) {
            *a += *b;
        }
        self.present_p.set_owned(&p);
        self.ghost_u.update(&self.comm, &mut self.present_u);
        self.ghost_p.update(&self.comm, &mut self.present_p);

        if self.comm.rank() == 0 {
            info!(
                step,
                time = self.time.current(),
                iterations,
                residual,
                "fluid step"
            );
        }

        if self.time.time_to_refine() {
            self.refine_mesh(self.config.min_refine_level, self.config.max_refine_level)?;
        }
        if self.time.time_to_output() && self.comm.rank() == 0 {
            info!(
                step,
                time = self.time.current(),
                n_active_cells = self.mesh.n_active_cells(),
                n_dofs = self.dof_handler.n_dofs(),
                "output"
            );
        }
        Ok(())
    }

    /// Run the time loop to completion. Collective.
    pub fn run(&mut self) -> Result<()> {
        while !self.time.end_reached() {
            self.run_one_step()?;
        }
        Ok(())
    }

    /// Gather the full solution onto every rank. Collective.
    pub fn get_current_solution(&self) -> BlockVector {
        let n_u = self.dof_handler.n_velocity_dofs();
        let n_p = self.dof_handler.n_pressure_dofs();
        let mut full = BlockVector::zeros(n_u, n_p);
        for (block, vector) in [(0, &self.present_u), (1, &self.present_p)] {
            let ids: Vec<usize> = self.partition.owned_partitioning[block].iter().collect();
            let all_ids = self.comm.exchange_indices(&vec![ids; self.comm.size()]);
            let all_values = self.comm.all_gather_values(vector.owned_values());
            for (ids, values) in all_ids.iter().zip(&all_values) {
                for (&d, &v) in ids.iter().zip(values) {
                    full.set(d, v);
                }
            }
        }
        full
    }

    /// The simulation clock.
    pub fn time(&self) -> &Time {
        &self.time
    }

    /// The mesh replica of this rank.
    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    /// This rank's partition state.
    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// The inhomogeneous constraint set.
    pub fn nonzero_constraints(&self) -> &Constraints {
        &self.nonzero_constraints
    }

    /// Coupling records of a locally owned cell, for FSI drivers running
    /// alongside this rank.
    ///
    /// # Panics
    ///
    /// Panics for cells this rank does not own.
    pub fn cell_records_mut(&mut self, cell: crate::mesh::CellId) -> &mut [CellProperty] {
        self.cell_property.get_mut(cell)
    }

    /// Gather the per-cell cache of all ranks. Collective.
    fn gather_full_cache(&self) -> CellDataStorage {
        let mut serialized = Vec::new();
        for &cell in &self.partition.owned_cells {
            serialized.push(cell as f64);
            for record in self.cell_property.get(cell) {
                serialized.extend_from_slice(&[
                    record.indicator as f64,
                    record.fsi_acceleration[0],
                    record.fsi_acceleration[1],
                    record.fsi_stress[(0, 0)],
                    record.fsi_stress[(0, 1)],
                    record.fsi_stress[(1, 0)],
                    record.fsi_stress[(1, 1)],
                ]);
            }
        }
        let gathered = self.comm.all_gather_values(serialized);

        let mut cache = CellDataStorage::new();
        let stride = 1 + 7 * N_Q_POINTS;
        for blob in gathered {
            debug_assert_eq!(blob.len() % stride, 0);
            for chunk in blob.chunks_exact(stride) {
                let cell = chunk[0] as u32;
                let records: Vec<CellProperty> = chunk[1..]
                    .chunks_exact(7)
                    .map(|r| CellProperty {
                        indicator: r[0] as i32,
                        fsi_acceleration: Vec2::new(r[1], r[2]),
                        fsi_stress: crate::types::Tensor2::new(r[3], r[4], r[5], r[6]),
                    })
                    .collect();
                cache.insert(cell, records);
            }
        }
        cache
    }

    /// Synchronized mesh adaptation: every rank reaches the identical
    /// refinement decision on gathered data, transfers, then repartitions.
    /// Collective.
    pub fn refine_mesh(&mut self, min_level: u32, max_level: u32) -> Result<()> {
        let full = self.get_current_solution();
        let indicators = estimate_velocity_jump_error(&self.mesh, &self.dof_handler, &full);
        if !flag_fixed_fractions(
            &mut self.mesh,
            indicators,
            self.config.refine_fraction,
            self.config.coarsen_fraction,
        ) {
            return Ok(());
        }
        self.mesh.prepare_coarsening_and_refinement(min_level, max_level);

        let full_cache = self.gather_full_cache();
        let transfer = SolutionTransfer::prepare(
            &self.mesh,
            &self.dof_handler,
            &full,
            &full_cache,
            N_GAUSS,
        );
        let map = self.mesh.execute_coarsening_and_refinement();
        if map.refined.is_empty() && map.coarsened.is_empty() {
            self.mesh.clear_flags();
            return Ok(());
        }

        // Replicated re-setup and repartition.
        self.dof_handler = DofHandler::distribute(&self.mesh);
        let (nonzero, zero) =
            build_constraint_sets(&self.mesh, &self.dof_handler, &self.boundary_values);
        self.nonzero_constraints = nonzero;
        self.zero_constraints = zero;
        self.partition = Partition::build(
            &self.mesh,
            &self.dof_handler,
            &self.zero_constraints,
            self.comm.rank(),
            self.comm.size(),
        );

        let mut new_full = BlockVector::zeros(
            self.dof_handler.n_velocity_dofs(),
            self.dof_handler.n_pressure_dofs(),
        );
        let mut new_cache = CellDataStorage::new();
        transfer.interpolate(
            &map,
            &self.mesh,
            &self.dof_handler,
            &mut new_full,
            &mut new_cache,
            N_GAUSS,
        );
        self.nonzero_constraints.distribute(&mut new_full);

        // Scatter the replicated state back into distributed storage.
        self.present_u = DistributedVector::new(
            self.partition.owned_partitioning[0].clone(),
            self.partition.relevant_partitioning[0].clone(),
        );
        self.present_p = DistributedVector::new(
            self.partition.owned_partitioning[1].clone(),
            self.partition.relevant_partitioning[1].clone(),
        );
        for d in self.partition.relevant_partitioning[0].iter() {
            self.present_u.set(d, new_full.get(d));
        }
        for d in self.partition.relevant_partitioning[1].iter() {
            self.present_p.set(d, new_full.get(d));
        }
        self.ghost_u =
            GhostExchange::new(&self.comm, &self.present_u, Arc::clone(&self.partition.dof_owner));
        self.ghost_p =
            GhostExchange::new(&self.comm, &self.present_p, Arc::clone(&self.partition.dof_owner));

        self.cell_property = CellDataStorage::new();
        for &cell in &self.partition.owned_cells {
            let records = new_cache.get(cell).to_vec();
            self.cell_property.insert(cell, records);
        }

        self.blocks = None;
        self.schur = None;
        self.rhs_u.clear();
        self.rhs_p.clear();
        self.mesh_changed = true;
        if self.comm.rank() == 0 {
            info!(
                refined = map.refined.len(),
                coarsened = map.coarsened.len(),
                n_active_cells = self.mesh.n_active_cells(),
                n_dofs = self.dof_handler.n_dofs(),
                "mesh adapted"
            );
        }
        Ok(())
    }
}

/// Apply constraint lines to the locally relevant part of a ghosted block
/// pair. Master values must be ghost-fresh; every rank computes the same
/// constrained values from the same masters, so no communication is
/// needed.
fn distribute_constraints_ghosted(
    constraints: &Constraints,
    u: &mut DistributedVector,
    p: &mut DistributedVector,
    n_u: usize,
) {
    let relevant = |d: usize, u: &DistributedVector, p: &DistributedVector| {
        if d < n_u {
            u.relevant().is_element(d)
        } else {
            p.relevant().is_element(d)
        }
    };
    for dof in constraints.constrained_dofs() {
        if !relevant(dof, u, p) {
            continue;
        }
        let line = constraints.line(dof).expect("constrained dof has a line");
        let mut value = line.inhomogeneity;
        for &(m, w) in &line.entries {
            let mv = if m < n_u { u.get(m) } else { p.get(m) };
            value += w * mv;
        }
        if dof < n_u {
            u.set(dof, value);
        } else {
            p.set(dof, value);
        }
    }
}
