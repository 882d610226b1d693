//! Incompressible Navier-Stokes solver with an IMEX time scheme.
//!
//! The momentum equation is written in incremental form and the convection
//! term is treated explicitly, so each time step solves one *linear,
//! symmetric* saddle-point system for the solution increment. The system
//! is stabilized with the Grad-Div term and solved by FGMRES with the
//! block Schur-complement preconditioner.
//!
//! In FSI runs the coupling driver writes the artificial-fluid indicator
//! and FSI forcing into the per-cell cache between steps; assembly picks
//! them up as source terms gated by the indicator.

use crate::boundary::BoundaryFunction;
use crate::cache::CellDataStorage;
use crate::config::SimulationConfig;
use crate::constraints::Constraints;
use crate::dofs::DofHandler;
use crate::error::Result;
use crate::fe::{shape, FeValues, N_CELL_DOFS, N_PRES_DOFS, N_Q2, N_VEL_DOFS};
use crate::krylov::{fgmres, SerialOps, SolverControl};
use crate::mesh::{edge_key, CellId, Mesh};
use crate::preconditioner::BlockSchurPreconditioner;
use crate::sparse::{BlockMatrix, BlockVector, CsrMatrix, TripletMatrix};
use crate::time::Time;
use crate::transfer::SolutionTransfer;
use crate::types::{double_contract, Point2, Tensor2, Vec2};
use nalgebra::DMatrix;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Gauss points per direction; exact for the Q2 x Q2 product terms.
const N_GAUSS: usize = 3;

/// Quadrature points per cell, as allocated in the coupling cache.
pub const N_Q_POINTS: usize = N_GAUSS * N_GAUSS;

/// Incompressible Navier-Stokes IMEX solver on an adaptively refined
/// quadrilateral mesh.
pub struct InsImex {
    viscosity: f64,
    rho: f64,
    gamma: f64,
    body_force: Vec2,

    pub(crate) mesh: Mesh,
    pub(crate) dof_handler: DofHandler,

    zero_constraints: Constraints,
    nonzero_constraints: Constraints,

    system_matrix: Option<Arc<BlockMatrix>>,
    mass_matrix: Option<Arc<BlockMatrix>>,
    mass_schur: Option<Arc<CsrMatrix>>,

    pub(crate) present_solution: BlockVector,
    solution_increment: BlockVector,
    system_rhs: BlockVector,

    time: Time,
    config: SimulationConfig,
    preconditioner: Option<BlockSchurPreconditioner>,

    pub(crate) cell_property: CellDataStorage,
    boundary_values: HashMap<u32, Box<dyn BoundaryFunction>>,

    /// Set by mesh adaptation; forces a full assembly on the next step.
    mesh_changed: bool,
}

impl InsImex {
    /// Create a solver over an externally built mesh.
    ///
    /// `boundary_values` maps boundary colors to prescribed velocities;
    /// uncolored boundaries are natural (do-nothing) outflow.
    pub fn new(
        mesh: Mesh,
        config: &SimulationConfig,
        boundary_values: HashMap<u32, Box<dyn BoundaryFunction>>,
    ) -> Result<Self> {
        config.validate()?;
        let time = Time::new(
            config.end_time,
            config.dt,
            config.output_interval,
            config.refinement_interval,
        );
        let dof_handler = DofHandler::distribute(&mesh);
        let mut solver = Self {
            viscosity: config.viscosity,
            rho: config.rho,
            gamma: config.gamma,
            body_force: Vec2::new(config.body_force[0], config.body_force[1]),
            mesh,
            dof_handler,
            zero_constraints: Constraints::new(),
            nonzero_constraints: Constraints::new(),
            system_matrix: None,
            mass_matrix: None,
            mass_schur: None,
            present_solution: BlockVector::zeros(0, 0),
            solution_increment: BlockVector::zeros(0, 0),
            system_rhs: BlockVector::zeros(0, 0),
            time,
            config: config.clone(),
            preconditioner: None,
            cell_property: CellDataStorage::new(),
            boundary_values,
            mesh_changed: false,
        };
        solver.make_constraints();
        solver.initialize_system();
        solver.setup_cell_property();
        Ok(solver)
    }

    /// Re-enumerate DoFs after the mesh changed.
    pub(crate) fn setup_dofs(&mut self) {
        self.dof_handler = DofHandler::distribute(&self.mesh);
        debug!(
            n_active_cells = self.mesh.n_active_cells(),
            n_dofs = self.dof_handler.n_dofs(),
            "distributed dofs"
        );
    }

    /// Build the zero and nonzero constraint sets: identical constrained
    /// DoFs, inhomogeneities only in the nonzero set.
    pub(crate) fn make_constraints(&mut self) {
        let (nonzero, zero) =
            build_constraint_sets(&self.mesh, &self.dof_handler, &self.boundary_values);
        self.nonzero_constraints = nonzero;
        self.zero_constraints = zero;
    }

    /// Size vectors and drop stale operators after a DoF change.
    pub(crate) fn initialize_system(&mut self) {
        let [n_u, n_p] = self.dof_handler.dofs_per_block();
        self.present_solution = BlockVector::zeros(n_u, n_p);
        self.solution_increment = BlockVector::zeros(n_u, n_p);
        self.system_rhs = BlockVector::zeros(n_u, n_p);
        self.system_matrix = None;
        self.mass_matrix = None;
        self.mass_schur = None;
        self.preconditioner = None;
    }

    /// Allocate one coupling record per quadrature point of every cell.
    pub(crate) fn setup_cell_property(&mut self) {
        for cell in self.mesh.active_cells() {
            self.cell_property.initialize(cell, N_Q_POINTS);
        }
    }

    /// Local DoF values of the present solution on a cell.
    fn local_solution(&self, cell: CellId) -> ([f64; N_VEL_DOFS], [f64; N_PRES_DOFS]) {
        let dofs = self.dof_handler.cell_dofs(cell);
        let mut local_u = [0.0; N_VEL_DOFS];
        for (i, value) in local_u.iter_mut().enumerate() {
            *value = self.present_solution.get(dofs[i]);
        }
        let mut local_p = [0.0; N_PRES_DOFS];
        for (i, value) in local_p.iter_mut().enumerate() {
            *value = self.present_solution.get(dofs[N_VEL_DOFS + i]);
        }
        (local_u, local_p)
    }

    /// Assemble the system matrix, mass matrix and right-hand side.
    ///
    /// With `assemble_system` false only the right-hand side is recomputed
    /// and the existing matrices are reused: within one mesh the LHS is
    /// constant, only the explicit convection and forcing change. That
    /// path requires the homogeneous constraint set, which is the only
    /// combination the run loop produces.
    pub fn assemble(&mut self, use_nonzero_constraints: bool, assemble_system: bool) {
        debug_assert!(
            assemble_system || !use_nonzero_constraints,
            "rhs-only assembly requires the homogeneous constraint set"
        );
        let constraints = if use_nonzero_constraints {
            &self.nonzero_constraints
        } else {
            &self.zero_constraints
        };

        let [n_u, n_p] = self.dof_handler.dofs_per_block();
        let n = n_u + n_p;
        let dt = self.time.dt();
        let (viscosity, rho, gamma) = (self.viscosity, self.rho, self.gamma);
        let body_force = self.body_force;

        let mesh = &self.mesh;
        let dof_handler = &self.dof_handler;
        let cell_property = &self.cell_property;

        struct Accumulator {
            system: TripletMatrix,
            mass: TripletMatrix,
            rhs: BlockVector,
        }
        let accumulator = Mutex::new(Accumulator {
            system: TripletMatrix::with_capacity(n, n, if assemble_system { 48 * n } else { 0 }),
            mass: TripletMatrix::with_capacity(n, n, if assemble_system { 24 * n } else { 0 }),
            rhs: BlockVector::zeros(n_u, n_p),
        });

        let params = AssemblyParams {
            viscosity,
            rho,
            gamma,
            dt,
            body_force,
        };
        let cells = mesh.active_cells();
        cells.par_iter().for_each_init(
            || FeValues::new(N_GAUSS),
            |fe, &cell| {
                fe.reinit(&mesh.cell_vertices(cell));
                let dofs = dof_handler.cell_dofs(cell);
                let mut local_u = [0.0; N_VEL_DOFS];
                for (i, v) in local_u.iter_mut().enumerate() {
                    *v = self.present_solution.get(dofs[i]);
                }
                let mut local_p = [0.0; N_PRES_DOFS];
                for (i, v) in local_p.iter_mut().enumerate() {
                    *v = self.present_solution.get(dofs[N_VEL_DOFS + i]);
                }
                let properties = cell_property.get(cell);

                let local = assemble_local_cell(
                    fe,
                    &local_u,
                    &local_p,
                    properties,
                    &params,
                    assemble_system,
                );

                let mut acc = accumulator.lock().unwrap();
                if assemble_system {
                    let Accumulator { system, mass, rhs } = &mut *acc;
                    constraints.distribute_local_to_global(
                        &local.matrix,
                        &local.rhs,
                        dofs,
                        system,
                        rhs,
                    );
                    constraints.distribute_local_matrix(&local.mass, dofs, mass);
                } else {
                    constraints.distribute_local_rhs(&local.rhs, dofs, &mut acc.rhs);
                }
            },
        );

        let acc = accumulator.into_inner().unwrap();
        self.system_rhs = acc.rhs;
        if assemble_system {
            self.system_matrix = Some(Arc::new(BlockMatrix::from_triplets(
                n_u,
                n_p,
                &acc.system.into_triplets(),
            )));
            self.mass_matrix = Some(Arc::new(BlockMatrix::from_triplets(
                n_u,
                n_p,
                &acc.mass.into_triplets(),
            )));
        }
    }

    /// Solve the assembled system with FGMRES and the block Schur
    /// preconditioner; returns `(iterations, residual)`.
    ///
    /// The preconditioner is reconstructed when `assemble_system` is set
    /// (matrices were rebuilt) and reused otherwise. After the Krylov
    /// solve the chosen constraint set is re-applied to the increment,
    /// since floating-point solves satisfy constraints only to residual
    /// accuracy. Non-convergence is reported through the returned pair,
    /// never as an error.
    pub fn solve(
        &mut self,
        use_nonzero_constraints: bool,
        assemble_system: bool,
    ) -> Result<(usize, f64)> {
        let system = Arc::clone(
            self.system_matrix
                .as_ref()
                .expect("assemble must run before solve"),
        );
        if assemble_system || self.preconditioner.is_none() {
            let mass = Arc::clone(self.mass_matrix.as_ref().expect("mass matrix assembled"));
            let pc = BlockSchurPreconditioner::new(
                self.gamma,
                self.viscosity,
                self.rho,
                self.time.dt(),
                Arc::clone(&system),
                mass,
            )?;
            self.mass_schur = Some(pc.mass_schur());
            self.preconditioner = Some(pc);
        }

        let [n_u, n_p] = self.dof_handler.dofs_per_block();
        self.solution_increment.set_zero();

        let rhs_norm = self.system_rhs.l2_norm();
        let control = SolverControl {
            max_iter: self.config.max_iteration,
            tol: self.config.tolerance * rhs_norm.max(1e-300),
        };

        let b = self.system_rhs.to_flat();
        let mut x = vec![0.0; b.len()];
        let pc = self.preconditioner.as_ref().expect("preconditioner built");
        let info = fgmres(
            &SerialOps,
            |src, dst| {
                let sv = BlockVector::from_flat(src, n_u);
                let mut dv = BlockVector::zeros(n_u, n_p);
                system.vmult(&mut dv, &sv);
                dst.copy_from_slice(&dv.to_flat());
            },
            |src, dst| {
                let sv = BlockVector::from_flat(src, n_u);
                let mut dv = BlockVector::zeros(n_u, n_p);
                pc.vmult(&mut dv, &sv);
                dst.copy_from_slice(&dv.to_flat());
            },
            &b,
            &mut x,
            &control,
        );

        self.solution_increment = BlockVector::from_flat(&x, n_u);
        let constraints = if use_nonzero_constraints {
            &self.nonzero_constraints
        } else {
            &self.zero_constraints
        };
        constraints.distribute(&mut self.solution_increment);

        Ok((info.iterations, info.residual))
    }

    /// Advance the simulation by one time step.
    pub fn run_one_step(&mut self) -> Result<()> {
        self.time.increment();
        let step = self.time.step();

        // The first step has no operators to reuse and must impose the
        // true boundary values; afterwards the increments carry
        // homogeneous boundary data and the matrices persist until the
        // mesh changes.
        let use_nonzero = step == 1;
        let full_assembly = use_nonzero || self.mesh_changed;

        self.assemble(use_nonzero, full_assembly);
        let (iterations, residual) = self.solve(use_nonzero, full_assembly)?;
        self.mesh_changed = false;

        self.present_solution.add_assign(&self.solution_increment);
        info!(
            step,
            time = self.time.current(),
            iterations,
            residual,
            "fluid step"
        );

        if self.time.time_to_refine() {
            self.refine_mesh(self.config.min_refine_level, self.config.max_refine_level);
        }
        if self.time.time_to_output() {
            self.output_results();
        }
        Ok(())
    }

    /// Run the time-stepping loop to completion.
    pub fn run(&mut self) -> Result<()> {
        info!(
            n_active_cells = self.mesh.n_active_cells(),
            n_dofs = self.dof_handler.n_dofs(),
            "starting fluid simulation"
        );
        while !self.time.end_reached() {
            self.run_one_step()?;
        }
        Ok(())
    }

    /// Read-only snapshot of the current block solution.
    pub fn get_current_solution(&self) -> BlockVector {
        self.present_solution.clone()
    }

    /// The simulation clock.
    pub fn time(&self) -> &Time {
        &self.time
    }

    /// The computational mesh.
    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    /// The DoF enumeration.
    pub fn dof_handler(&self) -> &DofHandler {
        &self.dof_handler
    }

    /// The inhomogeneous constraint set (hanging nodes plus true boundary
    /// values).
    pub fn nonzero_constraints(&self) -> &Constraints {
        &self.nonzero_constraints
    }

    /// The explicit Schur approximation held since the last preconditioner
    /// reset, if any.
    pub fn mass_schur(&self) -> Option<&CsrMatrix> {
        self.mass_schur.as_deref()
    }

    /// Velocity of the present solution at an arbitrary point.
    pub fn sample_velocity(&self, p: &Point2) -> Option<Vec2> {
        let cell = self.mesh.locate_cell(p)?;
        let (local_u, _) = self.local_solution(cell);
        let (xi, eta) = self.mesh.reference_coords(cell, p);
        let n = shape::q2_values(xi, eta);
        let mut u = Vec2::zeros();
        for i in 0..N_Q2 {
            u[0] += n[i] * local_u[2 * i];
            u[1] += n[i] * local_u[2 * i + 1];
        }
        Some(u)
    }

    /// Adapt the mesh: flag by fixed fractions of the total error
    /// indicator, bound levels to `[min_level, max_level]`, and transfer
    /// the solution and the coupling cache onto the new mesh.
    pub fn refine_mesh(&mut self, min_level: u32, max_level: u32) {
        let indicators =
            estimate_velocity_jump_error(&self.mesh, &self.dof_handler, &self.present_solution);
        if !flag_fixed_fractions(
            &mut self.mesh,
            indicators,
            self.config.refine_fraction,
            self.config.coarsen_fraction,
        ) {
            return;
        }

        self.mesh.prepare_coarsening_and_refinement(min_level, max_level);

        let transfer = SolutionTransfer::prepare(
            &self.mesh,
            &self.dof_handler,
            &self.present_solution,
            &self.cell_property,
            N_GAUSS,
        );
        let map = self.mesh.execute_coarsening_and_refinement();
        if map.refined.is_empty() && map.coarsened.is_empty() {
            self.mesh.clear_flags();
            return;
        }

        self.setup_dofs();
        self.make_constraints();
        self.initialize_system();
        self.setup_cell_property();
        transfer.interpolate(
            &map,
            &self.mesh,
            &self.dof_handler,
            &mut self.present_solution,
            &mut self.cell_property,
            N_GAUSS,
        );
        self.nonzero_constraints.distribute(&mut self.present_solution);
        self.mesh_changed = true;
        info!(
            refined = map.refined.len(),
            coarsened = map.coarsened.len(),
            n_active_cells = self.mesh.n_active_cells(),
            n_dofs = self.dof_handler.n_dofs(),
            "mesh adapted"
        );
    }

    /// Report a step summary. File formats live outside the core; this
    /// hook logs the state the writers would consume.
    pub fn output_results(&self) {
        info!(
            step = self.time.step(),
            time = self.time.current(),
            n_active_cells = self.mesh.n_active_cells(),
            n_dofs = self.dof_handler.n_dofs(),
            "output"
        );
    }
}

/// Physical parameters threaded into the per-cell assembly.
pub(crate) struct AssemblyParams {
    pub viscosity: f64,
    pub rho: f64,
    pub gamma: f64,
    pub dt: f64,
    pub body_force: Vec2,
}

/// Local contributions of one cell.
pub(crate) struct LocalSystem {
    pub matrix: DMatrix<f64>,
    pub mass: DMatrix<f64>,
    pub rhs: [f64; N_CELL_DOFS],
}

/// Evaluate the IMEX weak form on one cell. `fe` must be reinitialized to
/// the cell. The left-hand side carries the viscous, mass, Grad-Div and
/// pressure-coupling terms and is symmetric; convection is evaluated from
/// the previous step's velocity and enters only the right-hand side. The
/// serial and distributed assemblies both run exactly this kernel.
pub(crate) fn assemble_local_cell(
    fe: &FeValues,
    local_u: &[f64; N_VEL_DOFS],
    local_p: &[f64; N_PRES_DOFS],
    properties: &[crate::cache::CellProperty],
    params: &AssemblyParams,
    assemble_system: bool,
) -> LocalSystem {
    let AssemblyParams {
        viscosity,
        rho,
        gamma,
        dt,
        body_force,
    } = *params;

    let mut local_matrix = DMatrix::<f64>::zeros(N_CELL_DOFS, N_CELL_DOFS);
    let mut local_mass = DMatrix::<f64>::zeros(N_CELL_DOFS, N_CELL_DOFS);
    let mut local_rhs = [0.0; N_CELL_DOFS];

    let mut phi_u = [Vec2::zeros(); N_VEL_DOFS];
    let mut grad_phi_u = [Tensor2::zeros(); N_VEL_DOFS];
    let mut div_phi_u = [0.0; N_VEL_DOFS];
    let mut phi_p = [0.0; N_PRES_DOFS];

    for q in 0..fe.n_q_points() {
        let jxw = fe.jxw(q);
        for node in 0..N_Q2 {
            let value = fe.q2_value(node, q);
            let grad = fe.q2_grad(node, q);
            for comp in 0..2 {
                let i = 2 * node + comp;
                phi_u[i] = Vec2::zeros();
                phi_u[i][comp] = value;
                grad_phi_u[i] = Tensor2::zeros();
                grad_phi_u[i][(comp, 0)] = grad[0];
                grad_phi_u[i][(comp, 1)] = grad[1];
                div_phi_u[i] = grad[comp];
            }
        }
        for (j, value) in phi_p.iter_mut().enumerate() {
            *value = fe.q1_value(j, q);
        }

        let u = fe.velocity_value(local_u, q);
        let grad_u = fe.velocity_gradient(local_u, q);
        let div_u = fe.velocity_divergence(local_u, q);
        let p = fe.pressure_value(local_p, q);
        let property = &properties[q];

        if assemble_system {
            for i in 0..N_CELL_DOFS {
                for j in 0..N_CELL_DOFS {
                    let mut value = 0.0;
                    let mut mass_value = 0.0;
                    if i < N_VEL_DOFS && j < N_VEL_DOFS {
                        value += viscosity * double_contract(&grad_phi_u[j], &grad_phi_u[i])
                            + rho / dt * phi_u[i].dot(&phi_u[j])
                            + gamma * rho * div_phi_u[i] * div_phi_u[j];
                        mass_value += phi_u[i].dot(&phi_u[j]);
                    } else if i < N_VEL_DOFS {
                        value -= div_phi_u[i] * phi_p[j - N_VEL_DOFS];
                    } else if j < N_VEL_DOFS {
                        value -= phi_p[i - N_VEL_DOFS] * div_phi_u[j];
                    } else {
                        mass_value += phi_p[i - N_VEL_DOFS] * phi_p[j - N_VEL_DOFS];
                    }
                    local_matrix[(i, j)] += value * jxw;
                    local_mass[(i, j)] += mass_value * jxw;
                }
            }
        }

        // Explicit terms: previous-step viscous, convection, pressure and
        // Grad-Div residuals, body force, and the FSI forcing on
        // artificial-fluid quadrature points.
        let convection = grad_u * u;
        for i in 0..N_CELL_DOFS {
            if i < N_VEL_DOFS {
                let mut value = -viscosity * double_contract(&grad_u, &grad_phi_u[i])
                    - rho * convection.dot(&phi_u[i])
                    + p * div_phi_u[i]
                    - gamma * rho * div_u * div_phi_u[i]
                    + rho * body_force.dot(&phi_u[i]);
                if property.indicator == 1 {
                    value += double_contract(&grad_phi_u[i], &property.fsi_stress)
                        + rho * property.fsi_acceleration.dot(&phi_u[i]);
                }
                local_rhs[i] += value * jxw;
            } else {
                local_rhs[i] += div_u * phi_p[i - N_VEL_DOFS] * jxw;
            }
        }
    }

    LocalSystem {
        matrix: local_matrix,
        mass: local_mass,
        rhs: local_rhs,
    }
}

/// Build the zero/nonzero constraint pair for a mesh: hanging-node
/// constraints on 1-irregular edges plus Dirichlet velocity values on the
/// colored boundaries. Both sets constrain the same DoFs; the zero set
/// replaces every boundary inhomogeneity with zero for increment solves.
pub(crate) fn build_constraint_sets(
    mesh: &Mesh,
    dof_handler: &DofHandler,
    boundary_values: &HashMap<u32, Box<dyn BoundaryFunction>>,
) -> (Constraints, Constraints) {
    let mut nonzero = Constraints::new();
    let mut zero = Constraints::new();

    add_hanging_node_constraints(mesh, dof_handler, &mut nonzero);
    add_hanging_node_constraints(mesh, dof_handler, &mut zero);

    // Dirichlet lines replace hanging lines on the same DoF.
    for cell in mesh.active_cells() {
        for (a, b) in mesh.cell_edges(cell) {
            let Some(color) = mesh.boundary_id(a, b) else {
                continue;
            };
            let Some(bv) = boundary_values.get(&color) else {
                continue;
            };
            let mid = (mesh.vertex(a) + mesh.vertex(b)) * 0.5;
            let nodes = [
                (dof_handler.vertex_q2_scalar(a), mesh.vertex(a)),
                (dof_handler.vertex_q2_scalar(b), mesh.vertex(b)),
                (dof_handler.edge_q2_scalar(edge_key(a, b)), mid),
            ];
            for (scalar, p) in nodes {
                let Some(scalar) = scalar else { continue };
                let value = bv.evaluate(&p);
                for comp in 0..2 {
                    let dof = dof_handler.velocity_dof(scalar, comp);
                    nonzero.constrain_dirichlet(dof, value[comp]);
                    zero.constrain_dirichlet(dof, 0.0);
                }
            }
        }
    }

    nonzero.close();
    zero.close();
    debug_assert_eq!(nonzero.constrained_dofs(), zero.constrained_dofs());
    (nonzero, zero)
}

/// Constrain fine DoFs on 1-irregular edges against the coarse edge: the
/// hanging vertex matches the coarse midside node, the fine midside nodes
/// interpolate the coarse edge quadratically, and the hanging pressure
/// vertex is the mean of the coarse endpoints.
fn add_hanging_node_constraints(
    mesh: &Mesh,
    dof_handler: &DofHandler,
    constraints: &mut Constraints,
) {
    let edges = mesh.active_edge_map();
    for cell in mesh.active_cells() {
        for (a, b) in mesh.cell_edges(cell) {
            let mid = (mesh.vertex(a) + mesh.vertex(b)) * 0.5;
            let Some(h) = mesh.find_vertex(&mid) else {
                continue;
            };
            let sub_lo = edge_key(a, h);
            let sub_hi = edge_key(h, b);
            if !edges.contains_key(&sub_lo) || !edges.contains_key(&sub_hi) {
                continue;
            }
            // This cell holds the coarse edge (a, b); the cells across it
            // are one level finer.
            let (Some(sa), Some(sb), Some(sm)) = (
                dof_handler.vertex_q2_scalar(a),
                dof_handler.vertex_q2_scalar(b),
                dof_handler.edge_q2_scalar(edge_key(a, b)),
            ) else {
                continue;
            };
            let (Some(sh), Some(sp1), Some(sp2)) = (
                dof_handler.vertex_q2_scalar(h),
                dof_handler.edge_q2_scalar(sub_lo),
                dof_handler.edge_q2_scalar(sub_hi),
            ) else {
                continue;
            };

            for comp in 0..2 {
                let dof = |s| dof_handler.velocity_dof(s, comp);
                // Hanging vertex sits at the coarse midside node.
                constraints.constrain_affine(dof(sh), vec![(dof(sm), 1.0)]);
                // Fine midside nodes at the quarter points of the coarse
                // edge: quadratic interpolation weights.
                constraints.constrain_affine(
                    dof(sp1),
                    vec![(dof(sa), 0.375), (dof(sm), 0.75), (dof(sb), -0.125)],
                );
                constraints.constrain_affine(
                    dof(sp2),
                    vec![(dof(sa), -0.125), (dof(sm), 0.75), (dof(sb), 0.375)],
                );
            }
            if let (Some(pa), Some(pb), Some(ph)) = (
                dof_handler.vertex_pressure_dof(a),
                dof_handler.vertex_pressure_dof(b),
                dof_handler.vertex_pressure_dof(h),
            ) {
                constraints.constrain_affine(ph, vec![(pa, 0.5), (pb, 0.5)]);
            }
        }
    }
}

/// Velocity gradient of a discrete solution at a point inside `cell`.
pub(crate) fn velocity_gradient_at(
    mesh: &Mesh,
    dof_handler: &DofHandler,
    solution: &BlockVector,
    cell: CellId,
    p: &Point2,
) -> Tensor2 {
    let dofs = dof_handler.cell_dofs(cell);
    let (xi, eta) = mesh.reference_coords(cell, p);
    let grads = shape::q2_gradients(xi, eta);
    let v = mesh.cell_vertices(cell);
    let scale_x = 2.0 / (v[1][0] - v[0][0]);
    let scale_y = 2.0 / (v[3][1] - v[0][1]);
    let mut grad = Tensor2::zeros();
    for i in 0..N_Q2 {
        let gx = grads[i][0] * scale_x;
        let gy = grads[i][1] * scale_y;
        grad[(0, 0)] += solution.get(dofs[2 * i]) * gx;
        grad[(0, 1)] += solution.get(dofs[2 * i]) * gy;
        grad[(1, 0)] += solution.get(dofs[2 * i + 1]) * gx;
        grad[(1, 1)] += solution.get(dofs[2 * i + 1]) * gy;
    }
    grad
}

/// Jump-of-gradient error indicator: for each active cell, the squared
/// indicator accumulates `h_e * ||[grad u]||_F^2` over its edges, with the
/// jump evaluated at the edge midpoint against the neighbor across it.
/// Boundary edges contribute nothing. Deterministic, so replicated
/// evaluations (the distributed variant) reach identical flags.
pub(crate) fn estimate_velocity_jump_error(
    mesh: &Mesh,
    dof_handler: &DofHandler,
    solution: &BlockVector,
) -> Vec<(CellId, f64)> {
    let outward = [
        Vec2::new(0.0, -1.0),
        Vec2::new(1.0, 0.0),
        Vec2::new(0.0, 1.0),
        Vec2::new(-1.0, 0.0),
    ];
    let mut indicators = Vec::new();
    for cell in mesh.active_cells() {
        let h = mesh.cell_diameter(cell);
        let mut eta_sq = 0.0;
        for (e, (a, b)) in mesh.cell_edges(cell).into_iter().enumerate() {
            let mid = (mesh.vertex(a) + mesh.vertex(b)) * 0.5;
            let probe = mid + outward[e] * (1e-6 * h);
            let Some(neighbor) = mesh.locate_cell(&probe) else {
                continue;
            };
            if neighbor == cell {
                continue;
            }
            let jump = velocity_gradient_at(mesh, dof_handler, solution, cell, &mid)
                - velocity_gradient_at(mesh, dof_handler, solution, neighbor, &mid);
            let edge_len = (mesh.vertex(b) - mesh.vertex(a)).norm();
            eta_sq += edge_len * double_contract(&jump, &jump);
        }
        indicators.push((cell, eta_sq.sqrt()));
    }
    indicators
}

/// Flag cells whose indicators account for the given fractions of the
/// total error: the largest for refinement, the smallest for coarsening.
/// Returns false when there is nothing to flag.
pub(crate) fn flag_fixed_fractions(
    mesh: &mut Mesh,
    mut indicators: Vec<(CellId, f64)>,
    refine_fraction: f64,
    coarsen_fraction: f64,
) -> bool {
    let total: f64 = indicators.iter().map(|(_, e)| e).sum();
    if total <= 0.0 {
        return false;
    }
    indicators.sort_by(|a, b| b.1.partial_cmp(&a.1).expect("finite indicators"));

    let mut accumulated = 0.0;
    for &(cell, eta) in &indicators {
        if accumulated >= refine_fraction * total {
            break;
        }
        mesh.set_refine_flag(cell);
        accumulated += eta;
    }
    let mut accumulated = 0.0;
    for &(cell, eta) in indicators.iter().rev() {
        if accumulated >= coarsen_fraction * total {
            break;
        }
        mesh.set_coarsen_flag(cell);
        accumulated += eta;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::{Constant, ParabolicInflow};
    use approx::assert_relative_eq;

    fn channel_config() -> SimulationConfig {
        SimulationConfig {
            viscosity: 1.0,
            rho: 1.0,
            gamma: 1.0,
            dt: 0.1,
            end_time: 10.0,
            tolerance: 1e-10,
            max_iteration: 500,
            ..Default::default()
        }
    }

    fn channel_boundaries(u_max: f64, height: f64) -> HashMap<u32, Box<dyn BoundaryFunction>> {
        let mut bv: HashMap<u32, Box<dyn BoundaryFunction>> = HashMap::new();
        bv.insert(0, Box::new(ParabolicInflow::new(u_max, height)));
        bv.insert(2, Box::new(Constant::zero()));
        bv.insert(3, Box::new(Constant::zero()));
        bv
    }

    fn channel_solver(nx: usize, ny: usize) -> InsImex {
        let mesh = Mesh::rectangle(nx, ny, Point2::new(0.0, 0.0), Point2::new(2.0, 1.0)).unwrap();
        InsImex::new(mesh, &channel_config(), channel_boundaries(1.0, 1.0)).unwrap()
    }

    #[test]
    fn test_system_matrix_is_symmetric() {
        let mut solver = channel_solver(2, 2);
        solver.assemble(true, true);
        let matrix = solver.system_matrix.as_ref().unwrap();
        let n = solver.dof_handler.n_dofs();
        for i in 0..n {
            for j in (i + 1)..n {
                let a = matrix.get(i, j);
                let b = matrix.get(j, i);
                let scale = a.abs().max(b.abs()).max(1.0);
                assert!(
                    ((a - b) / scale).abs() < 1e-12,
                    "asymmetry at ({}, {}): {} vs {}",
                    i,
                    j,
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn test_constraints_satisfied_after_steps() {
        let mut solver = channel_solver(4, 2);
        for _ in 0..2 {
            solver.run_one_step().unwrap();
        }
        let solution = solver.get_current_solution();
        let constraints = solver.nonzero_constraints();
        for dof in constraints.constrained_dofs() {
            let line = constraints.line(dof).unwrap();
            if line.entries.is_empty() {
                assert_relative_eq!(
                    solution.get(dof),
                    line.inhomogeneity,
                    epsilon = 1e-8,
                    max_relative = 1e-8
                );
            }
        }
    }

    #[test]
    fn test_solve_is_idempotent_without_reassembly() {
        let mut solver = channel_solver(3, 2);
        solver.assemble(true, true);
        let first = solver.solve(true, true).unwrap();
        let second = solver.solve(true, false).unwrap();
        assert_eq!(first.0, second.0);
        assert_relative_eq!(first.1, second.1, epsilon = 0.0);
        // The Schur buffer survives the reuse path
        assert!(solver.mass_schur().is_some());
    }

    #[test]
    fn test_zero_max_iteration_reports_initial_residual() {
        let mesh = Mesh::rectangle(2, 2, Point2::new(0.0, 0.0), Point2::new(2.0, 1.0)).unwrap();
        let config = SimulationConfig {
            max_iteration: 0,
            ..channel_config()
        };
        let mut solver = InsImex::new(mesh, &config, channel_boundaries(1.0, 1.0)).unwrap();
        solver.assemble(true, true);
        let (iterations, residual) = solver.solve(true, true).unwrap();
        assert_eq!(iterations, 0);
        let rhs_norm = solver.system_rhs.l2_norm();
        assert_relative_eq!(residual, rhs_norm, epsilon = 1e-12);
    }

    #[test]
    fn test_fsi_forcing_enters_rhs_only_when_indicated() {
        let mut solver = channel_solver(2, 1);
        solver.assemble(true, true);
        let baseline = solver.system_rhs.clone();

        // Write a forcing record without raising the indicator: no change.
        let cell = solver.mesh.active_cells()[0];
        for record in solver.cell_property.get_mut(cell) {
            record.fsi_acceleration = Vec2::new(1.0, 0.0);
        }
        solver.assemble(true, true);
        for i in 0..baseline.len() {
            assert_relative_eq!(solver.system_rhs.get(i), baseline.get(i), epsilon = 1e-12);
        }

        // Raising the indicator activates the forcing.
        for record in solver.cell_property.get_mut(cell) {
            record.indicator = 1;
        }
        solver.assemble(true, true);
        let diff: f64 = (0..baseline.len())
            .map(|i| (solver.system_rhs.get(i) - baseline.get(i)).abs())
            .sum();
        assert!(diff > 1e-8, "indicator-gated forcing had no effect");
    }

    #[test]
    fn test_poiseuille_channel_reaches_steady_profile() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let mut solver = channel_solver(8, 4);

        let mut previous = solver.get_current_solution();
        let mut converged = false;
        for _ in 0..60 {
            solver.run_one_step().unwrap();
            let current = solver.get_current_solution();
            let mut diff = current.clone();
            for i in 0..diff.len() {
                diff.set(i, diff.get(i) - previous.get(i));
            }
            if diff.l2_norm() < 1e-8 {
                converged = true;
                previous = current;
                break;
            }
            previous = current;
        }
        assert!(converged, "channel flow did not reach a steady state");

        // Centerline velocity within 1% of the analytic Poiseuille maximum
        let center = solver.sample_velocity(&Point2::new(1.0, 0.5)).unwrap();
        assert!(
            (center[0] - 1.0).abs() < 0.01,
            "centerline velocity {} deviates from 1.0",
            center[0]
        );
        assert!(center[1].abs() < 1e-6);

        // The whole profile is parabolic
        let quarter = solver.sample_velocity(&Point2::new(1.5, 0.25)).unwrap();
        assert!((quarter[0] - 0.75).abs() < 0.01);
    }

    #[test]
    fn test_adaptive_run_keeps_constraints() {
        let mesh = Mesh::rectangle(4, 2, Point2::new(0.0, 0.0), Point2::new(2.0, 1.0)).unwrap();
        let config = SimulationConfig {
            refinement_interval: 2,
            max_refine_level: 1,
            ..channel_config()
        };
        let mut solver = InsImex::new(mesh, &config, channel_boundaries(1.0, 1.0)).unwrap();
        for _ in 0..5 {
            solver.run_one_step().unwrap();
        }
        // Refinement happened and the solution still satisfies the BCs
        let solution = solver.get_current_solution();
        let constraints = solver.nonzero_constraints();
        for dof in constraints.constrained_dofs() {
            let line = constraints.line(dof).unwrap();
            if line.entries.is_empty() {
                assert_relative_eq!(
                    solution.get(dof),
                    line.inhomogeneity,
                    epsilon = 1e-6,
                    max_relative = 1e-6
                );
            }
        }
        // Every active cell has cache records after the transfers
        for cell in solver.mesh().active_cells() {
            assert_eq!(solver.cell_property.get(cell).len(), N_Q_POINTS);
        }
    }
}
