//! IFSI Core - Immersed Fluid-Structure Interaction solver framework
//!
//! Incompressible Navier-Stokes solver with an implicit-explicit (IMEX)
//! time scheme, built for partitioned fluid-structure interaction:
//! - Taylor-Hood (Q2/Q1) finite elements on adaptively refined
//!   quadrilateral meshes
//! - Block saddle-point assembly with zero/nonzero constraint sets
//! - FGMRES outer solver with a block Schur-complement preconditioner
//! - Per-cell coupling cache carrying artificial-fluid indicators and
//!   FSI forcing terms between fluid and solid solves
//! - A thread-SPMD distributed variant with partitioned ownership
//!
//! # Architecture
//!
//! The solver is designed around these core abstractions:
//!
//! - [`Mesh`]: quadrilateral cell forest with stable cell identities
//!   across refinement
//! - [`DofHandler`]: block-wise (velocity, pressure) DoF enumeration
//! - [`Constraints`]: Dirichlet and hanging-node constraint sets
//! - [`InsImex`]: the IMEX fluid solver and its time-stepping loop
//! - [`CellDataStorage`]: the per-cell coupling cache written by FSI
//!   drivers and read during assembly

pub mod boundary;
pub mod cache;
pub mod config;
pub mod constraints;
pub mod coupling;
pub mod distributed;
pub mod dofs;
pub mod error;
pub mod fe;
pub mod fluid;
pub mod krylov;
pub mod mesh;
pub mod preconditioner;
pub mod sparse;
pub mod time;
pub mod transfer;
pub mod types;

pub use boundary::{BoundaryFunction, Constant, ParabolicInflow};
pub use cache::{CellDataStorage, CellProperty};
pub use config::SimulationConfig;
pub use constraints::Constraints;
pub use coupling::FsiExchange;
pub use dofs::DofHandler;
pub use error::{Error, Result};
pub use fluid::InsImex;
pub use mesh::{CellId, Mesh};
pub use sparse::{BlockMatrix, BlockVector};
pub use time::Time;
