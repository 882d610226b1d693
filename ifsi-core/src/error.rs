//! Error types for IFSI operations.

use thiserror::Error;

/// Result type alias using the IFSI Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during IFSI operations.
///
/// Linear-solver *non-convergence* is intentionally not represented here:
/// solves report `(iterations, residual)` and the caller decides whether to
/// abort. Cache lookups for cells that were never initialized are
/// programming-invariant violations and panic instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration or precondition violations (fatal at startup).
    #[error("configuration error: {0}")]
    Config(String),

    /// Mesh-related errors.
    #[error("mesh error: {0}")]
    Mesh(String),

    /// DoF enumeration or constraint errors.
    #[error("dof error: {0}")]
    Dofs(String),

    /// Assembly errors.
    #[error("assembly error: {0}")]
    Assembly(String),

    /// Hard solver failures (setup, size mismatches).
    #[error("solver error: {0}")]
    Solver(String),

    /// Matrix singularity or failed factorization.
    #[error("singular matrix: {0}")]
    SingularMatrix(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
