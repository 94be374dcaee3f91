//! Common error types for peer mesh components.

use thiserror::Error;

/// Errors shared by every crate in the workspace.
#[derive(Error, Debug)]
pub enum MeshCommonError {
    /// An identifier was empty or otherwise unusable.
    #[error("Invalid identifier: {0}")]
    InvalidId(String),
}

/// Result type alias using `MeshCommonError`
pub type Result<T> = std::result::Result<T, MeshCommonError>;
