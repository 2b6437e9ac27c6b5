//! Dense matrix collaborator used by the autograd engine
//!
//! The engine only relies on clone, zeros/ones-like, add-in-place and shape
//! queries; the element-wise helpers exist for the illustrative functions.

pub mod core;
pub mod ops;

// Re-export main types for convenience
pub use self::core::{Matrix, Shape};
