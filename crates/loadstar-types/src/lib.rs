//! Shared Loadstar model and error types.
//!
//! No I/O lives here: the state and engine crates both depend on these
//! types without depending on each other.

pub mod error;
pub mod mode;
pub mod record;
pub mod state;
