//! In-memory monitoring state.

mod failure;

pub use failure::*;
