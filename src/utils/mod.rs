//! Pure utility functions.
//!
//! Stateless helpers plus the clock abstraction used across the crate.

pub mod bootstrap;
pub mod clock;
pub mod retry;
