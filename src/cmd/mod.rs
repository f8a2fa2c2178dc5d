//! Command-line entry points.

pub mod recognize;
pub mod title;
