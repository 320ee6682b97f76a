//! Command implementations

pub mod cache;
pub mod completions;
pub mod context;
pub mod resolve;
pub mod why;
