//! Utility functions and helpers.

pub mod fs;
pub mod http;
pub mod log;
