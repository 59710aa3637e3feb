//! Application services coordinating domain and infrastructure.

pub mod compile;
pub mod error;
