//! HTTP service that compiles uploaded LaTeX sources to PDF with tectonic.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
