//! Common utilities for integration tests

pub mod cli;
pub mod project;

pub use project::TestProject;
