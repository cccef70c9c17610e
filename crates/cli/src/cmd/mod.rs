//! CLI command implementations

pub mod config;
pub mod export;
pub mod gc;
pub mod history;
pub mod init;
pub mod rollback;
pub mod scan;
pub mod show;
pub mod status;
