//! Command handlers

pub mod config;
pub mod diagram;
pub mod finding;
pub mod init;
pub mod project;
pub mod serve;
pub mod status;
pub mod sync;
pub mod thread;
