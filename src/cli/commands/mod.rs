//! Command implementations for the CLI.
//!
//! Each command returns the process exit code.

pub mod init;
pub mod watch;
