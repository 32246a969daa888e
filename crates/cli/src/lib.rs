//! uiflow CLI
//!
//! Command-line interface for running, validating and listing scenarios.

pub mod args;
pub mod commands;
pub mod output;
