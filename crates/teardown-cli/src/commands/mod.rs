//! CLI commands

pub mod destroy;
