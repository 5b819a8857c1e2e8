//! Command line interface: the `quiver start` launcher.

pub mod args;
pub mod commands;

pub use args::*;
pub use commands::*;
