// homestak-cli: clap command tree, logging init, result output.

pub mod commands;
pub mod logging;
pub mod output;

pub use commands::run;
