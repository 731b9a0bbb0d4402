//! Library side of the `olm` command: argument definitions and logging.

pub mod cli;
pub mod logging;
