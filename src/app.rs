//! Usage: Process-level concerns shared by embedders (logging setup).

pub mod logging;
