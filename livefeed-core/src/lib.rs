pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod failover;
pub mod graph;
pub mod hotswap;
pub mod klv;
pub mod linker;
pub mod logging;
pub mod peer;
pub mod probe;
pub mod session;
pub mod types;

#[cfg(test)]
pub mod test_helpers;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
pub use types::{SourceBranch, SourceConfig, SourceSpec, ViewerId};
