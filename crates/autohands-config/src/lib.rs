//! # AutoHands Config
//!
//! TOML configuration loading shared by the supervisor crates.
//!
//! Any `serde` schema can be loaded; `${VAR}` references are substituted from
//! the environment before parsing.

mod error;
mod loader;

pub use error::ConfigError;
pub use loader::ConfigLoader;
