//! relay-core: shared vocabulary for relaygrid.
//!
//! Job definitions and their validation rules, the worker identity used
//! to key supervisor records and cursors, duration parsing, and the
//! `relay.toml` configuration model.

pub mod config;
pub mod duration;
pub mod error;
pub mod types;

pub use config::{RelayConfig, ZombieScope};
pub use duration::{human_age, parse_duration};
pub use error::ConfigError;
pub use types::*;
