// src/config/mod.rs

//! Engine configuration loaded from a TOML file.

pub mod loader;
pub mod model;

pub use loader::{load_and_validate, load_from_path};
pub use model::{EngineConfig, RawEngineConfig};
