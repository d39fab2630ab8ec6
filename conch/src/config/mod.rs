//! Project configuration
//!
//! `conch.toml` declares the app and the dev processes `conch dev` runs.

mod conch_toml;
mod error;

pub use conch_toml::*;
pub use error::{ConfigError, Result};
