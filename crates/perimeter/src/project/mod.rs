//! Project Management
//!
//! Loads the static site configuration: the project manifest and one file
//! per physical device.

mod config;
mod loader;

pub use config::*;
pub use loader::*;
