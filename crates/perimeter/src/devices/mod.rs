//! Devices
//!
//! Every controllable device is reached through a [`DeviceSession`], which
//! exposes one positioning/action surface and translates it into the
//! device's own wire dialect.

pub mod geometry;
mod protocol;
mod session;
mod transport;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use protocol::*;
pub use session::*;
pub use transport::*;
pub use types::*;
