//! Perimeter Runtime - service lifecycle and the shared event bus
//!
//! Long-running components of the perimeter platform (presence publishing,
//! analytics bridging) run as [`service::Service`]s under a
//! [`service::ServiceManager`], and everything that needs to tell the rest of
//! the platform about a device publishes an [`service::Event`] on its bus.

pub mod service;

pub use service::{Event, EventPublisher, Service, ServiceContext, ServiceManager, ServiceSpec};
