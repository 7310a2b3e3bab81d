//! Perimeter - device abstraction and response coordination
//!
//! This crate provides the perimeter-security device layer:
//! - Device sessions for PTZ cameras and acoustic hailing devices
//! - The device registry and presence publishing
//! - The response coordinator for multi-device plans
//! - Analytics bridging onto the shared event bus
//! - Project configuration loading

// Re-export the service runtime
pub use perimeter_runtime;

// Device sessions, protocol adapters and transports
pub mod devices;

// Device registry
pub mod registry;

// Response coordinator
pub mod coordinator;

// Analytics and alert bridging
pub mod analytics;

// Project management
pub mod project;
