//! Common utilities for ustick-copy
//!
//! This crate provides the pieces shared between the system manager and
//! the per-stick workers: device identity types, the port identity
//! resolver, error handling, logging setup, and the two channel bridges
//! (device event queue, status relay).

pub mod channel;
pub mod device;
pub mod error;
pub mod logging;
pub mod port;

pub use channel::{
    DeviceEvent, EventSink, StatusMessage, StatusTag, create_event_queue, create_status_relay,
};
pub use device::DeviceInfo;
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use port::{PortTree, port_id, port_name};
