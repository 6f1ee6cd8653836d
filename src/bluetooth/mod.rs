//! Bluetooth orchestration over the BlueZ daemon.
//!
//! [`bus`] wraps the daemon's D-Bus objects; [`manager`] builds device
//! connection and audio routing workflows on top.

pub mod bus;
pub mod manager;
