//! Connectivity orchestration for Linux desktops.
//!
//! Bluetooth and Wi-Fi adapter control on top of BlueZ, `bluetoothctl` and
//! `nmcli`, with audio routing through `pactl` that follows Bluetooth
//! devices as they connect and disconnect.

pub mod audio;
pub mod bluetooth;
pub mod cache;
pub mod command;
pub mod config;
pub mod dbus;
pub mod error;
pub mod event;
pub mod model;
pub mod notify;
pub mod parser;
pub mod retry;
pub mod service;
