//! Bluetooth link and L2CAP channel management.
//!
//! The manager is generic over [`platform::BluetoothPlatform`]; the BlueZ
//! binding lives in [`bluez`].

pub mod bluez;
pub mod connection;
pub mod exchange;
pub mod l2cap;
pub mod manager;
pub mod platform;
pub mod pump;

#[cfg(test)]
pub(crate) mod mock;
