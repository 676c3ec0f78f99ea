//! # bluez-core — a device cache and connection manager for BlueZ
//!
//! This crate mediates between a host application and the local Bluetooth
//! daemon (BlueZ) over the D-Bus system bus. It hides the asynchronous,
//! signal-driven, object-path-oriented nature of the bus behind a small,
//! stable API: device discovery, connection, pairing, trust.
//!
//! The crate is built around two long-lived objects:
//!
//! * [`DeviceManager`] owns a concurrency-safe cache of remote device state,
//!   fed by a background [`Dispatcher`] thread that turns bus signals into
//!   cache mutations and host callbacks.
//! * [`ConnectionManager`] issues `Connect`/`Disconnect`/`Pair`/`Trust`/
//!   `Block`/`Unpair` against a device's object path and tracks a small
//!   per-device connection state machine.
//!
//! Both share one [`BusClient`], so match rules are installed once and
//! every signal is delivered exactly once no matter how many managers a
//! host constructs.
//!
//! GATT/profile I/O, audio routing, interactive pairing agents, and BLE
//! advertising are out of scope — see the module-level docs of
//! [`device_manager`] and [`connection_manager`] for what is and is not
//! covered.

mod address;
mod bus;
mod callbacks;
mod config;
mod connection_manager;
mod device;
mod device_manager;
mod dispatcher;
mod event;
mod properties;

pub use address::{address_of, path_of, Address, InvalidAddress};
pub use bus::BusClient;
pub use callbacks::{ConnectionSink, DiscoverySink};
pub use config::{ConnectionManagerConfig, ConnectionState, DeviceManagerConfig};
pub use connection_manager::ConnectionManager;
pub use device::{Device, DeviceKind};
pub use device_manager::DeviceManager;
pub use properties::{PropertyMap, PropertyValue};

/// Well-known bus destination for the Bluetooth daemon.
pub(crate) const SERVICE_NAME: &str = "org.bluez";
/// Standard object-manager interface, queried once at startup for adapter selection
/// and again for connection-manager path resolution.
pub(crate) const OBJECT_MANAGER_INTERFACE: &str = "org.freedesktop.DBus.ObjectManager";
/// `org.bluez.Adapter1`.
pub(crate) const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
/// `org.bluez.Device1`.
pub(crate) const DEVICE_INTERFACE: &str = "org.bluez.Device1";
/// `org.freedesktop.DBus.Properties`.
pub(crate) const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Closed taxonomy of everything that can go wrong talking to BlueZ.
///
/// Every public API call returns exactly one of these kinds; the
/// Dispatcher thread never propagates an error this way — it reports
/// through [`DiscoverySink::on_error`] and keeps running.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required input was null, empty, or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// An internal allocation failed.
    #[error("allocation failed")]
    OutOfMemory,
    /// The bus reported a transport or protocol failure.
    #[error("D-Bus transport error: {0}")]
    Bus(#[from] dbus::Error),
    /// The bus call returned an error reply from the Bluetooth daemon.
    #[error("BlueZ reported {name}: {message}")]
    Daemon {
        /// The daemon's `org.bluez.Error.*` name, e.g. `org.bluez.Error.Failed`.
        name: String,
        /// The daemon's human-readable error message, if any.
        message: String,
    },
    /// The Dispatcher thread failed to start.
    #[error("dispatcher thread failed to start: {0}")]
    Thread(String),
    /// A match rule could not be installed or a signal could not be parsed.
    #[error("IPC error: {0}")]
    Ipc(String),
    /// An operation referenced an address not present in the cache.
    #[error("no device known for address {0}")]
    NoDevice(String),
    /// `Connect`/`Disconnect` returned an error reply or timed out.
    #[error("connection operation failed: {0}")]
    ConnectionFailed(String),
    /// `Pair` returned an error reply or timed out.
    #[error("pairing failed: {0}")]
    PairingFailed(String),
}

impl Error {
    pub(crate) fn daemon(name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Daemon { name: name.into(), message: message.into() }
    }
}

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;
