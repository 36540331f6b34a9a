//! BlueZ adapter identity and connection lifecycle management for
//! Nintendo Switch controller emulation.
//!
//! The Switch pins a controller's identity to its Bluetooth hardware
//! address and expects a fully automatic pairing handshake. This crate
//! makes a stock BlueZ stack behave like that kind of accessory:
//!
//! - [`BluetoothAdapter`] owns one adapter: property access, hardware
//!   address spoofing, device class control, clean-mode service hygiene
//!   and the discovery/pairing/connection orchestration built on it.
//! - [`PairingAgent`] answers every pairing and authorization prompt
//!   automatically so no human confirmation is ever required.
//! - [`ConnectionStateStore`] persists the identity needed to reconnect
//!   to a remembered console across process restarts and adapter
//!   resets.
//! - [`BusSession`] is the explicitly constructed bus connection the
//!   rest of the crate operates on, with generic lookup of managed
//!   objects.
//!
//! The HID report protocol, macro engine and any user-facing frontends
//! are external collaborators; this crate only knows about adapters,
//! remote peers, identity and connection state.
//!
//! One instance holds one logical bus connection and provides no
//! internal locking: callers needing concurrency hold an external mutex
//! around all calls, or build one instance per context.

pub mod adapter;
pub mod agent;
pub mod bus;
pub mod discovery;
pub mod error;
pub mod state;
mod tools;

pub use adapter::{replace_mac_addresses, BluetoothAdapter};
pub use agent::{PairingAgent, AGENT_PATH};
pub use bus::{BusSession, ADAPTER_INTERFACE, DEVICE_INTERFACE, SERVICE_NAME};
pub use discovery::{disconnect_devices_by_alias, find_devices_by_alias, DeviceProps};
pub use error::{Error, Result};
pub use state::{AdapterRecord, ConnectionState, ConnectionStateStore};
pub use tools::random_controller_mac;
