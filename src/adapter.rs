//! Adapter identity control.
//!
//! Owns one physical adapter: property access over the bus, hardware
//! address spoofing, device class control, clean-mode service hygiene
//! and the pairing agent lifecycle. One instance holds one logical bus
//! connection and is not safe for concurrent use; callers serialize
//! access or build one instance per context.

use std::collections::HashMap;

use tracing::{debug, warn};
use zbus::proxy::CacheProperties;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, Value};

use crate::agent::AgentHandle;
use crate::bus::{
    Adapter1Proxy, BusSession, Device1Proxy, ProfileManager1Proxy, ADAPTER_INTERFACE, SERVICE_NAME,
};
use crate::error::{Error, Result};
use crate::state::{adapter_id, ConnectionStateStore};
use crate::tools;

/// Identity and lifecycle controller for one Bluetooth adapter.
pub struct BluetoothAdapter {
    session: BusSession,
    adapter_path: OwnedObjectPath,
    adapter_id: String,
    adapter: Adapter1Proxy<'static>,
    profile_manager: ProfileManager1Proxy<'static>,
    original_address: String,
    agent: AgentHandle,
    store: ConnectionStateStore,
}

impl BluetoothAdapter {
    /// Binds to the adapter at `adapter_path`, or to the first usable
    /// adapter when no path is given or the given one does not exist.
    ///
    /// Captures the adapter's hardware address and registers the
    /// always-accept pairing agent as the bus default.
    pub async fn new(adapter_path: Option<&str>) -> Result<Self> {
        let session = BusSession::system().await?;
        Self::with_session(session, adapter_path).await
    }

    /// Same as [`new`](Self::new), over a caller-constructed session.
    /// The session is owned for the lifetime of this instance.
    pub async fn with_session(session: BusSession, adapter_path: Option<&str>) -> Result<Self> {
        let resolved = match adapter_path {
            Some(path) => {
                session
                    .find_object_path(SERVICE_NAME, ADAPTER_INTERFACE, Some(path))
                    .await?
            }
            None => None,
        };
        let resolved = match resolved {
            Some(path) => Some(path),
            None => {
                session
                    .find_object_path(SERVICE_NAME, ADAPTER_INTERFACE, None)
                    .await?
            }
        };
        let adapter_path = resolved.ok_or(Error::NoAdapterFound)?;
        let id = adapter_id(adapter_path.as_str()).to_owned();
        debug!("using adapter under object path {}", adapter_path.as_str());

        let adapter = build_adapter_proxy(&session, adapter_path.clone()).await?;
        let profile_manager = ProfileManager1Proxy::new(session.connection()).await?;
        let original_address = adapter.address().await?.to_uppercase();

        let mut controller = Self {
            session,
            adapter_path,
            adapter_id: id,
            adapter,
            profile_manager,
            original_address,
            agent: AgentHandle::new(),
            store: ConnectionStateStore::new(),
        };
        controller
            .agent
            .register(controller.session.connection())
            .await?;
        Ok(controller)
    }

    /// Bus object path of the adapter.
    pub fn adapter_path(&self) -> &str {
        self.adapter_path.as_str()
    }

    /// Short identifier (`hci0`, ...) used as the persistence key.
    pub fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    /// Session this controller operates on.
    pub fn session(&self) -> &BusSession {
        &self.session
    }

    /// Hardware address captured when this controller was constructed.
    /// Never recomputed, so it survives any later spoofing.
    pub fn original_address(&self) -> &str {
        &self.original_address
    }

    /// Whether the pairing agent currently holds a registration.
    pub fn agent_registered(&self) -> bool {
        self.agent.is_registered()
    }

    /// Current adapter address, read live from the stack.
    pub async fn address(&self) -> Result<String> {
        Ok(self.adapter.address().await?.to_uppercase())
    }

    /// Rewrites the adapter's hardware address.
    ///
    /// BlueZ exposes no identity-rewrite API, so this issues the vendor
    /// command through `hcitool` and resets the adapter so the link
    /// controller picks up the new address.
    pub async fn set_address(&self, mac: &str) -> Result<()> {
        tools::set_adapter_address(&self.adapter_id, mac).await?;
        debug!("set adapter address to {}", mac);
        Ok(())
    }

    pub async fn name(&self) -> Result<String> {
        Ok(self.adapter.name().await?)
    }

    /// Forwards a name write to the stack. Most daemons derive the name
    /// from the alias and reject direct writes.
    pub async fn set_name(&self, value: &str) -> Result<()> {
        Ok(self.adapter.set_name(value).await?)
    }

    /// Friendly name presented to remote peers.
    pub async fn alias(&self) -> Result<String> {
        Ok(self.adapter.alias().await?)
    }

    /// Sets the alias. The stack applies it asynchronously; allow a
    /// moment before reading it back.
    pub async fn set_alias(&self, value: &str) -> Result<()> {
        Ok(self.adapter.set_alias(value).await?)
    }

    pub async fn pairable(&self) -> Result<bool> {
        Ok(self.adapter.pairable().await?)
    }

    pub async fn set_pairable(&self, value: bool) -> Result<()> {
        Ok(self.adapter.set_pairable(value).await?)
    }

    /// Seconds the adapter stays pairable; zero means no timeout.
    pub async fn pairable_timeout(&self) -> Result<u32> {
        Ok(self.adapter.pairable_timeout().await?)
    }

    pub async fn set_pairable_timeout(&self, value: u32) -> Result<()> {
        Ok(self.adapter.set_pairable_timeout(value).await?)
    }

    pub async fn discoverable(&self) -> Result<bool> {
        Ok(self.adapter.discoverable().await?)
    }

    pub async fn set_discoverable(&self, value: bool) -> Result<()> {
        Ok(self.adapter.set_discoverable(value).await?)
    }

    /// Seconds the adapter stays discoverable; zero means no timeout.
    pub async fn discoverable_timeout(&self) -> Result<u32> {
        Ok(self.adapter.discoverable_timeout().await?)
    }

    pub async fn set_discoverable_timeout(&self, value: u32) -> Result<()> {
        Ok(self.adapter.set_discoverable_timeout(value).await?)
    }

    pub async fn powered(&self) -> Result<bool> {
        Ok(self.adapter.powered().await?)
    }

    pub async fn set_powered(&self, value: bool) -> Result<()> {
        Ok(self.adapter.set_powered(value).await?)
    }

    /// Bluetooth device class, read through `hciconfig` so the value
    /// matches what the setter committed.
    pub async fn device_class(&self) -> Result<String> {
        tools::read_device_class(&self.adapter_id).await
    }

    /// Sets the Bluetooth device class (what kind of device the adapter
    /// reports as, e.g. a gamepad).
    ///
    /// The stack does not commit class changes reliably over the bus,
    /// so this goes through `hciconfig` and therefore needs root.
    pub async fn set_device_class(&self, device_class: &str) -> Result<()> {
        if !tools::is_superuser() {
            return Err(Error::PermissionDenied {
                operation: "setting the device class",
            });
        }
        let digits = device_class.strip_prefix("0x").unwrap_or(device_class);
        if device_class.len() != 8 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidArgument(format!(
                "device class must be an 8 character hex string, got {device_class:?}"
            )));
        }
        tools::write_device_class(&self.adapter_id, device_class).await
    }

    /// Restores the address the console saw during the last successful
    /// connection.
    ///
    /// The Switch only accepts reconnections from the exact address it
    /// paired with, so this must run before any reconnection attempt
    /// that follows a process restart or adapter reset. Returns `true`
    /// when the adapter identity is ready for reconnection.
    pub async fn prepare_for_reconnect(&self, switch_address: Option<&str>) -> Result<bool> {
        let stored = self.store.controller_mac(self.adapter_path.as_str());
        let current = self.address().await?;
        match reconnect_action(stored, &current) {
            ReconnectAction::NoStoredMac => {
                debug!("no stored controller address for this adapter");
                Ok(false)
            }
            ReconnectAction::AlreadyMatching => {
                debug!("adapter address already matches stored value {}", current);
                Ok(true)
            }
            ReconnectAction::Spoof(mac) => {
                debug!(
                    "restoring controller address {} for reconnection to {} (current: {})",
                    mac,
                    switch_address.unwrap_or("any console"),
                    current
                );
                match self.set_address(&mac).await {
                    Ok(()) => Ok(true),
                    Err(err) => {
                        debug!("failed to restore controller address: {}", err);
                        Ok(false)
                    }
                }
            }
        }
    }

    /// Records the identity used for a successful connection so the
    /// console can be reconnected to later.
    pub async fn save_connection_info(&self, switch_address: &str) -> Result<()> {
        let current = self.address().await?;
        self.store.update(
            self.adapter_path.as_str(),
            &current,
            switch_address,
            Some(&self.original_address),
        );
        debug!(
            "saved connection info: adapter={}, switch={}",
            current, switch_address
        );
        Ok(())
    }

    /// Marks a remote device trusted so the stack allows automatic
    /// reconnections. Best-effort: the device may already be gone by
    /// the time this runs, so bus errors are logged, never raised.
    pub async fn trust_device(&self, device_path: &str) -> Result<()> {
        let trust = async {
            let device = Device1Proxy::builder(self.session.connection())
                .path(device_path.to_owned())?
                .cache_properties(CacheProperties::No)
                .build()
                .await?;
            device.set_trusted(true).await
        };
        match trust.await {
            Ok(()) => debug!("device {} marked as trusted", device_path),
            Err(err) => debug!("failed to trust device {}: {}", device_path, err),
        }
        Ok(())
    }

    /// Applies or clears the host compatibility override.
    ///
    /// Clean mode restarts bluetoothd with `--compat --noplugin=*` so
    /// no input plugin grabs the controller connection, and purges
    /// leftover advertised service records. The bluetooth service is
    /// only restarted when the override state actually changes.
    pub async fn set_clean_mode(&self, enabled: bool) -> Result<()> {
        if !tools::is_superuser() {
            return Err(Error::PermissionDenied {
                operation: "toggling clean mode",
            });
        }
        let restarted = tools::apply_compat_override(enabled).await?;
        if restarted {
            debug!("bluetooth service restarted, clean mode {}", enabled);
        }
        if enabled {
            tools::purge_service_records().await?;
        }
        Ok(())
    }

    /// Restarts the bluetooth service and rebinds every handle.
    ///
    /// The adapter may re-enumerate under a different object path
    /// across a daemon restart, so the path is resolved again before
    /// the adapter and profile-manager proxies are rebuilt. Safe to
    /// call repeatedly; the agent registration is torn down first so
    /// none leak.
    pub async fn reset(&mut self) -> Result<()> {
        self.agent.unregister(self.session.connection()).await?;

        tools::restart_bluetooth_service().await?;
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;

        let resolved = self
            .session
            .find_object_path(SERVICE_NAME, ADAPTER_INTERFACE, Some(&self.adapter_id))
            .await?;
        match resolved {
            Some(path) => {
                if path != self.adapter_path {
                    debug!("adapter re-enumerated under {}", path.as_str());
                    self.adapter_id = adapter_id(path.as_str()).to_owned();
                }
                self.adapter_path = path;
            }
            None => warn!(
                "adapter {} not found after service restart; keeping previous path",
                self.adapter_id
            ),
        }

        self.adapter = build_adapter_proxy(&self.session, self.adapter_path.clone()).await?;
        self.profile_manager = ProfileManager1Proxy::new(self.session.connection()).await?;
        self.agent.register(self.session.connection()).await?;
        Ok(())
    }

    /// Unregisters the pairing agent. The bus connection itself is
    /// released when the instance is dropped. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if let Err(err) = self.agent.unregister(self.session.connection()).await {
            debug!("agent unregistration during close: {}", err);
        }
    }

    /// Registers a service record with the profile manager.
    ///
    /// The options map is passed through untouched; see the BlueZ
    /// profile-manager documentation for the accepted keys (`Name`,
    /// `Role`, `RequireAuthentication`, `RequireAuthorization`,
    /// `AutoConnect`, `ServiceRecord`, ...).
    pub async fn register_profile(
        &self,
        profile_path: &ObjectPath<'_>,
        uuid: &str,
        options: HashMap<&str, Value<'_>>,
    ) -> Result<()> {
        Ok(self
            .profile_manager
            .register_profile(profile_path, uuid, options)
            .await?)
    }

    /// Removes a service record from the profile manager.
    pub async fn unregister_profile(&self, profile_path: &ObjectPath<'_>) -> Result<()> {
        Ok(self.profile_manager.unregister_profile(profile_path).await?)
    }

    /// Resets the link controller without restarting the service.
    pub async fn reset_adapter(&self) -> Result<()> {
        tools::reset_adapter(&self.adapter_id).await
    }

    pub(crate) fn adapter_proxy(&self) -> &Adapter1Proxy<'static> {
        &self.adapter
    }
}

async fn build_adapter_proxy(
    session: &BusSession,
    path: OwnedObjectPath,
) -> Result<Adapter1Proxy<'static>> {
    // Property reads go straight to the stack; the adapter's identity
    // can change underneath a cache through the vendor-command path.
    Ok(Adapter1Proxy::builder(session.connection())
        .path(path)?
        .cache_properties(CacheProperties::No)
        .build()
        .await?)
}

/// What `prepare_for_reconnect` decided to do with the adapter address.
#[derive(Debug, PartialEq, Eq)]
enum ReconnectAction {
    /// No stored identity for this adapter.
    NoStoredMac,
    /// Live address already matches the stored identity.
    AlreadyMatching,
    /// Live address must be rewritten to the stored identity.
    Spoof(String),
}

fn reconnect_action(stored: Option<String>, current: &str) -> ReconnectAction {
    match stored {
        None => ReconnectAction::NoStoredMac,
        Some(mac) if mac.eq_ignore_ascii_case(current) => ReconnectAction::AlreadyMatching,
        Some(mac) => ReconnectAction::Spoof(mac),
    }
}

/// Rewrites several adapters' addresses in one pass, index-wise.
///
/// Used when a fleet of adapters must take on controller identities
/// before their workers spin up.
pub async fn replace_mac_addresses(adapter_paths: &[&str], addresses: &[&str]) -> Result<()> {
    if adapter_paths.len() != addresses.len() {
        return Err(Error::InvalidArgument(
            "one address is required per adapter".to_owned(),
        ));
    }
    for (path, mac) in adapter_paths.iter().zip(addresses) {
        tools::set_adapter_address(adapter_id(path), mac).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_without_stored_identity_does_nothing() {
        assert_eq!(
            reconnect_action(None, "11:22:33:44:55:66"),
            ReconnectAction::NoStoredMac
        );
    }

    #[test]
    fn reconnect_skips_spoofing_when_addresses_match() {
        assert_eq!(
            reconnect_action(Some("7c:bb:8a:01:02:03".to_owned()), "7C:BB:8A:01:02:03"),
            ReconnectAction::AlreadyMatching
        );
    }

    #[test]
    fn reconnect_spoofs_when_addresses_differ() {
        assert_eq!(
            reconnect_action(Some("7C:BB:8A:01:02:03".to_owned()), "11:22:33:44:55:66"),
            ReconnectAction::Spoof("7C:BB:8A:01:02:03".to_owned())
        );
    }

    #[tokio::test]
    async fn replace_macs_requires_matching_lengths() {
        let err = replace_mac_addresses(&["/org/bluez/hci0"], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
