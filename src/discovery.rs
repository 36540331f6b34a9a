//! Device discovery, pairing and connection orchestration.
//!
//! Discovery is the one long-running operation in the crate: it blocks
//! its caller for up to the requested timeout, polling the stack once
//! per second, and unconditionally stops discovery (and lets the stack
//! settle) afterwards no matter how the loop exits.

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;
use zbus::proxy::CacheProperties;
use zbus::zvariant::ObjectPath;

use crate::adapter::BluetoothAdapter;
use crate::bus::{self, BusSession, Device1Proxy, PropertyMap, DEVICE_INTERFACE, SERVICE_NAME};
use crate::error::Result;

/// Properties of a remote device as reported by the stack.
///
/// Everything is optional: the daemon reports whatever it has resolved
/// so far, and a device observed mid-discovery may carry no alias yet.
/// Nothing here is persisted; devices are rediscovered each session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceProps {
    pub address: Option<String>,
    pub alias: Option<String>,
    pub paired: Option<bool>,
    pub connected: Option<bool>,
    /// Service identifiers the device offers.
    pub uuids: Option<Vec<String>>,
}

impl DeviceProps {
    pub(crate) fn from_properties(props: &PropertyMap) -> Self {
        Self {
            address: props.get("Address").and_then(bus::value_as_string),
            alias: props.get("Alias").and_then(bus::value_as_string),
            paired: props.get("Paired").and_then(bus::value_as_bool),
            connected: props.get("Connected").and_then(bus::value_as_bool),
            uuids: props.get("UUIDs").and_then(bus::value_as_string_list),
        }
    }
}

/// Surface the discovery loop needs from the stack, factored out so the
/// loop's timing and cleanup guarantees can be exercised against a
/// simulated stack.
pub(crate) trait DeviceScanner {
    async fn devices(&mut self) -> Result<HashMap<String, DeviceProps>>;
    async fn start_discovery(&mut self) -> Result<()>;
    async fn stop_discovery(&mut self) -> Result<()>;
}

/// Polls the scanner once per second for `timeout_secs` seconds,
/// merging newly observed devices into the running set and handing the
/// cumulative set to `on_update` after each poll.
///
/// Discovery is stopped, and the stack given a second to settle, no
/// matter how the loop exits; that cleanup is the one ordering
/// guarantee this function makes.
pub(crate) async fn run_discovery<S, F>(
    scanner: &mut S,
    timeout_secs: u64,
    mut on_update: Option<F>,
) -> Result<HashMap<String, DeviceProps>>
where
    S: DeviceScanner,
    F: FnMut(&HashMap<String, DeviceProps>) -> Result<()>,
{
    // Seed with everything previously discovered or connected.
    let mut devices = scanner.devices().await?;

    scanner.start_discovery().await?;
    let outcome: Result<()> = async {
        for _ in 0..timeout_secs {
            tokio::time::sleep(Duration::from_secs(1)).await;
            devices.extend(scanner.devices().await?);
            if let Some(callback) = on_update.as_mut() {
                callback(&devices)?;
            }
        }
        Ok(())
    }
    .await;

    if let Err(err) = scanner.stop_discovery().await {
        debug!("failed to stop discovery: {}", err);
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    outcome?;
    Ok(devices)
}

/// Keeps devices that expose an alias, match the requested alias when
/// one is given, and are not already paired.
pub(crate) fn filter_discovered(
    devices: HashMap<String, DeviceProps>,
    alias: Option<&str>,
) -> HashMap<String, DeviceProps> {
    devices
        .into_iter()
        .filter(|(_, props)| {
            let Some(device_alias) = props.alias.as_deref() else {
                return false;
            };
            if alias.is_some_and(|wanted| wanted != device_alias) {
                return false;
            }
            matches!(props.paired, Some(false))
        })
        .collect()
}

struct AdapterScanner<'a> {
    adapter: &'a BluetoothAdapter,
}

impl DeviceScanner for AdapterScanner<'_> {
    async fn devices(&mut self) -> Result<HashMap<String, DeviceProps>> {
        self.adapter.discovered_devices().await
    }

    async fn start_discovery(&mut self) -> Result<()> {
        Ok(self.adapter.adapter_proxy().start_discovery().await?)
    }

    async fn stop_discovery(&mut self) -> Result<()> {
        Ok(self.adapter.adapter_proxy().stop_discovery().await?)
    }
}

impl BluetoothAdapter {
    /// Snapshot of every device object the stack currently knows,
    /// whether discovered just now or connected in an earlier session,
    /// keyed by bus path.
    pub async fn discovered_devices(&self) -> Result<HashMap<String, DeviceProps>> {
        let mut devices = HashMap::new();
        for (path, props) in self
            .session()
            .managed_interfaces(SERVICE_NAME, DEVICE_INTERFACE)
            .await?
        {
            devices.insert(path.to_string(), DeviceProps::from_properties(&props));
        }
        Ok(devices)
    }

    /// Discovers nearby devices for `timeout_secs` seconds.
    ///
    /// The adapter is powered and made pairable first. The result seeds
    /// from already-known devices, and each one-second poll merges the
    /// stack's latest view before handing the cumulative set to
    /// `on_update`. After discovery stops, the set is narrowed to
    /// devices that expose an alias, match `alias` when given, and are
    /// not already paired.
    ///
    /// Already-paired devices never show up here, so a remembered
    /// console cannot be re-paired through this path without removing
    /// it first.
    pub async fn discover_devices<F>(
        &self,
        alias: Option<&str>,
        timeout_secs: u64,
        on_update: Option<F>,
    ) -> Result<HashMap<String, DeviceProps>>
    where
        F: FnMut(&HashMap<String, DeviceProps>) -> Result<()>,
    {
        self.set_powered(true).await?;
        self.set_pairable(true).await?;

        let mut scanner = AdapterScanner { adapter: self };
        let devices = run_discovery(&mut scanner, timeout_secs, on_update).await?;
        Ok(filter_discovered(devices, alias))
    }

    /// Pairs the device at a bus path.
    pub async fn pair_device(&self, device_path: &str) -> Result<()> {
        Ok(self.device_proxy(device_path).await?.pair().await?)
    }

    /// Attempts to connect the device at a bus path.
    ///
    /// A single failed attempt is logged, not raised: reconnection runs
    /// through [`prepare_for_reconnect`](Self::prepare_for_reconnect)
    /// and retries at a higher layer, so one bus-level failure is not
    /// treated as fatal.
    pub async fn connect_device(&self, device_path: &str) -> Result<()> {
        let attempt = async {
            let device = self.device_proxy(device_path).await?;
            device.connect().await.map_err(crate::error::Error::from)
        };
        if let Err(err) = attempt.await {
            debug!("connection attempt for {} failed: {}", device_path, err);
        }
        Ok(())
    }

    /// Removes a device (discovered, paired or connected) from the
    /// adapter.
    pub async fn remove_device(&self, device_path: &str) -> Result<()> {
        let path = ObjectPath::try_from(device_path)?;
        Ok(self.adapter_proxy().remove_device(&path).await?)
    }

    /// Bus path of the device carrying an address, if the stack knows
    /// one.
    pub async fn find_device_by_address(&self, address: &str) -> Result<Option<String>> {
        for (path, props) in self
            .session()
            .managed_interfaces(SERVICE_NAME, DEVICE_INTERFACE)
            .await?
        {
            let device = DeviceProps::from_properties(&props);
            if device
                .address
                .is_some_and(|addr| addr.eq_ignore_ascii_case(address))
            {
                return Ok(Some(path.to_string()));
            }
        }
        Ok(None)
    }

    /// Paths of currently connected devices, optionally narrowed to an
    /// alias (compared uppercase, the way the stack stores aliases).
    pub async fn find_connected_devices(&self, alias_filter: Option<&str>) -> Result<Vec<String>> {
        let mut connected = Vec::new();
        for (path, props) in self
            .session()
            .managed_interfaces(SERVICE_NAME, DEVICE_INTERFACE)
            .await?
        {
            let device = DeviceProps::from_properties(&props);
            if device.connected != Some(true) {
                continue;
            }
            if let Some(wanted) = alias_filter {
                let matches = device
                    .alias
                    .as_deref()
                    .is_some_and(|alias| alias.eq_ignore_ascii_case(wanted));
                if !matches {
                    continue;
                }
            }
            connected.push(path.to_string());
        }
        Ok(connected)
    }

    async fn device_proxy(&self, device_path: &str) -> Result<Device1Proxy<'static>> {
        Ok(Device1Proxy::builder(self.session().connection())
            .path(device_path.to_owned())?
            .cache_properties(CacheProperties::No)
            .build()
            .await?)
    }
}

/// Addresses and paths of every known device whose alias matches,
/// compared case-insensitively the way the stack normalizes aliases.
pub async fn find_devices_by_alias(
    session: &BusSession,
    alias: &str,
) -> Result<(Vec<String>, Vec<String>)> {
    let mut addresses = Vec::new();
    let mut paths = Vec::new();
    for (path, props) in session
        .managed_interfaces(SERVICE_NAME, DEVICE_INTERFACE)
        .await?
    {
        let device = DeviceProps::from_properties(&props);
        let matched = device
            .alias
            .as_deref()
            .is_some_and(|device_alias| device_alias.eq_ignore_ascii_case(alias));
        if matched {
            if let Some(address) = device.address {
                addresses.push(address.to_uppercase());
                paths.push(path.to_string());
            }
        }
    }
    Ok((addresses, paths))
}

/// Disconnects every device whose alias matches. Individual disconnect
/// failures are logged and skipped; the stack may have dropped the
/// device on its own already.
pub async fn disconnect_devices_by_alias(session: &BusSession, alias: &str) -> Result<()> {
    let (_, paths) = find_devices_by_alias(session, alias).await?;
    for path in paths {
        let attempt = async {
            let device = Device1Proxy::builder(session.connection())
                .path(path.clone())?
                .cache_properties(CacheProperties::No)
                .build()
                .await?;
            device.disconnect().await
        };
        if let Err(err) = attempt.await {
            debug!("disconnect of {} failed: {}", path, err);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    type DeviceMap = HashMap<String, DeviceProps>;

    fn named_device(alias: Option<&str>, paired: Option<bool>) -> DeviceProps {
        DeviceProps {
            address: Some("AA:BB:CC:DD:EE:FF".to_owned()),
            alias: alias.map(str::to_owned),
            paired,
            ..Default::default()
        }
    }

    /// Reports one additional device on every poll, like a stack that
    /// resolves one new neighbour per second.
    #[derive(Default)]
    struct SimulatedScanner {
        polls: usize,
        starts: usize,
        stops: usize,
    }

    impl DeviceScanner for SimulatedScanner {
        async fn devices(&mut self) -> Result<DeviceMap> {
            let mut devices = DeviceMap::new();
            for i in 0..self.polls {
                devices.insert(
                    format!("/org/bluez/hci0/dev_00_00_00_00_00_0{i}"),
                    named_device(Some(&format!("Device {i}")), Some(false)),
                );
            }
            self.polls += 1;
            Ok(devices)
        }

        async fn start_discovery(&mut self) -> Result<()> {
            self.starts += 1;
            Ok(())
        }

        async fn stop_discovery(&mut self) -> Result<()> {
            self.stops += 1;
            Ok(())
        }
    }

    type UpdateFn = fn(&DeviceMap) -> Result<()>;

    #[tokio::test(start_paused = true)]
    async fn discovery_accumulates_one_device_per_poll() {
        let mut scanner = SimulatedScanner::default();
        let devices = run_discovery(&mut scanner, 3, None::<UpdateFn>)
            .await
            .unwrap();

        assert_eq!(devices.len(), 3);
        assert_eq!(scanner.starts, 1);
        assert_eq!(scanner.stops, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_stops_exactly_once_when_the_callback_fails() {
        let mut scanner = SimulatedScanner::default();
        let mut calls = 0;
        let result = run_discovery(
            &mut scanner,
            5,
            Some(|_: &DeviceMap| {
                calls += 1;
                if calls == 2 {
                    Err(Error::InvalidArgument("callback gave up".to_owned()))
                } else {
                    Ok(())
                }
            }),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls, 2);
        assert_eq!(scanner.stops, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_invokes_the_callback_with_the_cumulative_set() {
        let mut scanner = SimulatedScanner::default();
        let mut sizes = Vec::new();
        run_discovery(
            &mut scanner,
            3,
            Some(|devices: &DeviceMap| {
                sizes.push(devices.len());
                Ok(())
            }),
        )
        .await
        .unwrap();

        assert_eq!(sizes, vec![1, 2, 3]);
    }

    #[test]
    fn filtering_drops_aliasless_and_paired_devices() {
        let mut devices = DeviceMap::new();
        devices.insert("/dev_1".to_owned(), named_device(None, Some(false)));
        devices.insert("/dev_2".to_owned(), named_device(Some("Nintendo Switch"), Some(true)));
        devices.insert("/dev_3".to_owned(), named_device(Some("Nintendo Switch"), None));
        devices.insert("/dev_4".to_owned(), named_device(Some("Nintendo Switch"), Some(false)));

        let filtered = filter_discovered(devices, None);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("/dev_4"));
    }

    #[test]
    fn filtering_honours_the_alias_filter() {
        let mut devices = DeviceMap::new();
        devices.insert("/dev_1".to_owned(), named_device(Some("Nintendo Switch"), Some(false)));
        devices.insert("/dev_2".to_owned(), named_device(Some("Some Headphones"), Some(false)));

        let filtered = filter_discovered(devices, Some("Nintendo Switch"));
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("/dev_1"));
    }

    #[test]
    fn device_props_parse_from_a_property_bag() {
        use zbus::zvariant::Value;

        let mut props = PropertyMap::new();
        props.insert(
            "Address".to_owned(),
            Value::from("AA:BB:CC:DD:EE:FF").try_to_owned().unwrap(),
        );
        props.insert(
            "Alias".to_owned(),
            Value::from("Nintendo Switch").try_to_owned().unwrap(),
        );
        props.insert("Paired".to_owned(), Value::from(false).try_to_owned().unwrap());
        props.insert("Connected".to_owned(), Value::from(true).try_to_owned().unwrap());
        props.insert(
            "UUIDs".to_owned(),
            Value::from(vec!["00001124-0000-1000-8000-00805f9b34fb"])
                .try_to_owned()
                .unwrap(),
        );

        let device = DeviceProps::from_properties(&props);
        assert_eq!(device.address.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(device.alias.as_deref(), Some("Nintendo Switch"));
        assert_eq!(device.paired, Some(false));
        assert_eq!(device.connected, Some(true));
        assert_eq!(
            device.uuids,
            Some(vec!["00001124-0000-1000-8000-00805f9b34fb".to_owned()])
        );
    }

    #[test]
    fn device_props_tolerate_missing_fields() {
        let device = DeviceProps::from_properties(&PropertyMap::new());
        assert_eq!(device, DeviceProps::default());
    }
}
