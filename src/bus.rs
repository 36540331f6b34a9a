//! Bus plumbing: a session wrapper over the D-Bus system bus, generic
//! object lookup for BlueZ-managed paths, and the typed proxies the rest
//! of the crate talks through.

use std::collections::HashMap;

use zbus::fdo::ObjectManagerProxy;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};
use zbus::Connection;

use crate::error::Result;

pub const SERVICE_NAME: &str = "org.bluez";
pub const BLUEZ_OBJECT_PATH: &str = "/org/bluez";
pub const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
pub const DEVICE_INTERFACE: &str = "org.bluez.Device1";
pub const PROFILE_MANAGER_INTERFACE: &str = "org.bluez.ProfileManager1";

/// Property bag for one interface of one managed object.
pub type PropertyMap = HashMap<String, OwnedValue>;

#[zbus::proxy(interface = "org.bluez.Adapter1", default_service = "org.bluez")]
pub(crate) trait Adapter1 {
    fn start_discovery(&self) -> zbus::Result<()>;

    fn stop_discovery(&self) -> zbus::Result<()>;

    fn remove_device(&self, device: &ObjectPath<'_>) -> zbus::Result<()>;

    #[zbus(property)]
    fn address(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn name(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn set_name(&self, value: &str) -> zbus::Result<()>;

    #[zbus(property)]
    fn alias(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn set_alias(&self, value: &str) -> zbus::Result<()>;

    #[zbus(property)]
    fn pairable(&self) -> zbus::Result<bool>;

    #[zbus(property)]
    fn set_pairable(&self, value: bool) -> zbus::Result<()>;

    #[zbus(property)]
    fn pairable_timeout(&self) -> zbus::Result<u32>;

    #[zbus(property)]
    fn set_pairable_timeout(&self, value: u32) -> zbus::Result<()>;

    #[zbus(property)]
    fn discoverable(&self) -> zbus::Result<bool>;

    #[zbus(property)]
    fn set_discoverable(&self, value: bool) -> zbus::Result<()>;

    #[zbus(property)]
    fn discoverable_timeout(&self) -> zbus::Result<u32>;

    #[zbus(property)]
    fn set_discoverable_timeout(&self, value: u32) -> zbus::Result<()>;

    #[zbus(property)]
    fn powered(&self) -> zbus::Result<bool>;

    #[zbus(property)]
    fn set_powered(&self, value: bool) -> zbus::Result<()>;
}

#[zbus::proxy(interface = "org.bluez.Device1", default_service = "org.bluez")]
pub(crate) trait Device1 {
    fn pair(&self) -> zbus::Result<()>;

    fn connect(&self) -> zbus::Result<()>;

    fn disconnect(&self) -> zbus::Result<()>;

    #[zbus(property)]
    fn set_trusted(&self, value: bool) -> zbus::Result<()>;
}

#[zbus::proxy(
    interface = "org.bluez.ProfileManager1",
    default_service = "org.bluez",
    default_path = "/org/bluez"
)]
pub(crate) trait ProfileManager1 {
    fn register_profile(
        &self,
        profile: &ObjectPath<'_>,
        uuid: &str,
        options: HashMap<&str, Value<'_>>,
    ) -> zbus::Result<()>;

    fn unregister_profile(&self, profile: &ObjectPath<'_>) -> zbus::Result<()>;
}

/// One explicitly constructed connection to the system bus.
///
/// There is deliberately no ambient global connection: callers build a
/// session, hand it to whoever owns it, and reconstruct it when the
/// transport dies.
#[derive(Debug)]
pub struct BusSession {
    connection: Connection,
}

impl BusSession {
    /// Connects to the system bus.
    pub async fn system() -> Result<Self> {
        let connection = Connection::system().await?;
        Ok(Self { connection })
    }

    /// Wraps an existing connection.
    pub fn from_connection(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Enumerates every object a service manages and returns each path
    /// that exposes `interface_name`, together with that interface's
    /// properties.
    pub async fn managed_interfaces(
        &self,
        service_name: &str,
        interface_name: &str,
    ) -> Result<Vec<(OwnedObjectPath, PropertyMap)>> {
        let manager = ObjectManagerProxy::builder(&self.connection)
            .destination(service_name.to_owned())?
            .path("/")?
            .build()
            .await?;

        let mut found = Vec::new();
        for (path, interfaces) in manager.get_managed_objects().await? {
            if let Some((_, props)) = interfaces
                .into_iter()
                .find(|(name, _)| name.as_str() == interface_name)
            {
                found.push((path, props));
            }
        }
        Ok(found)
    }

    /// Searches for an object path exposing `interface_name` under a
    /// service.
    ///
    /// A filter narrows the match to objects whose `Address` property
    /// equals the filter or whose path ends with it; without a filter
    /// the first match wins. An empty result is `None`, never an error;
    /// only an unreachable bus or service fails.
    pub async fn find_object_path(
        &self,
        service_name: &str,
        interface_name: &str,
        filter: Option<&str>,
    ) -> Result<Option<OwnedObjectPath>> {
        for (path, props) in self.managed_interfaces(service_name, interface_name).await? {
            let matched = match filter {
                None => true,
                Some(wanted) => {
                    let address = props.get("Address").and_then(value_as_string);
                    address.as_deref() == Some(wanted) || path.as_str().ends_with(wanted)
                }
            };
            if matched {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    /// All object paths exposing `interface_name` under a service.
    pub async fn find_object_paths(
        &self,
        service_name: &str,
        interface_name: &str,
    ) -> Result<Vec<OwnedObjectPath>> {
        Ok(self
            .managed_interfaces(service_name, interface_name)
            .await?
            .into_iter()
            .map(|(path, _)| path)
            .collect())
    }
}

pub(crate) fn value_as_string(value: &OwnedValue) -> Option<String> {
    match &**value {
        Value::Str(s) => Some(s.as_str().to_owned()),
        _ => None,
    }
}

pub(crate) fn value_as_bool(value: &OwnedValue) -> Option<bool> {
    match &**value {
        Value::Bool(b) => Some(*b),
        _ => None,
    }
}

pub(crate) fn value_as_string_list(value: &OwnedValue) -> Option<Vec<String>> {
    match &**value {
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Str(s) => Some(s.as_str().to_owned()),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(value: Value<'_>) -> OwnedValue {
        value.try_to_owned().unwrap()
    }

    #[test]
    fn string_values_downcast() {
        let value = owned(Value::from("AA:BB:CC:DD:EE:FF"));
        assert_eq!(
            value_as_string(&value).as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
        assert_eq!(value_as_bool(&value), None);
    }

    #[test]
    fn bool_values_downcast() {
        let value = owned(Value::from(true));
        assert_eq!(value_as_bool(&value), Some(true));
        assert_eq!(value_as_string(&value), None);
    }

    #[test]
    fn string_lists_downcast() {
        let value = owned(Value::from(vec!["1124", "180a"]));
        assert_eq!(
            value_as_string_list(&value),
            Some(vec!["1124".to_owned(), "180a".to_owned()])
        );
        assert_eq!(value_as_string_list(&owned(Value::from(7u32))), None);
    }
}
