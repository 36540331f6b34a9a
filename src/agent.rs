//! Always-accept pairing agent.
//!
//! The console's pairing flow is designed for manual confirmation on a
//! companion device; a purpose-built controller has no human in the
//! loop, so every prompt the daemon can raise is granted automatically.

use tracing::debug;
use zbus::zvariant::{ObjectPath, OwnedObjectPath};
use zbus::Connection;

use crate::error::Result;

/// Object path the agent is exported under.
pub const AGENT_PATH: &str = "/nxlink/agent";

/// Capability advertised to the agent manager. `NoInputNoOutput` keeps
/// the daemon from expecting any display or keyboard interaction.
const AGENT_CAPABILITY: &str = "NoInputNoOutput";

/// PIN returned for legacy pairing requests.
const AGENT_PIN: &str = "0000";

#[zbus::proxy(
    interface = "org.bluez.AgentManager1",
    default_service = "org.bluez",
    default_path = "/org/bluez"
)]
trait AgentManager {
    fn register_agent(&self, agent: &ObjectPath<'_>, capability: &str) -> zbus::Result<()>;

    fn request_default_agent(&self, agent: &ObjectPath<'_>) -> zbus::Result<()>;

    fn unregister_agent(&self, agent: &ObjectPath<'_>) -> zbus::Result<()>;
}

/// Grants every pairing and authorization request BlueZ forwards.
pub struct PairingAgent;

#[zbus::interface(name = "org.bluez.Agent1")]
impl PairingAgent {
    fn release(&self) {
        debug!("pairing agent released");
    }

    fn authorize_service(&self, device: OwnedObjectPath, uuid: String) {
        debug!("authorizing service {} for {}", uuid, device.as_str());
    }

    fn request_pin_code(&self, device: OwnedObjectPath) -> String {
        debug!("pin code requested by {}", device.as_str());
        AGENT_PIN.to_owned()
    }

    fn request_passkey(&self, device: OwnedObjectPath) -> u32 {
        debug!("passkey requested by {}", device.as_str());
        0
    }

    fn display_passkey(&self, device: OwnedObjectPath, passkey: u32, entered: u16) {
        // Nothing to show; logged for protocol tracing only.
        debug!(
            "display passkey {} ({} entered) for {}",
            passkey,
            entered,
            device.as_str()
        );
    }

    fn display_pin_code(&self, device: OwnedObjectPath, pincode: String) {
        debug!("display pin code {} for {}", pincode, device.as_str());
    }

    fn request_confirmation(&self, device: OwnedObjectPath, passkey: u32) {
        debug!("confirming passkey {} for {}", passkey, device.as_str());
    }

    fn request_authorization(&self, device: OwnedObjectPath) {
        debug!("authorizing connection for {}", device.as_str());
    }

    fn cancel(&self) {
        debug!("pairing request cancelled");
    }
}

/// Surface the registration lifecycle needs from the bus, factored out
/// so the idempotence of the state machine can be exercised without a
/// live daemon.
pub(crate) trait AgentRegistrar {
    async fn export(&mut self) -> Result<bool>;
    async fn register_default(&mut self) -> zbus::Result<()>;
    async fn unregister(&mut self) -> zbus::Result<()>;
    async fn remove(&mut self) -> Result<bool>;
}

/// Tracks the agent's registration state.
///
/// Both transitions are idempotent. BlueZ races its own bookkeeping
/// against ours across daemon restarts, so an already-registered or
/// never-registered answer from the agent manager is expected, logged
/// and absorbed.
pub(crate) struct AgentHandle {
    registered: bool,
}

impl AgentHandle {
    pub(crate) fn new() -> Self {
        Self { registered: false }
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered
    }

    pub(crate) async fn register(&mut self, connection: &Connection) -> Result<()> {
        self.register_with(&mut BusRegistrar { connection }).await
    }

    pub(crate) async fn unregister(&mut self, connection: &Connection) -> Result<()> {
        self.unregister_with(&mut BusRegistrar { connection }).await
    }

    pub(crate) async fn register_with<R: AgentRegistrar>(
        &mut self,
        registrar: &mut R,
    ) -> Result<()> {
        if self.registered {
            debug!("pairing agent already registered");
            return Ok(());
        }

        registrar.export().await?;
        // The daemon may still hold a registration from a previous life
        // of this path, so an AlreadyExists answer is not an error.
        match registrar.register_default().await {
            Ok(()) => debug!("pairing agent registered as bus default"),
            Err(err) => debug!("agent registration: {}", err),
        }
        self.registered = true;
        Ok(())
    }

    pub(crate) async fn unregister_with<R: AgentRegistrar>(
        &mut self,
        registrar: &mut R,
    ) -> Result<()> {
        if !self.registered {
            return Ok(());
        }

        if let Err(err) = registrar.unregister().await {
            debug!("agent unregistration: {}", err);
        }
        if let Err(err) = registrar.remove().await {
            debug!("agent object removal: {}", err);
        }
        self.registered = false;
        debug!("pairing agent unregistered");
        Ok(())
    }
}

struct BusRegistrar<'a> {
    connection: &'a Connection,
}

impl AgentRegistrar for BusRegistrar<'_> {
    async fn export(&mut self) -> Result<bool> {
        Ok(self
            .connection
            .object_server()
            .at(agent_path(), PairingAgent)
            .await?)
    }

    async fn register_default(&mut self) -> zbus::Result<()> {
        let manager = AgentManagerProxy::new(self.connection).await?;
        manager
            .register_agent(&agent_path(), AGENT_CAPABILITY)
            .await?;
        manager.request_default_agent(&agent_path()).await
    }

    async fn unregister(&mut self) -> zbus::Result<()> {
        let manager = AgentManagerProxy::new(self.connection).await?;
        manager.unregister_agent(&agent_path()).await
    }

    async fn remove(&mut self) -> Result<bool> {
        Ok(self
            .connection
            .object_server()
            .remove::<PairingAgent, _>(agent_path())
            .await?)
    }
}

fn agent_path() -> ObjectPath<'static> {
    ObjectPath::from_static_str_unchecked(AGENT_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_path() -> OwnedObjectPath {
        ObjectPath::from_static_str_unchecked("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF").into()
    }

    #[test]
    fn policy_grants_fixed_credentials() {
        let agent = PairingAgent;
        assert_eq!(agent.request_pin_code(device_path()), AGENT_PIN);
        assert_eq!(agent.request_passkey(device_path()), 0);
    }

    #[derive(Default)]
    struct CountingRegistrar {
        exports: usize,
        registers: usize,
        unregisters: usize,
        removals: usize,
    }

    impl AgentRegistrar for CountingRegistrar {
        async fn export(&mut self) -> Result<bool> {
            self.exports += 1;
            Ok(true)
        }

        async fn register_default(&mut self) -> zbus::Result<()> {
            self.registers += 1;
            Ok(())
        }

        async fn unregister(&mut self) -> zbus::Result<()> {
            self.unregisters += 1;
            Ok(())
        }

        async fn remove(&mut self) -> Result<bool> {
            self.removals += 1;
            Ok(true)
        }
    }

    #[tokio::test]
    async fn double_registration_is_idempotent() {
        let mut registrar = CountingRegistrar::default();
        let mut handle = AgentHandle::new();

        handle.register_with(&mut registrar).await.unwrap();
        handle.register_with(&mut registrar).await.unwrap();

        assert!(handle.is_registered());
        assert_eq!(registrar.exports, 1);
        assert_eq!(registrar.registers, 1);
    }

    #[tokio::test]
    async fn unregistering_when_not_registered_is_a_no_op() {
        let mut registrar = CountingRegistrar::default();
        let mut handle = AgentHandle::new();

        handle.unregister_with(&mut registrar).await.unwrap();
        assert_eq!(registrar.unregisters, 0);
        assert_eq!(registrar.removals, 0);

        handle.register_with(&mut registrar).await.unwrap();
        handle.unregister_with(&mut registrar).await.unwrap();
        handle.unregister_with(&mut registrar).await.unwrap();

        assert!(!handle.is_registered());
        assert_eq!(registrar.unregisters, 1);
        assert_eq!(registrar.removals, 1);
    }

    #[tokio::test]
    async fn daemon_side_registration_races_are_absorbed() {
        struct RacingRegistrar;

        impl AgentRegistrar for RacingRegistrar {
            async fn export(&mut self) -> Result<bool> {
                Ok(false)
            }

            async fn register_default(&mut self) -> zbus::Result<()> {
                Err(zbus::Error::Failure("AlreadyExists".to_owned()))
            }

            async fn unregister(&mut self) -> zbus::Result<()> {
                Err(zbus::Error::Failure("DoesNotExist".to_owned()))
            }

            async fn remove(&mut self) -> Result<bool> {
                Ok(false)
            }
        }

        let mut handle = AgentHandle::new();
        handle.register_with(&mut RacingRegistrar).await.unwrap();
        assert!(handle.is_registered());
        handle.unregister_with(&mut RacingRegistrar).await.unwrap();
        assert!(!handle.is_registered());
    }
}
