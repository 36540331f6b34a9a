//! Privileged external tooling.
//!
//! BlueZ exposes no supported surface for rewriting the adapter hardware
//! address or committing a device class, so those operations go through
//! the classic `hcitool`/`hciconfig` CLIs; SDP hygiene uses `sdptool`
//! and service control goes through `systemctl`. Every tool is invoked
//! as a subprocess and reported as missing at first use, with a hint the
//! operator can act on.

use std::path::Path;
use std::process::Output;
use std::time::Duration;

use rand::Rng;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

pub(crate) const HCITOOL: &str = "hcitool";
pub(crate) const HCICONFIG: &str = "hciconfig";
pub(crate) const SDPTOOL: &str = "sdptool";
pub(crate) const SYSTEMCTL: &str = "systemctl";

const TOOL_HINT: &str = "install it, as it is required for proper functionality";

/// Unit file the compatibility override is derived from.
const BLUETOOTH_UNIT_PATH: &str = "/lib/systemd/system/bluetooth.service";
const OVERRIDE_DIR: &str = "/run/systemd/system/bluetooth.service.d";
const OVERRIDE_FILE: &str = "nxlink.conf";

/// Service records that must survive a purge. The device-information
/// record is standard and expected by remote stacks.
const RECORD_EXCEPTIONS: &[&str] = &["PnP Information"];

/// Runs a tool and captures its output.
///
/// A missing binary maps to [`Error::ToolMissing`]; a nonzero exit or
/// any stderr output maps to [`Error::CommandFailed`].
pub(crate) async fn run_tool(tool: &'static str, args: &[&str]) -> Result<Output> {
    let output = Command::new(tool)
        .args(args)
        .output()
        .await
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => Error::ToolMissing {
                tool,
                hint: TOOL_HINT,
            },
            _ => Error::Io(err),
        })?;

    let stderr = String::from_utf8_lossy(&output.stderr).replace('\n', "");
    if !output.status.success() || !stderr.is_empty() {
        return Err(Error::CommandFailed {
            tool: tool.to_owned(),
            stderr,
        });
    }
    Ok(output)
}

/// Whether the process runs with an effective uid of root.
pub(crate) fn is_superuser() -> bool {
    // SAFETY: geteuid cannot fail and has no side effects.
    unsafe { libc::geteuid() == 0 }
}

/// Splits a `XX:XX:XX:XX:XX:XX` address into its six octet strings.
fn mac_octets(mac: &str) -> Result<Vec<&str>> {
    let octets: Vec<&str> = mac.split(':').collect();
    let well_formed = octets.len() == 6
        && octets
            .iter()
            .all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()));
    if !well_formed {
        return Err(Error::InvalidArgument(format!(
            "malformed MAC address: {mac:?}"
        )));
    }
    Ok(octets)
}

/// `hcitool` arguments for the vendor command that rewrites the adapter
/// address. The link controller takes the octets in reverse order.
pub(crate) fn spoof_command_args(adapter_id: &str, mac: &str) -> Result<Vec<String>> {
    let octets = mac_octets(mac)?;
    let mut args = vec![
        "-i".to_owned(),
        adapter_id.to_owned(),
        "cmd".to_owned(),
        "0x3f".to_owned(),
        "0x001".to_owned(),
    ];
    args.extend(octets.iter().rev().map(|octet| format!("0x{octet}")));
    Ok(args)
}

/// Rewrites an adapter's hardware address, then resets the link
/// controller so the new identity takes effect.
pub(crate) async fn set_adapter_address(adapter_id: &str, mac: &str) -> Result<()> {
    let args = spoof_command_args(adapter_id, mac)?;
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    run_tool(HCITOOL, &args).await?;
    run_tool(HCICONFIG, &[adapter_id, "reset"]).await?;
    Ok(())
}

/// Resets the link controller.
pub(crate) async fn reset_adapter(adapter_id: &str) -> Result<()> {
    run_tool(HCICONFIG, &[adapter_id, "reset"]).await?;
    Ok(())
}

/// Pulls the 8-character class token out of `hciconfig <id> class`
/// output.
pub(crate) fn parse_device_class(output: &str) -> Option<String> {
    let start = output.find("Class: ")? + "Class: ".len();
    let class: String = output[start..].chars().take(8).collect();
    if class.len() == 8 {
        Some(class)
    } else {
        None
    }
}

pub(crate) async fn read_device_class(adapter_id: &str) -> Result<String> {
    let output = run_tool(HCICONFIG, &[adapter_id, "class"]).await?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_device_class(&stdout).ok_or_else(|| Error::CommandFailed {
        tool: HCICONFIG.to_owned(),
        stderr: "no device class in output".to_owned(),
    })
}

pub(crate) async fn write_device_class(adapter_id: &str, device_class: &str) -> Result<()> {
    run_tool(HCICONFIG, &[adapter_id, "class", device_class]).await?;
    Ok(())
}

pub(crate) async fn restart_bluetooth_service() -> Result<()> {
    run_tool(SYSTEMCTL, &["restart", "bluetooth"]).await?;
    Ok(())
}

async fn reload_units() -> Result<()> {
    run_tool(SYSTEMCTL, &["daemon-reload"]).await?;
    Ok(())
}

/// Builds the drop-in that restarts bluetoothd in compatibility mode
/// with every plugin disabled, from the unit file's own ExecStart line.
pub(crate) fn compat_override(unit_file: &str) -> Result<String> {
    let exec_start = unit_file
        .lines()
        .find(|line| line.starts_with("ExecStart="))
        .ok_or(Error::UnitFileMalformed)?;
    Ok(format!(
        "[Service]\nExecStart=\n{} --compat --noplugin=*\n",
        exec_start.trim()
    ))
}

/// Applies or removes the compatibility override, restarting the
/// bluetooth service only when the on-disk state actually changed.
/// Returns whether a restart happened.
pub(crate) async fn apply_compat_override(enabled: bool) -> Result<bool> {
    let override_path = Path::new(OVERRIDE_DIR).join(OVERRIDE_FILE);

    if enabled {
        if override_path.is_file() {
            return Ok(false);
        }
        let unit = tokio::fs::read_to_string(BLUETOOTH_UNIT_PATH).await?;
        let contents = compat_override(&unit)?;
        tokio::fs::create_dir_all(OVERRIDE_DIR).await?;
        tokio::fs::write(&override_path, contents).await?;
    } else {
        match tokio::fs::remove_file(&override_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        }
    }

    reload_units().await?;
    restart_bluetooth_service().await?;
    // Give the stack a moment to finish re-enumerating.
    tokio::time::sleep(Duration::from_millis(500)).await;
    Ok(true)
}

/// Record handles from `sdptool browse local` output, skipping any
/// record that names one of the exceptions.
pub(crate) fn service_record_handles(listing: &str, exceptions: &[&str]) -> Vec<String> {
    let mut handles = Vec::new();
    for record in listing.split("\n\n") {
        if exceptions.iter().any(|keep| record.contains(keep)) {
            continue;
        }
        for line in record.lines() {
            if line.contains("Service RecHandle") {
                if let Some(handle) = line.split(' ').nth(2) {
                    handles.push(handle.to_owned());
                }
            }
        }
    }
    handles
}

/// Deletes every advertised service record except the exceptions, so
/// only the emulated controller's service remains visible.
pub(crate) async fn purge_service_records() -> Result<()> {
    // Later BlueZ 5 releases ship the SDP server socket unreadable in
    // compatibility mode; open it up before browsing.
    run_tool("chmod", &["777", "/var/run/sdp"]).await?;

    let output = run_tool(SDPTOOL, &["browse", "local"]).await?;
    let listing = String::from_utf8_lossy(&output.stdout).into_owned();
    let handles = service_record_handles(&listing, RECORD_EXCEPTIONS);
    debug!("purging {} stale service records", handles.len());
    for handle in handles {
        run_tool(SDPTOOL, &["del", &handle]).await?;
    }
    Ok(())
}

/// Generates a random controller address inside the OUI range the
/// console associates with first-party controllers.
pub fn random_controller_mac() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "7C:BB:8A:{:02X}:{:02X}:{:02X}",
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spoof_args_reverse_the_octets() {
        let args = spoof_command_args("hci0", "7C:BB:8A:01:02:03").unwrap();
        assert_eq!(
            args,
            vec![
                "-i", "hci0", "cmd", "0x3f", "0x001", "0x03", "0x02", "0x01", "0x8A", "0xBB",
                "0x7C",
            ]
        );
    }

    #[test]
    fn malformed_macs_are_rejected() {
        assert!(spoof_command_args("hci0", "7C:BB:8A:01:02").is_err());
        assert!(spoof_command_args("hci0", "7C:BB:8A:01:02:0Z").is_err());
        assert!(spoof_command_args("hci0", "7CBB8A010203").is_err());
    }

    #[test]
    fn device_class_parses_from_hciconfig_output() {
        let output = "hci0:\tType: Primary  Bus: USB\n\tClass: 0x002508\n\tService Classes: Unspecified\n";
        assert_eq!(parse_device_class(output).as_deref(), Some("0x002508"));
        assert_eq!(parse_device_class("no class here"), None);
    }

    #[test]
    fn compat_override_extends_exec_start() {
        let unit = "[Unit]\nDescription=Bluetooth service\n\n[Service]\nExecStart=/usr/lib/bluetooth/bluetoothd\n";
        let contents = compat_override(unit).unwrap();
        assert_eq!(
            contents,
            "[Service]\nExecStart=\nExecStart=/usr/lib/bluetooth/bluetoothd --compat --noplugin=*\n"
        );
    }

    #[test]
    fn compat_override_requires_exec_start() {
        assert!(matches!(
            compat_override("[Service]\nType=dbus\n"),
            Err(Error::UnitFileMalformed)
        ));
    }

    #[test]
    fn record_handles_skip_exceptions() {
        let listing = concat!(
            "Service Name: PnP Information\n",
            "Service RecHandle: 0x10000\n",
            "\n",
            "Service Name: Headset Voice gateway\n",
            "Service RecHandle: 0x10001\n",
            "\n",
            "Service Name: AVRCP\n",
            "Service RecHandle: 0x10002\n",
        );
        assert_eq!(
            service_record_handles(listing, &["PnP Information"]),
            vec!["0x10001", "0x10002"]
        );
    }

    #[test]
    fn controller_macs_use_the_console_oui() {
        for _ in 0..16 {
            let mac = random_controller_mac();
            assert!(mac.starts_with("7C:BB:8A:"));
            assert_eq!(mac.len(), 17);
            assert!(mac_octets(&mac).is_ok());
        }
    }
}
