//! Durable reconnection state.
//!
//! The Switch pins a controller to the Bluetooth address it first paired
//! with, so the address in use during a successful connection has to
//! survive process restarts and adapter resets. Each adapter gets one
//! record keyed by its short identifier; persistence is best-effort and
//! an unreadable file degrades to an empty state rather than failing the
//! operation that touched it.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

const STATE_DIR_NAME: &str = "nxlink";
const STATE_FILE_NAME: &str = "connection_state.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionState {
    #[serde(default)]
    pub adapters: BTreeMap<String, AdapterRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterRecord {
    /// First-seen hardware address of the adapter, set once and kept.
    pub original_mac: String,
    /// Address impersonated for reconnection, overwritten on every
    /// successful connection.
    pub controller_mac: String,
    /// Console addresses ever connected through this adapter, stored
    /// uppercase in first-seen order.
    #[serde(default)]
    pub switch_addresses: Vec<String>,
}

/// File-backed store for per-adapter reconnection records.
#[derive(Debug, Clone)]
pub struct ConnectionStateStore {
    path: PathBuf,
}

impl ConnectionStateStore {
    /// Store under the per-user configuration directory.
    pub fn new() -> Self {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(STATE_DIR_NAME);
        path.push(STATE_FILE_NAME);
        Self { path }
    }

    /// Store backed by an explicit file path.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the backing file. A missing, unreadable or unparseable file
    /// yields an empty state.
    pub fn load(&self) -> ConnectionState {
        match fs::read_to_string(&self.path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(state) => state,
                Err(err) => {
                    debug!("discarding unreadable connection state: {}", err);
                    ConnectionState::default()
                }
            },
            Err(err) => {
                if err.kind() != ErrorKind::NotFound {
                    debug!("failed to read connection state: {}", err);
                }
                ConnectionState::default()
            }
        }
    }

    /// Writes the full state map, creating the containing directory if
    /// needed. Best-effort: failures are logged and absorbed so
    /// persistence never blocks the primary operation.
    pub fn save(&self, state: &ConnectionState) {
        if let Err(err) = self.try_save(state) {
            debug!("failed to save connection state: {}", err);
        }
    }

    fn try_save(&self, state: &ConnectionState) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(state)?;
        fs::write(&self.path, json)
    }

    /// Merges one successful connection into the stored record for an
    /// adapter and persists.
    ///
    /// `controller_mac` is overwritten every time, `original_mac` is set
    /// only while absent, and the peer address is stored uppercase
    /// exactly once no matter its casing or how often it is reported.
    pub fn update(
        &self,
        adapter_path: &str,
        current_mac: &str,
        switch_address: &str,
        original_mac: Option<&str>,
    ) {
        let mut state = self.load();
        let record = state
            .adapters
            .entry(adapter_id(adapter_path).to_owned())
            .or_insert_with(|| AdapterRecord {
                original_mac: original_mac.unwrap_or(current_mac).to_owned(),
                controller_mac: current_mac.to_owned(),
                switch_addresses: Vec::new(),
            });

        record.controller_mac = current_mac.to_owned();
        if record.original_mac.is_empty() {
            if let Some(mac) = original_mac {
                record.original_mac = mac.to_owned();
            }
        }

        if !switch_address.is_empty()
            && !record
                .switch_addresses
                .iter()
                .any(|addr| addr.eq_ignore_ascii_case(switch_address))
        {
            record.switch_addresses.push(switch_address.to_uppercase());
        }

        self.save(&state);
        debug!(
            "updated connection state: adapter={}, mac={}, switch={}",
            adapter_id(adapter_path),
            current_mac,
            switch_address
        );
    }

    /// Address used during the last successful connection for an
    /// adapter, the one a remembered console will accept.
    pub fn controller_mac(&self, adapter_path: &str) -> Option<String> {
        self.load()
            .adapters
            .get(adapter_id(adapter_path))
            .map(|record| record.controller_mac.clone())
    }

    /// Stored console addresses, optionally filtered by adapter.
    ///
    /// Without a filter the union across all adapters is returned with
    /// duplicates removed, first occurrence winning.
    pub fn switch_addresses(&self, adapter_path: Option<&str>) -> Vec<String> {
        let state = self.load();
        match adapter_path {
            Some(path) => state
                .adapters
                .get(adapter_id(path))
                .map(|record| record.switch_addresses.clone())
                .unwrap_or_default(),
            None => {
                let mut union: Vec<String> = Vec::new();
                for record in state.adapters.values() {
                    for addr in &record.switch_addresses {
                        if !union.iter().any(|seen| seen.eq_ignore_ascii_case(addr)) {
                            union.push(addr.clone());
                        }
                    }
                }
                union
            }
        }
    }
}

impl Default for ConnectionStateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Final segment of an adapter object path, used as the persistence key.
pub(crate) fn adapter_id(adapter_path: &str) -> &str {
    adapter_path.rsplit('/').next().unwrap_or(adapter_path)
}
