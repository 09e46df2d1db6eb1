//! Registry walks producing the [`AdapterRegistry`] snapshot.

use crate::adapter::{AdapterRegistry, AdapterRegistryEntry, PanelConnectionEntry};
use crate::error::{Error, Result};
use crate::tap_protocol::TAP_COMPONENT_ID;
use winreg::enums::{HKEY_LOCAL_MACHINE, KEY_READ};
use winreg::RegKey;

/// Network adapter device class.
const ADAPTER_KEY: &str =
    r"SYSTEM\CurrentControlSet\Control\Class\{4D36E972-E325-11CE-BFC1-08002BE10318}";

/// Connections shown in the network control panel.
const NETWORK_CONNECTIONS_KEY: &str =
    r"SYSTEM\CurrentControlSet\Control\Network\{4D36E972-E325-11CE-BFC1-08002BE10318}";

fn open_key(path: &str) -> Result<RegKey> {
    RegKey::predef(HKEY_LOCAL_MACHINE)
        .open_subkey_with_flags(path, KEY_READ)
        .map_err(|e| {
            let e = Error::Adapter(format!("Error opening registry key: {path}: {e}"));
            log::error!("{e}");
            e
        })
}

/// Adapters installed by the TAP driver, in registry order.
pub fn tap_adapters() -> Result<Vec<AdapterRegistryEntry>> {
    let class = open_key(ADAPTER_KEY)?;
    let mut adapters = Vec::new();
    for name in class.enum_keys() {
        let name = match name {
            Ok(name) => name,
            Err(e) => {
                log::debug!("Error enumerating registry subkeys of key: {ADAPTER_KEY}: {e}");
                break;
            }
        };
        let Ok(unit) = class.open_subkey_with_flags(&name, KEY_READ) else {
            log::debug!("Error opening registry key: {ADAPTER_KEY}\\{name}");
            continue;
        };
        let component_id: String = match unit.get_value("ComponentId") {
            Ok(id) => id,
            Err(_) => {
                log::debug!("Error opening registry key: {ADAPTER_KEY}\\{name}\\ComponentId");
                continue;
            }
        };
        if component_id != TAP_COMPONENT_ID {
            continue;
        }
        match unit.get_value::<String, _>("NetCfgInstanceId") {
            Ok(guid) => adapters.push(AdapterRegistryEntry { guid }),
            Err(_) => log::debug!("Error opening registry key: {ADAPTER_KEY}\\{name}\\NetCfgInstanceId"),
        }
    }
    Ok(adapters)
}

/// `(GUID, connection name)` pairs of the network control panel.
pub fn panel_connections() -> Result<Vec<PanelConnectionEntry>> {
    let network = open_key(NETWORK_CONNECTIONS_KEY)?;
    let mut panels = Vec::new();
    for guid in network.enum_keys() {
        let guid = match guid {
            Ok(guid) => guid,
            Err(e) => {
                log::debug!("Error enumerating registry subkeys of key: {NETWORK_CONNECTIONS_KEY}: {e}");
                break;
            }
        };
        let Ok(connection) = network.open_subkey_with_flags(format!("{guid}\\Connection"), KEY_READ)
        else {
            // Plenty of keys under here are not connections.
            continue;
        };
        match connection.get_value::<String, _>("Name") {
            Ok(name) => panels.push(PanelConnectionEntry { guid, name }),
            Err(_) => log::debug!("Error opening registry key: {NETWORK_CONNECTIONS_KEY}\\{guid}\\Connection\\Name"),
        }
    }
    Ok(panels)
}

pub fn snapshot() -> Result<AdapterRegistry> {
    Ok(AdapterRegistry::new(tap_adapters()?, panel_connections()?))
}
