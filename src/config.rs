//! Persistent bridge identity.
//!
//! Reads and writes `bridge_config.json` so the bridge keeps the same
//! serial number and MAC across restarts — Zwift pairs against both.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Saved bridge identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub serial: String,
    /// Dash-separated, as published in the mDNS TXT record.
    pub mac: String,
}

impl BridgeConfig {
    /// Name presented over BLE and mDNS.
    pub fn device_name(&self) -> String {
        format!("KICKR BIKE PRO {}", self.serial)
    }
}

/// Load the identity from disk. A missing or unparseable file yields
/// None; the caller decides whether that means "generate a new one".
pub fn load(path: &str) -> Option<BridgeConfig> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed = serde_json::from_str::<BridgeConfig>(&raw);
    if let Err(e) = &parsed {
        warn!("ignoring config {}: {}", path, e);
    }
    parsed.ok()
}

/// Persist the identity. Failure is logged and tolerated; the bridge
/// simply regenerates on the next start.
pub fn save(path: &str, config: &BridgeConfig) {
    let json = match serde_json::to_string_pretty(config) {
        Ok(json) => json,
        Err(e) => {
            warn!("config not serializable: {}", e);
            return;
        }
    };
    if let Err(e) = std::fs::write(path, json) {
        warn!("could not write {}: {}", path, e);
    }
}

/// Load the config, generating and persisting a fresh identity on first
/// run.
pub fn load_or_create(path: &str) -> BridgeConfig {
    match load(path) {
        Some(config) => {
            info!("identity: serial={} mac={}", config.serial, config.mac);
            config
        }
        None => {
            let serial = generate_serial();
            let config = BridgeConfig { mac: derive_mac(&serial), serial };
            info!("new identity: serial={} mac={}", config.serial, config.mac);
            save(path, &config);
            config
        }
    }
}

// Nine-digit serial in the format Wahoo uses, seeded from the clock.
fn generate_serial() -> String {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("22{:07}", seconds % 10_000_000)
}

// Locally administered MAC derived from the serial, dash-separated.
fn derive_mac(serial: &str) -> String {
    let mut octets = [0u8; 5];
    for (i, byte) in serial.bytes().enumerate() {
        octets[i % 5] = octets[i % 5].wrapping_mul(31).wrapping_add(byte);
    }
    format!(
        "F2-{:02X}-{:02X}-{:02X}-{:02X}-{:02X}",
        octets[0], octets[1], octets[2], octets[3], octets[4]
    )
}
