//! mDNS advertisement of the TNP endpoint.
//!
//! Zwift discovers TNP bridges by browsing `_wahoo-fitness-tnp._tcp` and
//! reading the TXT records: `ble-service-uuids` (comma-separated 16-bit
//! short UUIDs), `mac-address` and `serial-number`. The UUID list starts
//! empty and grows as services register; every change is re-published.

use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{info, warn};
use mdns_sd::{ServiceDaemon, ServiceInfo};

pub const SERVICE_TYPE: &str = "_wahoo-fitness-tnp._tcp.local.";

pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
    instance: String,
    hostname: String,
    port: u16,
    mac: String,
    serial: String,
    short_uuids: Mutex<Vec<String>>,
}

impl MdnsAdvertiser {
    pub fn new(serial: &str, mac: &str, port: u16) -> Result<Self, mdns_sd::Error> {
        Ok(MdnsAdvertiser {
            daemon: ServiceDaemon::new()?,
            instance: instance_name(serial),
            hostname: format!("kickr-bridge-{}.local.", serial),
            port,
            mac: mac.to_string(),
            serial: serial.to_string(),
            short_uuids: Mutex::new(Vec::new()),
        })
    }

    fn uuids(&self) -> MutexGuard<'_, Vec<String>> {
        self.short_uuids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// (Re-)announce the service with the current TXT records.
    pub fn publish(&self) -> Result<(), mdns_sd::Error> {
        let uuid_list = self.uuids().join(",");
        let properties = [
            ("ble-service-uuids", uuid_list.as_str()),
            ("mac-address", self.mac.as_str()),
            ("serial-number", self.serial.as_str()),
        ];
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            &self.instance,
            &self.hostname,
            "",
            self.port,
            &properties[..],
        )?
        .enable_addr_auto();
        self.daemon.register(info)?;
        info!(
            "mDNS: '{}' on port {} (services: [{}])",
            self.instance, self.port, uuid_list
        );
        Ok(())
    }

    /// Append a short service UUID to the TXT list and re-publish.
    /// Idempotent; re-publish failures are logged, not fatal.
    pub fn add_service_uuid(&self, short: u16) {
        let hex = format!("{:04X}", short);
        {
            let mut uuids = self.uuids();
            if uuids.contains(&hex) {
                return;
            }
            uuids.push(hex);
        }
        if let Err(e) = self.publish() {
            warn!("mDNS re-publish failed: {}", e);
        }
    }

    pub fn shutdown(&self) {
        let _ = self.daemon.shutdown();
    }
}

fn instance_name(serial: &str) -> String {
    format!("KICKR BIKE PRO {}", serial)
}
