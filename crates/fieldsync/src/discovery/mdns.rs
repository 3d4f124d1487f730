//! LAN discovery over multicast DNS.
//!
//! Each device registers a DNS-SD service `<instance>.<type>.local.` whose
//! SRV record points at its replication server. The full announcement rides
//! in TXT properties:
//!
//! ```text
//! id=<device id hex>  deviceName=field laptop  deviceType=mobile
//! ```
//!
//! Browsing maps resolved services to `Up` and removed ones to `Down`.
//! Expiry and re-announcement are left to the responder.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use fieldsync_core::DeviceType;

use super::{Announcement, Discovery, DiscoveryEvent};
use crate::error::{EngineError, Result};

/// TXT key holding the full announcement name.
const TXT_ID: &str = "id";
const TXT_DEVICE_NAME: &str = "deviceName";
const TXT_DEVICE_TYPE: &str = "deviceType";

/// DNS labels are at most 63 bytes; device ids are longer.
const INSTANCE_LEN: usize = 32;

fn mdns_error(e: mdns_sd::Error) -> EngineError {
    EngineError::Discovery(e.to_string())
}

/// `_fieldsync._tcp` becomes `_fieldsync._tcp.local.`.
pub fn service_domain(service_type: &str) -> String {
    format!("{}.local.", service_type.trim_end_matches('.'))
}

fn instance_name(name: &str) -> String {
    name.chars().take(INSTANCE_LEN).collect()
}

/// Build the service record for an announcement.
pub fn service_info(announcement: &Announcement) -> Result<ServiceInfo> {
    let instance = instance_name(&announcement.name);
    let host_name = format!("{instance}.local.");
    let properties = [
        (TXT_ID, announcement.name.as_str()),
        (TXT_DEVICE_NAME, announcement.device_name.as_str()),
        (TXT_DEVICE_TYPE, announcement.device_type.as_str()),
    ];

    // A wildcard bind is advertised on every interface the daemon uses.
    let fixed = announcement
        .host
        .parse::<IpAddr>()
        .ok()
        .filter(|ip| !ip.is_unspecified())
        .map(|ip| ip.to_string())
        .unwrap_or_default();
    let info = ServiceInfo::new(
        &service_domain(&announcement.service_type),
        &instance,
        &host_name,
        fixed.as_str(),
        announcement.port,
        &properties[..],
    )
    .map_err(mdns_error)?;

    Ok(if fixed.is_empty() {
        info.enable_addr_auto()
    } else {
        info
    })
}

fn device_type(value: Option<&str>) -> DeviceType {
    match value {
        Some("desktop") | None => DeviceType::Desktop,
        Some("mobile") => DeviceType::Mobile,
        Some(_) => DeviceType::Unknown,
    }
}

/// Read an announcement back from a resolved service. `None` if it has no
/// usable address.
pub fn announcement_from(info: &ServiceInfo, service_type: &str) -> Option<Announcement> {
    let addresses = info.get_addresses();
    let host = addresses
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addresses.iter().next())?;

    let fullname = info.get_fullname();
    let instance = fullname.split('.').next().unwrap_or(fullname);
    let name = info.get_property_val_str(TXT_ID).unwrap_or(instance);

    Some(Announcement {
        name: name.to_string(),
        host: host.to_string(),
        port: info.get_port(),
        service_type: service_type.to_string(),
        device_name: info
            .get_property_val_str(TXT_DEVICE_NAME)
            .unwrap_or_default()
            .to_string(),
        device_type: device_type(info.get_property_val_str(TXT_DEVICE_TYPE)),
    })
}

/// Turns daemon events for one service type into discovery events.
struct Browser {
    service_type: String,
    /// Resolved services by full name.
    seen: HashMap<String, Announcement>,
}

impl Browser {
    fn new(service_type: &str) -> Self {
        Self {
            service_type: service_type.to_string(),
            seen: HashMap::new(),
        }
    }

    fn on_event(&mut self, event: ServiceEvent) -> Option<DiscoveryEvent> {
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let Some(announcement) = announcement_from(&info, &self.service_type) else {
                    trace!(service = info.get_fullname(), "resolved service has no address");
                    return None;
                };
                let fullname = info.get_fullname().to_string();
                if self.seen.get(&fullname) == Some(&announcement) {
                    return None;
                }
                self.seen.insert(fullname, announcement.clone());
                Some(DiscoveryEvent::Up(announcement))
            }
            ServiceEvent::ServiceRemoved(_, fullname) => {
                let announcement = self.seen.remove(&fullname)?;
                Some(DiscoveryEvent::Down {
                    name: announcement.name,
                })
            }
            other => {
                trace!(event = ?other, "mdns event");
                None
            }
        }
    }
}

struct Browsing {
    domain: String,
    task: JoinHandle<()>,
}

/// Multicast DNS discovery backed by an [`mdns_sd::ServiceDaemon`].
pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    /// Full name of the registered service.
    registered: Mutex<Option<String>>,
    browsing: Mutex<Option<Browsing>>,
}

impl MdnsDiscovery {
    /// Start the responder daemon.
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(mdns_error)?;
        Ok(Self {
            daemon,
            registered: Mutex::new(None),
            browsing: Mutex::new(None),
        })
    }

    fn unregister(&self) {
        let fullname = lock(&self.registered).take();
        if let Some(fullname) = fullname {
            debug!(service = %fullname, "unregistering");
            if let Err(e) = self.daemon.unregister(&fullname) {
                warn!(service = %fullname, error = %e, "failed to unregister service");
            }
        }
    }

    fn stop(&self) {
        let browsing = lock(&self.browsing).take();
        if let Some(browsing) = browsing {
            // The browse task ends on the daemon's SearchStopped event.
            if let Err(e) = self.daemon.stop_browse(&browsing.domain) {
                debug!(error = %e, "stop browse failed");
                browsing.task.abort();
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl Discovery for MdnsDiscovery {
    async fn announce(&self, announcement: Announcement) -> Result<()> {
        let info = service_info(&announcement)?;
        let fullname = info.get_fullname().to_string();
        self.unregister();

        self.daemon.register(info).map_err(mdns_error)?;
        debug!(service = %fullname, port = announcement.port, "registered service");
        *lock(&self.registered) = Some(fullname);
        Ok(())
    }

    async fn unannounce(&self) -> Result<()> {
        self.unregister();
        Ok(())
    }

    async fn browse(&self, service_type: &str) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>> {
        self.stop();

        let domain = service_domain(service_type);
        let events = self.daemon.browse(&domain).map_err(mdns_error)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut browser = Browser::new(service_type);

        let task = tokio::task::spawn_blocking(move || {
            while let Ok(event) = events.recv() {
                if matches!(event, ServiceEvent::SearchStopped(_)) {
                    break;
                }
                if let Some(event) = browser.on_event(event) {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            }
            trace!("mdns browse ended");
        });
        debug!(service = %domain, "browsing");
        *lock(&self.browsing) = Some(Browsing { domain, task });
        Ok(rx)
    }

    async fn stop_browsing(&self) -> Result<()> {
        self.stop();
        Ok(())
    }
}

impl Drop for MdnsDiscovery {
    fn drop(&mut self) {
        self.unregister();
        self.stop();
        if let Err(e) = self.daemon.shutdown() {
            debug!(error = %e, "mdns daemon shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_SERVICE_TYPE;

    fn announcement(device_type: DeviceType) -> Announcement {
        Announcement {
            name: "ab".repeat(32),
            host: "192.168.1.20".to_string(),
            port: 50211,
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            device_name: "field laptop".to_string(),
            device_type,
        }
    }

    #[test]
    fn test_service_domain() {
        assert_eq!(service_domain("_fieldsync._tcp"), "_fieldsync._tcp.local.");
        assert_eq!(service_domain("_fieldsync._tcp."), "_fieldsync._tcp.local.");
    }

    #[test]
    fn test_record_carries_whole_announcement() {
        let original = announcement(DeviceType::Mobile);
        let info = service_info(&original).unwrap();

        assert_eq!(info.get_port(), 50211);
        let instance = info.get_fullname().split('.').next().unwrap();
        assert!(instance.len() <= 63);
        assert_eq!(
            announcement_from(&info, DEFAULT_SERVICE_TYPE),
            Some(original)
        );
    }

    #[test]
    fn test_wildcard_host_has_no_fixed_address() {
        let mut wildcard = announcement(DeviceType::Desktop);
        wildcard.host = "0.0.0.0".to_string();
        let info = service_info(&wildcard).unwrap();
        assert!(info.get_addresses().is_empty());
        // Nothing to connect to until the daemon fills in addresses.
        assert_eq!(announcement_from(&info, DEFAULT_SERVICE_TYPE), None);
    }

    #[test]
    fn test_unknown_device_type_tolerated() {
        assert_eq!(device_type(Some("tablet")), DeviceType::Unknown);
        assert_eq!(device_type(None), DeviceType::Desktop);
    }

    #[test]
    fn test_browser_maps_resolved_and_removed() {
        let original = announcement(DeviceType::Desktop);
        let info = service_info(&original).unwrap();
        let fullname = info.get_fullname().to_string();
        let domain = service_domain(DEFAULT_SERVICE_TYPE);
        let mut browser = Browser::new(DEFAULT_SERVICE_TYPE);

        assert_eq!(
            browser.on_event(ServiceEvent::SearchStarted(domain.clone())),
            None
        );
        assert_eq!(
            browser.on_event(ServiceEvent::ServiceResolved(info.clone())),
            Some(DiscoveryEvent::Up(original.clone()))
        );
        // Re-resolving the same record is not news.
        assert_eq!(browser.on_event(ServiceEvent::ServiceResolved(info)), None);

        // The removal is reported under the device id, not the instance label.
        assert_eq!(
            browser.on_event(ServiceEvent::ServiceRemoved(domain.clone(), fullname.clone())),
            Some(DiscoveryEvent::Down {
                name: original.name
            })
        );
        assert_eq!(
            browser.on_event(ServiceEvent::ServiceRemoved(domain, fullname)),
            None
        );
    }

    #[test]
    fn test_browser_reports_moved_service() {
        let mut browser = Browser::new(DEFAULT_SERVICE_TYPE);
        let first = announcement(DeviceType::Desktop);
        browser.on_event(ServiceEvent::ServiceResolved(service_info(&first).unwrap()));

        let moved = Announcement {
            port: 50300,
            ..first
        };
        assert_eq!(
            browser.on_event(ServiceEvent::ServiceResolved(service_info(&moved).unwrap())),
            Some(DiscoveryEvent::Up(moved))
        );
    }
}
