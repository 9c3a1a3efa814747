//! mDNS/DNS-SD service advertisement for LAN discovery.
//!
//! Advertises `_hubd._tcp.local.` so that devices on the same LAN can find
//! the gateway before the user ever types its address — the pairing code is
//! still required to attach.

use mdns_sd::{ServiceDaemon, ServiceInfo};
use tracing::{info, warn};

/// Holds the mDNS daemon and service name.
/// The service is unregistered when this guard is dropped.
pub struct MdnsGuard {
    daemon: ServiceDaemon,
    fullname: String,
}

impl Drop for MdnsGuard {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            warn!(err = %e, "mDNS unregister failed on shutdown");
        }
        if let Err(e) = self.daemon.shutdown() {
            warn!(err = %e, "mDNS daemon shutdown failed");
        }
        info!("mDNS advertisement unregistered");
    }
}

/// Start advertising `_hubd._tcp.local.` on `port`.
/// Returns `None` if mDNS is unavailable (non-fatal).
///
/// Expected to fail on headless servers, containers, or systems without
/// multicast networking — the gateway continues without LAN discovery and
/// clients connect via explicit address.
pub fn advertise(gateway_id: &str, port: u16) -> Option<MdnsGuard> {
    match try_advertise(gateway_id, port) {
        Ok(guard) => {
            info!(port = port, "mDNS advertisement registered (_hubd._tcp.local)");
            Some(guard)
        }
        Err(e) => {
            warn!(
                err = %e,
                port = port,
                "mDNS advertisement failed — LAN discovery will not be available; \
                 connect via explicit address (localhost:{})",
                port,
            );
            None
        }
    }
}

fn try_advertise(gateway_id: &str, port: u16) -> anyhow::Result<MdnsGuard> {
    let mdns =
        ServiceDaemon::new().map_err(|e| anyhow::anyhow!("failed to start mDNS daemon: {e}"))?;

    // Instance name: hubd-{first 8 chars of gateway_id}
    let short_id = &gateway_id[..8.min(gateway_id.len())];
    let instance_name = format!("hubd-{short_id}");

    let mut props = std::collections::HashMap::new();
    props.insert("version".to_owned(), env!("CARGO_PKG_VERSION").to_owned());
    props.insert("gateway_id".to_owned(), gateway_id.to_owned());

    let service_info = ServiceInfo::new(
        "_hubd._tcp.local.",
        &instance_name,
        "localhost.local.",
        "", // empty = mdns-sd auto-detects local IP(s)
        port,
        Some(props),
    )?;

    let fullname = service_info.get_fullname().to_owned();
    mdns.register(service_info)?;

    Ok(MdnsGuard {
        daemon: mdns,
        fullname,
    })
}
