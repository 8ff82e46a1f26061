use std::collections::HashMap;
use mdns_sd::{ServiceDaemon, ServiceInfo};

use shared::protocol::TXT_DEVICE;
use shared::types::ServiceType;

use crate::error::NetError;

/// Publish a service instance listening on `port`. Addresses are
/// auto-resolved from the machine's interfaces, and the TXT record
/// carries the device name.
pub fn register_service(
    daemon: &ServiceDaemon,
    instance_name: &str,
    service_type: &ServiceType,
    domain: &str,
    port: u16,
) -> Result<ServiceInfo, NetError> {
    let hostname = hostname::get()?.to_string_lossy().to_string();
    let host = format!("{}.{}", hostname, domain);

    let txt_records = HashMap::from([(TXT_DEVICE.to_string(), instance_name.to_string())]);

    let service_info = ServiceInfo::new(
        &service_type.qualified(domain),
        instance_name,
        &host,
        "",
        port,
        txt_records,
    )?
    .enable_addr_auto();

    daemon.register(service_info.clone())?;

    tracing::info!(
        "registered {} as {} on port {}",
        service_type.qualified(domain),
        instance_name,
        port
    );

    Ok(service_info)
}

pub fn unregister_service(daemon: &ServiceDaemon, fullname: &str) -> Result<(), NetError> {
    let _ = daemon.unregister(fullname)?;

    tracing::info!("unregistered {}", fullname);
    Ok(())
}
