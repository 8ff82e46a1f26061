use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use shared::protocol::DEFAULT_DOMAIN;
use shared::types::{DiscoveredService, ServiceType};

use crate::error::NetError;

/// Notifications from a [`ServicesBrowser`].
#[derive(Debug)]
pub enum BrowserEvent {
    /// The complete current membership of the discovered set. Never a
    /// delta; consumers replace their prior view wholesale.
    ServicesUpdated(Vec<DiscoveredService>),
    /// The browser stopped on a search failure. The set has already
    /// been cleared and an empty update emitted.
    Stopped { error: Option<NetError> },
}

/// Handle on a running browse task.
struct BrowseTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Watches the network for services of one type within one domain and
/// keeps the live discovered set. The set is mutated only by the
/// browse task; consumers get snapshots through events or
/// [`services`](ServicesBrowser::services).
pub struct ServicesBrowser {
    service_type: ServiceType,
    domain: String,
    daemon: ServiceDaemon,
    events: mpsc::Sender<BrowserEvent>,
    services: Arc<Mutex<HashMap<String, DiscoveredService>>>,
    active: Arc<Mutex<Option<BrowseTask>>>,
}

impl ServicesBrowser {
    pub fn new(
        service_type: ServiceType,
        daemon: ServiceDaemon,
        events: mpsc::Sender<BrowserEvent>,
    ) -> Self {
        Self {
            service_type,
            domain: DEFAULT_DOMAIN.to_string(),
            daemon,
            events,
            services: Arc::new(Mutex::new(HashMap::new())),
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn service_type(&self) -> &ServiceType {
        &self.service_type
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn is_started(&self) -> bool {
        self.lock_active().is_some()
    }

    /// Point-in-time snapshot of the discovered set.
    pub fn services(&self) -> Vec<DiscoveredService> {
        self.lock_services().values().cloned().collect()
    }

    /// Begin searching. No-op if already started. A search that cannot
    /// start at all emits an empty update followed by `Stopped` with
    /// the error.
    pub async fn start(&self) {
        let fulltype = self.service_type.qualified(&self.domain);

        // browse and spawn happen under the slot lock (both are
        // synchronous) so two racing starts cannot both get a task
        let failed = {
            let mut active = self.lock_active();
            if active.is_some() {
                return;
            }
            match self.daemon.browse(&fulltype) {
                Ok(receiver) => {
                    let cancel = CancellationToken::new();
                    let task = tokio::spawn(run_browser(
                        receiver,
                        self.events.clone(),
                        self.services.clone(),
                        self.active.clone(),
                        cancel.clone(),
                    ));
                    *active = Some(BrowseTask { cancel, task });
                    None
                }
                Err(err) => Some(err),
            }
        };

        match failed {
            None => tracing::info!("browsing for {}", fulltype),
            Some(err) => {
                tracing::error!("could not search for {}: {}", fulltype, err);
                let _ = self.events.send(BrowserEvent::ServicesUpdated(Vec::new())).await;
                let _ = self
                    .events
                    .send(BrowserEvent::Stopped {
                        error: Some(err.into()),
                    })
                    .await;
            }
        }
    }

    /// Stop searching, clear the discovered set, and emit one empty
    /// update. No-op if already stopped.
    pub async fn stop(&self) {
        let Some(browse) = self.lock_active().take() else {
            return;
        };
        browse.cancel.cancel();
        // join the task first, so a stale snapshot cannot land after
        // the empty update below
        if let Err(err) = browse.task.await {
            tracing::warn!("browse task join failed: {}", err);
        }

        let fulltype = self.service_type.qualified(&self.domain);
        if let Err(err) = self.daemon.stop_browse(&fulltype) {
            tracing::warn!("stop_browse for {} failed: {}", fulltype, err);
        }

        self.lock_services().clear();
        let _ = self.events.send(BrowserEvent::ServicesUpdated(Vec::new())).await;

        tracing::info!("stopped browsing for {}", fulltype);
    }

    fn lock_services(&self) -> MutexGuard<'_, HashMap<String, DiscoveredService>> {
        self.services.lock().expect("services lock poisoned")
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<BrowseTask>> {
        self.active.lock().expect("browser state lock poisoned")
    }
}

/// Browse task: waits for one daemon event, then drains everything
/// already queued behind it so a burst of finds or removes becomes a
/// single coalesced update.
async fn run_browser(
    receiver: flume::Receiver<ServiceEvent>,
    events: mpsc::Sender<BrowserEvent>,
    services: Arc<Mutex<HashMap<String, DiscoveredService>>>,
    active: Arc<Mutex<Option<BrowseTask>>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("browse task shutting down");
                return;
            }
            event = receiver.recv_async() => {
                match event {
                    Ok(first) => {
                        let (changed, snapshot) = {
                            let mut set = services.lock().expect("services lock poisoned");
                            let changed = drain_burst(&receiver, &mut set, first);
                            (changed, set.values().cloned().collect::<Vec<_>>())
                        };
                        if changed {
                            let _ = events.send(BrowserEvent::ServicesUpdated(snapshot)).await;
                        }
                    }
                    Err(_) => {
                        // daemon went away underneath us: hard stop
                        services.lock().expect("services lock poisoned").clear();
                        active.lock().expect("browser state lock poisoned").take();
                        let _ = events.send(BrowserEvent::ServicesUpdated(Vec::new())).await;
                        let _ = events
                            .send(BrowserEvent::Stopped {
                                error: Some(NetError::DaemonGone),
                            })
                            .await;
                        return;
                    }
                }
            }
        }
    }
}

/// Apply `first` plus every event already waiting in the receiver.
/// Returns whether membership changed.
fn drain_burst(
    receiver: &flume::Receiver<ServiceEvent>,
    set: &mut HashMap<String, DiscoveredService>,
    first: ServiceEvent,
) -> bool {
    let mut changed = apply_event(set, first);
    while let Ok(more) = receiver.try_recv() {
        changed |= apply_event(set, more);
    }
    changed
}

fn apply_event(set: &mut HashMap<String, DiscoveredService>, event: ServiceEvent) -> bool {
    match event {
        ServiceEvent::ServiceFound(_ty, fullname) => {
            // more results pending; nothing to publish until resolution
            tracing::debug!("found {}, awaiting resolution", fullname);
            false
        }
        ServiceEvent::ServiceResolved(info) => match convert_service_info(&info) {
            Some(service) => {
                tracing::debug!("resolved {}", service.fullname);
                set.insert(service.fullname.clone(), service);
                true
            }
            None => false,
        },
        ServiceEvent::ServiceRemoved(_ty, fullname) => {
            tracing::debug!("removed {}", fullname);
            set.remove(&fullname).is_some()
        }
        _ => false,
    }
}

/// Convert an mdns-sd ServiceInfo to our DiscoveredService.
fn convert_service_info(info: &mdns_sd::ServiceInfo) -> Option<DiscoveredService> {
    let addresses: Vec<std::net::IpAddr> = info.get_addresses().iter().copied().collect();

    if addresses.is_empty() {
        tracing::debug!("skipping {} - no resolved addresses", info.get_fullname());
        return None;
    }

    let txt: HashMap<String, String> = info
        .get_properties()
        .iter()
        .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
        .collect();

    Some(DiscoveredService {
        service_type: info.get_type().to_string(),
        fullname: info.get_fullname().to_string(),
        hostname: info.get_hostname().to_string(),
        addresses,
        port: info.get_port(),
        txt,
        discovered_at: Utc::now(),
    })
}
