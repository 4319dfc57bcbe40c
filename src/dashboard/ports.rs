//! Port allocation across all known projects.
//!
//! Allocation is a pure function over the set of ports already held by
//! other records; callers run it inside the project store's writer lock so
//! two concurrent creations cannot be handed the same port.

use std::collections::{BTreeMap, HashMap};
use std::net::TcpListener;

use super::models::{AddOn, PortMap, ProjectRecord, ServiceKind, Template};
use crate::config::PortBaselines;
use crate::errors::PortError;

/// Checks whether a host port is free outside of the registry.
pub trait PortProbe: Send + Sync {
    fn is_free(&self, port: u16) -> bool;
}

/// Probes by binding a TCP listener on the loopback interface.
pub struct BindProbe;

impl PortProbe for BindProbe {
    fn is_free(&self, port: u16) -> bool {
        TcpListener::bind(("127.0.0.1", port)).is_ok()
    }
}

/// Treats every port as free; only the registry is consulted.
pub struct RegistryOnly;

impl PortProbe for RegistryOnly {
    fn is_free(&self, _port: u16) -> bool {
        true
    }
}

/// Services a project needs, in allocation order.
pub fn required_services(template: Template, addons: &[AddOn]) -> Vec<ServiceKind> {
    let mut services: Vec<ServiceKind> = template.base_services().to_vec();
    for addon in template.supported_addons() {
        if addons.contains(addon) {
            services.push(addon.service());
        }
    }
    services
}

/// Ports held by existing records, keyed by port with the owning project name.
pub fn used_ports<'a, I>(records: I) -> HashMap<u16, String>
where
    I: IntoIterator<Item = &'a ProjectRecord>,
{
    let mut used = HashMap::new();
    for record in records {
        for port in record.ports.values() {
            used.insert(*port, record.name.clone());
        }
    }
    used
}

pub struct PortAllocator<'a> {
    baselines: &'a PortBaselines,
    probe: &'a dyn PortProbe,
}

impl<'a> PortAllocator<'a> {
    pub fn new(baselines: &'a PortBaselines, probe: &'a dyn PortProbe) -> Self {
        Self { baselines, probe }
    }

    /// Assign one port per required service. Custom ports are honored when
    /// they don't collide; everything else walks upward from its baseline.
    pub fn allocate(
        &self,
        template: Template,
        addons: &[AddOn],
        custom: &BTreeMap<ServiceKind, u16>,
        used: &HashMap<u16, String>,
    ) -> Result<PortMap, PortError> {
        let services = required_services(template, addons);
        for service in custom.keys() {
            if !services.contains(service) {
                return Err(PortError::UnknownService(service.to_string()));
            }
        }

        let mut assigned = PortMap::new();

        // Custom ports first so the walk below can step around them.
        for (service, port) in custom {
            if let Some(owner) = used.get(port) {
                return Err(PortError::InUse {
                    port: *port,
                    service: service.to_string(),
                    owner: owner.clone(),
                });
            }
            if let Some((other, _)) = assigned.iter().find(|(_, p)| *p == port) {
                return Err(PortError::Duplicate {
                    port: *port,
                    first: other.to_string(),
                    second: service.to_string(),
                });
            }
            assigned.insert(*service, *port);
        }

        let node = template == Template::Nodejs;
        for service in services {
            if assigned.contains_key(&service) {
                continue;
            }
            let baseline = self.baselines.baseline(service, node);
            let port = self.next_free(baseline, used, &assigned).ok_or_else(|| {
                PortError::Exhausted(service.to_string())
            })?;
            assigned.insert(service, port);
        }

        Ok(assigned)
    }

    fn next_free(&self, baseline: u16, used: &HashMap<u16, String>, assigned: &PortMap) -> Option<u16> {
        (baseline..=u16::MAX).find(|port| {
            !used.contains_key(port)
                && !assigned.values().any(|p| p == port)
                && self.probe.is_free(*port)
        })
    }
}
