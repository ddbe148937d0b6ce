//! Which host runs which service, fixed for the life of the process.

use std::collections::HashMap;

use tideway_common::{ServiceKind, TidewayError};
use tideway_fleet::{FleetActuator, HostServices};
use tracing::info;

/// Flat service-id → host mapping plus per-kind counts, filled once from
/// the fleet's discovery probe.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    host_of: HashMap<String, String>,
    hosts: Vec<String>,
    ost_count: usize,
    client_count: usize,
}

impl ServiceRegistry {
    /// Probe every host and build the registry. Called once at startup.
    pub async fn detect(fleet: &dyn FleetActuator) -> tideway_common::Result<Self> {
        let discovered = fleet
            .discover_services()
            .await
            .map_err(|e| TidewayError::Setup(e.to_string()))?;
        Self::from_discovery(discovered)
    }

    /// Build from an already-run discovery. A service id claimed by two
    /// hosts means the cluster is misconfigured; refuse to start.
    pub fn from_discovery(discovered: Vec<HostServices>) -> tideway_common::Result<Self> {
        let mut registry = Self::default();
        for entry in discovered {
            registry.hosts.push(entry.hostname.clone());
            for service in entry.services {
                if let Some(previous) = registry
                    .host_of
                    .insert(service.id.clone(), entry.hostname.clone())
                {
                    return Err(TidewayError::Setup(format!(
                        "two hosts [{previous}] and [{}] for service [{}]",
                        entry.hostname, service.id
                    )));
                }
                match service.kind {
                    ServiceKind::Ost => registry.ost_count += 1,
                    ServiceKind::Client => registry.client_count += 1,
                    ServiceKind::Mdt | ServiceKind::Mgs => {}
                }
            }
        }
        info!(
            hosts = registry.hosts.len(),
            osts = registry.ost_count,
            clients = registry.client_count,
            "service registry built"
        );
        Ok(registry)
    }

    pub fn host_of(&self, service_id: &str) -> Option<&str> {
        self.host_of.get(service_id).map(String::as_str)
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn ost_count(&self) -> usize {
        self.ost_count
    }

    pub fn client_count(&self) -> usize {
        self.client_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tideway_fleet::ServiceRecord;

    fn host(hostname: &str, ids: &[(&str, ServiceKind)]) -> HostServices {
        HostServices {
            hostname: hostname.to_string(),
            services: ids
                .iter()
                .map(|(id, kind)| ServiceRecord {
                    kind: *kind,
                    id: id.to_string(),
                    mount_point: None,
                })
                .collect(),
        }
    }

    #[test]
    fn maps_services_to_hosts() {
        let registry = ServiceRegistry::from_discovery(vec![
            host(
                "oss0",
                &[("OST0000", ServiceKind::Ost), ("OST0001", ServiceKind::Ost)],
            ),
            host(
                "mixed0",
                &[("MDT0000", ServiceKind::Mdt), ("c0:/mnt", ServiceKind::Client)],
            ),
        ])
        .unwrap();

        assert_eq!(registry.host_of("OST0001"), Some("oss0"));
        assert_eq!(registry.host_of("MDT0000"), Some("mixed0"));
        assert_eq!(registry.host_of("OST9999"), None);
        assert_eq!(registry.ost_count(), 2);
        assert_eq!(registry.client_count(), 1);
        assert_eq!(registry.hosts().len(), 2);
    }

    #[test]
    fn duplicate_service_id_is_fatal() {
        let result = ServiceRegistry::from_discovery(vec![
            host("oss0", &[("OST0000", ServiceKind::Ost)]),
            host("oss1", &[("OST0000", ServiceKind::Ost)]),
        ]);
        assert!(result.is_err());
    }
}
