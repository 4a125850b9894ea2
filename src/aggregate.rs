use std::collections::{ BTreeMap, HashSet };

use crate::scan::{ PortState, ScanResult, Service };

/// Service key shared by every port whose service name is empty.
pub const UNDEFINED_SERVICE: &str = "Undefined service";

/// Groupings derived from a scan. Address lists keep host and port order
/// exactly as parsed and are never deduplicated.
#[derive(Debug, Default, PartialEq)]
pub struct Aggregate {
    pub state_counts: BTreeMap<PortState, usize>,
    pub by_port: BTreeMap<u16, Vec<String>>,
    pub by_service: BTreeMap<String, Vec<String>>,
}

impl Aggregate {
    pub fn from_scan(result: &ScanResult) -> Self {
        let mut agg = Aggregate::default();
        for host in &result.hosts {
            let address = host.address();
            for port in &host.ports {
                *agg.state_counts.entry(port.state).or_insert(0) += 1;
                agg.by_port.entry(port.port_id).or_default().push(address.to_owned());
                agg.by_service
                    .entry(service_key(&port.service))
                    .or_default()
                    .push(address.to_owned());
            }
        }
        agg
    }

    /// Number of (host, port) pairs seen.
    pub fn total_ports(&self) -> usize {
        self.state_counts.values().sum()
    }

    pub fn count(&self, state: PortState) -> usize {
        self.state_counts.get(&state).copied().unwrap_or(0)
    }
}

/// `name@version`, or [`UNDEFINED_SERVICE`] when the name is empty. The
/// version is ignored in the latter case, so unnamed services merge.
pub fn service_key(service: &Service) -> String {
    if service.name.is_empty() {
        return UNDEFINED_SERVICE.to_owned();
    }
    format!("{}@{}", service.name, service.version)
}

/// Distinct (product, version) pairs in first-seen order.
pub fn service_pairs(result: &ScanResult) -> Vec<(String, String)> {
    let mut seen = HashSet::new();
    let mut pairs = vec![];
    for port in result.hosts.iter().flat_map(|h| h.ports.iter()) {
        let pair = (port.service.product.clone(), port.service.version.clone());
        if seen.insert(pair.clone()) {
            pairs.push(pair);
        }
    }
    pairs
}
