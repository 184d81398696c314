//! Logical address to transport host resolution.
//!
//! Resolution prefers an authority match on `(scheme, host, port)`; when
//! several hosts share an authority the one whose base path is the longest
//! prefix of the destination path wins (most specific route). Without an
//! authority match, resolution falls back to a scheme-only lookup.

use crate::{TransportError, TransportHost};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Registry of transport hosts, shared by the bus and the outbox dispatcher.
#[derive(Default)]
pub struct HostRegistry {
    hosts: RwLock<Vec<Arc<dyn TransportHost>>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, host: Arc<dyn TransportHost>) {
        debug!(address = %host.address(), "registered transport host");
        self.hosts.write().push(host);
    }

    pub fn hosts(&self) -> Vec<Arc<dyn TransportHost>> {
        self.hosts.read().clone()
    }

    /// Resolve the host owning `address`.
    pub fn resolve(&self, address: &Url) -> Result<Arc<dyn TransportHost>, TransportError> {
        let hosts = self.hosts.read();

        let mut best: Option<(usize, Arc<dyn TransportHost>)> = None;
        let mut authority_fallback: Option<Arc<dyn TransportHost>> = None;
        for host in hosts.iter() {
            if !same_authority(host.address(), address) {
                continue;
            }
            authority_fallback.get_or_insert_with(|| host.clone());
            let base = normalized_base_path(host.address());
            if address.path().starts_with(&base) {
                let is_better = best
                    .as_ref()
                    .map(|(len, _)| base.len() > *len)
                    .unwrap_or(true);
                if is_better {
                    best = Some((base.len(), host.clone()));
                }
            }
        }
        if let Some((_, host)) = best {
            return Ok(host);
        }
        // Authority matched but no base path covers the destination: the
        // authority owner is still the closest route.
        if let Some(host) = authority_fallback {
            return Ok(host);
        }

        // Scheme-only fallback: one host per scheme.
        if let Some(host) = hosts
            .iter()
            .find(|h| h.address().scheme() == address.scheme())
        {
            return Ok(host.clone());
        }

        Err(TransportError::no_host(address))
    }
}

fn same_authority(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}

/// Base path with a guaranteed trailing slash, so prefix comparison works on
/// whole segments.
fn normalized_base_path(address: &Url) -> String {
    let path = address.path();
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}
