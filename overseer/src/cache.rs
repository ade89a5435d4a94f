use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

#[derive(Error, Debug)]
#[error("no interface with index {ifindex}: {source}")]
pub struct LookupError {
    pub ifindex: u32,
    #[source]
    pub source: nix::Error,
}

/// Resolves interface indexes against the host network stack.
pub trait LinkLookup: Send + Sync {
    fn name_of(&self, ifindex: u32) -> Result<String, LookupError>;
}

/// Production lookup through `if_indextoname(3)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLinks;

impl LinkLookup for SystemLinks {
    fn name_of(&self, ifindex: u32) -> Result<String, LookupError> {
        nix::net::if_::if_indextoname(ifindex)
            .map(|name| name.to_string_lossy().into_owned())
            .map_err(|source| LookupError { ifindex, source })
    }
}

/// Outcome of [`NameCache::set_lease_name`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseUpdate {
    Inserted,
    Updated { previous: String },
    Unchanged,
}

/// Enrichment caches shared by the exporter, the console printer and the
/// lease watcher.
///
/// Device names are memoized for the life of the process; failed lookups are
/// never cached. Lease names are keyed by lower-case hardware address and
/// follow the last write.
pub struct NameCache<L = SystemLinks> {
    links: L,
    devices: Mutex<HashMap<u32, String>>,
    leases: Mutex<HashMap<String, String>>,
}

impl NameCache<SystemLinks> {
    pub fn new() -> Self {
        Self::with_lookup(SystemLinks)
    }
}

impl Default for NameCache<SystemLinks> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Every critical section is a single map operation; poisoning leaves the
    // map consistent.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<L: LinkLookup> NameCache<L> {
    pub fn with_lookup(links: L) -> Self {
        Self {
            links,
            devices: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// Device name for `ifindex`, or its decimal form when the interface
    /// cannot be resolved.
    pub fn device_name(&self, ifindex: u32) -> String {
        let mut devices = lock(&self.devices);
        if let Some(name) = devices.get(&ifindex) {
            return name.clone();
        }

        match self.links.name_of(ifindex) {
            Ok(name) => {
                tracing::info!(ifindex, device = %name, "adding link to cache");
                devices.insert(ifindex, name.clone());
                name
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to resolve interface name");
                ifindex.to_string()
            }
        }
    }

    pub fn set_lease_name(&self, macaddr: &str, hostname: &str) -> LeaseUpdate {
        let macaddr = macaddr.to_lowercase();
        let mut leases = lock(&self.leases);

        let update = match leases.get(&macaddr) {
            Some(current) if current == hostname => return LeaseUpdate::Unchanged,
            Some(current) => {
                tracing::info!(
                    macaddr = %macaddr,
                    from = %current,
                    to = %hostname,
                    "updating lease entry"
                );
                LeaseUpdate::Updated {
                    previous: current.clone(),
                }
            }
            None => {
                tracing::info!(macaddr = %macaddr, name = %hostname, "adding lease entry");
                LeaseUpdate::Inserted
            }
        };
        leases.insert(macaddr, hostname.to_string());
        update
    }

    pub fn lease_name(&self, macaddr: &str) -> Option<String> {
        lock(&self.leases).get(&macaddr.to_lowercase()).cloned()
    }

    #[cfg(test)]
    fn cached_devices(&self) -> usize {
        lock(&self.devices).len()
    }
}
