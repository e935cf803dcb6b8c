use crate::maps::MapError;
use arc_swap::ArcSwap;
use log::{info, warn};
use std::{collections::HashMap, net::Ipv4Addr, sync::Arc};
use thiserror::Error;
use zon_nat_common::{InstanceList, MAX_INSTANCES, MAX_SERVICES};

pub const MAP_NAME: &str = "ZN_SERVICE_TO_INSTANCE";

type ServiceMap = HashMap<u32, InstanceList>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("service {service} has {count} instances, max is {MAX_INSTANCES}")]
    TooManyInstances { service: Ipv4Addr, count: usize },
    #[error(transparent)]
    Map(#[from] MapError),
}

/// Service address to instance list store. Only the control plane writes
/// to it. Every write publishes a new copy of the whole table, so the
/// dataplane reads a snapshot without taking a lock.
pub struct BackendRegistry {
    max_entries: usize,
    services: ArcSwap<ServiceMap>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::with_max_entries(MAX_SERVICES)
    }

    pub fn with_max_entries(max: usize) -> Self {
        Self {
            max_entries: max,
            services: ArcSwap::from_pointee(HashMap::with_capacity(max)),
        }
    }

    fn admits(&self, services: &ServiceMap, service: u32) -> bool {
        services.contains_key(&service) || services.len() < self.max_entries
    }

    fn full(&self) -> RegistryError {
        RegistryError::Map(MapError::Full {
            name: MAP_NAME,
            max: self.max_entries,
        })
    }

    /// Copies the table, applies `f` to the copy and swaps it in. `f` may
    /// run more than once under contention and must only depend on the
    /// table it is given. Returns the table the change was applied to.
    fn modify<F>(&self, service: u32, f: F) -> Result<Arc<ServiceMap>, RegistryError>
    where
        F: Fn(&mut ServiceMap),
    {
        let prev = self.services.rcu(|current| {
            if !self.admits(current, service) {
                return Arc::clone(current);
            }
            let mut next = ServiceMap::clone(current);
            f(&mut next);
            Arc::new(next)
        });

        if !self.admits(&prev, service) {
            return Err(self.full());
        }
        Ok(prev)
    }

    /// Dataplane read. A missing service is the normal state until
    /// the control plane publishes it.
    pub fn lookup_instances(&self, service: u32) -> Option<InstanceList> {
        self.services.load().get(&service).copied()
    }

    /// Replaces the instances of `service`.
    pub fn publish(&self, service: Ipv4Addr, instances: &[Ipv4Addr]) -> Result<(), RegistryError> {
        if instances.len() > MAX_INSTANCES {
            return Err(RegistryError::TooManyInstances {
                service,
                count: instances.len(),
            });
        }
        let addrs: Vec<u32> = instances.iter().map(|&ip| u32::from(ip)).collect();
        self.publish_list(u32::from(service), InstanceList::from_slice(&addrs))
    }

    pub fn publish_list(&self, service: u32, list: InstanceList) -> Result<(), RegistryError> {
        self.modify(service, |services| {
            services.insert(service, list);
        })?;
        info!(
            "[reg] publish {} => {} instances",
            Ipv4Addr::from(service),
            list.len()
        );
        Ok(())
    }

    /// Adds `instance` to the list of `service`, creating the service if
    /// needed. A full list keeps its length and the new instance takes
    /// slot `len % MAX_INSTANCES`.
    pub fn add_instance(
        &self,
        service: Ipv4Addr,
        instance: Ipv4Addr,
    ) -> Result<InstanceList, RegistryError> {
        let key = u32::from(service);
        let addr = u32::from(instance);
        let extended = |services: &ServiceMap| {
            services
                .get(&key)
                .copied()
                .unwrap_or_default()
                .with_instance(addr)
        };

        let prev = self.modify(key, |services| {
            let list = extended(services);
            services.insert(key, list);
        })?;

        let current = prev.get(&key).copied().unwrap_or_default();
        if current.is_full() && !current.contains(addr) {
            warn!(
                "[reg] {} instance list is full, {} replaces {}",
                service,
                instance,
                Ipv4Addr::from(current.as_slice()[0])
            );
        } else {
            info!("[reg] add {} => {}", service, instance);
        }
        Ok(extended(&prev))
    }

    pub fn remove(&self, service: Ipv4Addr) -> Option<InstanceList> {
        let key = u32::from(service);
        let prev = self.services.rcu(|current| {
            if !current.contains_key(&key) {
                return Arc::clone(current);
            }
            let mut next = ServiceMap::clone(current);
            next.remove(&key);
            Arc::new(next)
        });
        prev.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.services.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.load().is_empty()
    }

    pub fn entries(&self) -> Vec<(Ipv4Addr, Vec<Ipv4Addr>)> {
        let mut entries: Vec<_> = self
            .services
            .load()
            .iter()
            .map(|(&svc, list)| {
                (
                    Ipv4Addr::from(svc),
                    list.as_slice().iter().map(|&ip| Ipv4Addr::from(ip)).collect(),
                )
            })
            .collect();
        entries.sort();
        entries
    }
}
