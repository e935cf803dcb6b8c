//! User space side of the miss notifications.
//!
//! The dataplane reports every service address it sees on the outgoing
//! path. The control plane resolves those services to instance addresses
//! and publishes the lists the dataplane reads.

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc;
use zon_nat_dp::{BackendRegistry, MissEvent, RegistryError};

/// Source of the instance addresses of a service.
pub trait Resolver: Send {
    fn resolve(&self, service: Ipv4Addr) -> Option<Vec<Ipv4Addr>>;
}

/// Resolver backed by the service table of the config file.
#[derive(Default)]
pub struct StaticResolver {
    table: HashMap<Ipv4Addr, Vec<Ipv4Addr>>,
}

impl StaticResolver {
    pub fn new<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (Ipv4Addr, Vec<Ipv4Addr>)>,
    {
        Self {
            table: entries.into_iter().collect(),
        }
    }
}

impl Resolver for StaticResolver {
    fn resolve(&self, service: Ipv4Addr) -> Option<Vec<Ipv4Addr>> {
        self.table.get(&service).cloned()
    }
}

pub struct ControlPlane<R: Resolver> {
    registry: Arc<BackendRegistry>,
    resolver: R,
    refresh_interval: chrono::Duration,
    last_seen: HashMap<Ipv4Addr, DateTime<Utc>>,
}

impl<R: Resolver> ControlPlane<R> {
    pub fn new(registry: Arc<BackendRegistry>, resolver: R, refresh_interval: Duration) -> Self {
        Self {
            registry,
            resolver,
            refresh_interval: chrono::Duration::from_std(refresh_interval)
                .unwrap_or_else(|_| chrono::Duration::zero()),
            last_seen: HashMap::new(),
        }
    }

    /// Handles one notification, returns true if a new instance list
    /// was published. Repeated events for the same service inside the
    /// refresh interval are ignored.
    pub fn handle(&mut self, event: MissEvent) -> Result<bool, RegistryError> {
        let service = event.service;

        if let Some(last) = self.last_seen.get(&service) {
            if event.timestamp.signed_duration_since(*last) < self.refresh_interval {
                return Ok(false);
            }
        }
        self.last_seen.insert(service, event.timestamp);

        let Some(instances) = self.resolver.resolve(service) else {
            debug!("[ctl] no instances known for {}", service);
            return Ok(false);
        };

        let unchanged = self
            .registry
            .lookup_instances(u32::from(service))
            .is_some_and(|current| {
                current
                    .as_slice()
                    .iter()
                    .copied()
                    .eq(instances.iter().map(|&ip| u32::from(ip)))
            });
        if unchanged {
            return Ok(false);
        }

        self.registry.publish(service, &instances)?;
        info!(
            "[ctl] {} resolved to {} instances",
            service,
            instances.len()
        );
        Ok(true)
    }

    /// Consumes notifications until every sender is dropped and returns
    /// the number of published lists.
    pub async fn run(mut self, mut rx: mpsc::Receiver<MissEvent>) -> usize {
        let mut published = 0;

        while let Some(event) = rx.recv().await {
            match self.handle(event) {
                Ok(true) => published += 1,
                Ok(false) => {}
                Err(e) => error!("[ctl] can't publish {}, {}", event.service, e),
            }
        }

        info!("[ctl] notification channel closed");
        published
    }
}
