//! The two packet procedures of the translator.
//!
//! `outgoing` rewrites the destination of client packets sent to a service
//! address to one of its instances, `ingoing` rewrites the source of the
//! instance replies back to the service address. Parse failures fail open
//! (forward unmodified); the only drop is an outgoing packet whose service
//! has no published instances.

use crate::{
    checksum::{self, ChecksumMode},
    headers::{self, HeaderError, Headers, L4Proto},
    notify::MissNotifier,
    registry::BackendRegistry,
    selector::Selector,
    sessions::SessionCache,
    stats::Stats,
    subnet,
};
use ipnet::Ipv4Net;
use log::{debug, error, info, log_enabled, warn, Level};
use std::{net::Ipv4Addr, sync::Arc};
use zon_nat_common::{stats, Conversion, ProtoFlags};

/// Traffic control action codes used by the hook loader
pub const TC_ACT_OK: i32 = 0;
pub const TC_ACT_SHOT: i32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    ForwardUnmodified,
    ForwardModified,
    Drop,
}

impl Verdict {
    pub fn tc_action(&self) -> i32 {
        match self {
            Self::ForwardUnmodified | Self::ForwardModified => TC_ACT_OK,
            Self::Drop => TC_ACT_SHOT,
        }
    }

    fn stat(&self) -> u32 {
        match self {
            Self::ForwardUnmodified => stats::FORWARD_UNMODIFIED,
            Self::ForwardModified => stats::FORWARD_MODIFIED,
            Self::Drop => stats::DROP,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ProxyConfig {
    /// Destinations eligible for translation
    pub subnet: Ipv4Net,
    pub protocols: ProtoFlags,
    pub checksum: ChecksumMode,
}

impl ProxyConfig {
    pub fn new(subnet: Ipv4Net) -> Self {
        Self {
            subnet,
            protocols: ProtoFlags::default(),
            checksum: ChecksumMode::default(),
        }
    }

    fn accepts(&self, proto: L4Proto) -> bool {
        match proto {
            L4Proto::Tcp => self.protocols.contains(ProtoFlags::TCP),
            L4Proto::Udp => self.protocols.contains(ProtoFlags::UDP),
        }
    }
}

pub struct Proxy {
    config: ProxyConfig,
    registry: Arc<BackendRegistry>,
    sessions: SessionCache,
    selector: Selector,
    notifier: MissNotifier,
    stats: Stats,
}

impl Proxy {
    pub fn new(
        config: ProxyConfig,
        registry: Arc<BackendRegistry>,
        selector: Selector,
        notifier: MissNotifier,
    ) -> Self {
        Self {
            config,
            registry,
            sessions: SessionCache::new(),
            selector,
            notifier,
            stats: Stats::new(),
        }
    }

    pub fn with_sessions(mut self, sessions: SessionCache) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionCache {
        &self.sessions
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Client to service direction.
    pub fn outgoing(&self, pkt: &mut [u8]) -> Verdict {
        self.finish(self.try_outgoing(pkt), "out")
    }

    /// Instance to client direction.
    pub fn ingoing(&self, pkt: &mut [u8]) -> Verdict {
        self.finish(self.try_ingoing(pkt), "in")
    }

    fn finish(&self, rc: Result<Verdict, HeaderError>, dir: &str) -> Verdict {
        self.stats.inc(stats::PACKETS);
        let verdict = match rc {
            Ok(verdict) => verdict,
            Err(e) => {
                let idx = match e {
                    HeaderError::OutOfBounds { .. } => stats::REWRITE_ERRORS,
                    e if e.is_unsupported() => stats::UNSUPPORTED,
                    _ => stats::PARSE_ERRORS,
                };
                self.stats.inc(idx);
                if log_enabled!(Level::Debug) {
                    debug!("[{}] pass, {}", dir, e);
                }
                Verdict::ForwardUnmodified
            }
        };
        self.stats.inc(verdict.stat());
        verdict
    }

    fn parse(&self, pkt: &[u8]) -> Result<Headers, HeaderError> {
        let hdrs = headers::parse(pkt)?;
        if !self.config.accepts(hdrs.proto) {
            return Err(HeaderError::Unsupported(hdrs.proto.ip_proto()));
        }
        Ok(hdrs)
    }

    fn rewrite(
        &self,
        pkt: &mut [u8],
        hdrs: &Headers,
        field_offset: usize,
        old: u32,
        new: u32,
    ) -> Result<(), HeaderError> {
        match self.config.checksum {
            ChecksumMode::Incremental => {
                checksum::apply_address_rewrite(pkt, hdrs, field_offset, old, new)
            }
            ChecksumMode::Full => {
                checksum::apply_address_rewrite_full(pkt, hdrs, field_offset, new)
            }
        }
    }

    fn try_outgoing(&self, pkt: &mut [u8]) -> Result<Verdict, HeaderError> {
        let hdrs = self.parse(pkt)?;
        let service = hdrs.dst_addr;

        if !subnet::contains(&self.config.subnet, service) {
            return Ok(Verdict::ForwardUnmodified);
        }

        if log_enabled!(Level::Debug) {
            debug!(
                "[out] [p:{:?}] {}:{} -> {}:{}",
                hdrs.proto,
                Ipv4Addr::from(hdrs.src_addr),
                hdrs.src_port,
                Ipv4Addr::from(service),
                hdrs.dst_port
            );
        }

        // Sent for every eligible packet so the control plane keeps
        // refreshing services that are in use.
        if !self.notifier.notify(service) {
            self.stats.inc(stats::NOTIFY_LOST);
        }

        let key = hdrs.flow_key();
        let instance = match self.sessions.lookup_by_service(&key, service) {
            Some(instance) => {
                self.stats.inc(stats::SESSION_HITS);
                instance
            }
            None => {
                self.stats.inc(stats::SESSION_MISSES);

                let instance = self
                    .registry
                    .lookup_instances(service)
                    .and_then(|list| self.selector.select(service, &list));

                let Some(instance) = instance else {
                    if log_enabled!(Level::Info) {
                        info!("[out] drop, no instances for {}", Ipv4Addr::from(service));
                    }
                    self.stats.inc(stats::REGISTRY_MISSES);
                    return Ok(Verdict::Drop);
                };

                // A concurrent first packet of the same flow may have
                // stored its pick already, that one wins.
                match self
                    .sessions
                    .insert_or_get(key, Conversion::new(service, instance))
                {
                    Ok(stored) => {
                        if stored == instance && log_enabled!(Level::Info) {
                            info!(
                                "[ctrk] {}:{} {} => {} added",
                                key.src_port,
                                key.dst_port,
                                Ipv4Addr::from(service),
                                Ipv4Addr::from(instance)
                            );
                        }
                        stored
                    }
                    Err(e) => {
                        // The packet is still translated, its replies won't be.
                        error!(
                            "[ctrk] {}:{} {} not added, {}",
                            key.src_port,
                            key.dst_port,
                            Ipv4Addr::from(service),
                            e
                        );
                        self.stats.inc(stats::SESSION_ERROR_UPDATE);
                        instance
                    }
                }
            }
        };

        self.rewrite(pkt, &hdrs, hdrs.dst_addr_off(), service, instance)?;

        if log_enabled!(Level::Debug) {
            debug!(
                "[out] {} -> {}",
                Ipv4Addr::from(service),
                Ipv4Addr::from(instance)
            );
        }

        Ok(Verdict::ForwardModified)
    }

    fn try_ingoing(&self, pkt: &mut [u8]) -> Result<Verdict, HeaderError> {
        let hdrs = self.parse(pkt)?;
        let instance = hdrs.src_addr;

        // Replies carry the client ports reversed
        let key = hdrs.flow_key().swapped();

        let Some(service) = self.sessions.lookup_by_instance(&key, instance) else {
            self.stats.inc(stats::INGOING_UNTRACKED);
            return Ok(Verdict::ForwardUnmodified);
        };

        if let Err(e) = self.rewrite(pkt, &hdrs, hdrs.src_addr_off(), instance, service) {
            warn!(
                "[in] can't rewrite {} to {}, {}",
                Ipv4Addr::from(instance),
                Ipv4Addr::from(service),
                e
            );
            return Err(e);
        }

        if log_enabled!(Level::Debug) {
            debug!(
                "[in] {} -> {}",
                Ipv4Addr::from(instance),
                Ipv4Addr::from(service)
            );
        }

        Ok(Verdict::ForwardModified)
    }
}
