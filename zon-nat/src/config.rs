use anyhow::{anyhow, Context};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::OpenOptions,
    io::{Read, Write},
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::Duration,
};
use zon_nat_common::{ProtoFlags, MAX_INSTANCES, MAX_SERVICES};
use zon_nat_dp::{ChecksumMode, ProxyConfig, SelectionMode, Selector};

fn default_selection() -> String {
    SelectionMode::Random.to_string()
}

fn default_checksum() -> String {
    "incremental".to_string()
}

fn default_protocols() -> Vec<String> {
    vec!["tcp".to_string(), "udp".to_string()]
}

fn default_notify_capacity() -> usize {
    1024
}

fn default_refresh_interval_ms() -> u64 {
    1000
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    /// Destination subnet handled by the translator, `a.b.c.d/len`
    pub subnet: Ipv4Net,
    #[serde(default = "default_selection")]
    pub selection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default = "default_checksum")]
    pub checksum: String,
    #[serde(default = "default_protocols")]
    pub protocols: Vec<String>,
    #[serde(default = "default_notify_capacity")]
    pub notify_capacity: usize,
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    /// Service address to instance addresses
    #[serde(default)]
    pub services: BTreeMap<String, Vec<String>>,
}

impl Config {
    pub fn new(subnet: Ipv4Net) -> Self {
        Self {
            subnet,
            selection: default_selection(),
            seed: None,
            checksum: default_checksum(),
            protocols: default_protocols(),
            notify_capacity: default_notify_capacity(),
            refresh_interval_ms: default_refresh_interval_ms(),
            services: BTreeMap::new(),
        }
    }

    pub fn description(&self) -> String {
        let icount = self.services.values().fold(0, |acc, i| acc + i.len());
        format!(
            "Subnet {}, {} services with {} instances, {} selection",
            self.subnet,
            self.services.len(),
            icount,
            self.selection
        )
    }

    /// Checks every field, the returned error names the first bad one.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        self.proxy_config()?;
        self.selection_mode()?;
        self.services()?;
        if self.notify_capacity == 0 {
            return Err(anyhow!("notify_capacity must be greater than 0"));
        }
        Ok(())
    }

    pub fn selection_mode(&self) -> Result<SelectionMode, anyhow::Error> {
        self.selection.parse().map_err(|e: String| anyhow!(e))
    }

    pub fn checksum_mode(&self) -> Result<ChecksumMode, anyhow::Error> {
        self.checksum.parse().map_err(|e: String| anyhow!(e))
    }

    pub fn proto_flags(&self) -> Result<ProtoFlags, anyhow::Error> {
        let mut flags = ProtoFlags::empty();
        for proto in &self.protocols {
            match proto.to_ascii_lowercase().as_str() {
                "tcp" => flags.insert(ProtoFlags::TCP),
                "udp" => flags.insert(ProtoFlags::UDP),
                _ => return Err(anyhow!("Unknown protocol '{}'", proto)),
            }
        }
        if flags.is_empty() {
            return Err(anyhow!("No protocol enabled"));
        }
        Ok(flags)
    }

    pub fn proxy_config(&self) -> Result<ProxyConfig, anyhow::Error> {
        let mut cfg = ProxyConfig::new(self.subnet);
        cfg.protocols = self.proto_flags()?;
        cfg.checksum = self.checksum_mode()?;
        Ok(cfg)
    }

    pub fn selector(&self) -> Result<Selector, anyhow::Error> {
        Ok(Selector::new(self.selection_mode()?, self.seed))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    /// Parsed service table, sorted by service address.
    pub fn services(&self) -> Result<Vec<(Ipv4Addr, Vec<Ipv4Addr>)>, anyhow::Error> {
        if self.services.len() > MAX_SERVICES {
            return Err(anyhow!(
                "Too many services {}, max is {}",
                self.services.len(),
                MAX_SERVICES
            ));
        }

        let mut services = Vec::with_capacity(self.services.len());
        for (service, instances) in &self.services {
            let addr: Ipv4Addr = service
                .parse()
                .context(format!("Invalid service address '{}'", service))?;

            if instances.len() > MAX_INSTANCES {
                return Err(anyhow!(
                    "Service {} has {} instances, max is {}",
                    service,
                    instances.len(),
                    MAX_INSTANCES
                ));
            }

            let instances = instances
                .iter()
                .map(|i| {
                    i.parse::<Ipv4Addr>()
                        .context(format!("Invalid instance address '{}' for {}", i, service))
                })
                .collect::<Result<Vec<_>, _>>()?;

            services.push((addr, instances));
        }

        services.sort_by_key(|(addr, _)| *addr);

        Ok(services)
    }
}

pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub fn new<P: AsRef<Path>>(filename: P) -> Self {
        Self {
            path: filename.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Config, anyhow::Error> {
        if !self.path.try_exists()? {
            return Err(anyhow!(
                "Config file does not exits, {}",
                self.path.display()
            ));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .open(&self.path)
            .context(format!("Can't read config file: {}", self.path.display()))?;
        let mut contents = String::new();
        let size = file.read_to_string(&mut contents)?;

        log::info!("Read {} bytes from: {}", size, self.path.display());

        let cfg: Config = toml::from_str(&contents)
            .context(format!("Can't parse config file: {}", self.path.display()))?;
        cfg.validate()
            .context(format!("Invalid config file: {}", self.path.display()))?;

        log::info!("Found in config: {}", cfg.description());
        Ok(cfg)
    }

    pub fn save(&self, cfg: &Config) -> Result<(), anyhow::Error> {
        if self.path.try_exists()? {
            log::info!("Config file will be overridden, {}", self.path.display());
        }

        log::info!("Saving config: {}", cfg.description());

        let contents = toml::to_string(cfg)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .context(format!("Can't write to config file: {}", self.path.display()))?;
        file.write_all(contents.as_bytes())?;

        log::info!(
            "Wrote {} bytes to config file: {}",
            contents.len(),
            self.path.display()
        );

        Ok(())
    }
}
