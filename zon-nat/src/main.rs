mod config;
mod control;
mod info;
mod logging;
mod stats;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use config::{Config, ConfigFile};
use control::{ControlPlane, StaticResolver};
use info::InfoTable;
use ipnet::Ipv4Net;
use log::{info, warn, LevelFilter};
use std::{
    net::{Ipv4Addr, SocketAddrV4},
    path::PathBuf,
    sync::Arc,
};
use tokio::signal;
use zon_nat_dp::{headers, notify, BackendRegistry, FrameBuilder, Proxy, Verdict};

#[derive(Debug, Parser)]
#[clap(version, about = "Transparent per-packet IPv4 service translator")]
struct Opt {
    /// Log level, overrides RUST_LOG
    #[clap(long, global = true)]
    log_level: Option<LevelFilter>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write a sample config file
    Init {
        #[clap(short, long)]
        config: PathBuf,

        /// Override an existing file
        #[clap(long)]
        force: bool,
    },
    /// Load and validate a config file
    Check {
        #[clap(short, long)]
        config: PathBuf,
    },
    /// Show the services published from a config file
    List {
        #[clap(short, long)]
        config: PathBuf,
    },
    /// Send one packet and its reply through the translator
    Probe {
        #[clap(short, long)]
        config: PathBuf,

        /// Client endpoint, ip:port
        #[clap(long)]
        src: SocketAddrV4,

        /// Service endpoint, ip:port
        #[clap(long)]
        dst: SocketAddrV4,

        /// Use TCP instead of UDP
        #[clap(long)]
        tcp: bool,

        /// Start with an empty registry and let the control plane
        /// publish the service on the first miss
        #[clap(long)]
        lazy: bool,
    },
    /// Start the translator and the control plane until Ctrl-C
    Run {
        #[clap(short, long)]
        config: PathBuf,
    },
}

fn sample_config() -> Result<Config, anyhow::Error> {
    let mut cfg = Config::new(Ipv4Net::new(Ipv4Addr::new(10, 30, 0, 0), 16)?);
    cfg.services.insert(
        "10.30.5.5".to_string(),
        vec!["10.30.5.10".to_string(), "10.30.5.11".to_string()],
    );
    Ok(cfg)
}

fn load_registry(cfg: &Config) -> Result<Arc<BackendRegistry>, anyhow::Error> {
    let registry = Arc::new(BackendRegistry::new());
    for (service, instances) in cfg.services()? {
        registry
            .publish(service, &instances)
            .context(format!("Can't publish service {}", service))?;
    }
    Ok(registry)
}

fn print_registry(registry: &BackendRegistry) {
    let mut tab = InfoTable::new(vec!["service", "instances"]);
    for (service, instances) in registry.entries() {
        let instances = instances
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        tab.push_row(vec![service.to_string(), instances]);
    }

    if tab.is_empty() {
        println!("No services");
    } else {
        tab.print("");
    }
}

fn init(file: &ConfigFile, force: bool) -> Result<(), anyhow::Error> {
    if !force && file.path().try_exists()? {
        return Err(anyhow!(
            "Config file {} exists, use --force to override",
            file.path().display()
        ));
    }
    file.save(&sample_config()?)
}

fn check(cfg: &Config) -> Result<(), anyhow::Error> {
    let pcfg = cfg.proxy_config()?;
    println!("subnet: {}", pcfg.subnet);
    println!("selection: {}", cfg.selection_mode()?);
    println!("checksum: {:?}", pcfg.checksum);
    println!("protocols: {:?}", pcfg.protocols);
    println!("{}", cfg.description());
    Ok(())
}

fn print_packet(dir: &str, verdict: Verdict, frame: &[u8]) {
    match headers::parse(frame) {
        Ok(hdrs) => println!(
            "{dir}: {:?} {}:{} -> {}:{}",
            verdict,
            Ipv4Addr::from(hdrs.src_addr),
            hdrs.src_port,
            Ipv4Addr::from(hdrs.dst_addr),
            hdrs.dst_port
        ),
        Err(e) => println!("{dir}: {:?}, {}", verdict, e),
    }
}

fn probe(
    cfg: &Config,
    src: SocketAddrV4,
    dst: SocketAddrV4,
    tcp: bool,
    lazy: bool,
) -> Result<(), anyhow::Error> {
    let registry = if lazy {
        Arc::new(BackendRegistry::new())
    } else {
        load_registry(cfg)?
    };
    let (notifier, mut rx) = notify::channel(cfg.notify_capacity);
    let proxy = Proxy::new(
        cfg.proxy_config()?,
        registry.clone(),
        cfg.selector()?,
        notifier,
    );
    let mut ctl = ControlPlane::new(
        registry,
        StaticResolver::new(cfg.services()?),
        cfg.refresh_interval(),
    );

    let build = |from: SocketAddrV4, to: SocketAddrV4| {
        let builder = if tcp {
            FrameBuilder::tcp(from, to)
        } else {
            FrameBuilder::udp(from, to)
        };
        builder.payload(b"zon-nat probe").build()
    };

    let mut request = build(src, dst);
    let mut verdict = proxy.outgoing(&mut request);
    print_packet("out", verdict, &request);

    // Let the control plane catch up, then retransmit
    while let Ok(event) = rx.try_recv() {
        ctl.handle(event)?;
    }
    if verdict == Verdict::Drop {
        request = build(src, dst);
        verdict = proxy.outgoing(&mut request);
        print_packet("out", verdict, &request);
    }

    if verdict == Verdict::ForwardModified {
        let hdrs = headers::parse(&request)?;
        let instance = SocketAddrV4::new(Ipv4Addr::from(hdrs.dst_addr), hdrs.dst_port);
        let mut reply = build(instance, src);
        let verdict = proxy.ingoing(&mut reply);
        print_packet("in", verdict, &reply);
    }

    println!();
    stats::print_all(proxy.stats(), "");
    Ok(())
}

async fn run(cfg: &Config) -> Result<(), anyhow::Error> {
    let registry = load_registry(cfg)?;
    let (notifier, rx) = notify::channel(cfg.notify_capacity);
    let proxy = Proxy::new(
        cfg.proxy_config()?,
        registry.clone(),
        cfg.selector()?,
        notifier,
    );

    let ctl = ControlPlane::new(
        registry.clone(),
        StaticResolver::new(cfg.services()?),
        cfg.refresh_interval(),
    );
    let ctl = tokio::spawn(ctl.run(rx));

    info!(
        "Translating {} with {} services",
        proxy.config().subnet,
        registry.len()
    );
    info!("Waiting for Ctrl-C...");
    signal::ctrl_c().await?;
    info!("Exiting...");

    stats::print_all(proxy.stats(), "");

    // Closes the notification channel
    drop(proxy);
    match ctl.await {
        Ok(published) => info!("Control plane published {} lists", published),
        Err(e) => warn!("Control plane task failed, {}", e),
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let opt = Opt::parse();

    logging::init_log(opt.log_level);

    match &opt.command {
        Command::Init { config, force } => init(&ConfigFile::new(config), *force),
        Command::Check { config } => check(&ConfigFile::new(config).load()?),
        Command::List { config } => {
            let cfg = ConfigFile::new(config).load()?;
            let registry = load_registry(&cfg)?;
            print_registry(&registry);
            Ok(())
        }
        Command::Probe {
            config,
            src,
            dst,
            tcp,
            lazy,
        } => {
            let cfg = ConfigFile::new(config).load()?;
            probe(&cfg, *src, *dst, *tcp, *lazy)
        }
        Command::Run { config } => run(&ConfigFile::new(config).load()?).await,
    }
}
