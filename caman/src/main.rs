//! caman: run the CA manager over a recorded transport stream.
//!
//! Registers the software CA plug-ins listed in the configuration file,
//! feeds a TS file through the manager and starts the requested service as
//! soon as its PMT shows up.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use tokio::io::AsyncReadExt;

use caman::config::DEFAULT_CONFIG_FILE;
use caman::protocol::{CaMessage, Message};
use caman::ts_analyzer::{TableMonitor, TS_PACKET_SIZE};
use caman::{logging, CaManager, Config, MsgCallback, SoftCa};

/// caman - Conditional access manager
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// MPEG-TS file to read
    #[arg(short, long)]
    input: PathBuf,

    /// Service (program number) to descramble
    #[arg(short, long)]
    service: Option<u16>,

    /// Use this CA plug-in instead of matching by CA system
    #[arg(long)]
    ca: Option<String>,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// List services and their CA systems, then exit
    #[arg(long)]
    list: bool,

    /// Directory where log files are stored
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value = "7")]
    log_retention_days: u64,

    /// Read size in TS packets
    #[arg(long, default_value = "100")]
    chunk_packets: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load config file: explicit path > auto-detect > default
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        default_path.exists().then_some(default_path)
    });
    let config = match &config_path {
        Some(path) => match Config::load(path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e.into());
            }
        },
        None => Config::default(),
    };

    // Command line takes precedence over the config file
    let log_dir = if args.log_dir.to_string_lossy() != "logs" {
        args.log_dir.clone()
    } else {
        PathBuf::from(config.logging.log_dir.as_deref().unwrap_or("logs"))
    };
    let log_retention_days = if args.log_retention_days != 7 {
        args.log_retention_days
    } else {
        config.logging.retention_days.unwrap_or(7)
    };
    logging::init_logging(
        &log_dir,
        log_retention_days,
        config.logging.level.as_deref(),
        args.verbose,
    )?;

    if args.list {
        return list_services(&args).await;
    }

    let Some(service_id) = args.service else {
        error!("--service is required unless --list is given");
        return Err("no service given".into());
    };

    let manager = Arc::new(CaManager::new());
    manager.open(config.stream.ts_params())?;
    for section in &config.plugins {
        let plugin = SoftCa::new(&section.name, section.ca_system_ids.clone())
            .strip_ca_descriptors(section.strip_ca_descriptors);
        manager.register_ca(&section.name, Arc::new(plugin), section.options())?;
        if section.open {
            manager.open_ca(&section.name)?;
        }
    }
    if manager.plugins().is_empty() {
        warn!("No CA plug-ins configured, scrambled services cannot be started");
    }

    let weak = Arc::downgrade(&manager);
    let callback: MsgCallback = Arc::new(move |msg: Message| {
        match &msg.body {
            CaMessage::Raw { tag, data } => {
                info!("{}: {} ({} bytes)", msg.ca_name, tag, data.len())
            }
            body => info!("{}: {:?}", msg.ca_name, body),
        }
        match weak.upgrade() {
            Some(manager) => manager.free_msg(msg),
            None => drop(msg),
        }
    });
    manager.set_callback(None, Some(callback));

    let result = run(&args, &manager, service_id).await;

    if let Some(binding) = manager.binding(service_id) {
        info!(
            "Service {} was served by {}",
            service_id,
            binding.ca_name.as_deref().unwrap_or("no CA (clear)")
        );
        if let Err(e) = manager.stop_service(service_id) {
            warn!("Failed to stop service {}: {}", service_id, e);
        }
    }
    manager.set_callback(None, None);
    manager.close()?;
    result
}

/// Feed the input file to the manager until EOF.
async fn run(
    args: &Args,
    manager: &CaManager,
    service_id: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut file = tokio::fs::File::open(&args.input).await?;
    let mut buf = vec![0u8; TS_PACKET_SIZE * args.chunk_packets.max(1)];
    let mut started = false;
    let mut total = 0u64;

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        total += n as u64;
        manager.feed(&buf[..n])?;

        if !started && manager.known_services().contains(&service_id) {
            started = true;
            if let Err(e) = manager.start_service(service_id, args.ca.as_deref()) {
                error!("Failed to start service {}: {}", service_id, e);
                return Err(e.into());
            }
        }
    }

    info!("Read {} bytes from {}", total, args.input.display());
    if !started {
        warn!("Service {} never appeared in the stream", service_id);
    }
    Ok(())
}

/// Print the services of the input file with their CA systems.
async fn list_services(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let data = tokio::fs::read(&args.input).await?;
    let mut monitor = TableMonitor::new();
    monitor.push_packets(&data);

    if let Some(pat) = monitor.pat() {
        println!("Transport stream 0x{:04X}", pat.transport_stream_id);
    }
    let emm = monitor.cat_ca_system_ids();
    if !emm.is_empty() {
        println!("CAT: CA systems {:04X?}", emm);
    }
    for sid in monitor.services() {
        let ids = monitor.pmt_ca_system_ids(sid).unwrap_or(&[]);
        let version = monitor.pmt_version(sid).unwrap_or(0);
        if ids.is_empty() {
            println!("Service {:5} (PMT v{}): clear", sid, version);
        } else {
            println!("Service {:5} (PMT v{}): CA systems {:04X?}", sid, version, ids);
        }
    }
    Ok(())
}
