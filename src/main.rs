/*
 * This file is part of Dimmwatch.
 *
 * Copyright (C) 2025 Dimmwatch contributors
 *
 * Dimmwatch is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Dimmwatch is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Dimmwatch. If not, see <https://www.gnu.org/licenses/>.
 */

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use dimmwatch::config::{config_path, load_config};
use dimmwatch::logger;
use dimmwatch::service::{self, Backend, SHUTDOWN};
use dw_core::{is_root, MemoryGroup};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    watch: bool,
    json: bool,
    scan: bool,
    simulate: bool,
    logging: bool,
}

fn print_help() {
    println!("dimmwatch {} - DDR5 memory module monitor", VERSION);
    println!();
    println!("USAGE:");
    println!("    dimmwatch [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help         Print this help");
    println!("    -v, --version      Print version");
    println!("    --config PATH      Config file (default /etc/dimmwatch/config.json)");
    println!("    --watch            Poll until Ctrl-C");
    println!("    --json             Print JSON snapshots instead of the text report");
    println!("    --scan             Probe the eight SPD5 hub slots and exit");
    println!("    --simulate         Use a simulated controller with two DDR5 modules");
    println!("    --logging          Append JSON events to /var/log/dimmwatch/events.json");
    println!();
    println!("ENVIRONMENT:");
    println!("    DIMMWATCH_LOG      tracing filter (default: info)");
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args::default();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                println!("dimmwatch {}", VERSION);
                std::process::exit(0);
            }
            "--config" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
                parsed.config = Some(PathBuf::from(&args[i]));
            }
            "--watch" => parsed.watch = true,
            "--json" => parsed.json = true,
            "--scan" => parsed.scan = true,
            "--simulate" => parsed.simulate = true,
            "--logging" => parsed.logging = true,
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }
    parsed
}

fn print_group(group: &MemoryGroup, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(&group.snapshot())?);
    } else {
        print!("{}", group.report());
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = parse_args();

    let log_level = std::env::var("DIMMWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .with_env_filter(&log_level)
        .init();

    if args.logging {
        match logger::init_logging() {
            Some(path) => info!("Event log: {}", path.display()),
            None => warn!("Event log could not be opened"),
        }
        logger::log_event("startup", serde_json::json!({
            "version": VERSION,
            "args": std::env::args().collect::<Vec<_>>(),
        }));
    }

    let path = config_path(args.config.as_deref());
    let cfg = load_config(&path).with_context(|| format!("loading {}", path.display()))?;

    let (backend, tables) = if args.simulate {
        let (sim, tables) = service::simulated_system();
        (Backend::Simulated(sim), Some(tables))
    } else {
        let root = is_root();
        if !root {
            warn!("Not running as root: SMBus access disabled, reporting firmware data only");
        }
        (Backend::open(root), service::load_platform_tables(&cfg))
    };
    info!("dimmwatch {} (port access: {})", VERSION, backend.describe());

    let arbiter = if args.simulate {
        Arc::new(dw_core::BusArbiter::new())
    } else {
        service::build_arbiter(&cfg)
    };

    if args.scan {
        let hubs = service::scan(&cfg, &backend, arbiter, tables.as_ref())?;
        if hubs.is_empty() {
            println!("No SPD5 hubs found");
        }
        for hub in &hubs {
            let identity = hub.identity();
            println!(
                "hid {} @ 0x{:02X}: {} serial={} part={}",
                hub.hid(),
                hub.address(),
                hub.device_type(),
                identity.serial_number,
                identity.part_number
            );
        }
        logger::log_event("scan", serde_json::json!({ "hubs": hubs.len() }));
        return Ok(());
    }

    let ctx = service::discovery_context(&cfg, &backend, arbiter);
    let mut group = MemoryGroup::discover(tables.as_ref(), &ctx);
    logger::log_event("discovery", serde_json::json!({
        "sources": group.sources().len(),
        "hubs": group.hub_count(),
        "smbus_base": group.smbus_base(),
    }));

    if !args.watch {
        group.update_all();
        return print_group(&group, args.json);
    }

    if let Err(e) = ctrlc::set_handler(|| SHUTDOWN.store(true, Ordering::SeqCst)) {
        warn!("Failed to set signal handler: {}", e);
    }

    let interval = Duration::from_millis(cfg.poll_interval_ms);
    let json = args.json;
    service::run_watch(&mut group, interval, &SHUTDOWN, None, |g| {
        if let Err(e) = print_group(g, json) {
            error!("Output failed: {}", e);
        }
        if logger::is_enabled() {
            logger::log_event("update", serde_json::to_value(g.snapshot()).unwrap_or_default());
        }
    });
    logger::log_event("shutdown", serde_json::json!({}));
    Ok(())
}
