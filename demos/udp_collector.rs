//! UDP flow collector example
//!
//! Run with: cargo run --example udp_collector [BIND_ADDR] [PEER...]
//!
//! Examples:
//!   cargo run --example udp_collector                         # 0.0.0.0:9995, any peer
//!   cargo run --example udp_collector 127.0.0.1:2055          # loopback, any peer
//!   cargo run --example udp_collector 0.0.0.0:2055 10.0.0.1   # only accept 10.0.0.1
//!
//! Send it something with:
//!   echo -n hello | nc -u -w0 127.0.0.1 9995
//!
//! Each record is printed as its length and a hex preview. Ctrl+C stops the
//! source and prints the base counters.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use flowsource::{AsyncSource, ListenSpec, SourceOptions, SourceRegistry};

/// Largest NetFlow v5 packet: 24-byte header plus 30 records of 48 bytes
const ITEM_SIZE: usize = 1464;

const ITEM_COUNT: usize = 1024;

fn print_usage() {
    eprintln!("Usage: udp_collector [BIND_ADDR] [PEER...]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  BIND_ADDR    Address to listen on (default: 0.0.0.0:9995)");
    eprintln!("  PEER         Accept datagrams only from these hosts (default: any)");
}

fn hex_preview(record: &[u8]) -> String {
    record
        .iter()
        .take(16)
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let listen: SocketAddr = match args.get(1) {
        Some(addr) => addr.parse()?,
        None => "0.0.0.0:9995".parse()?,
    };
    let peers = args
        .iter()
        .skip(2)
        .map(|p| p.parse::<IpAddr>())
        .collect::<Result<Vec<_>, _>>()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("flowsource=debug".parse()?)
                .add_directive("udp_collector=debug".parse()?),
        )
        .init();

    let registry = Arc::new(SourceRegistry::from_env());
    let spec = ListenSpec::network_from([listen], peers)?;
    let source = registry.create_source(&spec, &SourceOptions::new(ITEM_SIZE, ITEM_COUNT))?;

    println!("Listening on {:?}", source.local_addrs());

    let mut source = AsyncSource::new(source);
    let stop = source.stop_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nShutting down...");
            // Blocks until the reader thread has exited
            let _ = tokio::task::spawn_blocking(move || stop.stop()).await;
        }
    });

    let mut records = 0u64;
    while let Some(record) = source.next_record().await {
        records += 1;
        let used = record.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        println!("#{} len={} {}", records, used, hex_preview(&record));
    }

    if let Some(source) = source.into_inner() {
        let stats = source.stats();
        println!(
            "Stats: received={} bytes={} delivered={} unknown_peer={} uptime={:?}",
            stats.datagrams_received,
            stats.bytes_received,
            stats.delivered(),
            stats.unknown_peer,
            Duration::from_secs(stats.uptime.as_secs()),
        );
        source.destroy();
    }

    Ok(())
}
