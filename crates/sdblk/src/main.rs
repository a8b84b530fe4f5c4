//! Command-line access to sheepdog virtual disks (sdblk).
//!
//! Every command takes a VDI location, either a URI or the short form:
//!
//! ```text
//! sdblk [OPTIONS] <COMMAND>
//!
//! Commands:
//!   create    Create a VDI
//!   info      Show a VDI and its allocation
//!   read      Read a byte range to a file or stdout
//!   write     Write a file or stdin at an offset
//!   resize    Grow a VDI
//!   discard   Drop whole objects of a range
//!   map       Show allocated and unallocated extents
//!   snapshot  Snapshot management
//!   vmstate   Save or load VM state
//!
//! Locations:
//!   sheepdog://host:port/vdi#snap
//!   sheepdog+unix:///vdi?socket=/path/to/sock
//!   [host:port:]vdi[:snap]
//! ```

mod common;
mod vdi;

use std::time::Duration;

use clap::{Parser, ValueEnum};
use sheepdog_block::{CacheMode, DriverConfig, LockType};
use tracing_subscriber::EnvFilter;

/// Sheepdog virtual disk tool.
#[derive(Parser)]
#[command(name = "sdblk", version, about = "Sheepdog virtual disk tool")]
struct Cli {
    /// Bypass the daemon's object cache
    #[arg(long)]
    directio: bool,

    /// Open the VDI with a shared lock
    #[arg(long)]
    shared: bool,

    /// Milliseconds between reconnect attempts
    #[arg(long, default_value_t = 1000)]
    reconnect_delay: u64,

    /// Enable verbose/debug logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Output format for listings
    #[arg(long, value_enum, default_value_t = Format::Table)]
    format: Format,

    #[command(subcommand)]
    command: vdi::Commands,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Format {
    Table,
    Raw,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = DriverConfig {
        cache_mode: if cli.directio {
            CacheMode::Directio
        } else {
            CacheMode::Writeback
        },
        lock_type: if cli.shared {
            LockType::Shared
        } else {
            LockType::Normal
        },
        reconnect_delay: Duration::from_millis(cli.reconnect_delay),
        ..Default::default()
    };

    tracing::debug!("driver config: {:?}", config);
    vdi::run(config, cli.format, cli.command).await;
}
