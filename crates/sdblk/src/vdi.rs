//! VDI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand};
use sheepdog_block::{CreateOptions, DriverConfig, Prealloc, SheepdogDevice, SnapshotInfo};
use sheepdog_core::inode::inode_stat;
use tabled::{Table, Tabled};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::{exit_error, finish, format_size, format_time, open_or_exit, parse_size};
use crate::Format;

#[derive(Subcommand)]
pub enum Commands {
    /// Create a VDI
    Create {
        /// VDI location
        location: String,
        /// Size (e.g. 100G, 512M)
        #[arg(value_parser = parse_size)]
        size: u64,
        /// Redundancy: copies ("3") or data:parity strips ("4:2")
        #[arg(short = 'c', long)]
        redundancy: Option<String>,
        /// Object size (e.g. 4M); the cluster default when omitted
        #[arg(short = 'o', long, value_parser = parse_size)]
        object_size: Option<u64>,
        /// Snapshot to clone from
        #[arg(short = 'b', long)]
        backing: Option<String>,
        /// Allocate every object now
        #[arg(short = 'P', long)]
        prealloc: bool,
    },
    /// Show a VDI and its allocation
    Info {
        location: String,
    },
    /// Read a byte range to a file or stdout
    Read {
        location: String,
        #[arg(value_parser = parse_size)]
        offset: u64,
        #[arg(value_parser = parse_size)]
        length: u64,
        /// Output file (stdout when omitted)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
    },
    /// Write a file or stdin at an offset, growing the VDI if needed
    Write {
        location: String,
        #[arg(value_parser = parse_size)]
        offset: u64,
        /// Input file (stdin when omitted)
        #[arg(short = 'i', long)]
        input: Option<PathBuf>,
    },
    /// Grow a VDI
    Resize {
        location: String,
        #[arg(value_parser = parse_size)]
        size: u64,
    },
    /// Drop the objects fully covered by a range
    Discard {
        location: String,
        #[arg(value_parser = parse_size)]
        offset: u64,
        #[arg(value_parser = parse_size)]
        length: u64,
    },
    /// Ask the daemon to persist cached writes
    Flush {
        location: String,
    },
    /// Show allocated and unallocated extents
    Map {
        location: String,
    },
    /// Snapshot management
    Snapshot(SnapshotArgs),
    /// Save or load VM state
    Vmstate(VmstateArgs),
}

#[derive(Args)]
pub struct SnapshotArgs {
    #[command(subcommand)]
    pub command: SnapshotCommands,
}

#[derive(Subcommand)]
pub enum SnapshotCommands {
    /// Snapshot the VDI and continue on a new writable VDI
    Create {
        location: String,
        tag: String,
    },
    /// List snapshots of a VDI
    List {
        location: String,
    },
    /// Revert to a snapshot (id or tag)
    Goto {
        location: String,
        snapshot: String,
    },
    /// Delete a snapshot (id or tag)
    Delete {
        location: String,
        snapshot: String,
    },
}

#[derive(Args)]
pub struct VmstateArgs {
    #[command(subcommand)]
    pub command: VmstateCommands,
}

#[derive(Subcommand)]
pub enum VmstateCommands {
    /// Save VM state from a file or stdin
    Save {
        location: String,
        #[arg(value_parser = parse_size)]
        pos: u64,
        #[arg(short = 'i', long)]
        input: Option<PathBuf>,
    },
    /// Load VM state saved before the last snapshot
    Load {
        location: String,
        #[arg(value_parser = parse_size)]
        pos: u64,
        #[arg(value_parser = parse_size)]
        length: u64,
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
    },
}

#[derive(Tabled)]
struct InfoRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Id")]
    id: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Used")]
    used: String,
    #[tabled(rename = "Shared")]
    shared: String,
    #[tabled(rename = "Copies")]
    copies: u8,
    #[tabled(rename = "Object Size")]
    object_size: String,
    #[tabled(rename = "Snapshot")]
    snapshot: String,
}

#[derive(Tabled)]
struct SnapshotRow {
    #[tabled(rename = "Id")]
    id: u32,
    #[tabled(rename = "Tag")]
    tag: String,
    #[tabled(rename = "VDI")]
    vdi_id: String,
    #[tabled(rename = "VM State")]
    vm_state: String,
    #[tabled(rename = "Created")]
    created: String,
}

impl From<&SnapshotInfo> for SnapshotRow {
    fn from(s: &SnapshotInfo) -> Self {
        Self {
            id: s.id,
            tag: s.tag.clone(),
            vdi_id: format!("{:x}", s.vdi_id),
            vm_state: format_size(s.vm_state_size),
            created: format_time(s.date_sec as u64),
        }
    }
}

#[derive(Tabled)]
struct ExtentRow {
    #[tabled(rename = "Start")]
    start: u64,
    #[tabled(rename = "Length")]
    length: u64,
    #[tabled(rename = "Allocated")]
    allocated: bool,
}

/// Execute a subcommand.
pub async fn run(config: DriverConfig, format: Format, command: Commands) {
    match command {
        Commands::Create {
            location,
            size,
            redundancy,
            object_size,
            backing,
            prealloc,
        } => {
            let opts = CreateOptions {
                size,
                redundancy,
                object_size,
                backing,
                prealloc: if prealloc { Prealloc::Full } else { Prealloc::Off },
            };
            match SheepdogDevice::create(&location, &opts, &config).await {
                Ok(vid) => println!("created {} (id: {:#x}, size: {})", location, vid, format_size(size)),
                Err(e) => exit_error(&format!("cannot create {}: {}", location, e)),
            }
        }
        Commands::Info { location } => vdi_info(&location, &config, format).await,
        Commands::Read {
            location,
            offset,
            length,
            output,
        } => {
            let dev = open_or_exit(&location, &config).await;
            let res = dev.read(offset, length as usize).await;
            let data = finish(dev, res, "read").await;
            write_output(output, &data).await;
        }
        Commands::Write {
            location,
            offset,
            input,
        } => {
            let data = read_input(input).await;
            let dev = open_or_exit(&location, &config).await;
            let res = dev.write(offset, &data).await;
            finish(dev, res, "write").await;
        }
        Commands::Resize { location, size } => {
            let dev = open_or_exit(&location, &config).await;
            let res = dev.truncate(size).await;
            finish(dev, res, "resize").await;
        }
        Commands::Discard {
            location,
            offset,
            length,
        } => {
            let dev = open_or_exit(&location, &config).await;
            let res = dev.discard(offset, length).await;
            finish(dev, res, "discard").await;
        }
        Commands::Flush { location } => {
            let dev = open_or_exit(&location, &config).await;
            let res = dev.flush().await;
            finish(dev, res, "flush").await;
        }
        Commands::Map { location } => vdi_map(&location, &config, format).await,
        Commands::Snapshot(args) => snapshot(&config, format, args.command).await,
        Commands::Vmstate(args) => vmstate(&config, args.command).await,
    }
}

async fn vdi_info(location: &str, config: &DriverConfig, format: Format) {
    let dev = open_or_exit(location, config).await;
    let inode = dev.inode();
    let (own, cow) = inode_stat(&inode);
    let row = InfoRow {
        name: inode.name.clone(),
        id: format!("{:x}", inode.vdi_id),
        size: format_size(inode.vdi_size),
        used: format_size(own * inode.object_size()),
        shared: format_size(cow * inode.object_size()),
        copies: inode.nr_copies,
        object_size: format_size(inode.object_size()),
        snapshot: if dev.is_snapshot() { "yes" } else { "no" }.to_string(),
    };
    finish(dev, Ok(()), "info").await;

    match format {
        Format::Table => println!("{}", Table::new(vec![row])),
        Format::Raw => println!(
            "{} {} {} {} {} {} {} {}",
            row.name,
            row.id,
            inode.vdi_size,
            own * inode.object_size(),
            cow * inode.object_size(),
            row.copies,
            inode.block_size_shift,
            row.snapshot
        ),
    }
}

async fn vdi_map(location: &str, config: &DriverConfig, format: Format) {
    let dev = open_or_exit(location, config).await;
    let size = dev.length();
    let mut rows = Vec::new();
    let mut start = 0u64;
    while start < size {
        let status = dev.block_status(start, size - start);
        if status.len == 0 {
            break;
        }
        rows.push(ExtentRow {
            start,
            length: status.len,
            allocated: status.allocated,
        });
        start += status.len;
    }
    finish(dev, Ok(()), "map").await;

    match format {
        Format::Table => println!("{}", Table::new(rows)),
        Format::Raw => {
            for r in rows {
                println!("{} {} {}", r.start, r.length, r.allocated);
            }
        }
    }
}

async fn snapshot(config: &DriverConfig, format: Format, command: SnapshotCommands) {
    match command {
        SnapshotCommands::Create { location, tag } => {
            let dev = open_or_exit(&location, config).await;
            let res = dev.snapshot_create(&tag, 0, 0).await;
            finish(dev, res, "snapshot").await;
            println!("snapshot '{}' of {} created", tag, location);
        }
        SnapshotCommands::List { location } => {
            let dev = open_or_exit(&location, config).await;
            let res = dev.snapshot_list().await;
            let mut snaps = finish(dev, res, "snapshot list").await;
            snaps.sort_by_key(|s| s.id);
            match format {
                Format::Table => {
                    let rows: Vec<SnapshotRow> = snaps.iter().map(SnapshotRow::from).collect();
                    println!("{}", Table::new(rows));
                }
                Format::Raw => {
                    for s in &snaps {
                        println!("{} {} {:x} {} {}", s.id, s.tag, s.vdi_id, s.vm_state_size, s.date_sec);
                    }
                }
            }
        }
        SnapshotCommands::Goto { location, snapshot } => {
            let dev = open_or_exit(&location, config).await;
            let res = dev.snapshot_goto(&snapshot).await;
            finish(dev, res, "snapshot goto").await;
        }
        SnapshotCommands::Delete { location, snapshot } => {
            let dev = open_or_exit(&location, config).await;
            let res = dev.snapshot_delete(&snapshot).await;
            finish(dev, res, "snapshot delete").await;
        }
    }
}

async fn vmstate(config: &DriverConfig, command: VmstateCommands) {
    match command {
        VmstateCommands::Save {
            location,
            pos,
            input,
        } => {
            let data = read_input(input).await;
            let dev = open_or_exit(&location, config).await;
            let res = dev.save_vmstate(&data, pos).await;
            let n = finish(dev, res, "vmstate save").await;
            println!("saved {} of VM state", format_size(n as u64));
        }
        VmstateCommands::Load {
            location,
            pos,
            length,
            output,
        } => {
            let dev = open_or_exit(&location, config).await;
            let res = dev.load_vmstate(pos, length as usize).await;
            let data = finish(dev, res, "vmstate load").await;
            write_output(output, &data).await;
        }
    }
}

async fn read_input(input: Option<PathBuf>) -> Vec<u8> {
    let res = match &input {
        Some(path) => tokio::fs::read(path).await,
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin().read_to_end(&mut buf).await.map(|_| buf)
        }
    };
    res.unwrap_or_else(|e| exit_error(&format!("cannot read input: {}", e)))
}

async fn write_output(output: Option<PathBuf>, data: &[u8]) {
    let res = match &output {
        Some(path) => tokio::fs::write(path, data).await,
        None => {
            let mut stdout = tokio::io::stdout();
            match stdout.write_all(data).await {
                Ok(()) => stdout.flush().await,
                Err(e) => Err(e),
            }
        }
    };
    if let Err(e) = res {
        exit_error(&format!("cannot write output: {}", e));
    }
}
