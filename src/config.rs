//! Command-line / runtime configuration, matching the teacher's
//! `clap::Parser`-derived `Args` in shape (flat struct, `#[arg(long)]`
//! fields with defaults) and in how `main.rs` turns it into a runtime
//! config object before constructing the engine.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;

use crate::wire::limits::DISCOVERY_PORT;

#[derive(Debug, Parser)]
#[command(name = "catbusd", about = "Catbus key-value bus node")]
pub struct Args {
    /// UDP port used for both discovery and data traffic.
    #[arg(long, default_value_t = DISCOVERY_PORT)]
    pub port: u16,

    /// Local address to bind the UDP socket to.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_addr: Ipv4Addr,

    /// Directory holding `kv_data`, `kvlinks`, and `kv_names`.
    #[arg(long, default_value = "./catbus-data")]
    pub data_dir: PathBuf,

    /// Optional path to a static-table image; omit to run with no static
    /// parameters declared (dynamic-only node).
    #[arg(long)]
    pub static_image: Option<PathBuf>,

    /// Meta-tag hashes this node advertises for discovery query matching.
    #[arg(long = "tag", value_name = "HASH")]
    pub tags: Vec<u32>,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// The resolved runtime configuration passed to `Engine::new`, distinct
/// from `Args` so library callers that don't go through the CLI (tests,
/// embedders) can build one directly.
#[derive(Debug, Clone)]
pub struct CatbusConfig {
    pub port: u16,
    pub bind_addr: Ipv4Addr,
    pub data_dir: PathBuf,
    pub static_image: Option<PathBuf>,
    pub tags: Vec<u32>,
}

impl From<Args> for CatbusConfig {
    fn from(args: Args) -> Self {
        CatbusConfig {
            port: args.port,
            bind_addr: args.bind_addr,
            data_dir: args.data_dir,
            static_image: args.static_image,
            tags: args.tags,
        }
    }
}

impl CatbusConfig {
    pub fn kv_data_path(&self) -> PathBuf {
        self.data_dir.join("kv_data")
    }

    pub fn kvlinks_path(&self) -> PathBuf {
        self.data_dir.join("kvlinks")
    }

    pub fn kv_names_path(&self) -> PathBuf {
        self.data_dir.join("kv_names")
    }
}
