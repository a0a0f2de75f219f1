mod config;
mod fs;
mod handle_table;
mod inode_table;
mod namedb;
mod pathmap;
mod util;

use clap::Parser;
use config::Config;
use fs::LongNameFs;
use fuser::MountOption;
use log::{debug, info};
use namedb::NameDb;
use std::path::PathBuf;
use std::process;

#[derive(Parser, Debug)]
#[command(name = "lfnfs")]
#[command(about = "Mirror a directory tree while lifting the 255 byte file name limit")]
struct Cli {
    /// Directory tree to mirror.
    source: PathBuf,

    /// Where to mount the mirrored tree.
    mountpoint: PathBuf,

    /// Enable debugging output.
    #[arg(long)]
    debug: bool,

    /// Enable FUSE debugging output.
    #[arg(long)]
    debug_fuse: bool,
}

fn init_logging(debug: bool, debug_fuse: bool) {
    let mut filter = String::from(if debug { "lfnfs=debug" } else { "lfnfs=info" });
    if debug_fuse {
        filter.push_str(",fuser=debug");
    }
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .format_timestamp_millis()
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.debug_fuse);

    let config = match Config::new(cli.source) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            process::exit(1);
        }
    };

    info!("using name database at {}", config.db_path.display());
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = NameDb::open(&config.db_path)?;
    let fs = LongNameFs::new(&config.source, db);

    // Single threaded on purpose: the digest database connection is not
    // shareable, and mount2 dispatches every request on this thread.
    let options = [MountOption::FSName("lfnfs".to_string())];
    debug!("mounting {} at {}", config.source.display(), cli.mountpoint.display());
    fuser::mount2(fs, &cli.mountpoint, &options)?;
    debug!("unmounted");
    Ok(())
}
