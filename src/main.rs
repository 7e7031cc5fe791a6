//! rust-multi-downloader - Main entry point
//!
//! Downloads (or seeds) one torrent from the peers given on the command line
//! and from peers that connect to the listening port.

use std::cell::RefCell;
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use rust_multi_downloader::torrent::monitor::format_bytes;
use rust_multi_downloader::{
    CliArgs, Config, Cuid, DownloadMonitorCommand, Handshake, MemoryTorrent, Peer,
    PeerChokeCommand, PeerConnectionSlotCommand, PeerListenCommand, Scheduler, TorrentHandle,
    TorrentInfo, TorrentManager, TorrentParser,
};
use tracing::{debug, error, info, warn};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        if let Some(location) = panic_info.location() {
            error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            );
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

// The engine is a blocking mio loop on this thread; no async runtime runs here.
fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    info!("rust-multi-downloader starting");
    debug!("CLI arguments: {:?}", args);

    let config = load_config(&args).context("Invalid configuration")?;
    let torrent_info = load_torrent_file(&args.torrent_file)?;
    display_torrent_info(&torrent_info, &config);

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(&torrent_info.name));
    let torrent = open_torrent(torrent_info, &config, &output)?;
    let seeded_from_disk = torrent.borrow().download_complete();
    add_peers(&torrent, &args.peers);

    let mut scheduler = Scheduler::new(config.clone()).context("Failed to start the engine")?;
    let handle: TorrentHandle = torrent.clone();
    schedule_commands(&mut scheduler, &handle, &config, args.peers.len())?;

    scheduler.run().context("Engine stopped unexpectedly")?;

    for failure in scheduler.failures() {
        error!("{} - {} failed: {}", failure.cuid, failure.command, failure.error);
    }
    if !scheduler.failures().is_empty() {
        bail!("{} session(s) failed", scheduler.failures().len());
    }

    let torrent = torrent.borrow();
    if torrent.download_complete() && !seeded_from_disk {
        torrent
            .write_to(&output)
            .with_context(|| format!("Failed to write {}", output.display()))?;
    } else if !torrent.download_complete() {
        warn!(
            "Stopped with {} of {} downloaded",
            format_bytes(torrent.completed_length()),
            format_bytes(torrent.total_length())
        );
    }

    info!("rust-multi-downloader finished");
    Ok(())
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let level = args.log_level();

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
        debug!("Using pretty log format (verbose mode)");
    } else {
        subscriber.compact().init();
    }
}

/// Read the config file if one was given, then apply the CLI overrides
fn load_config(args: &CliArgs) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_args(args);
    config.validate()?;
    debug!("Effective configuration: {:?}", config);
    Ok(config)
}

/// Load and parse the torrent file
fn load_torrent_file(path: &Path) -> Result<TorrentInfo> {
    info!("Loading torrent file: {}", path.display());
    let info = TorrentParser::parse_file(path).context("Failed to parse torrent file")?;
    info!("Successfully loaded torrent file: {}", info.name);
    Ok(info)
}

/// Display torrent information
fn display_torrent_info(torrent_info: &TorrentInfo, config: &Config) {
    info!("  Name: {}", torrent_info.name);
    info!(
        "  Size: {} ({})",
        torrent_info.total_size(),
        format_bytes(torrent_info.total_size())
    );
    info!("  Pieces: {}", torrent_info.piece_count());
    info!("  Piece length: {}", format_bytes(u64::from(torrent_info.piece_length)));
    info!("  Info hash: {}", torrent_info.info_hash_hex());
    info!(
        "  Listen ports: {}-{}",
        config.listen_port_start, config.listen_port_end
    );
    info!("  Max peers: {}", config.max_peers);
    info!("  Seeding: {}", if config.seed { "enabled" } else { "disabled" });
}

/// Create the torrent, loading existing content when seeding
fn open_torrent(info: TorrentInfo, config: &Config, output: &Path) -> Result<Rc<RefCell<MemoryTorrent>>> {
    let peer_id = Handshake::generate_peer_id();
    let torrent = if config.seed && output.exists() {
        info!("Seeding existing content from {}", output.display());
        let content = std::fs::read(output)
            .with_context(|| format!("Failed to read {}", output.display()))?;
        MemoryTorrent::seeded(info, peer_id, config.max_peers, &content)
            .context("Existing content does not match the torrent")?
    } else {
        MemoryTorrent::new(info, peer_id, config.max_peers)
    };
    Ok(Rc::new(RefCell::new(torrent)))
}

fn add_peers(torrent: &Rc<RefCell<MemoryTorrent>>, peers: &[String]) {
    let mut torrent = torrent.borrow_mut();
    let piece_count = torrent.piece_count();
    for entry in peers {
        match entry.to_socket_addrs().map(|mut addrs| addrs.next()) {
            Ok(Some(addr)) => {
                if !torrent.add_peer(Peer::new(addr, piece_count).into_handle()) {
                    debug!("Ignoring duplicate peer {}", addr);
                }
            }
            Ok(None) => warn!("No address for peer {}", entry),
            Err(e) => warn!("Invalid peer address {}: {}", entry, e),
        }
    }
    info!("{} peer(s) waiting in the pool", torrent.pooled_peers());
}

/// Queue the listener, the connection slots, the choker and the monitor
fn schedule_commands(
    scheduler: &mut Scheduler,
    torrent: &TorrentHandle,
    config: &Config,
    peer_count: usize,
) -> Result<()> {
    let cuid = new_cuid(torrent);
    let mut listen = PeerListenCommand::new(scheduler.next_command_id(), cuid, torrent.clone());
    listen
        .bind_port(config.listen_port_start, config.listen_port_end)
        .context("Failed to open the listening port")?;
    scheduler.push(Box::new(listen));

    if !torrent.borrow().download_complete() {
        for _ in 0..peer_count.min(config.max_peers) {
            let cuid = new_cuid(torrent);
            let id = scheduler.next_command_id();
            scheduler.push(Box::new(PeerConnectionSlotCommand::new(
                id,
                cuid,
                torrent.clone(),
                config.retry_wait(),
            )));
        }
    }

    let cuid = new_cuid(torrent);
    let id = scheduler.next_command_id();
    scheduler.push(Box::new(PeerChokeCommand::new(
        id,
        cuid,
        torrent.clone(),
        config.choke_interval(),
        config.max_unchoked_peers,
    )));

    let cuid = new_cuid(torrent);
    let id = scheduler.next_command_id();
    scheduler.push(Box::new(DownloadMonitorCommand::new(id, cuid, torrent.clone())));

    debug!("Queued commands: {:?}", scheduler.queued_names());
    Ok(())
}

fn new_cuid(torrent: &TorrentHandle) -> Cuid {
    torrent.borrow_mut().get_new_cuid()
}
