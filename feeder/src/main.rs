use anyhow::Context;
use log::info;

mod config;
mod ipc;
mod logger;
mod server;
mod shm;
mod source;

/// Entry point for the feeder daemon.
///
/// Brings up logging and configuration, creates and initializes the shared
/// ring, binds the rendezvous and ingest sockets, and hands control to the
/// event loop. Any failure up to that point exits non-zero; from then on
/// the daemon only ever stops on a signal.
fn main() -> anyhow::Result<()> {
    // Keep logger alive for the duration of the process.
    let _logger = logger::init_logger().context("initializing the logger")?;

    let config_path = config::find_config_file();
    let cfg = config::Config::load_or_default(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;
    info!(
        "configuration: {}x{} NV21, {} ring slots, ingest port {}",
        cfg.video.width, cfg.video.height, cfg.video.num_frames, cfg.network.listen_port
    );

    let daemon = server::Feeder::bind(&cfg)?;
    daemon.run()
}
